use std::sync::Arc;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// Passive receiver of completion events. The owning flow indexes this
/// node by the source ids in its `scope` property and re-emits the
/// completed message here unchanged.
#[derive(Debug)]
#[flow_node("complete")]
struct CompleteNode {
    base: FlowNode,
}

impl CompleteNode {
    fn build(_flow: &Flow, base: FlowNode, _config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let node = CompleteNode { base };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for CompleteNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            // No unit-of-work here, a completion must not re-trigger itself.
            match self.recv_msg(stop_token.clone()).await {
                Ok(msg) => {
                    if let Err(err) = self.fan_out_one(Envelope { port: 0, msg }, stop_token.clone()).await {
                        log::error!(
                            "Failed to fan out message in CompleteNode(id='{}', name='{}'): {:?}",
                            self.id(),
                            self.name(),
                            err
                        );
                    }
                }
                Err(_) => break,
            }
        }
    }
}
