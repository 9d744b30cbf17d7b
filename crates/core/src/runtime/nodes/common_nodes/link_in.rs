use std::sync::Arc;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// The receiving end of virtual wires. `link out` and `link call` nodes
/// inject into it directly; it just relays to its own wires.
#[derive(Debug)]
#[flow_node("link in")]
struct LinkInNode {
    base: FlowNode,
}

impl LinkInNode {
    fn build(_flow: &Flow, base: FlowNode, _config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let node = LinkInNode { base };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for LinkInNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.clone();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                node.fan_out_one(Envelope { port: 0, msg }, cancel.clone()).await
            })
            .await;
        }
    }
}
