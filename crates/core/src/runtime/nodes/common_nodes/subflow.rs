use std::sync::Arc;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// The synthetic node standing in for a subflow instance. Its input
/// relays into the expanded template flow; the template's output ports
/// fan back out through this node's wires.
#[derive(Debug)]
#[flow_node("subflow")]
struct SubflowNode {
    base: FlowNode,
    subflow_id: ElementId,
}

impl SubflowNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let subflow_id = config
            .type_name
            .split_once(':')
            .and_then(|x| x.1.parse().ok())
            .ok_or(WireflowError::BadFlowsJson(format!("Bad subflow instance type: '{}'", config.type_name)))?;

        let node = SubflowNode { base, subflow_id };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for SubflowNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                let engine =
                    node.engine().ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?;
                engine.inject_msg_to_flow(&node.subflow_id, msg, cancel.child_token()).await
            })
            .await;
        }
    }
}
