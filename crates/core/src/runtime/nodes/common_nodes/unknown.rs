use std::sync::Arc;

use crate::runtime::engine::Engine;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::{FlowNodeConfig, GlobalNodeConfig};
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// Stands in for a flow node whose type has no registered constructor.
/// It drains its input so upstream senders never block.
#[derive(Debug)]
#[flow_node("unknown.flow")]
struct UnknownFlowNode {
    base: FlowNode,
}

impl UnknownFlowNode {
    fn build(_flow: &Flow, base: FlowNode, _config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let node = UnknownFlowNode { base };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for UnknownFlowNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while let Ok(msg) = self.recv_msg(stop_token.clone()).await {
            drop(msg);
        }
    }
}

#[derive(Debug)]
#[global_node("unknown.global")]
struct UnknownGlobalNode {
    base: GlobalNode,
}

impl UnknownGlobalNode {
    fn build(
        _engine: &Engine,
        base: GlobalNode,
        _config: &GlobalNodeConfig,
    ) -> crate::Result<Box<dyn GlobalNodeBehavior>> {
        let node = UnknownGlobalNode { base };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl GlobalNodeBehavior for UnknownGlobalNode {
    fn get_base(&self) -> &GlobalNode {
        &self.base
    }
}
