use std::sync::Arc;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// Forwards every received message to the engine's capture channel. The
/// integration harness wires flows into this node and asserts on what
/// arrives.
#[derive(Debug)]
#[flow_node("test-once")]
struct TestOnceNode {
    base: FlowNode,
}

impl TestOnceNode {
    fn build(_flow: &Flow, base: FlowNode, _config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let node = TestOnceNode { base };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for TestOnceNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let engine = match self.engine() {
                Some(engine) => engine,
                None => break,
            };

            match self.recv_msg(stop_token.clone()).await {
                Ok(msg) => {
                    if let Err(e) = engine.recv_final_msg(msg) {
                        log::error!("Failed to capture final msg: {:?}", e);
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}
