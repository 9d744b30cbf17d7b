use std::sync::Arc;

use serde::Deserialize;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Deserialize, Debug)]
struct DebugNodeConfig {
    #[serde(default = "debug_active_default")]
    active: bool,

    /// Which property to print; `complete="true"` prints the whole msg.
    #[serde(default)]
    complete: String,
}

fn debug_active_default() -> bool {
    true
}

#[derive(Debug)]
#[flow_node("debug")]
struct DebugNode {
    base: FlowNode,
    config: DebugNodeConfig,
}

impl DebugNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let mut debug_config = DebugNodeConfig::deserialize(&config.rest)?;
        if debug_config.complete.is_empty() || debug_config.complete == "false" {
            debug_config.complete = "payload".to_string();
        }

        let node = DebugNode { base, config: debug_config };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for DebugNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            match self.recv_msg(stop_token.child_token()).await {
                Ok(msg) => {
                    if !self.config.active {
                        continue;
                    }
                    let msg_guard = msg.read().await;
                    if self.config.complete == "true" {
                        log::info!("[debug:{}] {:#?}", self.name(), msg_guard.as_variant());
                    } else {
                        let selected = msg_guard.get_nav_stripped(&self.config.complete);
                        log::info!("[debug:{}] {:?}", self.name(), selected);
                    }
                }
                Err(_) => break,
            }
        }
    }
}
