use std::sync::{Arc, Weak};

use serde::Deserialize;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::common_nodes::link_call::LinkCallNode;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum LinkOutMode {
    /// Push a clone to every linked `link in`.
    #[default]
    #[serde(rename = "link")]
    Link = 0,

    /// Return the message to the `link call` that forwarded it.
    #[serde(rename = "return")]
    Return = 1,
}

#[derive(Deserialize, Debug)]
struct LinkOutNodeConfig {
    #[serde(default)]
    mode: LinkOutMode,

    #[serde(default, deserialize_with = "crate::runtime::model::json::deser::deser_id_vec")]
    links: Vec<ElementId>,
}

#[derive(Debug)]
#[flow_node("link out")]
struct LinkOutNode {
    base: FlowNode,
    mode: LinkOutMode,
    links: Vec<ElementId>,
    linked_nodes: std::sync::RwLock<Vec<Weak<dyn FlowNodeBehavior>>>,
}

impl LinkOutNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let link_out_config = LinkOutNodeConfig::deserialize(&config.rest)?;

        let node = LinkOutNode {
            base,
            mode: link_out_config.mode,
            links: link_out_config.links,
            linked_nodes: std::sync::RwLock::new(Vec::new()),
        };
        Ok(Box::new(node))
    }

    /// Target resolution is deferred to start so wiring order and cyclic
    /// link graphs do not matter.
    fn resolve_links(&self) -> crate::Result<()> {
        if self.mode != LinkOutMode::Link {
            return Ok(());
        }
        let flow = self.flow().ok_or(WireflowError::InvalidOperation("The flow is gone".into()))?;
        let engine = flow.engine().ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?;

        let mut linked_nodes = self.linked_nodes.write().expect("linked_nodes lock");
        linked_nodes.clear();
        for link_in_id in self.links.iter() {
            if let Some(link_in) = flow.get_node_by_id(link_in_id).or_else(|| engine.find_flow_node_by_id(link_in_id))
            {
                linked_nodes.push(Arc::downgrade(&link_in));
            } else {
                log::error!("LinkOutNode: Cannot find the required `link in` node(id={})!", link_in_id);
                return Err(WireflowError::BadFlowsJson("Cannot find the required `link in` node".to_string()).into());
            }
        }
        Ok(())
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        match self.mode {
            LinkOutMode::Link => {
                let linked_nodes: Vec<_> = { self.linked_nodes.read().expect("linked_nodes lock").clone() };
                let last_index = linked_nodes.len().saturating_sub(1);
                for (i, link_node) in linked_nodes.iter().enumerate() {
                    if let Some(link_node) = link_node.upgrade() {
                        let msg_to_send = if i == last_index { msg.clone() } else { msg.deep_clone(true).await };
                        link_node.inject_msg(msg_to_send, cancel.clone()).await?;
                    } else {
                        let err_msg =
                            format!("The required `link in` was unavailable in `link out` node(id={})!", self.id());
                        return Err(WireflowError::InvalidOperation(err_msg).into());
                    }
                }
            }
            LinkOutMode::Return => {
                let flow = self.flow().ok_or(WireflowError::InvalidOperation("The flow is gone".into()))?;
                let engine = flow.engine().ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?;
                let stack_top = {
                    let mut msg_guard = msg.write().await;
                    msg_guard.pop_link_source()
                };
                if let Some(ref source_link) = stack_top {
                    if let Some(target_node) = engine.find_flow_node_by_id(&source_link.link_call_node_id) {
                        if let Some(link_call_node) = target_node.as_any().downcast_ref::<LinkCallNode>() {
                            link_call_node
                                .return_msg(msg.clone(), source_link.id, self.id(), flow.id(), cancel.clone())
                                .await?;
                        } else {
                            return Err(WireflowError::InvalidOperation(format!(
                                "The node(id='{}') is not a `link call` node!",
                                source_link.link_call_node_id
                            ))
                            .into());
                        }
                    } else {
                        return Err(WireflowError::InvalidOperation(format!(
                            "Cannot find the `link call` node by id='{}'",
                            source_link.link_call_node_id
                        ))
                        .into());
                    }
                } else {
                    return Err(WireflowError::InvalidOperation(
                        "The received message carries no `link call` source to return to".to_string(),
                    )
                    .into());
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for LinkOutNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn on_starting(&self) {
        if let Err(e) = self.resolve_links() {
            log::error!("[link out:{}] {:?}", self.name(), e);
        }
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.clone();
            with_uow(self.as_ref(), stop_token.clone(), |node, msg| node.uow(msg, cancel.clone())).await;
        }
    }
}
