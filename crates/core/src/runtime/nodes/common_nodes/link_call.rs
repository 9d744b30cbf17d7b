use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::helpers::parse_id_str;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

const DEFAULT_CALL_TIMEOUT_SECS: f64 = 30.0;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum LinkType {
    #[default]
    #[serde(rename = "static")]
    Static,

    #[serde(rename = "dynamic")]
    Dynamic,
}

#[derive(Deserialize, Debug)]
struct LinkCallNodeConfig {
    #[serde(default, rename = "linkType")]
    link_type: LinkType,

    #[serde(default, deserialize_with = "crate::runtime::model::json::deser::deser_id_vec")]
    links: Vec<ElementId>,

    #[serde(default, deserialize_with = "crate::runtime::model::json::deser::str_to_option_f64")]
    timeout: Option<f64>,
}

#[derive(Debug)]
struct PendingCall {
    msg: MsgHandle,
    timeout_handle: tokio::task::AbortHandle,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.timeout_handle.is_finished() {
            self.timeout_handle.abort();
        }
    }
}

#[derive(Debug)]
struct LinkCallMutState {
    timeout_tasks: JoinSet<()>,
    pending_calls: HashMap<ElementId, PendingCall>,
}

/// Forwards messages to a `link in` and waits for a matching return from a
/// `link out` in return mode. Each forwarded message carries exactly one
/// call-stack entry keyed by a fresh call id; nesting is rejected.
#[derive(Debug)]
#[flow_node("link call")]
pub(crate) struct LinkCallNode {
    base: FlowNode,
    config: LinkCallNodeConfig,
    call_id_atomic: AtomicU64,
    mut_state: Mutex<LinkCallMutState>,
}

impl LinkCallNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let link_call_config = LinkCallNodeConfig::deserialize(&config.rest)?;

        let node = LinkCallNode {
            base,
            config: link_call_config,
            call_id_atomic: AtomicU64::new(1),
            mut_state: Mutex::new(LinkCallMutState { pending_calls: HashMap::new(), timeout_tasks: JoinSet::new() }),
        };
        Ok(Box::new(node))
    }

    async fn uow(&self, node: Arc<Self>, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let call_id = {
            let mut locked_msg = msg.write().await;
            if locked_msg.link_call_stack.is_some() {
                // single-level return only
                return Err(WireflowError::InvalidOperation(
                    "Nested `link call` invocations are not supported".to_string(),
                )
                .into());
            }
            let call_id = ElementId::with_u64(self.call_id_atomic.fetch_add(1, Ordering::Relaxed));
            locked_msg.push_link_source(LinkCallStackEntry { id: call_id, link_call_node_id: self.id() });
            call_id
        };

        {
            let mut mut_state = self.mut_state.lock().await;
            let timeout_node = node.clone();
            let timeout_cancel = cancel.clone();
            let timeout_handle = mut_state
                .timeout_tasks
                .spawn(async move { timeout_node.timeout_task(call_id, timeout_cancel).await });
            mut_state.pending_calls.insert(call_id, PendingCall { msg: msg.clone(), timeout_handle });
        }

        self.forward_call_msg(msg, cancel).await
    }

    async fn forward_call_msg(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        match self.config.link_type {
            LinkType::Static => {
                let flow = self.flow().ok_or(WireflowError::InvalidOperation("The flow is gone".into()))?;
                let engine = flow.engine().ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?;
                let last_index = self.config.links.len().saturating_sub(1);
                for (i, link_in_id) in self.config.links.iter().enumerate() {
                    let link_node = flow
                        .get_node_by_id(link_in_id)
                        .or_else(|| engine.find_flow_node_by_id(link_in_id))
                        .ok_or(WireflowError::InvalidOperation(format!(
                            "Cannot find the `link in` node (id={})",
                            link_in_id
                        )))?;
                    let msg_to_send = if i == last_index { msg.clone() } else { msg.deep_clone(true).await };
                    link_node.inject_msg(msg_to_send, cancel.clone()).await?;
                }
            }
            LinkType::Dynamic => {
                let target_node = {
                    let locked_msg = msg.read().await;
                    self.get_dynamic_target_node(&locked_msg)?
                };
                if let Some(target_node) = target_node {
                    target_node.inject_msg(msg.clone(), cancel.clone()).await?;
                } else {
                    return Err(WireflowError::InvalidOperation("Cannot find node by msg.target".to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn get_dynamic_target_node(&self, msg: &Msg) -> crate::Result<Option<Arc<dyn FlowNodeBehavior>>> {
        let target_field = msg
            .get("target")
            .ok_or(WireflowError::InvalidOperation("There is no `target` field in the msg".to_string()))?;

        let result = match target_field {
            Variant::String(target_name) => {
                let engine = self.engine().ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?;
                // ids first, then names in this flow, then anywhere
                if let Some(parsed_id) = parse_id_str(target_name) {
                    if let Some(found) = engine.find_flow_node_by_id(&parsed_id) {
                        Some(found)
                    } else {
                        None
                    }
                } else {
                    let flow = self.flow().ok_or(WireflowError::InvalidOperation("The flow is gone".into()))?;

                    if let Some(node) = flow.get_node_by_name(target_name)? {
                        Some(node)
                    } else {
                        engine.find_flow_node_by_name(target_name)?
                    }
                }
            }
            _ => {
                let err_msg = format!("Unsupported dynamic target in `msg.target`: {:?}", target_field);
                return Err(WireflowError::InvalidOperation(err_msg).into());
            }
        };
        if let Some(node) = &result {
            if node.flow().map(|f| f.is_subflow()).unwrap_or(false) {
                return Err(WireflowError::InvalidOperation(
                    "A `link call` cannot call a `link in` node inside a subflow".to_string(),
                )
                .into());
            }
        }
        Ok(result)
    }

    /// One error per expired call: the pending entry is dropped and the
    /// caller's error path fires with the original message.
    async fn timeout_task(self: Arc<Self>, call_id: ElementId, cancel: CancellationToken) {
        let secs = self.config.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;

        let expired = {
            let mut mut_state = self.mut_state.lock().await;
            mut_state.pending_calls.remove(&call_id)
        };
        if let Some(expired) = expired {
            log::warn!("[link call:{}] call timed out, call_id={}", self.name(), call_id);
            {
                let mut msg_guard = expired.msg.write().await;
                msg_guard.pop_link_source();
            }
            self.report_error("link call timed out".to_string(), expired.msg.clone(), cancel).await;
        }
    }
}

#[async_trait]
impl FlowNodeBehavior for LinkCallNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.clone();
            let node = self.clone();
            with_uow(self.as_ref(), cancel.clone(), |_, msg| async move { node.uow(node.clone(), msg, cancel).await })
                .await;
        }

        {
            let mut mut_state = self.mut_state.lock().await;
            if !mut_state.timeout_tasks.is_empty() {
                mut_state.timeout_tasks.abort_all();
            }
            mut_state.pending_calls.clear();
        }
    }
}

#[async_trait]
impl LinkCallNodeBehavior for LinkCallNode {
    async fn return_msg(
        &self,
        msg: MsgHandle,
        stack_id: ElementId,
        _return_from_node_id: ElementId,
        _return_from_flow_id: ElementId,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let entry = {
            let mut mut_state = self.mut_state.lock().await;
            mut_state.pending_calls.remove(&stack_id)
        };
        match entry {
            Some(entry) => {
                self.fan_out_one(Envelope { msg, port: 0 }, cancel).await?;
                drop(entry);
                Ok(())
            }
            None => Err(WireflowError::InvalidOperation(format!(
                "Cannot find and(or) remove the pending call id: '{}'",
                stack_id
            ))
            .into()),
        }
    }
}
