use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::runtime::eval;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

const ALL_TOPICS_KEY: &str = "_none_";

#[derive(Deserialize, Debug)]
struct TriggerNodeConfig {
    #[serde(default)]
    op1: String,

    #[serde(default = "op1type_default", rename = "op1type")]
    op1_type: String,

    #[serde(default)]
    op2: String,

    #[serde(default = "op2type_default", rename = "op2type")]
    op2_type: String,

    #[serde(default = "duration_default", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    duration: f64,

    #[serde(default = "units_default")]
    units: String,

    #[serde(default)]
    extend: bool,

    #[serde(default, rename = "overrideDelay")]
    override_delay: bool,

    #[serde(default)]
    reset: String,

    /// `all` arms one shared state, anything else arms per topic.
    #[serde(default = "bytopic_default")]
    bytopic: String,
}

fn op1type_default() -> String {
    "val".to_string()
}

fn op2type_default() -> String {
    "val".to_string()
}

fn duration_default() -> f64 {
    250.0
}

fn units_default() -> String {
    "ms".to_string()
}

fn bytopic_default() -> String {
    "all".to_string()
}

impl TriggerNodeConfig {
    fn base_duration(&self) -> Duration {
        let millis = match self.units.as_str() {
            "s" => self.duration * 1000.0,
            "min" => self.duration * 60_000.0,
            "hr" => self.duration * 3_600_000.0,
            _ => self.duration,
        };
        if millis.is_nan() || millis < 0.0 {
            Duration::ZERO
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

#[derive(Debug)]
struct ArmedEntry {
    timer: Option<tokio::task::AbortHandle>,
    /// The message the second emission resolves against; `overrideDelay`
    /// swaps it on restart.
    msg: MsgHandle,
}

#[derive(Debug, Default)]
struct TriggerMutState {
    armed: HashMap<String, ArmedEntry>,
}

/// Emits a first value on arrival and a second one after a delay. While
/// armed, further messages are blocked unless `extend`/`overrideDelay`
/// restart the timer; a reset cancels the pending second emission.
#[derive(Debug)]
#[flow_node("trigger")]
struct TriggerNode {
    base: FlowNode,
    config: TriggerNodeConfig,
    mut_state: Mutex<TriggerMutState>,
    timer_tasks: Mutex<JoinSet<()>>,
}

impl TriggerNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let trigger_config = TriggerNodeConfig::deserialize(&config.rest)?;
        let node = TriggerNode {
            base,
            config: trigger_config,
            mut_state: Mutex::new(TriggerMutState::default()),
            timer_tasks: Mutex::new(JoinSet::new()),
        };
        Ok(Box::new(node))
    }

    async fn arm_key(&self, msg: &MsgHandle) -> String {
        if self.config.bytopic == "all" {
            return ALL_TOPICS_KEY.to_string();
        }
        let guard = msg.read().await;
        guard.get(wellknown::TOPIC_PROPERTY).and_then(|t| t.as_str()).unwrap_or(ALL_TOPICS_KEY).to_string()
    }

    async fn is_reset(&self, msg: &MsgHandle) -> bool {
        let guard = msg.read().await;
        if guard.contains("reset") {
            return true;
        }
        if !self.config.reset.is_empty() {
            if let Some(payload) = guard.get(wellknown::PAYLOAD_PROPERTY) {
                if payload.to_cow_str().map(|s| s == self.config.reset.as_str()).unwrap_or(false) {
                    return true;
                }
            }
        }
        false
    }

    async fn resolve_op(&self, op: &str, op_type: &str, msg: &MsgHandle) -> crate::Result<Option<MsgHandle>> {
        match op_type {
            "nothing" => Ok(None),
            "pay" | "payl" => Ok(Some(msg.clone())),
            _ => {
                let (value, topic) = {
                    let guard = msg.read().await;
                    let ptype = PropertyType::from_str_kind(if op_type == "val" { "str" } else { op_type })?;
                    let value =
                        eval::evaluate_node_property(op, ptype, Some(self), self.flow().as_ref(), Some(&guard)).await?;
                    (value, guard.get(wellknown::TOPIC_PROPERTY).cloned())
                };
                let mut out = Msg::with_payload(value);
                if let Some(topic) = topic {
                    out.set(wellknown::TOPIC_PROPERTY.to_string(), topic);
                }
                Ok(Some(MsgHandle::new(out)))
            }
        }
    }

    async fn msg_delay(&self, msg: &MsgHandle) -> Duration {
        if self.config.override_delay {
            let guard = msg.read().await;
            if let Some(ms) = guard.get("delay").and_then(|d| d.as_f64()).filter(|x| *x >= 0.0) {
                return Duration::from_millis(ms as u64);
            }
        }
        self.config.base_duration()
    }

    async fn spawn_timer(
        &self,
        node: Arc<Self>,
        key: String,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Option<tokio::task::AbortHandle> {
        // a zero duration means "stay armed until reset": no second shot
        if delay.is_zero() {
            return None;
        }
        let mut tasks = self.timer_tasks.lock().await;
        Some(tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let entry = {
                let mut state = node.mut_state.lock().await;
                state.armed.remove(&key)
            };
            if let Some(entry) = entry {
                match node.resolve_op(&node.config.op2, &node.config.op2_type, &entry.msg).await {
                    Ok(Some(out)) => {
                        if let Err(e) = node.fan_out_one(Envelope { port: 0, msg: out }, cancel).await {
                            log::warn!("[trigger:{}] Failed to emit: {}", node.name(), e);
                        }
                    }
                    Ok(None) => (),
                    Err(e) => {
                        node.report_error(e.to_string(), entry.msg.clone(), cancel).await;
                    }
                }
            }
        }))
    }

    async fn uow(&self, node: Arc<Self>, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let key = self.arm_key(&msg).await;

        if self.is_reset(&msg).await {
            let mut state = self.mut_state.lock().await;
            if let Some(entry) = state.armed.remove(&key) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
            return Ok(());
        }

        let mut state = self.mut_state.lock().await;
        if let Some(entry) = state.armed.get_mut(&key) {
            if self.config.extend || self.config.override_delay {
                // restart the pending timer
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                if self.config.override_delay {
                    entry.msg = msg.clone();
                }
                let delay = self.msg_delay(&entry.msg).await;
                entry.timer = self.spawn_timer(node, key, delay, cancel).await;
            }
            // blocked while armed
            return Ok(());
        }

        // not armed: arm first so a short timer cannot race the insert
        let delay = self.msg_delay(&msg).await;
        state.armed.insert(key.clone(), ArmedEntry { timer: None, msg: msg.clone() });
        drop(state);

        let timer = self.spawn_timer(node, key.clone(), delay, cancel.clone()).await;
        {
            let mut state = self.mut_state.lock().await;
            if let Some(entry) = state.armed.get_mut(&key) {
                entry.timer = timer;
            }
        }

        if let Some(out) = self.resolve_op(&self.config.op1, &self.config.op1_type, &msg).await? {
            self.fan_out_one(Envelope { port: 0, msg: out }, cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for TriggerNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            let node = self.clone();
            with_uow(self.as_ref(), cancel.child_token(), |_, msg| async move {
                node.uow(node.clone(), msg, cancel).await
            })
            .await;
        }

        // release pending timers
        let mut tasks = self.timer_tasks.lock().await;
        tasks.abort_all();
        self.mut_state.lock().await.armed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_units() {
        let cfg: TriggerNodeConfig =
            TriggerNodeConfig::deserialize(&json!({"duration": "2", "units": "s"})).unwrap();
        assert_eq!(cfg.base_duration(), Duration::from_secs(2));

        let cfg: TriggerNodeConfig = TriggerNodeConfig::deserialize(&json!({"duration": 250})).unwrap();
        assert_eq!(cfg.base_duration(), Duration::from_millis(250));

        let cfg: TriggerNodeConfig = TriggerNodeConfig::deserialize(&json!({"duration": "0"})).unwrap();
        assert!(cfg.base_duration().is_zero());
    }
}
