use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
enum RbeFunc {
    #[default]
    #[serde(rename = "rbe")]
    Rbe,

    #[serde(rename = "rbei")]
    Rbei,

    #[serde(rename = "narrowband")]
    Narrowband,

    #[serde(rename = "narrowbandEq")]
    NarrowbandEq,

    #[serde(rename = "deadband")]
    Deadband,

    #[serde(rename = "deadbandEq")]
    DeadbandEq,
}

impl RbeFunc {
    fn is_rbe(&self) -> bool {
        matches!(self, RbeFunc::Rbe | RbeFunc::Rbei)
    }

    fn is_narrowband(&self) -> bool {
        matches!(self, RbeFunc::Narrowband | RbeFunc::NarrowbandEq)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RbeNodeConfig {
    #[serde(default)]
    func: RbeFunc,

    #[serde(default, deserialize_with = "deser_f64_percent_or_0")]
    gap: f64,

    #[serde(skip, default)]
    is_percent: bool,

    #[serde(default, rename = "start", deserialize_with = "json::deser::str_to_option_f64")]
    start_value: Option<f64>,

    #[serde(rename = "septopics", default = "septopics_default")]
    sep_topics: bool,

    #[serde(rename = "property", default = "property_default")]
    property: String,

    #[serde(rename = "topi", default = "topic_default")]
    topic: String,
}

fn septopics_default() -> bool {
    true
}

fn property_default() -> String {
    "payload".to_string()
}

fn topic_default() -> String {
    "topic".to_string()
}

fn deser_f64_percent_or_0<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;

    match value {
        serde_json::Value::Number(num) => num.as_f64().ok_or_else(|| serde::de::Error::custom("Invalid f64")),

        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(0.0)
            } else if let Some(stripped) = trimmed.strip_suffix('%') {
                stripped.parse::<f64>().map(|n| n / 100.0).map_err(serde::de::Error::custom)
            } else {
                trimmed.parse::<f64>().map_err(serde::de::Error::custom)
            }
        }

        _ => Ok(0.0),
    }
}

#[derive(Debug, Default)]
struct RbeState {
    previous: HashMap<String, Variant>,
}

/// Report-by-exception and band filtering: a message passes only when the
/// watched property moved (enough) since the last pass.
#[derive(Debug)]
#[flow_node("rbe")]
struct RbeNode {
    base: FlowNode,
    config: RbeNodeConfig,
    state: Mutex<RbeState>,
}

impl RbeNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let mut rbe_config = RbeNodeConfig::deserialize(&config.rest)?;
        rbe_config.is_percent =
            config.rest.get("gap").and_then(|g| g.as_str()).map(|s| s.trim().ends_with('%')).unwrap_or(false);
        let node = RbeNode { base, config: rbe_config, state: Mutex::new(RbeState::default()) };
        Ok(Box::new(node))
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let should_send = {
            let guard = msg.read().await;

            // msg.reset clears the remembered values
            if guard.contains("reset") {
                let mut state = self.state.lock().await;
                if self.config.sep_topics {
                    if let Some(topic) = guard.get(&self.config.topic).and_then(|t| t.as_str()) {
                        state.previous.remove(topic);
                    } else {
                        state.previous.clear();
                    }
                } else {
                    state.previous.clear();
                }
                return Ok(());
            }

            let value = match guard.get_nav_stripped(&self.config.property) {
                Some(v) => v.clone(),
                None => return Ok(()),
            };

            let key = if self.config.sep_topics {
                guard.get(&self.config.topic).and_then(|t| t.as_str()).unwrap_or("_no_topic").to_string()
            } else {
                "_no_topic".to_string()
            };

            let mut state = self.state.lock().await;
            let previous = state.previous.get(&key);

            let send = if self.config.func.is_rbe() {
                let changed = previous.map(|p| p != &value).unwrap_or(true);
                if previous.is_none() && self.config.func == RbeFunc::Rbei {
                    // ignore-initial: remember but do not emit
                    state.previous.insert(key, value);
                    return Ok(());
                }
                if changed {
                    state.previous.insert(key, value);
                }
                changed
            } else {
                // band functions need numbers
                let current_num = match value.as_f64() {
                    Some(n) => n,
                    None => {
                        return Err(WireflowError::InvalidOperation(format!(
                            "The property '{}' is not a number",
                            self.config.property
                        ))
                        .into())
                    }
                };
                let prev_num = previous.and_then(|p| p.as_f64()).or(self.config.start_value);

                match prev_num {
                    None => {
                        state.previous.insert(key, value);
                        // no baseline yet: deadband drops, narrowband sends
                        self.config.func.is_narrowband()
                    }
                    Some(prev_num) => {
                        let gap = if self.config.is_percent {
                            (self.config.gap * prev_num).abs()
                        } else {
                            self.config.gap
                        };
                        let distance = (current_num - prev_num).abs();
                        let outside = match self.config.func {
                            RbeFunc::Deadband => distance > gap,
                            RbeFunc::DeadbandEq => distance >= gap,
                            RbeFunc::Narrowband => distance > gap,
                            RbeFunc::NarrowbandEq => distance >= gap,
                            _ => false,
                        };
                        let send = if self.config.func.is_narrowband() { !outside } else { outside };
                        if send {
                            state.previous.insert(key, value);
                        }
                        send
                    }
                }
            };
            send
        };

        if should_send {
            self.fan_out_one(Envelope { port: 0, msg }, cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for RbeNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                node.uow(msg, cancel.child_token()).await
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gap_deserialization() {
        let cfg: RbeNodeConfig = RbeNodeConfig::deserialize(&json!({"gap": "10%"})).unwrap();
        assert_eq!(cfg.gap, 0.1);

        let cfg: RbeNodeConfig = RbeNodeConfig::deserialize(&json!({"gap": "2.5"})).unwrap();
        assert_eq!(cfg.gap, 2.5);

        let cfg: RbeNodeConfig = RbeNodeConfig::deserialize(&json!({"gap": ""})).unwrap();
        assert_eq!(cfg.gap, 0.0);
    }
}
