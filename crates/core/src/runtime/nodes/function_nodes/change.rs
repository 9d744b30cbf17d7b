use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::runtime::context::evaluate_key;
use crate::runtime::eval;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Clone, Deserialize, PartialEq)]
enum RuleKind {
    #[serde(rename = "set")]
    Set,

    #[serde(rename = "change")]
    Change,

    #[serde(rename = "delete")]
    Delete,

    #[serde(rename = "move")]
    Move,
}

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    pub t: RuleKind,

    pub p: String,
    pub pt: PropertyType,

    #[serde(default)]
    pub to: Option<String>,

    #[serde(default)]
    pub tot: Option<PropertyType>,

    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub fromt: Option<PropertyType>,

    #[serde(default, rename = "fromRE")]
    pub from_regex_str: Option<String>,
}

impl Rule {
    fn from_regex(&self) -> Option<Regex> {
        self.from_regex_str.as_deref().and_then(|s| Regex::new(s).ok())
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChangeNodeConfig {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Rewrites message, flow-context and global-context properties rule by
/// rule: set, search/replace, delete, move.
#[derive(Debug)]
#[flow_node("change")]
struct ChangeNode {
    base: FlowNode,
    config: ChangeNodeConfig,
}

#[async_trait]
impl FlowNodeBehavior for ChangeNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.clone();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                {
                    let mut msg_guard = msg.write().await;
                    // The message is relayed whether or not the rules
                    // applied cleanly.
                    node.apply_rules(&mut msg_guard).await;
                }
                node.fan_out_one(Envelope { port: 0, msg }, cancel.clone()).await
            })
            .await;
        }
    }
}

impl ChangeNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let json = handle_legacy_json(config.rest.clone())?;
        let change_config = ChangeNodeConfig::deserialize(&json)?;
        let node = ChangeNode { base, config: change_config };
        Ok(Box::new(node))
    }

    async fn get_to_value(&self, rule: &Rule, msg: &Msg) -> crate::Result<Variant> {
        if let (Some(tot), Some(to)) = (rule.tot, rule.to.as_ref()) {
            eval::evaluate_node_property(to, tot, Some(self), self.flow().as_ref(), Some(msg)).await
        } else {
            Err(WireflowError::BadFlowsJson("The `tot` and `to` in the rule cannot be None".into()).into())
        }
    }

    async fn get_from_value(&self, rule: &Rule, msg: &Msg) -> crate::Result<Variant> {
        if let (Some(fromt), Some(from)) = (rule.fromt, rule.from.as_ref()) {
            eval::evaluate_node_property(from, fromt, Some(self), self.flow().as_ref(), Some(msg)).await
        } else {
            Err(WireflowError::BadFlowsJson("The `fromt` and `from` in the rule cannot be None".into()).into())
        }
    }

    async fn apply_rules(&self, msg: &mut Msg) {
        for rule in self.config.rules.iter() {
            if let Err(err) = self.apply_rule(rule, msg).await {
                log::warn!("[change:{}] Failed to apply rule: {}", self.name(), err);
            }
        }
    }

    async fn apply_rule(&self, rule: &Rule, msg: &mut Msg) -> crate::Result<()> {
        match rule.t {
            RuleKind::Set => {
                let to_value = self.get_to_value(rule, msg).await.ok();
                self.apply_rule_set(rule, msg, to_value).await
            }
            RuleKind::Change => {
                let to_value = self.get_to_value(rule, msg).await.ok();
                self.apply_rule_change(rule, msg, to_value).await
            }
            RuleKind::Delete => self.apply_rule_delete(rule, msg).await,
            RuleKind::Move => self.apply_rule_move(rule, msg).await,
        }
    }

    async fn write_target(&self, pt: PropertyType, p: &str, msg: &mut Msg, value: Option<Variant>) -> crate::Result<()> {
        match pt {
            PropertyType::Msg => match value {
                Some(value) => msg.set_nav_stripped(p, value, true),
                None => {
                    let _ = msg.remove_nav_stripped(p);
                    Ok(())
                }
            },

            PropertyType::Flow | PropertyType::Global => {
                let ctx = match pt {
                    PropertyType::Flow => self
                        .flow()
                        .map(|f| f.context())
                        .ok_or(WireflowError::InvalidOperation("The flow is gone".into()))?,
                    _ => self
                        .engine()
                        .map(|e| e.context())
                        .ok_or(WireflowError::InvalidOperation("The engine is gone".into()))?,
                };
                let ctx_prop = evaluate_key(p)?;
                let msg_env = [PropexEnv::ExtRef("msg", msg.as_variant())];
                ctx.set_one(ctx_prop.store, ctx_prop.key, value, &msg_env).await
            }

            _ => Err(WireflowError::NotSupported(
                "The 'change' node only modifies `msg` and flow/global context properties".into(),
            )
            .into()),
        }
    }

    async fn read_target(&self, pt: PropertyType, p: &str, msg: &Msg) -> Option<Variant> {
        match pt {
            PropertyType::Msg => msg.get_nav_stripped(p).cloned(),
            PropertyType::Flow | PropertyType::Global => {
                eval::evaluate_node_property(p, pt, Some(self), self.flow().as_ref(), Some(msg)).await.ok()
            }
            _ => None,
        }
    }

    async fn apply_rule_set(&self, rule: &Rule, msg: &mut Msg, to_value: Option<Variant>) -> crate::Result<()> {
        match (rule.pt, to_value) {
            // an unresolvable value clears the property, like the
            // `undefined` assignment it mirrors
            (PropertyType::Msg, None) => {
                let _ = msg.remove_nav_stripped(&rule.p);
                Ok(())
            }
            (pt, value) => self.write_target(pt, &rule.p, msg, value).await,
        }
    }

    async fn apply_rule_change(&self, rule: &Rule, msg: &mut Msg, to_value: Option<Variant>) -> crate::Result<()> {
        let to_value = match to_value {
            None => return Ok(()),
            Some(v) => v,
        };

        let current = match self.read_target(rule.pt, &rule.p, msg).await {
            Some(v) => v,
            None => return Ok(()),
        };

        // regex replace path
        if let Some(re) = rule.from_regex() {
            if let Variant::String(ref current_str) = current {
                let replaced = re.replace_all(current_str, to_value.to_string()?.as_str());
                let value_to_set = match (rule.tot, replaced.as_ref()) {
                    (Some(PropertyType::Bool), "true") => to_value,
                    (Some(PropertyType::Bool), "false") => to_value,
                    _ => Variant::String(replaced.into_owned()),
                };
                return self.write_target(rule.pt, &rule.p, msg, Some(value_to_set)).await;
            }
            return Ok(());
        }

        let from_value = match self.get_from_value(rule, msg).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };

        match &current {
            Variant::String(current_str) => {
                if current == from_value {
                    // a string holding exactly the from value is replaced
                    // wholesale, keeping the target type
                    self.write_target(rule.pt, &rule.p, msg, Some(to_value)).await
                } else {
                    let replaced = current_str.replace(&from_value.to_string()?, &to_value.to_string()?);
                    self.write_target(rule.pt, &rule.p, msg, Some(Variant::String(replaced))).await
                }
            }

            Variant::Number(_) | Variant::Bool(_) if current == from_value => {
                self.write_target(rule.pt, &rule.p, msg, Some(to_value)).await
            }

            _ => Ok(()),
        }
    }

    async fn apply_rule_delete(&self, rule: &Rule, msg: &mut Msg) -> crate::Result<()> {
        self.write_target(rule.pt, &rule.p, msg, None).await
    }

    /// Move = read, delete, then write under the new name.
    async fn apply_rule_move(&self, rule: &Rule, msg: &mut Msg) -> crate::Result<()> {
        let (to, tot) = match (rule.to.as_ref(), rule.tot) {
            (Some(to), Some(tot)) => (to.clone(), tot),
            _ => {
                return Err(WireflowError::BadFlowsJson("A `move` rule needs `to` and `tot`".into()).into());
            }
        };

        let value = match self.read_target(rule.pt, &rule.p, msg).await {
            Some(v) => v,
            None => return Ok(()),
        };
        self.write_target(rule.pt, &rule.p, msg, None).await?;
        self.write_target(tot, &to, msg, Some(value)).await
    }
}

fn handle_legacy_json(n: Value) -> crate::Result<Value> {
    let mut rules: Vec<Value> = if let Some(Value::Array(existed_rules)) = n.get("rules") {
        existed_rules.to_vec()
    } else {
        let mut rule = serde_json::json!({
            "t": if n["action"] == "replace" {
                "set"
            } else {
                n["action"].as_str().unwrap_or("")
            },
            "p": n["property"].as_str().unwrap_or("")
        });

        if rule["t"] == "set" || rule["t"] == "move" {
            rule["to"] = n.get("to").cloned().unwrap_or(Value::String("".to_string()));
        } else if rule["t"] == "change" {
            rule["from"] = n.get("from").cloned().unwrap_or("".into());
            rule["to"] = n.get("to").cloned().unwrap_or("".into());
            rule["re"] = n.get("reg").cloned().unwrap_or(Value::Bool(true));
        }
        vec![rule]
    };

    let old_from_re_pattern = regex::Regex::new(r"[-\[\]{}()*+?.,\\^$|#\s]")?;
    for rule in rules.iter_mut() {
        // migrate to type-aware rules
        if rule.get("pt").is_none() {
            rule["pt"] = "msg".into();
        }

        if let (Some("change"), Some(_)) = (rule.get("t").and_then(|t| t.as_str()), rule.get("re")) {
            rule["fromt"] = "re".into();
            rule.as_object_mut().map(|m| m.remove("re"));
        }

        if let (Some("set"), None, Some(Value::String(to))) =
            (rule.get("t").and_then(|t| t.as_str()), rule.get("tot"), rule.get("to"))
        {
            if to.starts_with("msg.") {
                rule["to"] = to.trim_start_matches("msg.").into();
                rule["tot"] = "msg".into();
            }
        }

        if rule.get("tot").is_none() {
            rule["tot"] = "str".into();
        }

        if rule.get("fromt").is_none() {
            rule["fromt"] = "str".into();
        }

        if let (Some(t), Some(fromt), Some(from)) = (rule.get("t"), rule.get("fromt"), rule.get("from")) {
            if t == "change" && fromt != "msg" && fromt != "flow" && fromt != "global" {
                let from_str = from.as_str().unwrap_or("");
                let mut from_re = from_str.to_string();

                if fromt != "re" {
                    from_re = old_from_re_pattern.replace_all(&from_re, r"\$&").to_string();
                }

                if fromt == "re" || !from_re.is_empty() {
                    match regex::Regex::new(&from_re) {
                        Ok(re) if fromt == "re" => {
                            rule["fromRE"] = Value::String(re.as_str().to_string());
                        }
                        Ok(_) => (),
                        Err(e) => {
                            log::error!("Invalid regexp: {}", e);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    let mut changed = n.clone();
    changed["rules"] = Value::Array(rules);
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_single_action_becomes_rule() {
        let legacy = json!({
            "action": "replace",
            "property": "payload",
            "to": "fixed"
        });
        let fixed = handle_legacy_json(legacy).unwrap();
        let rules = fixed["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["t"], "set");
        assert_eq!(rules[0]["p"], "payload");
        assert_eq!(rules[0]["pt"], "msg");
        assert_eq!(rules[0]["tot"], "str");
    }

    #[test]
    fn test_legacy_msg_to_target_migration() {
        let legacy = json!({
            "rules": [ { "t": "set", "p": "out", "to": "msg.payload" } ]
        });
        let fixed = handle_legacy_json(legacy).unwrap();
        let rules = fixed["rules"].as_array().unwrap();
        assert_eq!(rules[0]["to"], "payload");
        assert_eq!(rules[0]["tot"], "msg");
    }
}
