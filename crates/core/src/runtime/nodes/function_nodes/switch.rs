use std::cmp::Ordering;
use std::sync::Arc;

use regex::RegexBuilder;
use serde::{Deserialize, Deserializer};
use smallvec::SmallVec;

use crate::runtime::eval;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Clone, Deserialize)]
struct SwitchRule {
    t: String,

    #[serde(default)]
    v: Option<String>,

    #[serde(default)]
    vt: Option<String>,

    #[serde(default)]
    v2: Option<String>,

    #[serde(default)]
    v2t: Option<String>,

    #[serde(default)]
    case: bool,
}

fn deser_checkall<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    // the editor writes this flag as the strings "true"/"false"
    let jv: serde_json::Value = Deserialize::deserialize(deserializer)?;
    Ok(match jv {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s != "false",
        _ => true,
    })
}

#[derive(Deserialize, Debug)]
struct SwitchNodeConfig {
    #[serde(default = "switch_property_default")]
    property: String,

    #[serde(default = "switch_property_type_default", rename = "propertyType")]
    property_type: String,

    #[serde(default)]
    rules: Vec<SwitchRule>,

    #[serde(default = "switch_checkall_default", deserialize_with = "deser_checkall")]
    checkall: bool,
}

fn switch_property_default() -> String {
    "payload".to_string()
}

fn switch_property_type_default() -> String {
    "msg".to_string()
}

fn switch_checkall_default() -> bool {
    true
}

/// Routes a message to the outputs whose rules match the evaluated
/// property. Output index i belongs to rule i; with `checkall` off the
/// first match wins.
#[derive(Debug)]
#[flow_node("switch")]
struct SwitchNode {
    base: FlowNode,
    config: SwitchNodeConfig,
}

impl SwitchNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let switch_config = SwitchNodeConfig::deserialize(&config.rest)?;
        let node = SwitchNode { base, config: switch_config };
        Ok(Box::new(node))
    }

    async fn evaluate_operand(&self, value: &Option<String>, vt: &Option<String>, msg: &Msg) -> Option<Variant> {
        let value = value.as_deref().unwrap_or("");
        let vt = vt.as_deref().unwrap_or("str");
        let ptype = PropertyType::from_str_kind(vt).ok()?;
        eval::evaluate_node_property(value, ptype, Some(self), self.flow().as_ref(), Some(msg)).await.ok()
    }

    async fn evaluate_subject(&self, msg: &Msg) -> Option<Variant> {
        match self.config.property_type.as_str() {
            "msg" => msg.get_nav_stripped(&self.config.property).cloned(),
            other => {
                let ptype = PropertyType::from_str_kind(other).ok()?;
                eval::evaluate_node_property(&self.config.property, ptype, Some(self), self.flow().as_ref(), Some(msg))
                    .await
                    .ok()
            }
        }
    }

    async fn rule_matches(&self, rule: &SwitchRule, subject: &Option<Variant>, msg: &Msg, matched_so_far: bool) -> bool {
        let value = subject.clone().unwrap_or(Variant::Null);
        match rule.t.as_str() {
            "eq" => match self.evaluate_operand(&rule.v, &rule.vt, msg).await {
                Some(operand) => loose_eq(&value, &operand),
                None => false,
            },
            "neq" => match self.evaluate_operand(&rule.v, &rule.vt, msg).await {
                Some(operand) => !loose_eq(&value, &operand),
                None => false,
            },
            "lt" | "lte" | "gt" | "gte" => match self.evaluate_operand(&rule.v, &rule.vt, msg).await {
                Some(operand) => match loose_cmp(&value, &operand) {
                    Some(ord) => match rule.t.as_str() {
                        "lt" => ord == Ordering::Less,
                        "lte" => ord != Ordering::Greater,
                        "gt" => ord == Ordering::Greater,
                        "gte" => ord != Ordering::Less,
                        _ => false,
                    },
                    None => false,
                },
                None => false,
            },
            "btwn" => {
                let low = self.evaluate_operand(&rule.v, &rule.vt, msg).await;
                let high = self.evaluate_operand(&rule.v2, &rule.v2t, msg).await;
                match (low, high) {
                    (Some(low), Some(high)) => {
                        loose_cmp(&value, &low).map(|o| o != Ordering::Less).unwrap_or(false)
                            && loose_cmp(&value, &high).map(|o| o != Ordering::Greater).unwrap_or(false)
                    }
                    _ => false,
                }
            }
            "cont" => match self.evaluate_operand(&rule.v, &rule.vt, msg).await {
                Some(operand) => contains(&value, &operand, rule.case),
                None => false,
            },
            "regex" => {
                let pattern = rule.v.as_deref().unwrap_or("");
                let re = RegexBuilder::new(pattern).case_insensitive(rule.case).build();
                match (re, value.to_cow_str()) {
                    (Ok(re), Ok(s)) => re.is_match(&s),
                    _ => false,
                }
            }
            "true" => value.is_truthy(),
            "false" => !value.is_truthy(),
            "null" => subject.is_none() || value.is_null(),
            "nnull" => subject.is_some() && !value.is_null(),
            "istype" => is_of_type(subject, rule.v.as_deref().unwrap_or("")),
            "empty" => match &value {
                Variant::String(s) => s.is_empty(),
                Variant::Array(a) => a.is_empty(),
                Variant::Bytes(b) => b.is_empty(),
                Variant::Object(o) => o.is_empty(),
                _ => false,
            },
            "nempty" => match &value {
                Variant::String(s) => !s.is_empty(),
                Variant::Array(a) => !a.is_empty(),
                Variant::Bytes(b) => !b.is_empty(),
                Variant::Object(o) => !o.is_empty(),
                _ => false,
            },
            "else" => !matched_so_far,
            other => {
                log::warn!("[switch:{}] Unsupported rule operator: '{}'", self.name(), other);
                false
            }
        }
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let matched_ports: Vec<usize> = {
            let msg_guard = msg.read().await;
            let subject = self.evaluate_subject(&msg_guard).await;

            let mut matched = Vec::new();
            for (i, rule) in self.config.rules.iter().enumerate() {
                if self.rule_matches(rule, &subject, &msg_guard, !matched.is_empty()).await {
                    matched.push(i);
                    if !self.config.checkall {
                        break;
                    }
                }
            }
            matched
        };

        // the first matching output gets the original message
        let mut envelopes = SmallVec::<[Envelope; 4]>::new();
        for (n, port) in matched_ports.iter().enumerate() {
            let to_send = if n == 0 { msg.clone() } else { msg.deep_clone(true).await };
            envelopes.push(Envelope { port: *port, msg: to_send });
        }
        self.fan_out_many(envelopes, cancel).await
    }
}

fn loose_eq(a: &Variant, b: &Variant) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn loose_cmp(a: &Variant, b: &Variant) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Variant::String(x), Variant::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_number(v: &Variant) -> Option<f64> {
    match v {
        Variant::Number(n) => n.as_f64(),
        Variant::String(s) => s.trim().parse::<f64>().ok(),
        Variant::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn contains(value: &Variant, operand: &Variant, case_insensitive: bool) -> bool {
    match value {
        Variant::Array(items) => items.iter().any(|item| loose_eq(item, operand)),
        _ => match (value.to_cow_str(), operand.to_cow_str()) {
            (Ok(haystack), Ok(needle)) => {
                if case_insensitive {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                } else {
                    haystack.contains(needle.as_ref())
                }
            }
            _ => false,
        },
    }
}

fn is_of_type(subject: &Option<Variant>, type_name: &str) -> bool {
    match (subject, type_name) {
        (None, "undefined") => true,
        (Some(Variant::Null), "null") => true,
        (Some(Variant::String(_)), "string") => true,
        (Some(Variant::Number(_)), "number") => true,
        (Some(Variant::Bool(_)), "boolean") => true,
        (Some(Variant::Array(_)), "array") => true,
        (Some(Variant::Bytes(_)), "buffer") => true,
        (Some(Variant::Object(_)), "object" | "json") => true,
        _ => false,
    }
}

#[async_trait]
impl FlowNodeBehavior for SwitchNode {
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

    #[test]
    fn test_loose_eq_and_cmp() {
        assert!(loose_eq(&Variant::from(10), &Variant::from("10")));
        assert!(loose_eq(&Variant::from("a"), &Variant::from("a")));
        assert!(!loose_eq(&Variant::from("a"), &Variant::from("b")));

        assert_eq!(loose_cmp(&Variant::from(5), &Variant::from("10")), Some(Ordering::Less));
        assert_eq!(loose_cmp(&Variant::from("b"), &Variant::from("a")), Some(Ordering::Greater));
        assert_eq!(loose_cmp(&Variant::Null, &Variant::from(1)), None);
    }

    #[test]
    fn test_contains() {
        assert!(contains(&Variant::from("hello world"), &Variant::from("WORLD"), true));
        assert!(!contains(&Variant::from("hello world"), &Variant::from("WORLD"), false));
        let list = Variant::Array(vec![Variant::from(1), Variant::from("x")]);
        assert!(contains(&list, &Variant::from("x"), false));
        assert!(!contains(&list, &Variant::from("y"), false));
    }

    #[test]
    fn test_is_of_type() {
        assert!(is_of_type(&None, "undefined"));
        assert!(is_of_type(&Some(Variant::Null), "null"));
        assert!(is_of_type(&Some(Variant::from("s")), "string"));
        assert!(is_of_type(&Some(Variant::Bytes(vec![1])), "buffer"));
        assert!(!is_of_type(&Some(Variant::from(1)), "string"));
    }
}
