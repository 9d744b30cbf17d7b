use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
enum JoinMode {
    #[default]
    #[serde(rename = "auto")]
    Auto,

    #[serde(rename = "custom")]
    Custom,
}

#[derive(Deserialize, Debug)]
struct JoinNodeConfig {
    #[serde(default)]
    mode: JoinMode,

    /// Custom mode: how to assemble the group.
    #[serde(default = "build_default")]
    build: String,

    /// Custom mode: group completion count (0 = explicit complete only).
    #[serde(default, deserialize_with = "json::deser::str_to_option_f64")]
    count: Option<f64>,

    /// Custom mode: the property that keys object entries.
    #[serde(default = "key_default", rename = "key")]
    key_property: String,

    #[serde(default = "joiner_default")]
    joiner: String,

    /// Custom mode: the property accumulated from each message.
    #[serde(default = "property_default")]
    property: String,
}

fn build_default() -> String {
    "array".to_string()
}

fn key_default() -> String {
    "topic".to_string()
}

fn joiner_default() -> String {
    "".to_string()
}

fn property_default() -> String {
    "payload".to_string()
}

#[derive(Debug, Default)]
struct PendingGroup {
    items: Vec<(usize, Variant)>,
    keyed_items: Vec<(String, Variant)>,
    expected: Option<usize>,
    parts_type: String,
    join_char: String,
    last_msg: Option<MsgHandle>,
}

#[derive(Debug, Default)]
struct JoinMutState {
    groups: HashMap<String, PendingGroup>,
}

/// Reassembles message sequences. Auto mode follows the `parts` metadata
/// written by a split; custom mode groups by topic (or a chosen key) and
/// completes by count or an explicit `msg.complete`.
#[derive(Debug)]
#[flow_node("join")]
struct JoinNode {
    base: FlowNode,
    config: JoinNodeConfig,
    mut_state: Mutex<JoinMutState>,
}

impl JoinNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let join_config = JoinNodeConfig::deserialize(&config.rest)?;
        let node = JoinNode { base, config: join_config, mut_state: Mutex::new(JoinMutState::default()) };
        Ok(Box::new(node))
    }

    fn assemble(parts_type: &str, join_char: &str, group: &mut PendingGroup) -> Variant {
        match parts_type {
            "string" => {
                group.items.sort_by_key(|(i, _)| *i);
                let pieces: Vec<String> =
                    group.items.iter().map(|(_, v)| v.to_cow_str().map(|c| c.into_owned()).unwrap_or_default()).collect();
                Variant::String(pieces.join(join_char))
            }
            "buffer" => {
                group.items.sort_by_key(|(i, _)| *i);
                let mut bytes = Vec::new();
                for (_, v) in group.items.iter() {
                    if let Some(b) = v.to_bytes() {
                        bytes.extend(b);
                    }
                }
                Variant::Bytes(bytes)
            }
            "object" => {
                let mut map = VariantObjectMap::new();
                for (k, v) in group.keyed_items.drain(..) {
                    map.insert(k, v);
                }
                Variant::Object(map)
            }
            "merged" => {
                let mut map = VariantObjectMap::new();
                group.items.sort_by_key(|(i, _)| *i);
                for (_, v) in group.items.iter() {
                    if let Some(obj) = v.as_object() {
                        for (k, val) in obj.iter() {
                            map.insert(k.clone(), val.clone());
                        }
                    }
                }
                Variant::Object(map)
            }
            // "array" and everything unrecognised
            _ => {
                group.items.sort_by_key(|(i, _)| *i);
                Variant::Array(group.items.drain(..).map(|(_, v)| v).collect())
            }
        }
    }

    async fn emit_group(&self, mut group: PendingGroup, cancel: CancellationToken) -> crate::Result<()> {
        let parts_type = group.parts_type.clone();
        let join_char = group.join_char.clone();
        let payload = Self::assemble(&parts_type, &join_char, &mut group);

        let mut out = match group.last_msg {
            Some(ref last) => last.read().await.clone(),
            None => Msg::default(),
        };
        out.set_id(Msg::generate_id());
        out.set(wellknown::PAYLOAD_PROPERTY.to_string(), payload);
        out.remove(wellknown::PARTS_PROPERTY);
        out.remove("complete");

        self.fan_out_one(Envelope { port: 0, msg: MsgHandle::new(out) }, cancel).await
    }

    async fn uow_auto(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let (group_id, index, count, parts_type, join_char, key, value) = {
            let guard = msg.read().await;
            let parts = guard
                .get(wellknown::PARTS_PROPERTY)
                .and_then(|p| p.as_object())
                .ok_or(WireflowError::InvalidOperation(
                    "The message has no `parts` to join on".to_string(),
                ))?;

            let group_id = parts.get("id").and_then(|v| v.as_str()).unwrap_or("_unknown").to_string();
            let index = parts.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let count = parts.get("count").and_then(|v| v.as_u64()).map(|c| c as usize);
            let parts_type = parts.get("type").and_then(|v| v.as_str()).unwrap_or("array").to_string();
            let join_char = parts.get("ch").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let key = parts.get("key").and_then(|v| v.as_str()).map(|s| s.to_string());
            let value = guard.get(wellknown::PAYLOAD_PROPERTY).cloned().unwrap_or(Variant::Null);
            (group_id, index, count, parts_type, join_char, key, value)
        };

        let completed_group = {
            let mut state = self.mut_state.lock().await;
            let group = state.groups.entry(group_id.clone()).or_default();
            group.parts_type = parts_type;
            group.join_char = join_char;
            if group.expected.is_none() {
                group.expected = count;
            }
            match key {
                Some(key) => group.keyed_items.push((key, value)),
                None => group.items.push((index, value)),
            }
            group.last_msg = Some(msg.clone());

            let received = group.items.len() + group.keyed_items.len();
            let done = group.expected.map(|c| received >= c).unwrap_or(false);
            if done {
                state.groups.remove(&group_id)
            } else {
                None
            }
        };

        if let Some(group) = completed_group {
            self.emit_group(group, cancel).await?;
        }
        Ok(())
    }

    async fn uow_custom(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let (group_key, value, entry_key, complete) = {
            let guard = msg.read().await;
            let group_key =
                guard.get(wellknown::TOPIC_PROPERTY).and_then(|t| t.as_str()).unwrap_or("_no_topic").to_string();
            let value = guard.get_nav_stripped(&self.config.property).cloned().unwrap_or(Variant::Null);
            let entry_key = guard.get(&self.config.key_property).and_then(|k| k.as_str()).map(|s| s.to_string());
            let complete = guard.contains("complete");
            (group_key, value, entry_key, complete)
        };

        let completed_group = {
            let mut state = self.mut_state.lock().await;
            let group = state.groups.entry(group_key.clone()).or_default();
            group.parts_type = self.config.build.clone();
            group.join_char = self.config.joiner.clone();
            let index = group.items.len();
            if self.config.build == "object" {
                group.keyed_items.push((entry_key.unwrap_or_else(|| index.to_string()), value));
            } else {
                group.items.push((index, value));
            }
            group.last_msg = Some(msg.clone());

            let received = group.items.len().max(group.keyed_items.len());
            let count_done =
                self.config.count.map(|c| c > 0.0 && received as f64 >= c).unwrap_or(false);
            if complete || count_done {
                state.groups.remove(&group_key)
            } else {
                None
            }
        };

        if let Some(group) = completed_group {
            self.emit_group(group, cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for JoinNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                match node.config.mode {
                    JoinMode::Auto => node.uow_auto(msg, cancel.child_token()).await,
                    JoinMode::Custom => node.uow_custom(msg, cancel.child_token()).await,
                }
            })
            .await;
        }

        self.mut_state.lock().await.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_string_join() {
        let mut group = PendingGroup {
            items: vec![(2, Variant::from("c")), (0, Variant::from("a")), (1, Variant::from("b"))],
            ..Default::default()
        };
        let joined = JoinNode::assemble("string", "-", &mut group);
        assert_eq!(joined, Variant::from("a-b-c"));
    }

    #[test]
    fn test_assemble_array_order() {
        let mut group = PendingGroup {
            items: vec![(1, Variant::from(2)), (0, Variant::from(1)), (2, Variant::from(3))],
            ..Default::default()
        };
        let joined = JoinNode::assemble("array", "", &mut group);
        assert_eq!(joined, Variant::Array(vec![Variant::from(1), Variant::from(2), Variant::from(3)]));
    }

    #[test]
    fn test_assemble_object_from_keyed_parts() {
        let mut group = PendingGroup {
            keyed_items: vec![("a".into(), Variant::from(1)), ("b".into(), Variant::from(2))],
            ..Default::default()
        };
        let joined = JoinNode::assemble("object", "", &mut group);
        let obj = joined.as_object().unwrap();
        assert_eq!(obj.get("a"), Some(&Variant::from(1)));
        assert_eq!(obj.get("b"), Some(&Variant::from(2)));
    }

    #[test]
    fn test_assemble_buffer_concat() {
        let mut group = PendingGroup {
            items: vec![(0, Variant::Bytes(vec![1, 2])), (1, Variant::Bytes(vec![3]))],
            ..Default::default()
        };
        let joined = JoinNode::assemble("buffer", "", &mut group);
        assert_eq!(joined, Variant::Bytes(vec![1, 2, 3]));
    }
}
