use std::sync::Arc;

use serde::Deserialize;
use smallvec::SmallVec;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Deserialize, Debug)]
struct SplitNodeConfig {
    /// String separator (or chunk length, depending on `spltType`).
    #[serde(default = "splt_default")]
    splt: String,

    #[serde(default = "splt_type_default", rename = "spltType")]
    splt_type: String,

    #[serde(default = "arraysplt_default", rename = "arraySplt")]
    array_splt: usize,
}

fn splt_default() -> String {
    "\\n".to_string()
}

fn splt_type_default() -> String {
    "str".to_string()
}

fn arraysplt_default() -> usize {
    1
}

impl SplitNodeConfig {
    fn separator(&self) -> String {
        // the editor stores escapes literally
        self.splt.replace("\\n", "\n").replace("\\r", "\r").replace("\\t", "\t")
    }
}

/// Splits a payload into a sequence of child messages, each stamped with
/// `parts = {id, index, count, type, …}` so a downstream join can
/// reassemble the batch.
#[derive(Debug)]
#[flow_node("split")]
struct SplitNode {
    base: FlowNode,
    config: SplitNodeConfig,
}

impl SplitNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let split_config = SplitNodeConfig::deserialize(&config.rest)?;
        let node = SplitNode { base, config: split_config };
        Ok(Box::new(node))
    }

    fn make_parts(
        batch_id: &str,
        index: usize,
        count: usize,
        parts_type: &str,
        extra: &[(&str, Variant)],
    ) -> Variant {
        let mut parts = VariantObjectMap::new();
        parts.insert("id".to_string(), Variant::String(batch_id.to_string()));
        parts.insert("index".to_string(), Variant::from(index));
        parts.insert("count".to_string(), Variant::from(count));
        parts.insert("type".to_string(), Variant::String(parts_type.to_string()));
        for (k, v) in extra.iter() {
            parts.insert(k.to_string(), v.clone());
        }
        Variant::Object(parts)
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let batch_id = ElementId::new().to_string();
        let template = { msg.read().await.clone() };
        let payload = template.get(wellknown::PAYLOAD_PROPERTY).cloned().unwrap_or(Variant::Null);

        // (payload, parts) pairs for the children
        let mut children: Vec<(Variant, Variant)> = Vec::new();
        match payload {
            Variant::Array(items) => {
                let chunk = self.config.array_splt.max(1);
                let chunks: Vec<Vec<Variant>> =
                    items.chunks(chunk).map(|c| c.to_vec()).collect();
                let count = chunks.len();
                for (index, chunk_items) in chunks.into_iter().enumerate() {
                    let child_payload = if chunk == 1 {
                        chunk_items.into_iter().next().unwrap_or(Variant::Null)
                    } else {
                        Variant::Array(chunk_items)
                    };
                    let parts = Self::make_parts(&batch_id, index, count, "array", &[("len", Variant::from(chunk))]);
                    children.push((child_payload, parts));
                }
            }

            Variant::String(text) => {
                let sep = self.config.separator();
                let pieces: Vec<&str> =
                    if sep.is_empty() { vec![text.as_str()] } else { text.split(sep.as_str()).collect() };
                let count = pieces.len();
                for (index, piece) in pieces.into_iter().enumerate() {
                    let parts = Self::make_parts(
                        &batch_id,
                        index,
                        count,
                        "string",
                        &[("ch", Variant::String(sep.clone()))],
                    );
                    children.push((Variant::String(piece.to_string()), parts));
                }
            }

            Variant::Object(map) => {
                let count = map.len();
                for (index, (key, value)) in map.into_iter().enumerate() {
                    let parts =
                        Self::make_parts(&batch_id, index, count, "object", &[("key", Variant::String(key))]);
                    children.push((value, parts));
                }
            }

            Variant::Bytes(bytes) => {
                let chunk = self.config.array_splt.max(1);
                let chunks: Vec<Vec<u8>> = bytes.chunks(chunk).map(|c| c.to_vec()).collect();
                let count = chunks.len();
                for (index, piece) in chunks.into_iter().enumerate() {
                    let parts = Self::make_parts(&batch_id, index, count, "buffer", &[("len", Variant::from(chunk))]);
                    children.push((Variant::Bytes(piece), parts));
                }
            }

            // anything else passes through as a single-element sequence
            other => {
                let parts = Self::make_parts(&batch_id, 0, 1, "array", &[]);
                children.push((other, parts));
            }
        }

        let mut envelopes = SmallVec::<[Envelope; 4]>::new();
        for (child_payload, parts) in children.into_iter() {
            let mut child = template.clone();
            child.set_id(Msg::generate_id());
            child.set(wellknown::PAYLOAD_PROPERTY.to_string(), child_payload);
            child.set(wellknown::PARTS_PROPERTY.to_string(), parts);
            envelopes.push(Envelope { port: 0, msg: MsgHandle::new(child) });
        }
        for envelope in envelopes.into_iter() {
            self.fan_out_one(envelope, cancel.child_token()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for SplitNode {
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
    fn test_separator_unescaping() {
        let cfg: SplitNodeConfig = SplitNodeConfig::deserialize(&serde_json::json!({"splt": "\\n"})).unwrap();
        assert_eq!(cfg.separator(), "\n");

        let cfg: SplitNodeConfig = SplitNodeConfig::deserialize(&serde_json::json!({"splt": ";"})).unwrap();
        assert_eq!(cfg.separator(), ";");
    }
}
