use std::sync::Arc;

use serde::Deserialize;
use smallvec::SmallVec;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Deserialize, Debug)]
struct FileInNodeConfig {
    #[serde(default)]
    filename: String,

    #[serde(default = "filename_type_default", rename = "filenameType")]
    filename_type: String,

    /// `utf8` whole text, `lines` one message per line, anything else a
    /// byte buffer.
    #[serde(default = "format_default")]
    format: String,
}

fn filename_type_default() -> String {
    "str".to_string()
}

fn format_default() -> String {
    "utf8".to_string()
}

/// Reads a file when a message arrives and emits its content, whole or
/// line by line with `parts` metadata.
#[derive(Debug)]
#[flow_node("file in")]
struct FileInNode {
    base: FlowNode,
    config: FileInNodeConfig,
}

impl FileInNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let file_config = FileInNodeConfig::deserialize(&config.rest)?;
        let node = FileInNode { base, config: file_config };
        Ok(Box::new(node))
    }

    async fn resolve_filename(&self, msg: &MsgHandle) -> crate::Result<String> {
        let name = if self.config.filename_type == "msg" {
            let guard = msg.read().await;
            guard
                .get_nav_stripped(&self.config.filename)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default()
        } else {
            self.config.filename.clone()
        };
        if name.is_empty() {
            return Err(WireflowError::InvalidOperation("No filename configured".into()).into());
        }
        Ok(name)
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let filename = self.resolve_filename(&msg).await?;
        let template = { msg.read().await.clone() };

        match self.config.format.as_str() {
            "lines" => {
                let text = tokio::fs::read_to_string(&filename).await?;
                let batch_id = ElementId::new().to_string();
                let lines: Vec<&str> = text.lines().collect();
                let count = lines.len();
                let mut envelopes = SmallVec::<[Envelope; 4]>::new();
                for (index, line) in lines.into_iter().enumerate() {
                    let mut out = template.clone();
                    out.set_id(Msg::generate_id());
                    out.set(wellknown::PAYLOAD_PROPERTY.to_string(), Variant::String(line.to_string()));
                    let mut parts = VariantObjectMap::new();
                    parts.insert("id".to_string(), Variant::String(batch_id.clone()));
                    parts.insert("index".to_string(), Variant::from(index));
                    parts.insert("count".to_string(), Variant::from(count));
                    parts.insert("type".to_string(), Variant::String("string".to_string()));
                    parts.insert("ch".to_string(), Variant::String("\n".to_string()));
                    out.set(wellknown::PARTS_PROPERTY.to_string(), Variant::Object(parts));
                    envelopes.push(Envelope { port: 0, msg: MsgHandle::new(out) });
                }
                for envelope in envelopes.into_iter() {
                    self.fan_out_one(envelope, cancel.child_token()).await?;
                }
            }
            "utf8" => {
                let text = tokio::fs::read_to_string(&filename).await?;
                let mut out = template;
                out.set_id(Msg::generate_id());
                out.set(wellknown::PAYLOAD_PROPERTY.to_string(), Variant::String(text));
                self.fan_out_one(Envelope { port: 0, msg: MsgHandle::new(out) }, cancel).await?;
            }
            _ => {
                let bytes = tokio::fs::read(&filename).await?;
                let mut out = template;
                out.set_id(Msg::generate_id());
                out.set(wellknown::PAYLOAD_PROPERTY.to_string(), Variant::Bytes(bytes));
                self.fan_out_one(Envelope { port: 0, msg: MsgHandle::new(out) }, cancel).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for FileInNode {
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
