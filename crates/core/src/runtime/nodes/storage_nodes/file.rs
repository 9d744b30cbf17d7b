use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Deserialize, Debug)]
struct FileNodeConfig {
    #[serde(default)]
    filename: String,

    /// `str` takes the configured name; `msg` reads it from the message.
    #[serde(default = "filename_type_default", rename = "filenameType")]
    filename_type: String,

    #[serde(default = "truthy_string_default", rename = "appendNewline")]
    append_newline: String,

    /// `"true"` overwrite, `"false"` append, `"delete"` remove the file.
    #[serde(default = "falsy_string_default", rename = "overwriteFile")]
    overwrite_file: String,

    #[serde(default, rename = "createDir")]
    create_dir: bool,

    #[serde(default = "encoding_default")]
    encoding: String,
}

fn filename_type_default() -> String {
    "str".to_string()
}

fn truthy_string_default() -> String {
    "true".to_string()
}

fn falsy_string_default() -> String {
    "false".to_string()
}

fn encoding_default() -> String {
    "utf8".to_string()
}

/// Writes, appends or deletes a file per message, then relays the
/// message.
#[derive(Debug)]
#[flow_node("file")]
struct FileNode {
    base: FlowNode,
    config: FileNodeConfig,
}

impl FileNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let file_config = FileNodeConfig::deserialize(&config.rest)?;
        let node = FileNode { base, config: file_config };
        Ok(Box::new(node))
    }

    async fn resolve_filename(&self, msg: &MsgHandle) -> crate::Result<PathBuf> {
        let name = if self.config.filename_type == "msg" {
            let guard = msg.read().await;
            guard
                .get_nav_stripped(&self.config.filename)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .ok_or(WireflowError::InvalidOperation(format!(
                    "Cannot resolve the filename from 'msg.{}'",
                    self.config.filename
                )))?
        } else {
            self.config.filename.clone()
        };
        if name.is_empty() {
            return Err(WireflowError::InvalidOperation("No filename configured".into()).into());
        }
        Ok(PathBuf::from(name))
    }

    async fn payload_bytes(&self, msg: &MsgHandle) -> Vec<u8> {
        let guard = msg.read().await;
        let payload = guard.get(wellknown::PAYLOAD_PROPERTY);
        let mut bytes = match payload {
            Some(Variant::Bytes(b)) => b.clone(),
            Some(Variant::String(s)) => s.clone().into_bytes(),
            Some(other) => serde_json::to_string(other).unwrap_or_default().into_bytes(),
            None => Vec::new(),
        };
        // the newline suffix only applies to text writes
        if self.config.append_newline != "false" && !matches!(payload, Some(Variant::Bytes(_))) {
            bytes.push(b'\n');
        }
        bytes
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        let path = self.resolve_filename(&msg).await?;

        match self.config.overwrite_file.as_str() {
            "delete" => {
                tokio::fs::remove_file(&path).await?;
            }
            mode => {
                if self.config.create_dir {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                let bytes = self.payload_bytes(&msg).await;
                if mode == "true" {
                    tokio::fs::write(&path, &bytes).await?;
                } else {
                    let mut file =
                        tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
                    file.write_all(&bytes).await?;
                    file.flush().await?;
                }
            }
        }

        self.fan_out_one(Envelope { port: 0, msg }, cancel).await
    }
}

#[async_trait]
impl FlowNodeBehavior for FileNode {
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
