use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize, Debug)]
struct WatchNodeConfig {
    /// Comma separated paths.
    #[serde(default)]
    files: String,

    #[serde(default)]
    recursive: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct FileStamp {
    modified: Option<SystemTime>,
    size: u64,
}

/// Emits one message per filesystem event on the watched paths. The
/// backend polls metadata; a dedicated notification collaborator can
/// replace it where inotify-grade latency matters.
#[derive(Debug)]
#[flow_node("watch")]
struct WatchNode {
    base: FlowNode,
    config: WatchNodeConfig,
}

impl WatchNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let watch_config = WatchNodeConfig::deserialize(&config.rest)?;
        let node = WatchNode { base, config: watch_config };
        Ok(Box::new(node))
    }

    fn roots(&self) -> Vec<PathBuf> {
        self.config
            .files
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    fn scan_into(&self, path: &Path, depth: usize, snapshot: &mut HashMap<PathBuf, FileStamp>) {
        if let Ok(md) = std::fs::metadata(path) {
            if md.is_file() {
                snapshot
                    .insert(path.to_path_buf(), FileStamp { modified: md.modified().ok(), size: md.len() });
            } else if md.is_dir() && (self.config.recursive || depth == 0) {
                if let Ok(entries) = std::fs::read_dir(path) {
                    for entry in entries.flatten() {
                        let child = entry.path();
                        if child.is_dir() && !self.config.recursive {
                            continue;
                        }
                        self.scan_into(&child, depth + 1, snapshot);
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> HashMap<PathBuf, FileStamp> {
        let mut result = HashMap::new();
        for root in self.roots() {
            self.scan_into(&root, 0, &mut result);
        }
        result
    }

    async fn emit_event(&self, event: &str, path: &Path, cancel: CancellationToken) {
        let mut out = Msg::with_payload(Variant::String(path.to_string_lossy().into_owned()));
        out.set("file".to_string(), Variant::String(path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default()));
        out.set("event".to_string(), Variant::String(event.to_string()));
        out.set(wellknown::TOPIC_PROPERTY.to_string(), Variant::String(path.to_string_lossy().into_owned()));
        if let Err(e) = self.fan_out_one(Envelope { port: 0, msg: MsgHandle::new(out) }, cancel).await {
            log::warn!("[watch:{}] Failed to emit event: {}", self.name(), e);
        }
    }
}

#[async_trait]
impl FlowNodeBehavior for WatchNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        let mut previous = self.snapshot();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = self.snapshot();

                    for (path, stamp) in current.iter() {
                        match previous.get(path) {
                            None => self.emit_event("created", path, stop_token.child_token()).await,
                            Some(old) if old != stamp => {
                                self.emit_event("changed", path, stop_token.child_token()).await
                            }
                            _ => {}
                        }
                    }
                    for path in previous.keys() {
                        if !current.contains_key(path) {
                            self.emit_event("deleted", path, stop_token.child_token()).await;
                        }
                    }

                    previous = current;
                }

                _ = stop_token.cancelled() => break,
            }
        }
    }
}
