use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::WireflowError;

mod eid;
mod msg;
mod typed;
mod variant;

pub mod json;
pub mod propex;

pub use eid::*;
pub use msg::*;
pub use typed::*;
pub use variant::*;

use super::context::Context;

/// Implemented by everything addressable in a flows document: flows,
/// groups, nodes.
pub trait FlowsElement: Sync + Send {
    fn id(&self) -> ElementId;
    fn name(&self) -> &str;
    fn type_str(&self) -> &'static str;
    fn ordering(&self) -> usize;
    fn is_disabled(&self) -> bool;
    fn as_any(&self) -> &dyn ::std::any::Any;
    fn parent_element(&self) -> Option<ElementId>;
    fn get_path(&self) -> String;
}

pub trait ContextHolder: FlowsElement + Sync + Send {
    fn context(&self) -> Arc<Context>;
}

/// A wire from an output port to one destination's input channel.
#[derive(Debug, Clone)]
pub struct PortWire {
    pub target_id: ElementId,
    pub msg_sender: MsgSender,
}

impl PortWire {
    pub async fn tx(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        tokio::select! {
            send_result = self.msg_sender.send(msg) => send_result.map_err(|e|
                WireflowError::InvalidOperation(format!("Failed to transmit message: {}", e)).into()),

            _ = cancel.cancelled() =>
                Err(WireflowError::TaskCancelled.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Port {
    pub wires: Vec<PortWire>,
}

impl Port {
    pub fn empty() -> Self {
        Port { wires: Vec::new() }
    }
}

pub type MsgSender = mpsc::Sender<MsgHandle>;
pub type MsgReceiver = mpsc::Receiver<MsgHandle>;

#[derive(Debug)]
pub struct MsgReceiverHolder {
    pub rx: Mutex<MsgReceiver>,
}

impl MsgReceiverHolder {
    pub fn new(rx: MsgReceiver) -> Self {
        MsgReceiverHolder { rx: Mutex::new(rx) }
    }

    pub async fn recv_msg_forever(&self) -> crate::Result<MsgHandle> {
        let rx = &mut self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => Ok(msg),
            None => {
                Err(WireflowError::InvalidOperation("The input channel has been closed".to_string()).into())
            }
        }
    }

    pub async fn recv_msg(&self, stop_token: CancellationToken) -> crate::Result<MsgHandle> {
        tokio::select! {
            result = self.recv_msg_forever() => result,

            _ = stop_token.cancelled() => {
                Err(WireflowError::TaskCancelled.into())
            }
        }
    }
}

pub type MsgUnboundedSender = mpsc::UnboundedSender<MsgHandle>;
pub type MsgUnboundedReceiver = mpsc::UnboundedReceiver<MsgHandle>;

#[derive(Debug)]
pub struct MsgUnboundedReceiverHolder {
    pub rx: Mutex<MsgUnboundedReceiver>,
}

impl MsgUnboundedReceiverHolder {
    pub fn new(rx: MsgUnboundedReceiver) -> Self {
        MsgUnboundedReceiverHolder { rx: Mutex::new(rx) }
    }

    pub async fn recv_msg_forever(&self) -> crate::Result<MsgHandle> {
        let rx = &mut self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => Ok(msg),
            None => {
                Err(WireflowError::InvalidOperation("The channel has been closed".to_string()).into())
            }
        }
    }

    pub async fn recv_msg(&self, stop_token: CancellationToken) -> crate::Result<MsgHandle> {
        tokio::select! {
            result = self.recv_msg_forever() => result,

            _ = stop_token.cancelled() => {
                Err(WireflowError::TaskCancelled.into())
            }
        }
    }
}

pub type MsgEventSender = tokio::sync::broadcast::Sender<MsgHandle>;
pub type MsgEventReceiver = tokio::sync::broadcast::Receiver<MsgHandle>;

/// The visual status badge a node publishes, routed to scope-filtered
/// `status` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Red,
    Green,
    Yellow,
    Blue,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Ring,
    Dot,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<StatusFill>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<StatusShape>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn empty() -> Self {
        NodeStatus { fill: None, shape: None, text: None }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        NodeStatus { fill: None, shape: None, text: Some(text.into()) }
    }

    pub fn to_variant(&self) -> Variant {
        let jv = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        Variant::from(jv)
    }
}
