use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::runtime::engine::Engine;
use crate::runtime::group::{Group, WeakGroup};
use smallvec::SmallVec;
use tokio::select;

// Node implementations pull these in through the glob import.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub use super::context::Context;
use crate::runtime::env::*;
use crate::runtime::flow::*;
use crate::runtime::hooks::*;
use crate::runtime::model::json::{FlowNodeConfig, GlobalNodeConfig};
use crate::runtime::model::*;
pub use crate::{ErrorContext, WireflowError};
use crate::*;

pub(crate) mod common_nodes;
mod function_nodes;
mod sequence_nodes;

#[cfg(feature = "nodes_fs")]
mod storage_nodes;

#[cfg(feature = "nodes_mqtt")]
pub(crate) mod network_nodes;

pub const NODE_MSG_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
pub enum NodeKind {
    Flow = 0,
    Global = 1,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NodeKind::Flow => write!(f, "FlowNode"),
            NodeKind::Global => write!(f, "GlobalNode"),
        }
    }
}

type GlobalNodeFactoryFn = fn(&Engine, GlobalNode, &GlobalNodeConfig) -> crate::Result<Box<dyn GlobalNodeBehavior>>;

type FlowNodeFactoryFn = fn(&Flow, FlowNode, &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>>;

#[derive(Debug, Clone, Copy)]
pub enum NodeFactory {
    Global(GlobalNodeFactoryFn),
    Flow(FlowNodeFactoryFn),
}

#[derive(Debug)]
pub struct MetaNode {
    pub kind: NodeKind,
    pub type_: &'static str,
    pub factory: NodeFactory,
}

/// The runtime state every flow node carries: identity, input channel,
/// output ports, status cell and its own stop token. Ports sit behind a
/// lock so partial deploys can rewire a running node.
#[derive(Debug)]
pub struct FlowNode {
    pub id: ElementId,
    pub name: String,
    pub type_str: &'static str,
    pub ordering: usize,
    pub disabled: bool,
    pub active: bool,
    pub flow: WeakFlow,
    pub msg_tx: MsgSender,
    pub msg_rx: MsgReceiverHolder,
    pub ports: std::sync::RwLock<Vec<Port>>,
    pub group: Option<WeakGroup>,
    pub envs: Envs,
    pub context: Arc<Context>,
    pub hooks: Arc<Hooks>,
    pub status: std::sync::RwLock<Option<NodeStatus>>,
    pub stop_token: CancellationToken,
    pub(crate) closing: AtomicBool,
}

impl FlowNode {
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// The base of a config/global node; owns the shared resource and its
/// reference-counted user set.
#[derive(Debug)]
pub struct GlobalNode {
    pub id: ElementId,
    pub name: String,
    pub type_str: &'static str,
    pub ordering: usize,
    pub context: Arc<Context>,
    pub disabled: bool,
    users: std::sync::Mutex<Vec<ElementId>>,
}

impl GlobalNode {
    pub fn new(
        id: ElementId,
        name: String,
        type_str: &'static str,
        ordering: usize,
        context: Arc<Context>,
        disabled: bool,
    ) -> Self {
        GlobalNode { id, name, type_str, ordering, context, disabled, users: std::sync::Mutex::new(Vec::new()) }
    }

    /// Registers a user node; returns the user count afterwards.
    pub fn register_user(&self, user: ElementId) -> usize {
        let mut users = self.users.lock().expect("users lock");
        if !users.contains(&user) {
            users.push(user);
        }
        users.len()
    }

    /// Removes a user node; returns the user count afterwards. The owner
    /// shuts the underlying resource down when this reaches zero.
    pub fn remove_user(&self, user: ElementId) -> usize {
        let mut users = self.users.lock().expect("users lock");
        users.retain(|x| *x != user);
        users.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().expect("users lock").len()
    }
}

#[async_trait]
pub trait GlobalNodeBehavior: Send + Sync + FlowsElement {
    fn get_base(&self) -> &GlobalNode;

    /// Releases the owned resource. Invoked when the node is removed by a
    /// deploy or the engine shuts down.
    async fn close(&self) {}
}

#[async_trait]
pub trait FlowNodeBehavior: Send + Sync + FlowsElement {
    fn get_base(&self) -> &FlowNode;

    /// The node's main task. Runs until the stop token fires.
    async fn run(self: Arc<Self>, stop_token: CancellationToken);

    /// Releases timers, subscriptions and processes. Runs after the main
    /// task has stopped. `removed` marks eviction rather than restart.
    async fn close(&self, _removed: bool) {}

    fn group(&self) -> Option<Group> {
        self.get_base().group.clone().and_then(|x| x.upgrade())
    }

    fn flow(&self) -> Option<Flow> {
        self.get_base().flow.upgrade()
    }

    fn envs(&self) -> &Envs {
        &self.get_base().envs
    }

    fn get_env(&self, key: &str) -> Option<Variant> {
        self.get_base().envs.evaluate_env(key)
    }

    fn engine(&self) -> Option<Engine> {
        self.get_base().flow.upgrade()?.engine()
    }

    /// Queues a message into this node's input channel. A closing or
    /// disabled node silently drops it.
    async fn inject_msg(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        if self.get_base().is_closing() || self.get_base().disabled {
            log::trace!("Dropping message to inactive node {}", self.id());
            return Ok(());
        }
        select! {
            result = self.get_base().msg_tx.send(msg) => result.map_err(|e| e.into()),
            _ = cancel.cancelled() => Err(WireflowError::TaskCancelled.into()),
        }
    }

    /// Waits for the next input message. The `onReceive` chain runs before
    /// the message is handed out; a halt verdict swallows the message.
    async fn recv_msg(&self, stop_token: CancellationToken) -> crate::Result<MsgHandle> {
        loop {
            let msg = self.get_base().msg_rx.recv_msg(stop_token.clone()).await?;
            if self.get_base().is_closing() {
                return Err(WireflowError::TaskCancelled.into());
            }

            let hooks = &self.get_base().hooks;
            if hooks.has("onReceive") {
                let payload = HookPayload::Receive(ReceiveEvent { destination_id: self.id(), msg: msg.clone() });
                match hooks.trigger("onReceive", payload).await {
                    Ok(HookTriggerResult::Completed(HookPayload::Receive(e))) => return Ok(e.msg),
                    Ok(HookTriggerResult::Completed(_)) => return Ok(msg),
                    Ok(HookTriggerResult::Halted) => continue,
                    Err(e) => {
                        log::error!("[{}:{}] onReceive hook failed: {:?}", self.type_str(), self.name(), e);
                        continue;
                    }
                }
            }
            return Ok(msg);
        }
    }

    async fn notify_uow_completed(&self, msg: MsgHandle, cancel: CancellationToken) {
        let hooks = &self.get_base().hooks;
        if hooks.has("onComplete") {
            let payload = HookPayload::Complete(CompleteEvent { node_id: self.id(), msg: msg.clone() });
            if let Err(e) = hooks.trigger("onComplete", payload).await {
                log::error!("[{}:{}] onComplete hook failed: {:?}", self.type_str(), self.name(), e);
            }
        }
        let (node_id, flow) = { (self.id(), self.get_base().flow.upgrade()) };
        if let Some(flow) = flow {
            flow.notify_node_uow_completed(&node_id, msg, cancel).await;
        }
    }

    /// Delivers one envelope. This is a send call: `onSend` runs once,
    /// then `preRoute`/`preDeliver`/`postDeliver` per destination. Every
    /// destination other than the last receives a deep clone; delivery
    /// failures are isolated per destination.
    async fn fan_out_one(&self, envelope: Envelope, cancel: CancellationToken) -> crate::Result<()> {
        let base = self.get_base();
        if base.disabled {
            // disabled nodes produce no output
            return Ok(());
        }
        {
            let ports = base.ports.read().expect("ports lock");
            if ports.is_empty() {
                log::trace!("No output wires in this node: Node(id='{}', name='{}')", self.id(), self.name());
                return Ok(());
            }
            if envelope.port >= ports.len() {
                return Err(WireflowError::BadArgument("envelope"))
                    .with_context(|| format!("Invalid port index {}", envelope.port));
            }
        }

        let hooks = &base.hooks;
        let mut msg = envelope.msg.clone();
        if hooks.has("onSend") {
            let payload = HookPayload::Send(SendEvent {
                source_id: self.id(),
                source_port: envelope.port,
                destination_id: None,
                msg: msg.clone(),
            });
            match hooks.trigger("onSend", payload).await? {
                HookTriggerResult::Halted => return Ok(()),
                HookTriggerResult::Completed(HookPayload::Send(e)) => msg = e.msg,
                HookTriggerResult::Completed(_) => (),
            }
        }

        let wires: Vec<PortWire> = {
            let ports = base.ports.read().expect("ports lock");
            ports[envelope.port].wires.clone()
        };

        let last_index = wires.len().saturating_sub(1);
        for (i, wire) in wires.iter().enumerate() {
            let msg_to_send = if i == last_index { msg.clone() } else { msg.deep_clone(true).await };

            if let Some(halted_or_msg) = self
                .run_destination_hooks(hooks, envelope.port, wire.target_id, msg_to_send, "preRoute")
                .await?
            {
                let msg_to_send = halted_or_msg;
                let msg_to_send = match self
                    .run_destination_hooks(hooks, envelope.port, wire.target_id, msg_to_send, "preDeliver")
                    .await?
                {
                    Some(m) => m,
                    None => continue, // halted: this leg only
                };

                if let Err(err) = wire.tx(msg_to_send.clone(), cancel.clone()).await {
                    if err.downcast_ref::<WireflowError>().map(|e| matches!(e, WireflowError::TaskCancelled)).unwrap_or(false) {
                        return Err(err);
                    }
                    log::warn!(
                        "[{}:{}] Failed to deliver message to node {}: {}",
                        self.type_str(),
                        self.name(),
                        wire.target_id,
                        err
                    );
                    continue;
                }

                let _ = self
                    .run_destination_hooks(hooks, envelope.port, wire.target_id, msg_to_send, "postDeliver")
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs one per-destination hook chain. `None` means halted.
    async fn run_destination_hooks(
        &self,
        hooks: &Arc<Hooks>,
        port: usize,
        destination_id: ElementId,
        msg: MsgHandle,
        hook_id: &str,
    ) -> crate::Result<Option<MsgHandle>> {
        if !hooks.has(hook_id) {
            return Ok(Some(msg));
        }
        let payload = HookPayload::Send(SendEvent {
            source_id: self.id(),
            source_port: port,
            destination_id: Some(destination_id),
            msg: msg.clone(),
        });
        match hooks.trigger(hook_id, payload).await? {
            HookTriggerResult::Halted => Ok(None),
            HookTriggerResult::Completed(HookPayload::Send(e)) => Ok(Some(e.msg)),
            HookTriggerResult::Completed(_) => Ok(Some(msg)),
        }
    }

    /// Dispatches to multiple ports: the i-th envelope to port i. Each
    /// envelope counts as one send call.
    async fn fan_out_many(&self, envelopes: SmallVec<[Envelope; 4]>, cancel: CancellationToken) -> crate::Result<()> {
        for e in envelopes.into_iter() {
            self.fan_out_one(e, cancel.child_token()).await?;
        }
        Ok(())
    }

    /// Updates the node status and publishes it to scope-filtered status
    /// nodes of the owning flow.
    async fn set_status(&self, status: NodeStatus, cancel: CancellationToken)
    where
        Self: Sized,
    {
        {
            let mut cell = self.get_base().status.write().expect("status lock");
            *cell = Some(status.clone());
        }
        if let Some(flow) = self.flow() {
            flow.handle_status(self, &status, None, cancel).await;
        }
    }

    async fn clear_status(&self, cancel: CancellationToken)
    where
        Self: Sized,
    {
        {
            let mut cell = self.get_base().status.write().expect("status lock");
            *cell = None;
        }
        if let Some(flow) = self.flow() {
            flow.handle_status(self, &NodeStatus::empty(), None, cancel).await;
        }
    }

    /// Publishes an error to the scope-filtered catch nodes of the owning
    /// flow. The flow writes the single ERROR record.
    async fn report_error(&self, log_message: String, msg: MsgHandle, cancel: CancellationToken)
    where
        Self: Sized,
    {
        if let Some(flow) = self.flow() {
            if let Err(e) = flow.handle_error(self, &log_message, Some(msg), None, cancel).await {
                log::error!("Failed to handle error: {:?}", e);
            }
        } else {
            log::error!("[{}:{}] {}", self.type_str(), self.name(), log_message);
        }
    }

    // events
    fn on_loaded(&self) {}
    async fn on_starting(&self) {}
}

impl dyn FlowNodeBehavior {
    pub fn type_id(&self) -> ::std::any::TypeId {
        self.as_any().type_id()
    }
}

impl fmt::Debug for dyn FlowNodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FlowNode(id='{}', type='{}', name='{}')", self.id(), self.type_str(), self.name(),))
    }
}

impl fmt::Display for dyn FlowNodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FlowNode(id='{}', type='{}', name='{}')", self.id(), self.type_str(), self.name(),))
    }
}

impl fmt::Debug for dyn GlobalNodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "GlobalNode(id='{}', type='{}', name='{}')",
            self.id(),
            self.get_base().type_str,
            self.name(),
        ))
    }
}

impl fmt::Display for dyn GlobalNodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "GlobalNode(id='{}', type='{}', name='{}')",
            self.id(),
            self.get_base().type_str,
            self.name(),
        ))
    }
}

/// One unit of work: receive a message, run the handler, then publish the
/// completion side channel. Handler errors route to the flow's catch
/// nodes; the failed message still counts as handled.
pub async fn with_uow<'a, B, F, T>(node: &'a B, cancel: CancellationToken, proc: F)
where
    B: FlowNodeBehavior,
    F: FnOnce(&'a B, MsgHandle) -> T,
    T: std::future::Future<Output = crate::Result<()>>,
{
    match node.recv_msg(cancel.clone()).await {
        Ok(msg) => {
            if let Err(ref err) = proc(node, msg.clone()).await {
                let error_message = err.to_string();
                if let Some(flow) = node.flow() {
                    match flow.handle_error(node, &error_message, Some(msg.clone()), None, cancel.clone()).await {
                        Ok(_) => (),
                        Err(e) => {
                            log::error!("Failed to handle error: {:?}", e);
                        }
                    }
                } else {
                    log::error!("[{}:{}] {}", node.type_str(), node.name(), error_message);
                }
            }

            // postReceive marks the hop as processed
            let hooks = &node.get_base().hooks;
            if hooks.has("postReceive") {
                let payload = HookPayload::Receive(ReceiveEvent { destination_id: node.id(), msg: msg.clone() });
                if let Err(e) = hooks.trigger("postReceive", payload).await {
                    log::error!("[{}:{}] postReceive hook failed: {:?}", node.type_str(), node.name(), e);
                }
            }

            // Report the completion
            node.notify_uow_completed(msg, cancel.clone()).await;
        }
        Err(ref err) => {
            if let Some(WireflowError::TaskCancelled) = err.downcast_ref::<WireflowError>() {
                return;
            }

            log::warn!("[{}:{}] {}", node.type_str(), node.name(), err);
        }
    }
}

#[async_trait]
pub trait LinkCallNodeBehavior: Send + Sync + FlowNodeBehavior {
    /// Receives a returning message for a pending call.
    async fn return_msg(
        &self,
        msg: MsgHandle,
        stack_id: ElementId,
        return_from_node_id: ElementId,
        return_from_flow_id: ElementId,
        cancel: CancellationToken,
    ) -> crate::Result<()>;
}
