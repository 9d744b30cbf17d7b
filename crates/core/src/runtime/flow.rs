use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::runtime::nodes::common_nodes::catch::{CatchNode, CatchScope};
use crate::runtime::nodes::common_nodes::status::{StatusNode, StatusScope};
use dashmap::DashMap;
use itertools::Itertools;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::context::Context;
use super::engine::{Engine, WeakEngine};
use super::group::{Group, GroupParent};
use super::registry::RegistryHandle;
use super::subflow::SubflowState;
use crate::runtime::env::*;
use crate::runtime::model::json::*;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use crate::WireflowError;
use crate::*;

pub type FlowNodeTask = tokio::task::JoinHandle<()>;

#[derive(Debug, Clone, Deserialize)]
pub struct FlowArgs {
    pub node_msg_queue_capacity: usize,
}

impl FlowArgs {
    pub fn load(cfg: Option<&config::Config>) -> crate::Result<Self> {
        match cfg {
            Some(cfg) => match cfg.get::<Self>("runtime.flow") {
                Ok(res) => Ok(res),
                Err(config::ConfigError::NotFound(_)) => Ok(Self::default()),
                Err(e) => Err(e.into()),
            },
            _ => Ok(Self::default()),
        }
    }
}

impl Default for FlowArgs {
    fn default() -> Self {
        Self { node_msg_queue_capacity: NODE_MSG_CHANNEL_CAPACITY }
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    inner: Arc<InnerFlow>,
}

#[derive(Debug, Clone)]
pub struct WeakFlow {
    inner: Weak<InnerFlow>,
}

impl WeakFlow {
    pub fn upgrade(&self) -> Option<Flow> {
        Weak::upgrade(&self.inner).map(|x| Flow { inner: x })
    }
}

#[derive(Debug, Clone)]
pub enum FlowKind {
    GlobalFlow,
    Subflow,
}

#[derive(Debug)]
struct InnerFlow {
    id: ElementId,
    parent: Option<ElementId>,
    label: String,
    disabled: bool,
    args: FlowArgs,
    ordering: usize,
    type_str: &'static str,

    engine: WeakEngine,

    stop_token: CancellationToken,

    pub(crate) groups: DashMap<ElementId, Group>,
    pub(crate) nodes: DashMap<ElementId, Arc<dyn FlowNodeBehavior>>,
    pub(crate) complete_nodes_map: DashMap<ElementId, Vec<Arc<dyn FlowNodeBehavior>>>,
    pub(crate) catch_nodes: std::sync::RwLock<Vec<Arc<dyn FlowNodeBehavior>>>,
    pub(crate) status_nodes: std::sync::RwLock<Vec<Arc<dyn FlowNodeBehavior>>>,
    pub(crate) node_tasks: Mutex<HashMap<ElementId, FlowNodeTask>>,

    subflow_state: Option<SubflowState>,

    envs: Envs,
    context: Arc<Context>,
}

impl FlowsElement for Flow {
    fn id(&self) -> ElementId {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.label
    }

    fn type_str(&self) -> &'static str {
        self.inner.type_str
    }

    fn ordering(&self) -> usize {
        self.inner.ordering
    }

    fn parent_element(&self) -> Option<ElementId> {
        self.inner.parent
    }

    fn as_any(&self) -> &dyn ::std::any::Any {
        self
    }

    fn is_disabled(&self) -> bool {
        self.inner.disabled
    }

    fn get_path(&self) -> String {
        match self.parent_element().and_then(|pid| {
            self.inner.engine.upgrade().and_then(|e| e.find_flow_node_by_id(&pid)).map(|n| n.get_path())
        }) {
            Some(path) => path,
            None => self.inner.id.to_string(),
        }
    }
}

impl ContextHolder for Flow {
    fn context(&self) -> Arc<Context> {
        self.inner.context.clone()
    }
}

impl Flow {
    pub fn downgrade(&self) -> WeakFlow {
        WeakFlow { inner: Arc::downgrade(&self.inner) }
    }

    pub(crate) fn new(
        engine: &Engine,
        flow_config: &FlowConfig,
        reg: &RegistryHandle,
        options: Option<&config::Config>,
    ) -> crate::Result<Flow> {
        let flow_kind = match flow_config.type_name.as_str() {
            "tab" => FlowKind::GlobalFlow,
            "subflow" => FlowKind::Subflow,
            _ => return Err(WireflowError::BadFlowsJson("Unsupported flow type".to_string()).into()),
        };

        let subflow_instance = flow_config.subflow_node_id.and_then(|x| engine.find_flow_node_by_id(&x));

        let mut envs_builder = EnvStoreBuilder::default();
        envs_builder = match flow_kind {
            FlowKind::GlobalFlow => envs_builder.with_parent(&engine.get_envs()),
            FlowKind::Subflow => {
                if let Some(ref instance) = subflow_instance {
                    envs_builder.with_parent(instance.envs())
                } else {
                    log::warn!("Cannot find the instance node of the subflow: id='{}'", flow_config.id);
                    envs_builder.with_parent(&engine.get_envs())
                }
            }
        };
        if let Some(env_json) = flow_config.rest.get("env") {
            envs_builder = envs_builder.load_json(env_json);
        }
        if let Some(ref instance) = subflow_instance {
            // merge from subflow instance
            envs_builder = envs_builder.update_with(instance.envs());
        }

        envs_builder = match flow_kind {
            FlowKind::GlobalFlow => envs_builder.extends([
                ("WF_FLOW_ID".into(), flow_config.id.to_string().into()),
                ("WF_FLOW_NAME".into(), flow_config.label.clone().into()),
            ]),
            FlowKind::Subflow => {
                let subflow_instance = subflow_instance
                    .as_ref()
                    .ok_or(WireflowError::BadFlowsJson("The id of the subflow instance node is missing".to_string()))?
                    .clone();
                envs_builder.extends([
                    ("WF_SUBFLOW_ID".into(), subflow_instance.id().to_string().into()),
                    ("WF_SUBFLOW_NAME".into(), subflow_instance.name().into()),
                    (
                        "WF_SUBFLOW_PATH".into(),
                        format!(
                            "{}/{}",
                            subflow_instance.flow().map(|f| f.id().to_string()).unwrap_or_default(),
                            subflow_instance.id()
                        )
                        .into(),
                    ),
                ])
            }
        };
        let envs = envs_builder.build();

        let context = engine.get_context_manager().new_context(&engine.context(), flow_config.id.to_string());
        let args = FlowArgs::load(options)?;

        let inner_flow = InnerFlow {
            id: flow_config.id,
            parent: subflow_instance.clone().map(|x| x.id()),
            engine: engine.downgrade(),
            label: flow_config.label.clone(),
            disabled: flow_config.disabled,
            ordering: flow_config.ordering,
            args: args.clone(),
            type_str: match flow_kind {
                FlowKind::GlobalFlow => "flow",
                FlowKind::Subflow => "subflow",
            },
            groups: DashMap::new(),
            nodes: DashMap::new(),
            complete_nodes_map: DashMap::new(),
            catch_nodes: std::sync::RwLock::new(Vec::new()),
            status_nodes: std::sync::RwLock::new(Vec::new()),
            node_tasks: Mutex::new(HashMap::new()),

            subflow_state: match flow_kind {
                FlowKind::Subflow => Some(SubflowState::new(engine, flow_config, &args)?),
                FlowKind::GlobalFlow => None,
            },
            envs,
            context,
            stop_token: CancellationToken::new(),
        };
        let flow = Flow { inner: Arc::new(inner_flow) };

        flow.populate_groups(flow_config)?;

        // First construct every node with empty ports, then wire. Cyclic
        // graphs are legal, so wiring cannot happen during construction.
        for node_config in flow_config.nodes.iter() {
            flow.add_node(node_config, reg, engine)?;
        }
        for node_config in flow_config.nodes.iter() {
            flow.rebuild_node_ports(node_config, engine)?;
        }

        if let Some(subflow_state) = &flow.inner.subflow_state {
            subflow_state.populate_in_nodes(&flow, flow_config)?;
        }

        Ok(flow)
    }

    fn populate_groups(&self, flow_config: &FlowConfig) -> crate::Result<()> {
        if !self.inner.groups.is_empty() {
            self.inner.groups.clear();
        }
        let root_group_configs = flow_config.groups.iter().filter(|gc| gc.z == self.id());
        for gc in root_group_configs {
            let group = match &gc.g {
                // Subgroup
                Some(parent_id) => {
                    let parent = self
                        .inner
                        .groups
                        .get(parent_id)
                        .map(|x| x.value().clone())
                        .ok_or(WireflowError::InvalidOperation(format!("Cannot find parent group id `{}`", parent_id)))?;
                    Group::new_subgroup(gc, self, &parent)?
                }

                // Root group
                None => Group::new_flow_group(gc, self)?,
            };
            self.inner.groups.insert(group.id(), group);
        }
        Ok(())
    }

    /// Constructs one node from its config and registers it in this flow.
    /// Ports stay empty until [`rebuild_node_ports`](Self::rebuild_node_ports).
    pub(crate) fn add_node(
        &self,
        node_config: &FlowNodeConfig,
        reg: &RegistryHandle,
        engine: &Engine,
    ) -> crate::Result<Arc<dyn FlowNodeBehavior>> {
        let meta_node = if let Some(meta_node) = reg.get(&node_config.type_name) {
            meta_node
        } else if node_config.type_name.starts_with("subflow:") {
            reg.get("subflow").expect("The `subflow` node must exist")
        } else {
            log::warn!(
                "Unknown flow node type: (type='{}', id='{}', name='{}')",
                node_config.type_name,
                node_config.id,
                node_config.name
            );
            reg.get("unknown.flow").expect("The `unknown.flow` node must exist")
        };

        let node = match meta_node.factory {
            NodeFactory::Flow(factory) => {
                let node_state = self.new_flow_node_state(meta_node, node_config, engine).map_err(|e| {
                    log::error!("Failed to create flow node(id='{}'): {:?}", node_config.id, e);
                    e
                })?;

                match factory(self, node_state, node_config) {
                    Ok(node) => node,
                    Err(err) => {
                        // fail-soft: keep the slot occupied so the graph
                        // stays wired, but run nothing
                        log::error!("Failed to build node from {}: {}", node_config, err);
                        let unknown = reg.get("unknown.flow").expect("The `unknown.flow` node must exist");
                        let node_state = self.new_flow_node_state(unknown, node_config, engine)?;
                        match unknown.factory {
                            NodeFactory::Flow(unknown_factory) => unknown_factory(self, node_state, node_config)?,
                            NodeFactory::Global(_) => return Err(err),
                        }
                    }
                }
            }
            NodeFactory::Global(_) => {
                return Err(WireflowError::NotSupported(format!(
                    "Must be a flow node: Node(id={0}, type='{1}')",
                    node_config.id, node_config.type_name
                ))
                .into())
            }
        };

        let arc_node: Arc<dyn FlowNodeBehavior> = Arc::from(node);
        arc_node.on_loaded();
        self.inner.nodes.insert(node_config.id, arc_node.clone());
        engine.register_flow_node(arc_node.clone())?;

        log::debug!("------ {} has been loaded.", arc_node);

        self.register_internal_node(arc_node.clone(), node_config)?;
        Ok(arc_node)
    }

    /// Recomputes the output wires of one node against the current node
    /// population. Runs at load and again when a deploy rewires the node.
    pub(crate) fn rebuild_node_ports(&self, node_config: &FlowNodeConfig, engine: &Engine) -> crate::Result<()> {
        let node = self
            .inner
            .nodes
            .get(&node_config.id)
            .map(|x| x.value().clone())
            .ok_or(WireflowError::InvalidOperation(format!("Unknown node id '{}'", node_config.id)))?;

        let mut ports = Vec::with_capacity(node_config.wires.len());
        for port_config in node_config.wires.iter() {
            let mut wires = Vec::new();
            for nid in port_config.node_ids.iter() {
                // first inside this flow, then the entire engine
                let node_in_flow = self.inner.nodes.get(nid).map(|x| x.value().clone());
                let node_entry = node_in_flow.or_else(|| engine.find_flow_node_by_id(nid)).ok_or(
                    WireflowError::InvalidOperation(format!(
                        "[flow:{}] Referenced node not found [this_node.id='{}' this_node.name='{}', referenced_node.id='{}']",
                        self.name(),
                        node_config.id,
                        node_config.name,
                        nid
                    )),
                )?;
                wires.push(PortWire { target_id: *nid, msg_sender: node_entry.get_base().msg_tx.to_owned() });
            }
            ports.push(Port { wires });
        }

        // Wires that leave through a subflow output port go to the
        // subflow's forward task instead.
        if let Some(subflow_state) = &self.inner.subflow_state {
            for (subflow_port_index, out_port) in subflow_state.out_ports().iter().enumerate() {
                for subflow_wire in out_port.wires.iter().filter(|x| x.id == node_config.id) {
                    while ports.len() <= subflow_wire.port {
                        ports.push(Port::empty());
                    }
                    if let Some(tx_port) = subflow_state.tx_port(subflow_port_index) {
                        ports[subflow_wire.port]
                            .wires
                            .push(PortWire { target_id: self.id(), msg_sender: tx_port.msg_tx.clone() });
                    }
                }
            }
        }

        let mut ports_guard = node.get_base().ports.write().expect("ports lock");
        *ports_guard = ports;
        Ok(())
    }

    fn register_internal_node(
        &self,
        node: Arc<dyn FlowNodeBehavior>,
        node_config: &FlowNodeConfig,
    ) -> crate::Result<()> {
        match node.get_base().type_str {
            "complete" => self.register_complete_node(node, node_config)?,

            "catch" => {
                let mut catch_nodes = self.inner.catch_nodes.write().expect("`catch_nodes` write lock");
                catch_nodes.push(node.clone());
                Self::sort_catch_nodes(&mut catch_nodes);
            }

            "status" => {
                let mut status_nodes = self.inner.status_nodes.write().expect("`status_nodes` write lock");
                status_nodes.push(node.clone());
            }

            // ignore normal nodes
            &_ => {}
        }
        Ok(())
    }

    /// Scoped catch nodes run before unscoped ones; `uncaught` handlers go
    /// last.
    fn sort_catch_nodes(catch_nodes: &mut [Arc<dyn FlowNodeBehavior>]) {
        catch_nodes.sort_by_key(|n| {
            let catch_node = n.as_any().downcast_ref::<CatchNode>().expect("CatchNode");
            let scope_rank = match catch_node.scope {
                CatchScope::Nodes(_) => 0,
                CatchScope::Group => 1,
                CatchScope::All => 2,
            };
            (catch_node.uncaught, scope_rank)
        });
    }

    fn register_complete_node(
        &self,
        node: Arc<dyn FlowNodeBehavior>,
        node_config: &FlowNodeConfig,
    ) -> crate::Result<()> {
        if let Some(scope) = node_config.rest.get("scope").and_then(|x| x.as_array()) {
            for src_id in scope {
                if let Some(src_id) = helpers::parse_id_value(src_id) {
                    if let Some(ref mut complete_nodes) = self.inner.complete_nodes_map.get_mut(&src_id) {
                        if !complete_nodes.iter().any(|x| x.id() == node.id()) {
                            complete_nodes.push(node.clone());
                        } else {
                            return Err(WireflowError::InvalidOperation(format!(
                                "The connection of the {} to the `complete` node already exists",
                                node
                            ))
                            .into());
                        }
                    } else {
                        self.inner.complete_nodes_map.insert(src_id, Vec::from([node.clone()]));
                    }
                }
            }
            Ok(())
        } else {
            Err(WireflowError::BadFlowsJson(format!("CompleteNode has no 'scope' property: {}", node)).into())
        }
    }

    /// Drops every index entry of a node. Part of node eviction during a
    /// partial deploy.
    fn unregister_internal_node(&self, id: &ElementId) {
        {
            let mut catch_nodes = self.inner.catch_nodes.write().expect("`catch_nodes` write lock");
            catch_nodes.retain(|x| x.id() != *id);
        }
        {
            let mut status_nodes = self.inner.status_nodes.write().expect("`status_nodes` write lock");
            status_nodes.retain(|x| x.id() != *id);
        }
        self.inner.complete_nodes_map.iter_mut().for_each(|mut entry| {
            entry.value_mut().retain(|x| x.id() != *id);
        });
        self.inner.complete_nodes_map.retain(|_, v| !v.is_empty());
    }

    pub fn is_subflow(&self) -> bool {
        self.inner.subflow_state.is_some()
    }

    pub fn get_all_flow_nodes(&self) -> Vec<Arc<dyn FlowNodeBehavior>> {
        self.inner.nodes.iter().map(|x| x.value().clone()).collect()
    }

    pub fn get_node_by_id(&self, id: &ElementId) -> Option<Arc<dyn FlowNodeBehavior>> {
        self.inner.nodes.get(id).map(|x| x.value().clone())
    }

    pub fn get_node_by_name(&self, name: &str) -> crate::Result<Option<Arc<dyn FlowNodeBehavior>>> {
        let mut found = None;
        for entry in self.inner.nodes.iter().filter(|val| val.name() == name) {
            if found.is_some() {
                return Err(
                    WireflowError::InvalidOperation(format!("There are multiple nodes with name '{}'", name)).into()
                );
            }
            found = Some(entry.value().clone());
        }
        Ok(found)
    }

    pub fn engine(&self) -> Option<Engine> {
        self.inner.engine.upgrade()
    }

    pub fn get_envs(&self) -> &Envs {
        &self.inner.envs
    }

    pub fn get_env(&self, key: &str) -> Option<Variant> {
        self.inner.envs.evaluate_env(key)
    }

    pub async fn start(&self) -> crate::Result<()> {
        if self.is_subflow() {
            log::info!("---- Starting Subflow (id={})...", self.id());
        } else {
            log::info!("---- Starting Flow (id={})...", self.id());
        }

        if let Some(subflow_state) = &self.inner.subflow_state {
            subflow_state.start_tx_tasks(self.inner.stop_token.clone()).await?;
        }

        // collect first: spawning may look nodes up again
        let nodes_ordering: Vec<Arc<dyn FlowNodeBehavior>> =
            self.inner.nodes.iter().map(|x| x.value().clone()).sorted_by_key(|x| x.ordering()).collect();
        for node in nodes_ordering.into_iter() {
            self.start_node(node).await;
        }

        Ok(())
    }

    /// Spawns a node's main task. Disabled nodes get a drain loop: they
    /// accept messages but never run handlers nor produce output.
    pub(crate) async fn start_node(&self, node: Arc<dyn FlowNodeBehavior>) {
        let node_stop_token = node.get_base().stop_token.clone();
        let task = if node.get_base().disabled {
            log::info!("------ Node {} is disabled, messages will be dropped.", node);
            let drain_node = node.clone();
            tokio::spawn(async move {
                while let Ok(msg) = drain_node.get_base().msg_rx.recv_msg(node_stop_token.clone()).await {
                    drop(msg);
                }
            })
        } else {
            log::info!("------ Starting node {}...", node);
            node.on_starting().await;
            let run_node = node.clone();
            tokio::spawn(async move {
                run_node.clone().run(node_stop_token).await;
                log::info!("------ {} has been stopped.", run_node.as_ref() as &dyn FlowNodeBehavior);
            })
        };
        self.inner.node_tasks.lock().await.insert(node.id(), task);
    }

    /// Stops one node: flags it closing, cancels its token, awaits its
    /// task and runs `close(removed)`. A removed node is also evicted from
    /// every index.
    pub(crate) async fn stop_node(&self, id: &ElementId, removed: bool) -> crate::Result<()> {
        let node = match self.get_node_by_id(id) {
            Some(node) => node,
            None => return Ok(()),
        };

        node.get_base().set_closing();
        node.get_base().stop_token.cancel();

        let task = self.inner.node_tasks.lock().await.remove(id);
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Node task for {} ended abnormally: {:?}", node, e);
            }
        }

        node.close(removed).await;

        if removed {
            self.inner.nodes.remove(id);
            self.unregister_internal_node(id);
            if let Some(engine) = self.engine() {
                engine.unregister_flow_node(id).await;
            }
        }
        Ok(())
    }

    /// Stops the named subset (or every node). Nodes named in
    /// `removed_list` are evicted from the indexes as well.
    pub async fn stop(
        &self,
        stop_list: Option<&[ElementId]>,
        removed_list: Option<&[ElementId]>,
    ) -> crate::Result<()> {
        if self.is_subflow() {
            log::info!("---- Stopping Subflow (id={})...", self.id());
        } else {
            log::info!("---- Stopping Flow (id={})...", self.id());
        }

        let ids: Vec<ElementId> = match stop_list {
            Some(list) => list.to_vec(),
            None => self.inner.nodes.iter().map(|x| x.id()).collect(),
        };

        if stop_list.is_none() {
            // a full stop also ends the subflow forward tasks
            self.inner.stop_token.cancel();
        }

        for id in ids.iter() {
            let removed = removed_list.map(|r| r.contains(id)).unwrap_or(false);
            self.stop_node(id, removed).await?;
        }

        if stop_list.is_none() {
            log::info!("---- All nodes in flow/subflow(id='{}') have been stopped.", self.id());
        }

        Ok(())
    }

    pub async fn notify_node_uow_completed(&self, emitter_id: &ElementId, msg: MsgHandle, cancel: CancellationToken) {
        if let Some(complete_nodes) = self.inner.complete_nodes_map.get(emitter_id) {
            for complete_node in complete_nodes.iter() {
                let to_send = msg.deep_clone(true).await;
                match complete_node.inject_msg(to_send, cancel.child_token()).await {
                    Ok(()) => {}
                    Err(err) => {
                        log::warn!("Failed to inject msg in notify_node_uow_completed(): {}", err);
                    }
                }
            }
        }
    }

    pub async fn inject_msg(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        tokio::select! {
            result = self.inject_msg_internal(msg, cancel.clone()) => result,

            _ = cancel.cancelled() => {
                Err(WireflowError::TaskCancelled.into())
            }
        }
    }

    async fn inject_msg_internal(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        if let Some(subflow_state) = &self.inner.subflow_state {
            let in_nodes = subflow_state.in_nodes();
            let last_index = in_nodes.len().saturating_sub(1);
            for (i, node) in in_nodes.iter().enumerate() {
                if i == last_index {
                    node.inject_msg(msg.clone(), cancel.clone()).await?;
                } else {
                    node.inject_msg(msg.deep_clone(true).await, cancel.clone()).await?;
                }
            }
            Ok(())
        } else {
            Err(WireflowError::InvalidOperation("This is not a subflow".into()).into())
        }
    }

    fn new_flow_node_state(
        &self,
        meta_node: &MetaNode,
        node_config: &FlowNodeConfig,
        engine: &Engine,
    ) -> crate::Result<FlowNode> {
        let (tx_root, rx) = tokio::sync::mpsc::channel(self.inner.args.node_msg_queue_capacity);

        let group = match &node_config.g {
            Some(gid) => match self.inner.groups.get(gid) {
                Some(g) => Some(g.value().clone()),
                None => {
                    return Err(WireflowError::InvalidOperation(format!(
                        "Cannot find the group id in groups: id='{}'",
                        gid
                    ))
                    .into());
                }
            },
            None => None,
        };

        let mut envs_builder = EnvStoreBuilder::default();
        if let Some(ref g) = group {
            envs_builder = envs_builder.with_parent(g.get_envs());
        } else {
            envs_builder = envs_builder.with_parent(self.get_envs());
        }
        if let Some(env_json) = node_config.rest.get("env") {
            envs_builder = envs_builder.load_json(env_json);
        }
        let envs = envs_builder
            .extends([
                ("WF_NODE_ID".into(), Variant::String(node_config.id.to_string())),
                ("WF_NODE_NAME".into(), Variant::String(node_config.name.clone())),
                ("WF_NODE_PATH".into(), Variant::String(format!("{}/{}", self.get_path(), node_config.id))),
            ])
            .build();
        let context = engine.get_context_manager().new_context(&self.inner.context, node_config.id.to_string());

        Ok(FlowNode {
            id: node_config.id,
            name: node_config.name.clone(),
            type_str: meta_node.type_,
            ordering: node_config.ordering,
            disabled: node_config.disabled,
            active: node_config.active.unwrap_or(true),
            flow: self.downgrade(),
            msg_tx: tx_root,
            msg_rx: MsgReceiverHolder::new(rx),
            ports: std::sync::RwLock::new(Vec::new()),
            group: group.map(|g| g.downgrade()),
            envs,
            context,
            hooks: engine.hooks().clone(),
            status: std::sync::RwLock::new(None),
            stop_token: self.inner.stop_token.child_token(),
            closing: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn group_distance(&self, from_group: Option<Group>, to_group_id: Option<ElementId>) -> Option<usize> {
        // distance along the group parent chain; None when `to` is not an
        // ancestor of `from`
        let mut distance = 0usize;
        let mut current = from_group;
        loop {
            match (current.as_ref().map(|g| g.id()), to_group_id) {
                (a, Some(b)) if a == Some(b) => return Some(distance),
                (None, None) => return Some(distance),
                (None, Some(_)) => return None,
                _ => {}
            }
            if to_group_id.is_none() {
                return Some(distance);
            }
            let parent = match current {
                Some(ref g) => match g.get_parent() {
                    GroupParent::Group(wg) => wg.upgrade(),
                    GroupParent::Flow(_) => None,
                },
                None => None,
            };
            distance += 1;
            if parent.is_none() && current.is_none() {
                return None;
            }
            current = parent;
        }
    }

    /// Routes an error to the catch nodes this flow owns, honouring their
    /// scopes, and writes the error record on the originating report.
    /// Returns whether any catch node received it; unmatched errors
    /// bubble to the parent flow and die at the root.
    pub async fn handle_error(
        &self,
        node: &dyn FlowNodeBehavior,
        log_message: &str,
        msg: Option<MsgHandle>,
        reporting_node: Option<&dyn FlowNodeBehavior>,
        cancel: CancellationToken,
    ) -> crate::Result<bool> {
        let reporting_node_id = reporting_node.map(|x| x.id()).unwrap_or_else(|| node.id());
        let reporting_group = reporting_node.map(|x| x.group()).unwrap_or_else(|| node.group());
        let source_is_catch = node.type_str() == "catch";

        // A bubble hop carries a reporting node; the originating report
        // does not. One ERROR record per logical error, no matter how far
        // it bubbles or whether a catch node takes it.
        if reporting_node.is_none() {
            log::error!("[{}:{}] {}", node.type_str(), node.name(), log_message);
        }

        let candidates: Vec<Arc<dyn FlowNodeBehavior>> =
            { self.inner.catch_nodes.read().expect("`catch_nodes` read lock").clone() };

        let mut handled = false;
        for candidate in candidates.iter() {
            let catch_node = candidate.as_any().downcast_ref::<CatchNode>().expect("CatchNode");

            // error loops: a catch node's own errors only reach `uncaught`
            // catchers
            if source_is_catch && !catch_node.uncaught {
                continue;
            }
            // `uncaught` handlers only fire when nothing else handled it
            if catch_node.uncaught && handled {
                break;
            }

            let matches = match &catch_node.scope {
                CatchScope::All => true,
                CatchScope::Nodes(scope) => scope.contains(&reporting_node_id),
                CatchScope::Group => {
                    let catch_group_id = candidate.group().map(|g| g.id());
                    catch_group_id.is_some()
                        && self.group_distance(reporting_group.clone(), catch_group_id).is_some()
                }
            };
            if !matches {
                continue;
            }

            let mut error_msg = if let Some(ref msg) = msg {
                let msg_lock = msg.read().await;
                msg_lock.clone()
            } else {
                Msg::default()
            };
            let error_object = Variant::from(serde_json::json!({
                "message": log_message.to_string(),
                "source": {
                    "id": node.id().to_string(),
                    "type": node.type_str().to_string(),
                    "name": node.name(),
                    "count": 1,
                }
            }));
            error_msg.set("error".into(), error_object);
            error_msg.set_id(Msg::generate_id());
            let error_msg = MsgHandle::new(error_msg);
            candidate.inject_msg(error_msg, cancel.clone()).await?;

            handled = true;
        }

        if !handled {
            // bubble to the parent flow, reporting as the instance node;
            // the hop always carries a reporting node so the error record
            // is never written twice
            if let Some(instance) = self.instance_node() {
                if let Some(parent_flow) = instance.flow() {
                    return Box::pin(parent_flow.handle_error(
                        node,
                        log_message,
                        msg,
                        Some(instance.as_ref()),
                        cancel,
                    ))
                    .await;
                }
            }
        }

        Ok(handled)
    }

    /// Routes a status update to the scope-filtered status nodes.
    pub async fn handle_status(
        &self,
        node: &dyn FlowNodeBehavior,
        status: &NodeStatus,
        reporting_node: Option<&dyn FlowNodeBehavior>,
        cancel: CancellationToken,
    ) {
        let reporting_node_id = reporting_node.map(|x| x.id()).unwrap_or_else(|| node.id());
        let reporting_group = reporting_node.map(|x| x.group()).unwrap_or_else(|| node.group());

        let candidates: Vec<Arc<dyn FlowNodeBehavior>> =
            { self.inner.status_nodes.read().expect("`status_nodes` read lock").clone() };

        for candidate in candidates.iter() {
            if candidate.id() == node.id() {
                continue;
            }
            let status_node = candidate.as_any().downcast_ref::<StatusNode>().expect("StatusNode");
            let matches = match &status_node.scope {
                StatusScope::All => true,
                StatusScope::Nodes(scope) => scope.contains(&reporting_node_id),
                StatusScope::Group => {
                    let group_id = candidate.group().map(|g| g.id());
                    group_id.is_some() && self.group_distance(reporting_group.clone(), group_id).is_some()
                }
            };
            if !matches {
                continue;
            }

            let mut status_body = status.to_variant();
            if let Some(obj) = status_body.as_object_mut() {
                obj.insert(
                    "source".to_string(),
                    Variant::from(serde_json::json!({
                        "id": node.id().to_string(),
                        "type": node.type_str().to_string(),
                        "name": node.name(),
                    })),
                );
            }
            let mut status_msg = Msg::default();
            status_msg.set_id(Msg::generate_id());
            status_msg.set("status".into(), status_body);
            let status_msg = MsgHandle::new(status_msg);
            if let Err(err) = candidate.inject_msg(status_msg, cancel.clone()).await {
                log::warn!("Failed to deliver status msg: {}", err);
            }
        }

        // status bubbles into the parent flow of a subflow as well
        if let Some(parent_flow) = self.parent_flow() {
            let instance = self.instance_node();
            Box::pin(parent_flow.handle_status(node, status, instance.as_deref().or(reporting_node), cancel)).await;
        }
    }

    fn parent_flow(&self) -> Option<Flow> {
        let instance_id = self.inner.parent?;
        let engine = self.engine()?;
        engine.find_flow_node_by_id(&instance_id).and_then(|n| n.flow())
    }

    fn instance_node(&self) -> Option<Arc<dyn FlowNodeBehavior>> {
        let instance_id = self.inner.parent?;
        self.engine()?.find_flow_node_by_id(&instance_id)
    }
}
