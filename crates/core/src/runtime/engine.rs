use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::context::{Context, ContextManager, ContextManagerBuilder};
use super::diff::{diff_configs, ConfigDiff, DeploymentType};
use super::env::*;
use super::events::Events;
use super::flow::*;
use super::hooks::Hooks;
use super::i18n::{I18n, DEFAULT_LANG};
use super::logging::Logger;
use super::model::json::{deser, helpers, FlowNodeConfig, GlobalNodeConfig, ResolvedFlows};
use super::model::*;
use super::nodes::{FlowNodeBehavior, GlobalNode, GlobalNodeBehavior, NodeFactory};
use super::registry::RegistryHandle;
use super::settings::Settings;
use super::storage::{FlowStorageHandle, MemoryStorage};
use crate::*;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineArgs {}

impl EngineArgs {
    pub fn load(cfg: Option<&config::Config>) -> crate::Result<Self> {
        match cfg {
            Some(cfg) => match cfg.get::<Self>("runtime.engine") {
                Ok(res) => Ok(res),
                Err(config::ConfigError::NotFound(_)) => Ok(Self::default()),
                Err(e) => Err(e.into()),
            },
            _ => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<InnerEngine>,
}

#[derive(Debug, Clone)]
pub struct WeakEngine {
    inner: Weak<InnerEngine>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        Weak::upgrade(&self.inner).map(|x| Engine { inner: x })
    }
}

struct InnerEngine {
    started: tokio::sync::RwLock<bool>,
    stop_token: CancellationToken,
    _args: EngineArgs,
    options: Option<config::Config>,
    envs: Envs,
    context_manager: Arc<ContextManager>,
    context: Arc<Context>,
    registry: RegistryHandle,

    hooks: Arc<Hooks>,
    events: Arc<Events>,
    logger: Arc<Logger>,
    i18n: Arc<I18n>,
    settings: Option<Arc<Settings>>,
    flow_storage: FlowStorageHandle,

    active_config: std::sync::RwLock<Vec<JsonValue>>,
    deploy_lock: tokio::sync::Mutex<()>,

    flows: DashMap<ElementId, Flow>,
    global_nodes: DashMap<ElementId, Arc<dyn GlobalNodeBehavior>>,
    all_flow_nodes: DashMap<ElementId, Arc<dyn FlowNodeBehavior>>,

    final_msgs_rx: MsgUnboundedReceiverHolder,
    final_msgs_tx: MsgUnboundedSender,
}

impl std::fmt::Debug for InnerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine").finish()
    }
}

/// Assembles an engine with explicit collaborators where the plain
/// `with_json` path would use defaults.
#[derive(Default)]
pub struct EngineBuilder {
    registry: Option<RegistryHandle>,
    flow_storage: Option<FlowStorageHandle>,
    settings: Option<Arc<Settings>>,
    logger: Option<Arc<Logger>>,
    events: Option<Arc<Events>>,
    hooks: Option<Arc<Hooks>>,
    i18n: Option<Arc<I18n>>,
}

impl EngineBuilder {
    pub fn with_registry(mut self, reg: RegistryHandle) -> Self {
        self.registry = Some(reg);
        self
    }

    pub fn with_flow_storage(mut self, storage: FlowStorageHandle) -> Self {
        self.flow_storage = Some(storage);
        self
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_events(mut self, events: Arc<Events>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_i18n(mut self, i18n: Arc<I18n>) -> Self {
        self.i18n = Some(i18n);
        self
    }

    pub fn build(self, elcfg: Option<&config::Config>) -> crate::Result<Engine> {
        let reg = match self.registry {
            Some(reg) => reg,
            None => crate::runtime::registry::RegistryBuilder::default().build()?,
        };

        let envs = EnvStoreBuilder::default().with_process_env().build();

        let mut ctx_builder = ContextManagerBuilder::new();
        if let Some(cfg) = elcfg {
            let _ = ctx_builder.with_config(cfg)?;
        } else {
            let _ = ctx_builder.load_default();
        }
        let context_manager = ctx_builder.build()?;
        let context = context_manager.new_global_context();

        let final_msgs_channel = tokio::sync::mpsc::unbounded_channel();

        let engine = Engine {
            inner: Arc::new(InnerEngine {
                started: tokio::sync::RwLock::new(false),
                stop_token: CancellationToken::new(),
                all_flow_nodes: DashMap::new(),
                global_nodes: DashMap::new(),
                flows: DashMap::new(),
                envs,
                _args: EngineArgs::load(elcfg)?,
                options: elcfg.cloned(),
                context_manager,
                context,
                registry: reg,
                hooks: self.hooks.unwrap_or_default(),
                events: self.events.unwrap_or_default(),
                logger: self.logger.unwrap_or_else(|| Arc::new(Logger::new())),
                i18n: self.i18n.unwrap_or_else(|| Arc::new(I18n::with_runtime_catalog())),
                settings: self.settings,
                flow_storage: self.flow_storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
                active_config: std::sync::RwLock::new(Vec::new()),
                deploy_lock: tokio::sync::Mutex::new(()),
                final_msgs_rx: MsgUnboundedReceiverHolder::new(final_msgs_channel.1),
                final_msgs_tx: final_msgs_channel.0,
            }),
        };
        Ok(engine)
    }
}

impl Engine {
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine { inner: Arc::downgrade(&self.inner) }
    }

    pub fn with_json(
        reg: &RegistryHandle,
        json: serde_json::Value,
        elcfg: Option<&config::Config>,
    ) -> crate::Result<Engine> {
        let engine = EngineBuilder::default().with_registry(reg.clone()).build(elcfg)?;
        let config_array = json
            .as_array()
            .cloned()
            .ok_or(WireflowError::BadFlowsJson("The flows document must be an array".to_string()))?;
        engine.load_config(&config_array)?;
        *engine.inner.active_config.write().expect("active_config lock") = config_array;
        Ok(engine)
    }

    pub fn with_flows_file(
        reg: &RegistryHandle,
        flows_json_path: &str,
        elcfg: Option<&config::Config>,
    ) -> crate::Result<Engine> {
        let mut file = std::fs::File::open(flows_json_path)?;
        let mut json_str = String::new();
        file.read_to_string(&mut json_str)?;
        Self::with_json_string(reg, json_str, elcfg)
    }

    pub fn with_json_string(
        reg: &RegistryHandle,
        json_str: String,
        elcfg: Option<&config::Config>,
    ) -> crate::Result<Engine> {
        let json: serde_json::Value = serde_json::from_str(&json_str)?;
        Self::with_json(reg, json, elcfg)
    }

    /// Parses and instantiates everything in `config`. Global config
    /// nodes load first so flow nodes can resolve their shared resources.
    fn load_config(&self, config: &[JsonValue]) -> crate::Result<()> {
        let resolved = deser::load_flows_json_value(JsonValue::Array(config.to_vec())).map_err(|e| {
            log::error!("Failed to load flows JSON value: {}", e);
            e
        })?;
        self.load_global_nodes(&resolved.global_nodes)?;
        self.load_flows(&resolved)?;
        Ok(())
    }

    fn load_flows(&self, resolved: &ResolvedFlows) -> crate::Result<()> {
        for flow_config in resolved.flows.iter() {
            if flow_config.disabled {
                log::info!("---- The flow (id='{}', label='{}') is disabled.", flow_config.id, flow_config.label);
                continue;
            }
            log::debug!("---- Loading flow/subflow: (id='{}', label='{}')...", flow_config.id, flow_config.label);
            let flow = Flow::new(self, flow_config, &self.inner.registry, self.inner.options.as_ref())?;
            self.inner.flows.insert(flow.id(), flow);
        }
        Ok(())
    }

    fn load_global_nodes(&self, node_configs: &[GlobalNodeConfig]) -> crate::Result<()> {
        for global_config in node_configs.iter() {
            let node = self.build_global_node(global_config)?;
            self.inner.global_nodes.insert(global_config.id, Arc::from(node));
        }
        Ok(())
    }

    fn build_global_node(&self, global_config: &GlobalNodeConfig) -> crate::Result<Box<dyn GlobalNodeBehavior>> {
        let node_type_name = global_config.type_name.as_str();
        let meta_node = if let Some(meta_node) = self.inner.registry.get(node_type_name) {
            meta_node
        } else {
            log::warn!(
                "Unknown global configuration node type: (type='{}', id='{}', name='{}')",
                global_config.type_name,
                global_config.id,
                global_config.name
            );
            self.inner.registry.get("unknown.global").expect("The `unknown.global` node must exist")
        };

        match meta_node.factory {
            NodeFactory::Global(factory) => {
                let context =
                    self.inner.context_manager.new_context(&self.inner.context, global_config.id.to_string());
                let base = GlobalNode::new(
                    global_config.id,
                    global_config.name.clone(),
                    meta_node.type_,
                    global_config.ordering,
                    context,
                    global_config.disabled,
                );
                factory(self, base, global_config)
            }
            _ => Err(WireflowError::NotSupported(format!(
                "Must be a global node: Node(id={0}, type='{1}')",
                global_config.id, global_config.type_name
            ))
            .into()),
        }
    }

    pub(crate) fn register_flow_node(&self, node: Arc<dyn FlowNodeBehavior>) -> crate::Result<()> {
        if self.inner.all_flow_nodes.contains_key(&node.id()) {
            return Err(WireflowError::InvalidOperation(format!("This flow node already exists: {}", node)).into());
        }
        self.inner.all_flow_nodes.insert(node.id(), node);
        Ok(())
    }

    pub(crate) async fn unregister_flow_node(&self, id: &ElementId) {
        self.inner.all_flow_nodes.remove(id);
        if let Err(e) = self.inner.context_manager.delete_context(&id.to_string()).await {
            log::warn!("Failed to delete the context of node {}: {:?}", id, e);
        }
    }

    pub fn get_flow(&self, id: &ElementId) -> Option<Flow> {
        self.inner.flows.get(id).map(|x| x.value().clone())
    }

    pub fn get_global_node(&self, id: &ElementId) -> Option<Arc<dyn GlobalNodeBehavior>> {
        self.inner.global_nodes.get(id).map(|x| x.value().clone())
    }

    pub fn find_flow_node_by_id(&self, id: &ElementId) -> Option<Arc<dyn FlowNodeBehavior>> {
        self.inner.all_flow_nodes.get(id).map(|x| x.value().clone())
    }

    pub fn find_flow_node_by_name(&self, name: &str) -> crate::Result<Option<Arc<dyn FlowNodeBehavior>>> {
        for i in self.inner.flows.iter() {
            let flow = i.value();
            let opt_node = flow.get_node_by_name(name)?;
            if opt_node.is_some() {
                return Ok(opt_node);
            }
        }
        Ok(None)
    }

    /// The canonical active configuration as last deployed.
    pub fn get_flows(&self) -> Vec<JsonValue> {
        self.inner.active_config.read().expect("active_config lock").clone()
    }

    pub async fn inject_msg_to_flow(
        &self,
        flow_id: &ElementId,
        msg: MsgHandle,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let flow = self.inner.flows.get(flow_id).as_deref().cloned();
        if let Some(flow) = flow {
            flow.inject_msg(msg, cancel.clone()).await?;
            Ok(())
        } else {
            Err(WireflowError::BadArgument("flow_id")).with_context(|| format!("Cannot find flow_id: {}", flow_id))
        }
    }

    pub async fn inject_msg(
        &self,
        flow_node_id: &ElementId,
        msg: MsgHandle,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let node = self
            .find_flow_node_by_id(flow_node_id)
            .ok_or(WireflowError::BadArgument("flow_node_id"))
            .with_context(|| format!("Cannot find the flow node, id='{}'", flow_node_id))?;
        node.inject_msg(msg, cancel).await
    }

    pub async fn is_started(&self) -> bool {
        *self.inner.started.read().await
    }

    pub async fn start(&self) -> crate::Result<()> {
        log::info!("-- Starting engine...");
        let mut started_lock = self.inner.started.write().await;
        if *started_lock {
            return Err(WireflowError::invalid_operation("already started."));
        }

        let flows: Vec<Flow> = self.inner.flows.iter().map(|x| x.value().clone()).collect();
        for f in flows.into_iter() {
            f.start().await?;
        }

        *started_lock = true;
        self.inner.events.emit("flows:started", Variant::Null);

        log::info!("-- {}", self.inner.i18n.t("runtime", "flows.started", DEFAULT_LANG, &[]));
        Ok(())
    }

    pub async fn stop(&self) -> crate::Result<()> {
        let mut started_lock = self.inner.started.write().await;
        if !*started_lock {
            return Err(WireflowError::invalid_operation("not started."));
        }
        log::info!("-- Stopping engine...");

        self.inner.stop_token.cancel();

        let flows: Vec<Flow> = self.inner.flows.iter().map(|x| x.value().clone()).collect();
        for flow in flows.into_iter() {
            flow.stop(None, None).await?;
        }
        let globals: Vec<Arc<dyn GlobalNodeBehavior>> =
            self.inner.global_nodes.iter().map(|x| x.value().clone()).collect();
        for node in globals.into_iter() {
            node.close().await;
        }

        *started_lock = false;
        self.inner.events.emit("flows:stopped", Variant::Null);
        log::info!("-- {}", self.inner.i18n.t("runtime", "flows.stopped", DEFAULT_LANG, &[]));
        Ok(())
    }

    /// Replaces the active configuration.
    ///
    /// The incoming document is diffed against the active one per the
    /// deployment type; storage is written first, so a storage failure
    /// leaves the running configuration in place; changed and removed
    /// nodes stop, added and changed ones start when the engine runs.
    /// One deploy at a time; concurrent calls wait on the deploy lock.
    pub async fn set_flows(
        &self,
        flows_json: JsonValue,
        deployment_type: DeploymentType,
        force_start: bool,
    ) -> crate::Result<ConfigDiff> {
        let _deploy_guard = self.inner.deploy_lock.lock().await;

        let new_config = flows_json
            .as_array()
            .cloned()
            .ok_or(WireflowError::BadFlowsJson("The flows document must be an array".to_string()))?;
        let old_config = self.get_flows();

        let mut deployment_type = deployment_type;
        if deployment_type.is_incremental() && touches_subflows(&old_config, &new_config) {
            // subflow expansion re-keys interior nodes, so instance-level
            // surgery is not well-defined; escalate
            log::debug!("Deploy touches subflows, escalating to a full deploy");
            deployment_type = DeploymentType::Full;
        }

        let diff = diff_configs(&old_config, &new_config, deployment_type);

        // fail-fast: nothing in the runtime changes when storage is down
        self.inner
            .flow_storage
            .save_flows(&JsonValue::Array(new_config.clone()))
            .await
            .with_context(|| "Failed to persist flows; keeping the active configuration")?;

        let started = self.is_started().await || force_start;

        if deployment_type.is_incremental() {
            self.apply_incremental_deploy(&new_config, &diff, started).await?;
        } else {
            self.apply_full_deploy(&new_config, started).await?;
        }

        *self.inner.active_config.write().expect("active_config lock") = new_config;
        self.inner.logger.audit("flows.set", None);
        log::info!(
            "-- {}",
            self.inner.i18n.t(
                "runtime",
                "flows.deployed",
                DEFAULT_LANG,
                &[
                    ("added", &diff.added.len().to_string()),
                    ("removed", &diff.removed.len().to_string()),
                    ("changed", &diff.changed.len().to_string()),
                ],
            )
        );
        self.inner.events.emit(
            "flows:deploy",
            Variant::from(serde_json::json!({
                "added": diff.added.len(),
                "removed": diff.removed.len(),
                "changed": diff.changed.len(),
                "rewired": diff.rewired.len(),
            })),
        );
        Ok(diff)
    }

    async fn apply_full_deploy(&self, new_config: &[JsonValue], start: bool) -> crate::Result<()> {
        let flows: Vec<Flow> = self.inner.flows.iter().map(|x| x.value().clone()).collect();
        for flow in flows.into_iter() {
            flow.stop(None, None).await?;
        }
        self.inner.flows.clear();
        let globals: Vec<Arc<dyn GlobalNodeBehavior>> =
            self.inner.global_nodes.iter().map(|x| x.value().clone()).collect();
        for node in globals.into_iter() {
            node.close().await;
        }
        self.inner.global_nodes.clear();
        self.inner.all_flow_nodes.clear();

        self.load_config(new_config)?;

        if start {
            let was_started = { *self.inner.started.read().await };
            if !was_started {
                *self.inner.started.write().await = true;
            }
            let flows: Vec<Flow> = self.inner.flows.iter().map(|x| x.value().clone()).collect();
            for flow in flows.into_iter() {
                if let Err(e) = flow.start().await {
                    // partial deploy: the sibling flows keep going
                    log::error!("Failed to start flow {}: {:?}", flow.id(), e);
                }
            }
        }
        Ok(())
    }

    async fn apply_incremental_deploy(
        &self,
        new_config: &[JsonValue],
        diff: &ConfigDiff,
        started: bool,
    ) -> crate::Result<()> {
        let resolved = deser::load_flows_json_value(JsonValue::Array(new_config.to_vec()))?;

        let record_of = |config: &[JsonValue], id: &ElementId| -> Option<JsonValue> {
            config.iter().find(|jv| jv.get("id").and_then(helpers::parse_id_value).as_ref() == Some(id)).cloned()
        };
        let old_config = self.get_flows();

        // --- tabs ---
        let mut restarted_flows: HashSet<ElementId> = HashSet::new();
        for id in diff.removed.iter() {
            if let Some(record) = record_of(&old_config, id) {
                if record.get("type").and_then(|x| x.as_str()) == Some("tab") {
                    self.remove_flow(id).await?;
                    restarted_flows.insert(*id);
                }
            }
        }
        for id in diff.changed.iter() {
            if let Some(record) = record_of(new_config, id) {
                if record.get("type").and_then(|x| x.as_str()) == Some("tab") {
                    self.remove_flow(id).await?;
                    self.build_flow_from_resolved(&resolved, id, started).await?;
                    restarted_flows.insert(*id);
                }
            }
        }
        for id in diff.added.iter() {
            if let Some(record) = record_of(new_config, id) {
                if record.get("type").and_then(|x| x.as_str()) == Some("tab") {
                    self.build_flow_from_resolved(&resolved, id, started).await?;
                    restarted_flows.insert(*id);
                }
            }
        }

        // --- global config nodes ---
        for id in diff.stop_set() {
            if let Some(node) = self.get_global_node(&id) {
                node.close().await;
                self.inner.global_nodes.remove(&id);
            }
        }
        for id in diff.start_set() {
            if let Some(global_config) = resolved.global_nodes.iter().find(|g| g.id == id) {
                match self.build_global_node(global_config) {
                    Ok(node) => {
                        self.inner.global_nodes.insert(id, Arc::from(node));
                    }
                    Err(e) => {
                        log::error!("Failed to build global node {}: {:?}", id, e);
                    }
                }
            }
        }

        // --- flow nodes, per surviving flow ---
        let flow_of_node = |config: &[JsonValue], id: &ElementId| -> Option<ElementId> {
            record_of(config, id).and_then(|r| r.get("z").and_then(helpers::parse_id_value))
        };

        // stop changed + removed member nodes; both leave the indexes, a
        // changed node comes back from its new config
        for id in diff.removed.iter().chain(diff.changed.iter()) {
            let owner = match flow_of_node(&old_config, id) {
                Some(owner) => owner,
                None => continue,
            };
            if restarted_flows.contains(&owner) {
                continue;
            }
            if let Some(flow) = self.get_flow(&owner) {
                flow.stop_node(id, true).await?;
            }
        }

        // build added + changed member nodes
        let mut pending_start: Vec<(Flow, Arc<dyn FlowNodeBehavior>)> = Vec::new();
        let mut rebuilt_port_ids: HashSet<ElementId> = HashSet::new();
        for id in diff.added.iter().chain(diff.changed.iter()) {
            let owner = match flow_of_node(new_config, id) {
                Some(owner) => owner,
                None => continue,
            };
            if restarted_flows.contains(&owner) {
                continue;
            }
            let flow = match self.get_flow(&owner) {
                Some(flow) => flow,
                None => continue,
            };
            if let Some(node_config) = find_node_config(&resolved, &owner, id) {
                match flow.add_node(node_config, &self.inner.registry, self) {
                    Ok(node) => {
                        rebuilt_port_ids.insert(*id);
                        pending_start.push((flow, node));
                    }
                    Err(e) => {
                        // partial deploy: siblings keep going
                        log::error!("Failed to build node {} during deploy: {:?}", id, e);
                    }
                }
            }
        }

        // rebuild wires of everything whose targets moved
        for id in rebuilt_port_ids.iter().chain(diff.rewired.iter()).chain(diff.linked.iter()) {
            let owner = match flow_of_node(new_config, id) {
                Some(owner) => owner,
                None => continue,
            };
            if restarted_flows.contains(&owner) {
                continue;
            }
            if let Some(flow) = self.get_flow(&owner) {
                if let Some(node_config) = find_node_config(&resolved, &owner, id) {
                    if let Err(e) = flow.rebuild_node_ports(node_config, self) {
                        log::error!("Failed to rebuild ports of node {}: {:?}", id, e);
                    }
                }
            }
        }

        // finally start the new and rebuilt nodes
        if started {
            for (flow, node) in pending_start.into_iter() {
                flow.start_node(node).await;
            }
        }

        Ok(())
    }

    async fn remove_flow(&self, id: &ElementId) -> crate::Result<()> {
        if let Some((_, flow)) = self.inner.flows.remove(id) {
            let all_ids: Vec<ElementId> = flow.get_all_flow_nodes().iter().map(|n| n.id()).collect();
            flow.stop(None, Some(&all_ids)).await?;
        }
        Ok(())
    }

    async fn build_flow_from_resolved(
        &self,
        resolved: &ResolvedFlows,
        id: &ElementId,
        start: bool,
    ) -> crate::Result<()> {
        let flow_config = match resolved.flows.iter().find(|f| f.id == *id) {
            Some(cfg) => cfg,
            None => return Ok(()),
        };
        if flow_config.disabled {
            return Ok(());
        }
        let flow = Flow::new(self, flow_config, &self.inner.registry, self.inner.options.as_ref())?;
        self.inner.flows.insert(flow.id(), flow.clone());
        if start {
            flow.start().await?;
        }
        Ok(())
    }

    /// Test harness: starts the engine, injects the given messages,
    /// awaits `expected_msgs` on the capture channel, then stops again.
    pub async fn run_once_with_inject(
        &self,
        expected_msgs: usize,
        timeout: std::time::Duration,
        mut msgs_to_inject: Vec<(ElementId, Msg)>,
    ) -> crate::Result<Vec<Msg>> {
        self.start().await?;

        let mut count = 0;
        let mut received = Vec::new();

        // Clear the capture channel
        {
            let mut rx = self.inner.final_msgs_rx.rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        let cancel = CancellationToken::new();
        for msg in msgs_to_inject.drain(..) {
            self.inject_msg(&msg.0, MsgHandle::new(msg.1), cancel.clone()).await?;
        }

        let result = tokio::time::timeout(timeout, async {
            while !cancel.is_cancelled() && count < expected_msgs {
                let msg = self.inner.final_msgs_rx.recv_msg(cancel.clone()).await?;
                count += 1;
                let msg = msg.unwrap_msg().await;
                received.push(msg);
            }
            cancel.cancel();
            cancel.cancelled().await;
            Ok(())
        })
        .await;

        self.stop().await?;
        match result {
            Ok(Ok(())) => Ok(received),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WireflowError::Timeout.into()),
        }
    }

    pub async fn run_once(&self, expected_msgs: usize, timeout: std::time::Duration) -> crate::Result<Vec<Msg>> {
        self.run_once_with_inject(expected_msgs, timeout, Vec::with_capacity(0)).await
    }

    /// The capture sink fed by the `test-once` node.
    pub fn recv_final_msg(&self, msg: MsgHandle) -> crate::Result<()> {
        self.inner.final_msgs_tx.send(msg)?;
        Ok(())
    }

    pub fn get_envs(&self) -> Envs {
        self.inner.envs.clone()
    }

    pub fn get_env(&self, key: &str) -> Option<Variant> {
        self.inner.envs.evaluate_env(key)
    }

    pub fn get_context_manager(&self) -> &Arc<ContextManager> {
        &self.inner.context_manager
    }

    pub fn context(&self) -> Arc<Context> {
        self.inner.context.clone()
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.inner.hooks
    }

    pub fn events(&self) -> &Arc<Events> {
        &self.inner.events
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.inner.registry
    }

    pub fn settings(&self) -> Option<&Arc<Settings>> {
        self.inner.settings.as_ref()
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.inner.logger
    }
}

fn find_node_config<'a>(
    resolved: &'a ResolvedFlows,
    flow_id: &ElementId,
    node_id: &ElementId,
) -> Option<&'a FlowNodeConfig> {
    resolved.flows.iter().find(|f| f.id == *flow_id)?.nodes.iter().find(|n| n.id == *node_id)
}

/// True when the difference between the documents involves subflow
/// machinery: a template, an instance node, or a template-interior node.
fn touches_subflows(old_config: &[JsonValue], new_config: &[JsonValue]) -> bool {
    let mut subflow_ids: HashSet<String> = HashSet::new();
    for jv in old_config.iter().chain(new_config.iter()) {
        if jv.get("type").and_then(|x| x.as_str()) == Some("subflow") {
            if let Some(id) = jv.get("id").and_then(|x| x.as_str()) {
                subflow_ids.insert(id.to_string());
            }
        }
    }
    if subflow_ids.is_empty() {
        return false;
    }

    let in_subflow = |jv: &JsonValue| -> bool {
        let type_is_subflow = jv
            .get("type")
            .and_then(|x| x.as_str())
            .map(|t| t == "subflow" || t.starts_with("subflow:"))
            .unwrap_or(false);
        let z_in_subflow = jv.get("z").and_then(|x| x.as_str()).map(|z| subflow_ids.contains(z)).unwrap_or(false);
        type_is_subflow || z_in_subflow
    };

    let old_map: HashMap<&str, &JsonValue> =
        old_config.iter().filter_map(|jv| jv.get("id").and_then(|x| x.as_str()).map(|id| (id, jv))).collect();
    let new_map: HashMap<&str, &JsonValue> =
        new_config.iter().filter_map(|jv| jv.get("id").and_then(|x| x.as_str()).map(|id| (id, jv))).collect();

    for (id, jv) in new_map.iter() {
        if in_subflow(jv) {
            match old_map.get(id) {
                None => return true,
                Some(old_jv) => {
                    if old_jv != jv {
                        return true;
                    }
                }
            }
        }
    }
    for (id, jv) in old_map.iter() {
        if in_subflow(jv) && !new_map.contains_key(id) {
            return true;
        }
    }
    false
}

pub fn build_test_engine(flows_json: serde_json::Value) -> crate::Result<Engine> {
    let registry = crate::runtime::registry::RegistryBuilder::default().build()?;
    Engine::with_json(&registry, flows_json, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn make_simple_flows_json() -> serde_json::Value {
        json!([
        { "id": "100", "type": "tab", "label": "Flow 1" },
        { "id": "1", "type": "inject", "z": "100", "name": "", "props": [
                { "p": "payload" },
                { "p": "topic", "vt": "str" }
            ],
            "once": true, "onceDelay": 0, "repeat": "", "topic": "t",
            "payload": "foo", "payloadType": "str",
            "wires": [ [ "2" ] ]
        },
        { "id": "2", "z": "100", "type": "test-once" }
        ])
    }

    #[tokio::test]
    async fn test_it_should_be_able_to_inject_msgs() {
        let flows_json = json!([
            { "id": "100", "type": "tab", "label": "Flow 1" },
            { "id": "1", "z": "100", "type": "test-once" }
        ]);
        let engine = build_test_engine(flows_json).unwrap();
        let msgs_to_inject = vec![
            ("1".parse().unwrap(), Msg::with_payload(Variant::from("foo"))),
            ("1".parse().unwrap(), Msg::with_payload(Variant::from("bar"))),
        ];
        let msgs = engine.run_once_with_inject(2, Duration::from_millis(200), msgs_to_inject).await.unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("foo"));
        assert_eq!(msgs[1].get("payload").unwrap(), &Variant::from("bar"));
    }

    #[tokio::test]
    async fn test_it_should_load_and_run_simple_json() {
        let flows_json = make_simple_flows_json();
        let engine = build_test_engine(flows_json).unwrap();
        let msgs = engine.run_once(1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].get("payload").unwrap(), &Variant::from("foo"));
        assert_eq!(msgs[0].get("topic").unwrap(), &Variant::from("t"));
    }

    #[tokio::test]
    async fn test_it_should_load_json_flows_multiple_times() {
        let flows_json = make_simple_flows_json();
        for _ in 0..10 {
            let res = build_test_engine(flows_json.clone());
            assert!(res.is_ok());
        }
    }

    #[tokio::test]
    async fn test_get_flows_returns_deployed_config() {
        let flows_json = make_simple_flows_json();
        let engine = build_test_engine(json!([])).unwrap();
        let diff = engine.set_flows(flows_json.clone(), DeploymentType::Full, false).await.unwrap();
        assert_eq!(diff.added.len(), 3);
        assert_eq!(engine.get_flows(), flows_json.as_array().cloned().unwrap());

        // every non-disabled node in the config is a live instance
        assert!(engine.find_flow_node_by_id(&"1".parse().unwrap()).is_some());
        assert!(engine.find_flow_node_by_id(&"2".parse().unwrap()).is_some());
    }
}
