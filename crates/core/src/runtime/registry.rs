use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::runtime::events::Events;
use crate::runtime::model::Variant;
use crate::runtime::nodes::*;
use crate::runtime::storage::{NodeLoaderHandle, NullNodeLoader};
use crate::*;

inventory::collect!(MetaNode);

/// The module every built-in node registers under.
pub const BUILTIN_MODULE: &str = "wireflow-nodes";
pub const BUILTIN_SET: &str = "core";

/// A deliverable set of node types inside a module.
#[derive(Debug, Clone)]
pub struct NodeSet {
    /// `"<module>/<set>"`
    pub id: String,
    pub name: String,
    pub module: String,
    pub version: String,
    pub types: Vec<String>,
    pub enabled: bool,
    pub err: Option<String>,
    /// The raw editor template for this set.
    pub config: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    pub pending_version: Option<String>,
    pub local: bool,
    pub user: bool,
    pub sets: Vec<NodeSetManifest>,
    pub icon_dirs: Vec<PathBuf>,
    pub resources_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeSetManifest {
    pub name: String,
    pub types: Vec<String>,
    pub config: String,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub pending_version: Option<String>,
    pub local: bool,
    pub user: bool,
    pub nodes: HashMap<String, NodeSet>,
    pub icon_dirs: Vec<PathBuf>,
    pub resources_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RegistryHandle(Arc<Registry>);

impl Deref for RegistryHandle {
    type Target = Arc<Registry>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The node registry: module/set bookkeeping plus the constructor table
/// the engine instantiates nodes from. Built-in nodes self-register via
/// `inventory`; external sets arrive through `add_module` +
/// `register_node_constructor`.
pub struct Registry {
    modules: RwLock<HashMap<String, ModuleInfo>>,
    node_type_to_id: RwLock<HashMap<String, String>>,
    constructors: RwLock<HashMap<String, &'static MetaNode>>,
    config_cache: Mutex<HashMap<String, String>>,
    pending_snapshot: Mutex<HashMap<String, Option<String>>>,
    events: Arc<Events>,
    node_loader: NodeLoaderHandle,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("modules", &self.modules.read().expect("modules lock").len()).finish()
    }
}

pub struct RegistryBuilder {
    with_builtins: bool,
    events: Option<Arc<Events>>,
    node_loader: Option<NodeLoaderHandle>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self { with_builtins: true, events: None, node_loader: None }
    }

    pub fn with_events(mut self, events: Arc<Events>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_node_loader(mut self, loader: NodeLoaderHandle) -> Self {
        self.node_loader = Some(loader);
        self
    }

    pub fn without_builtins(mut self) -> Self {
        self.with_builtins = false;
        self
    }

    pub fn build(self) -> crate::Result<RegistryHandle> {
        let registry = Registry {
            modules: RwLock::new(HashMap::new()),
            node_type_to_id: RwLock::new(HashMap::new()),
            constructors: RwLock::new(HashMap::new()),
            config_cache: Mutex::new(HashMap::new()),
            pending_snapshot: Mutex::new(HashMap::new()),
            events: self.events.unwrap_or_default(),
            node_loader: self.node_loader.unwrap_or_else(|| Arc::new(NullNodeLoader)),
        };

        // The builtin module record always exists; `without_builtins`
        // only skips filling its constructor table.
        let builtin_manifest = ModuleManifest {
            name: BUILTIN_MODULE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pending_version: None,
            local: false,
            user: false,
            sets: vec![NodeSetManifest {
                name: BUILTIN_SET.to_string(),
                types: Vec::new(),
                config: String::new(),
            }],
            icon_dirs: Vec::new(),
            resources_dir: None,
        };
        registry.add_module(builtin_manifest)?;

        if self.with_builtins {
            let set_id = format!("{}/{}", BUILTIN_MODULE, BUILTIN_SET);
            for meta in inventory::iter::<MetaNode> {
                log::debug!("[REGISTRY] Available built-in node: '{}'", meta.type_);
                registry.register_node_constructor(&set_id, meta)?;
            }
        }

        Ok(RegistryHandle(Arc::new(registry)))
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Constructor lookup used by the engine when instantiating nodes.
    /// Yields the constructor only when the owning set is enabled and has
    /// no load error.
    pub fn get(&self, type_name: &str) -> Option<&'static MetaNode> {
        let meta = *self.constructors.read().expect("constructors lock").get(type_name)?;
        let set_id = self.node_type_to_id.read().expect("types lock").get(type_name).cloned()?;
        let (module_name, set_name) = set_id.split_once('/')?;
        let modules = self.modules.read().expect("modules lock");
        let set = modules.get(module_name)?.nodes.get(set_name)?;
        if set.enabled && set.err.is_none() {
            Some(meta)
        } else {
            None
        }
    }

    pub fn all_types(&self) -> Vec<String> {
        self.constructors.read().expect("constructors lock").keys().cloned().collect()
    }

    /// Adds a module and its sets. A set arriving with zero types is
    /// flagged `set_has_no_types`; registered constructors may fill the
    /// set and clear the flag.
    pub fn add_module(&self, manifest: ModuleManifest) -> crate::Result<()> {
        {
            let mut modules = self.modules.write().expect("modules lock");
            if modules.contains_key(&manifest.name) {
                return Err(WireflowError::InvalidOperation(format!(
                    "Module '{}' is already registered",
                    manifest.name
                ))
                .into());
            }

            let mut nodes = HashMap::new();
            for set_manifest in manifest.sets.iter() {
                let set = NodeSet {
                    id: format!("{}/{}", manifest.name, set_manifest.name),
                    name: set_manifest.name.clone(),
                    module: manifest.name.clone(),
                    version: manifest.version.clone(),
                    types: set_manifest.types.clone(),
                    enabled: true,
                    err: if set_manifest.types.is_empty() { Some("set_has_no_types".to_string()) } else { None },
                    config: set_manifest.config.clone(),
                };
                nodes.insert(set_manifest.name.clone(), set);
            }

            let info = ModuleInfo {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                pending_version: manifest.pending_version.clone(),
                local: manifest.local,
                user: manifest.user,
                nodes,
                icon_dirs: manifest.icon_dirs.clone(),
                resources_dir: manifest.resources_dir.clone(),
            };
            modules.insert(manifest.name.clone(), info);

            let mut types = self.node_type_to_id.write().expect("types lock");
            for set_manifest in manifest.sets.iter() {
                for t in set_manifest.types.iter() {
                    types.insert(t.clone(), format!("{}/{}", manifest.name, set_manifest.name));
                }
            }
        }

        self.invalidate_config_cache();
        Ok(())
    }

    /// Binds a constructor to a type inside a set. A type name is globally
    /// unique; a second registration names both owners.
    pub fn register_node_constructor(&self, set_id: &str, meta: &'static MetaNode) -> crate::Result<()> {
        let (module_name, set_name) = set_id
            .split_once('/')
            .ok_or(WireflowError::BadArgument("set_id"))
            .with_context(|| format!("Bad set id: '{}'", set_id))?;

        {
            let types = self.node_type_to_id.read().expect("types lock");
            if let Some(existing_set) = types.get(meta.type_) {
                let existing_module = existing_set.split('/').next().unwrap_or(existing_set).to_string();
                if existing_set != set_id {
                    return Err(WireflowError::TypeAlreadyRegistered {
                        type_: meta.type_.to_string(),
                        module: existing_module,
                    })
                    .with_context(|| {
                        format!("'{}' is provided by both '{}' and '{}'", meta.type_, existing_set, set_id)
                    });
                }
            }
        }

        {
            let mut modules = self.modules.write().expect("modules lock");
            let module = modules
                .get_mut(module_name)
                .ok_or(WireflowError::InvalidOperation(format!("Unknown module: '{}'", module_name)))?;
            let set = module
                .nodes
                .get_mut(set_name)
                .ok_or(WireflowError::InvalidOperation(format!("Unknown node set: '{}'", set_id)))?;
            if !set.types.iter().any(|t| t == meta.type_) {
                set.types.push(meta.type_.to_string());
            }
            if set.err.as_deref() == Some("set_has_no_types") {
                set.err = None;
            }
        }

        self.node_type_to_id.write().expect("types lock").insert(meta.type_.to_string(), set_id.to_string());
        self.constructors.write().expect("constructors lock").insert(meta.type_.to_string(), meta);
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Option<ModuleInfo> {
        self.modules.read().expect("modules lock").get(name).cloned()
    }

    pub fn get_module_list(&self) -> Vec<ModuleInfo> {
        self.modules.read().expect("modules lock").values().cloned().collect()
    }

    pub fn get_module_info(&self, name: &str) -> Option<ModuleInfo> {
        self.get_module(name)
    }

    pub fn get_node_list(&self, filter: Option<&dyn Fn(&NodeSet) -> bool>) -> Vec<NodeSet> {
        let modules = self.modules.read().expect("modules lock");
        let mut result = Vec::new();
        for module in modules.values() {
            for set in module.nodes.values() {
                if filter.map(|f| f(set)).unwrap_or(true) {
                    result.push(set.clone());
                }
            }
        }
        result
    }

    /// Looks a set up by its id (`module/set`) or by one of its types.
    pub fn get_node_info(&self, type_or_id: &str) -> Option<NodeSet> {
        let modules = self.modules.read().expect("modules lock");
        if let Some((module_name, set_name)) = type_or_id.split_once('/') {
            if let Some(set) = modules.get(module_name).and_then(|m| m.nodes.get(set_name)) {
                return Some(set.clone());
            }
        }
        let set_id = self.node_type_to_id.read().expect("types lock").get(type_or_id).cloned()?;
        let (module_name, set_name) = set_id.split_once('/')?;
        modules.get(module_name).and_then(|m| m.nodes.get(set_name)).cloned()
    }

    pub fn get_type_id(&self, type_name: &str) -> Option<String> {
        self.node_type_to_id.read().expect("types lock").get(type_name).cloned()
    }

    /// Marks a load failure on a set. The constructor gate reports None
    /// for its types from now on.
    pub fn set_module_error(&self, set_id: &str, err: String) {
        if let Some((module_name, set_name)) = set_id.split_once('/') {
            let mut modules = self.modules.write().expect("modules lock");
            if let Some(set) = modules.get_mut(module_name).and_then(|m| m.nodes.get_mut(set_name)) {
                set.err = Some(err);
            }
        }
    }

    pub fn set_node_set_enabled(&self, set_id: &str, enabled: bool) {
        if let Some((module_name, set_name)) = set_id.split_once('/') {
            let mut modules = self.modules.write().expect("modules lock");
            if let Some(set) = modules.get_mut(module_name).and_then(|m| m.nodes.get_mut(set_name)) {
                set.enabled = enabled;
            }
        }
    }

    /// The editor-facing config document for a language: per loaded set, a
    /// delimiter comment, the set's raw template and the localised help.
    /// Cached per language until `add_module`/`clear`.
    pub fn get_all_node_configs(&self, lang: &str) -> String {
        {
            let cache = self.config_cache.lock().expect("config cache lock");
            if let Some(cached) = cache.get(lang) {
                return cached.clone();
            }
        }

        let mut result = String::new();
        let modules = self.modules.read().expect("modules lock");
        let mut sets: Vec<&NodeSet> = modules.values().flat_map(|m| m.nodes.values()).collect();
        sets.sort_by(|a, b| a.id.cmp(&b.id));
        for set in sets.iter().filter(|s| s.enabled && s.err.is_none() && !s.types.is_empty()) {
            result.push_str(&format!("\n<!-- --- [node-set:{}] --- -->\n", set.id));
            result.push_str(&set.config);
            if let Some(help) = self.node_loader.get_node_help(&set.name, lang) {
                result.push_str(&help);
            }
        }
        drop(modules);

        let mut cache = self.config_cache.lock().expect("config cache lock");
        cache.insert(lang.to_string(), result.clone());
        result
    }

    fn invalidate_config_cache(&self) {
        self.config_cache.lock().expect("config cache lock").clear();
    }

    /// Resolves an icon file. Paths escaping the module directories are
    /// rejected; misses on other modules fall back to the built-in module.
    pub fn get_node_icon_path(&self, module: &str, icon: &str) -> Option<PathBuf> {
        if icon.contains("..") {
            return None;
        }
        let modules = self.modules.read().expect("modules lock");
        if let Some(found) = modules.get(module).and_then(|m| find_icon_in_dirs(&m.icon_dirs, icon)) {
            return Some(found);
        }
        if module != BUILTIN_MODULE {
            return modules.get(BUILTIN_MODULE).and_then(|m| find_icon_in_dirs(&m.icon_dirs, icon));
        }
        None
    }

    /// Every module's icon file list.
    pub fn get_node_icons(&self) -> HashMap<String, Vec<String>> {
        let modules = self.modules.read().expect("modules lock");
        let mut result = HashMap::new();
        for (name, module) in modules.iter() {
            let mut icons = Vec::new();
            for dir in module.icon_dirs.iter() {
                if let Ok(entries) = std::fs::read_dir(dir) {
                    for entry in entries.flatten() {
                        if entry.path().is_file() {
                            if let Some(fname) = entry.file_name().to_str() {
                                icons.push(fname.to_string());
                            }
                        }
                    }
                }
            }
            if !icons.is_empty() {
                result.insert(name.clone(), icons);
            }
        }
        result
    }

    pub fn get_module_resource(&self, module: &str, resource_path: &str) -> Option<PathBuf> {
        if resource_path.contains("..") {
            return None;
        }
        let modules = self.modules.read().expect("modules lock");
        let dir = modules.get(module)?.resources_dir.clone()?;
        let full = dir.join(resource_path);
        if full.is_file() {
            Some(full)
        } else {
            None
        }
    }

    /// Persists the module list snapshot. Emits a `restart-required`
    /// runtime event iff some module's pending version resolved or
    /// appeared since the previous snapshot.
    pub fn save_node_list(&self) -> crate::Result<()> {
        let current: HashMap<String, Option<String>> = {
            let modules = self.modules.read().expect("modules lock");
            modules.iter().map(|(name, m)| (name.clone(), m.pending_version.clone())).collect()
        };

        let restart_required = {
            let mut snapshot = self.pending_snapshot.lock().expect("snapshot lock");
            let changed = current.iter().any(|(name, pending)| snapshot.get(name).map(|p| p != pending).unwrap_or(false))
                || snapshot.iter().any(|(name, pending)| pending.is_some() && !current.contains_key(name));
            *snapshot = current;
            changed
        };

        if restart_required {
            self.events.emit(
                "runtime-event",
                Variant::from(serde_json::json!({"id": "restart-required", "retain": true})),
            );
        }
        Ok(())
    }

    pub fn clear(&self) {
        {
            let mut modules = self.modules.write().expect("modules lock");
            modules.clear();
        }
        self.node_type_to_id.write().expect("types lock").clear();
        self.constructors.write().expect("constructors lock").clear();
        self.invalidate_config_cache();
    }
}

fn find_icon_in_dirs(dirs: &[PathBuf], icon: &str) -> Option<PathBuf> {
    for dir in dirs.iter() {
        let candidate = dir.join(icon);
        if candidate.is_file() && candidate.starts_with(Path::new(dir)) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> RegistryHandle {
        RegistryBuilder::new().build().unwrap()
    }

    #[test]
    fn test_builtin_types_are_registered() {
        let reg = test_registry();
        assert!(reg.get("inject").is_some());
        assert!(reg.get("debug").is_some());
        assert!(reg.get("unknown.flow").is_some());
        assert!(reg.get("definitely-not-a-node").is_none());
        assert_eq!(reg.get_type_id("inject").as_deref(), Some("wireflow-nodes/core"));
    }

    #[test]
    fn test_duplicate_type_is_rejected() {
        let reg = test_registry();
        let manifest = ModuleManifest {
            name: "acme-nodes".into(),
            version: "1.0.0".into(),
            sets: vec![NodeSetManifest { name: "tools".into(), types: vec![], config: String::new() }],
            ..Default::default()
        };
        reg.add_module(manifest).unwrap();

        static DUP_META: MetaNode =
            MetaNode { kind: NodeKind::Flow, type_: "inject", factory: NodeFactory::Flow(|_, _, _| unreachable!()) };
        let err = reg.register_node_constructor("acme-nodes/tools", &DUP_META).unwrap_err();
        let found = format!("{:#}", err);
        assert!(found.contains("inject"));
        assert!(found.contains("wireflow-nodes"));
    }

    #[test]
    fn test_empty_set_is_flagged() {
        let reg = test_registry();
        let manifest = ModuleManifest {
            name: "empty-module".into(),
            version: "0.1.0".into(),
            sets: vec![NodeSetManifest { name: "nothing".into(), types: vec![], config: String::new() }],
            ..Default::default()
        };
        reg.add_module(manifest).unwrap();
        let info = reg.get_node_info("empty-module/nothing").unwrap();
        assert_eq!(info.err.as_deref(), Some("set_has_no_types"));
    }

    #[test]
    fn test_disabled_set_gates_constructor() {
        let reg = test_registry();
        assert!(reg.get("inject").is_some());
        reg.set_node_set_enabled("wireflow-nodes/core", false);
        assert!(reg.get("inject").is_none());
        reg.set_node_set_enabled("wireflow-nodes/core", true);
        assert!(reg.get("inject").is_some());

        reg.set_module_error("wireflow-nodes/core", "failed to load".into());
        assert!(reg.get("inject").is_none());
    }

    #[test]
    fn test_node_info_lookup_by_type_and_id() {
        let reg = test_registry();
        let by_type = reg.get_node_info("inject").unwrap();
        let by_id = reg.get_node_info("wireflow-nodes/core").unwrap();
        assert_eq!(by_type.id, by_id.id);
        assert!(by_type.types.iter().any(|t| t == "inject"));
    }

    #[test]
    fn test_all_node_configs_cache() {
        let reg = test_registry();
        let manifest = ModuleManifest {
            name: "acme".into(),
            version: "1.0.0".into(),
            sets: vec![NodeSetManifest {
                name: "tools".into(),
                types: vec!["acme-tool".into()],
                config: "<script type=\"text/html\">acme</script>".into(),
            }],
            ..Default::default()
        };

        let first = reg.get_all_node_configs("en-US");
        assert!(!first.contains("acme"));

        reg.add_module(manifest).unwrap();
        let second = reg.get_all_node_configs("en-US");
        assert!(second.contains("node-set:acme/tools"));
        assert!(second.contains("acme"));
    }

    #[test]
    fn test_icon_path_rejects_traversal() {
        let reg = test_registry();
        assert!(reg.get_node_icon_path(BUILTIN_MODULE, "../../etc/passwd").is_none());
    }

    #[test]
    fn test_save_node_list_restart_required() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let events = Arc::new(Events::new());
        let reg = RegistryBuilder::new().with_events(events.clone()).build().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        events.on("runtime-event", move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        // no pending versions anywhere: no restart required
        reg.save_node_list().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let manifest = ModuleManifest {
            name: "pending-module".into(),
            version: "1.0.0".into(),
            pending_version: Some("2.0.0".into()),
            sets: vec![NodeSetManifest { name: "s".into(), types: vec!["pending-type".into()], config: String::new() }],
            ..Default::default()
        };
        reg.add_module(manifest).unwrap();
        reg.save_node_list().unwrap();
        // snapshot had no entry for the new module: not a pending change
        // of a known module, snapshot is updated

        // pending version resolves
        {
            let mut modules = reg.modules.write().unwrap();
            modules.get_mut("pending-module").unwrap().pending_version = None;
        }
        reg.save_node_list().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
