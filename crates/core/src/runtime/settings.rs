use std::collections::HashMap;
use std::sync::RwLock;

use crate::runtime::model::*;
use crate::runtime::storage::SettingsStorageHandle;
use crate::*;

/// A per-node-type setting declaration.
#[derive(Debug, Clone)]
pub struct NodeSettingOpts {
    pub value: Variant,
    pub exportable: bool,
}

/// The layered runtime settings store.
///
/// Four layers answer lookups in order: *local* (fixed at process start,
/// read-only), *global* (mutable, persisted through the storage
/// collaborator), *node* (registered per node type), and *user* (a
/// per-username submap inside global).
pub struct Settings {
    local: HashMap<String, Variant>,
    global: RwLock<Option<VariantObjectMap>>,
    node_settings: RwLock<HashMap<String, HashMap<String, NodeSettingOpts>>>,
    storage: SettingsStorageHandle,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings").field("local", &self.local).finish()
    }
}

impl Settings {
    pub fn new(local: HashMap<String, Variant>, storage: SettingsStorageHandle) -> Self {
        Settings { local, global: RwLock::new(None), node_settings: RwLock::new(HashMap::new()), storage }
    }

    /// Loads the global layer from storage. Until this resolves, every
    /// global access reports `NotAvailable`.
    pub async fn load(&self) -> crate::Result<()> {
        let loaded = self.storage.load_settings().await?;
        let map = match loaded {
            Some(jv) => Variant::from(jv).into_object().unwrap_or_default(),
            None => VariantObjectMap::new(),
        };
        *self.global.write().expect("settings lock") = Some(map);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.global.read().expect("settings lock").is_some()
    }

    pub fn get(&self, prop: &str) -> crate::Result<Variant> {
        if prop == "users" {
            return Err(WireflowError::PermissionDenied.into());
        }
        if let Some(value) = self.local.get(prop) {
            return Ok(value.clone());
        }
        let global = self.global.read().expect("settings lock");
        let global = global
            .as_ref()
            .ok_or(WireflowError::NotAvailable("settings".into()))
            .with_context(|| "Settings not available".to_string())?;
        Ok(global.get(prop).cloned().unwrap_or(Variant::Null))
    }

    /// Writes a global property. Local keys are read-only; unchanged
    /// values (deep compare) are not persisted again.
    pub async fn set(&self, prop: &str, value: Variant) -> crate::Result<()> {
        if prop == "users" {
            return Err(WireflowError::PermissionDenied.into());
        }
        if self.local.contains_key(prop) {
            return Err(WireflowError::PropertyReadOnly(prop.to_string()).into());
        }

        let (changed, snapshot) = {
            let mut global = self.global.write().expect("settings lock");
            let global = global
                .as_mut()
                .ok_or(WireflowError::NotAvailable("settings".into()))
                .with_context(|| "Settings not available".to_string())?;
            let current = global.get(prop);
            if current == Some(&value) {
                (false, Variant::Null)
            } else {
                global.insert(prop.to_string(), value);
                (true, Variant::Object(global.clone()))
            }
        };

        if changed {
            let jv = serde_json::to_value(&snapshot)?;
            self.storage.save_settings(&jv).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, prop: &str) -> crate::Result<()> {
        if self.local.contains_key(prop) {
            return Err(WireflowError::PropertyReadOnly(prop.to_string()).into());
        }
        let (changed, snapshot) = {
            let mut global = self.global.write().expect("settings lock");
            let global = global
                .as_mut()
                .ok_or(WireflowError::NotAvailable("settings".into()))
                .with_context(|| "Settings not available".to_string())?;
            match global.remove(prop) {
                Some(_) => (true, Variant::Object(global.clone())),
                None => (false, Variant::Null),
            }
        };
        if changed {
            let jv = serde_json::to_value(&snapshot)?;
            self.storage.save_settings(&jv).await?;
        }
        Ok(())
    }

    pub fn get_user_settings(&self, username: &str) -> Option<Variant> {
        let global = self.global.read().expect("settings lock");
        global
            .as_ref()?
            .get("users")
            .and_then(|users| users.as_object())
            .and_then(|users| users.get(username))
            .cloned()
    }

    pub async fn set_user_settings(&self, username: &str, value: Variant) -> crate::Result<()> {
        let snapshot = {
            let mut global = self.global.write().expect("settings lock");
            let global = global
                .as_mut()
                .ok_or(WireflowError::NotAvailable("settings".into()))
                .with_context(|| "Settings not available".to_string())?;
            let users = global.entry("users".to_string()).or_insert_with(Variant::empty_object);
            match users.as_object_mut() {
                Some(users) => {
                    users.insert(username.to_string(), value);
                }
                None => {
                    return Err(WireflowError::InvalidOperation("'users' must be an object".into()).into());
                }
            }
            Variant::Object(global.clone())
        };
        let jv = serde_json::to_value(&snapshot)?;
        self.storage.save_settings(&jv).await?;
        Ok(())
    }

    /// Registers per-type node settings. Every property name must start
    /// with the normalised type name (`mqtt-broker` registers
    /// `mqttBroker*` properties).
    pub fn register_node_settings(&self, node_type: &str, opts: HashMap<String, NodeSettingOpts>) -> crate::Result<()> {
        let normalised = normalise_node_type_name(node_type);
        for name in opts.keys() {
            if !name.starts_with(&normalised) {
                return Err(WireflowError::InvalidOperation(format!(
                    "Registered setting '{}' for type '{}' must start with '{}'",
                    name, node_type, normalised
                ))
                .into());
            }
        }
        let mut node_settings = self.node_settings.write().expect("settings lock");
        node_settings.insert(node_type.to_string(), opts);
        Ok(())
    }

    /// The union of exportable node settings: registered defaults overlaid
    /// by local values. Keys already present in `safe_settings` are left
    /// alone.
    pub fn export_node_settings(&self, safe_settings: &mut VariantObjectMap) {
        let node_settings = self.node_settings.read().expect("settings lock");
        for (node_type, opts) in node_settings.iter() {
            for (name, opt) in opts.iter() {
                if !opt.exportable {
                    continue;
                }
                if safe_settings.contains_key(name) {
                    log::warn!("[SETTINGS] Cannot export property '{}' of type '{}': already in use", name, node_type);
                    continue;
                }
                let value = self.local.get(name).cloned().unwrap_or_else(|| opt.value.clone());
                safe_settings.insert(name.clone(), value);
            }
        }
    }
}

/// camelCase normalisation of a node type name: non-alphanumerics split
/// words, each subsequent word is capitalised, the first character is
/// lowered.
pub fn normalise_node_type_name(node_type: &str) -> String {
    let cleaned: String = node_type.chars().map(|c| if c.is_alphanumeric() { c } else { ' ' }).collect();
    let mut result = String::with_capacity(node_type.len());
    for (i, word) in cleaned.split_whitespace().enumerate() {
        let mut chars = word.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => continue,
        };
        if i == 0 {
            result.extend(first.to_lowercase());
        } else {
            result.extend(first.to_uppercase());
        }
        result.push_str(chars.as_str());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::MemoryStorage;
    use std::sync::Arc;

    fn make_settings(local: &[(&str, Variant)]) -> Settings {
        let local_map = local.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        Settings::new(local_map, Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_normalise_node_type_name() {
        assert_eq!(normalise_node_type_name("mqtt-broker"), "mqttBroker");
        assert_eq!(normalise_node_type_name("inject"), "inject");
        assert_eq!(normalise_node_type_name("HTTP Request"), "hTTPRequest");
        assert_eq!(normalise_node_type_name("a_b c"), "aBC");
    }

    #[tokio::test]
    async fn test_get_rejects_users_and_unloaded() {
        let settings = make_settings(&[]);
        assert!(settings.get("users").is_err());
        assert!(settings.get("foo").is_err()); // global not loaded

        settings.load().await.unwrap();
        assert_eq!(settings.get("foo").unwrap(), Variant::Null);
    }

    #[tokio::test]
    async fn test_local_layer_wins_and_is_read_only() {
        let settings = make_settings(&[("httpPort", Variant::from(1880))]);
        settings.load().await.unwrap();

        assert_eq!(settings.get("httpPort").unwrap(), Variant::from(1880));
        let err = settings.set("httpPort", Variant::from(9999)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<WireflowError>(), Some(WireflowError::PropertyReadOnly(_))));
    }

    #[tokio::test]
    async fn test_set_persists_only_on_change() {
        let storage = Arc::new(MemoryStorage::new());
        let settings = Settings::new(HashMap::new(), storage.clone());
        settings.load().await.unwrap();

        settings.set("theme", Variant::from("dark")).await.unwrap();
        use crate::runtime::storage::SettingsStorage;
        let stored1 = storage.load_settings().await.unwrap().unwrap();
        assert_eq!(stored1["theme"], serde_json::json!("dark"));

        // same deep value again: not persisted, not an error
        settings.set("theme", Variant::from("dark")).await.unwrap();
        assert_eq!(settings.get("theme").unwrap(), Variant::from("dark"));
    }

    #[tokio::test]
    async fn test_register_node_settings_enforces_prefix() {
        let settings = make_settings(&[]);
        let mut opts = HashMap::new();
        opts.insert(
            "mqttBrokerKeepalive".to_string(),
            NodeSettingOpts { value: Variant::from(60), exportable: true },
        );
        settings.register_node_settings("mqtt-broker", opts).unwrap();

        let mut bad = HashMap::new();
        bad.insert("keepalive".to_string(), NodeSettingOpts { value: Variant::from(60), exportable: true });
        assert!(settings.register_node_settings("mqtt-broker", bad).is_err());
    }

    #[tokio::test]
    async fn test_export_node_settings_overlays_and_refuses_overwrite() {
        let settings = make_settings(&[("injectMaxTimers", Variant::from(10))]);
        let mut opts = HashMap::new();
        opts.insert("injectMaxTimers".to_string(), NodeSettingOpts { value: Variant::from(5), exportable: true });
        opts.insert("injectHidden".to_string(), NodeSettingOpts { value: Variant::from(1), exportable: false });
        settings.register_node_settings("inject", opts).unwrap();

        let mut safe = VariantObjectMap::new();
        safe.insert("already".to_string(), Variant::from(true));
        settings.export_node_settings(&mut safe);

        // local value wins over the registered default
        assert_eq!(safe.get("injectMaxTimers").unwrap(), &Variant::from(10));
        // non-exportable settings stay private
        assert!(!safe.contains_key("injectHidden"));
        assert_eq!(safe.get("already").unwrap(), &Variant::from(true));
    }

    #[tokio::test]
    async fn test_user_settings_submap() {
        let settings = make_settings(&[]);
        settings.load().await.unwrap();
        assert!(settings.get_user_settings("alice").is_none());

        settings.set_user_settings("alice", Variant::from([("lang", Variant::from("en"))])).await.unwrap();
        let alice = settings.get_user_settings("alice").unwrap();
        assert_eq!(alice.get_nav("lang", &[]).unwrap(), &Variant::from("en"));

        // the users map stays unreachable through plain get
        assert!(settings.get("users").is_err());
    }
}
