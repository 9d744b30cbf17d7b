use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

/// Persists the flows document. The editor API owns the real
/// implementation; the runtime only requires these two calls.
#[async_trait]
pub trait FlowStorage: Send + Sync {
    async fn load_flows(&self) -> crate::Result<Option<JsonValue>>;
    async fn save_flows(&self, flows: &JsonValue) -> crate::Result<()>;
}

/// Persists the global settings layer.
#[async_trait]
pub trait SettingsStorage: Send + Sync {
    async fn load_settings(&self) -> crate::Result<Option<JsonValue>>;
    async fn save_settings(&self, settings: &JsonValue) -> crate::Result<()>;
}

/// Resolves localised node help for the registry's config cache.
pub trait NodeLoader: Send + Sync {
    fn get_node_help(&self, set_name: &str, lang: &str) -> Option<String>;
}

pub type FlowStorageHandle = Arc<dyn FlowStorage>;
pub type SettingsStorageHandle = Arc<dyn SettingsStorage>;
pub type NodeLoaderHandle = Arc<dyn NodeLoader>;

/// Keeps everything in process memory. The default when no collaborator
/// is wired in, and the storage used by the tests.
#[derive(Default)]
pub struct MemoryStorage {
    flows: Mutex<Option<JsonValue>>,
    settings: Mutex<Option<JsonValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStorage for MemoryStorage {
    async fn load_flows(&self) -> crate::Result<Option<JsonValue>> {
        Ok(self.flows.lock().await.clone())
    }

    async fn save_flows(&self, flows: &JsonValue) -> crate::Result<()> {
        *self.flows.lock().await = Some(flows.clone());
        Ok(())
    }
}

#[async_trait]
impl SettingsStorage for MemoryStorage {
    async fn load_settings(&self) -> crate::Result<Option<JsonValue>> {
        Ok(self.settings.lock().await.clone())
    }

    async fn save_settings(&self, settings: &JsonValue) -> crate::Result<()> {
        *self.settings.lock().await = Some(settings.clone());
        Ok(())
    }
}

/// A loader with no catalogs. Help lookups just miss.
#[derive(Default)]
pub struct NullNodeLoader;

impl NodeLoader for NullNodeLoader {
    fn get_node_help(&self, _set_name: &str, _lang: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.load_flows().await.unwrap().is_none());

        let flows = json!([{"id": "100", "type": "tab"}]);
        storage.save_flows(&flows).await.unwrap();
        assert_eq!(storage.load_flows().await.unwrap(), Some(flows));

        let settings = json!({"a": 1});
        storage.save_settings(&settings).await.unwrap();
        assert_eq!(storage.load_settings().await.unwrap(), Some(settings));
    }
}
