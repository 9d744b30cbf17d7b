use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::runtime::context::*;
use crate::runtime::model::propex::PropexSegment;
use crate::Result;

inventory::submit! {
    ProviderMetadata { type_: "memory", factory: MemoryContextStore::build }
}

/// The in-process context provider: one variant object per scope.
struct MemoryContextStore {
    name: String,
    scopes: RwLock<HashMap<String, Variant>>,
}

impl MemoryContextStore {
    fn build(name: String, _options: Option<&ContextStoreOptions>) -> crate::Result<Box<dyn ContextStore>> {
        let this = MemoryContextStore { name, scopes: RwLock::new(HashMap::new()) };
        Ok(Box::new(this))
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_one(&self, scope: &str, path: &[PropexSegment<'_>]) -> Result<Variant> {
        let scopes = self.scopes.read().await;
        let scope_var = scopes.get(scope).ok_or(WireflowError::OutOfRange)?;
        scope_var.get_segs(path).cloned().ok_or(WireflowError::OutOfRange.into())
    }

    async fn get_keys(&self, scope: &str) -> Result<Vec<String>> {
        let scopes = self.scopes.read().await;
        let scope_var = scopes.get(scope).ok_or(WireflowError::OutOfRange)?;
        match scope_var.as_object() {
            Some(map) => Ok(map.keys().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn set_one(&self, scope: &str, path: &[PropexSegment<'_>], value: Variant) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        let scope_var = scopes.entry(scope.to_string()).or_insert_with(Variant::empty_object);
        scope_var.set_segs_property(path, value, true)
    }

    async fn remove_one(&self, scope: &str, path: &[PropexSegment<'_>]) -> Result<Variant> {
        let mut scopes = self.scopes.write().await;
        let scope_var = scopes.get_mut(scope).ok_or(WireflowError::OutOfRange)?;
        let map = scope_var.as_object_mut().ok_or(WireflowError::OutOfRange)?;
        map.remove_segs_property(path).ok_or(WireflowError::OutOfRange.into())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        scopes.remove(scope);
        Ok(())
    }

    async fn clean(&self, active_scopes: &[String]) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        scopes.retain(|scope, _| scope == GLOBAL_CONTEXT_NAME || active_scopes.iter().any(|x| x == scope));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::model::propex;

    fn segs(expr: &str) -> Vec<PropexSegment<'_>> {
        propex::parse(expr).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_set_get_remove() {
        let store = MemoryContextStore::build("memory".into(), None).unwrap();

        store.set_one("node1", &segs("count"), Variant::from(3)).await.unwrap();
        assert_eq!(store.get_one("node1", &segs("count")).await.unwrap(), Variant::from(3));

        assert!(store.get_one("node2", &segs("count")).await.is_err());

        let removed = store.remove_one("node1", &segs("count")).await.unwrap();
        assert_eq!(removed, Variant::from(3));
        assert!(store.get_one("node1", &segs("count")).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_clean_preserves_global() {
        let store = MemoryContextStore::build("memory".into(), None).unwrap();
        store.set_one(GLOBAL_CONTEXT_NAME, &segs("keep"), Variant::from(1)).await.unwrap();
        store.set_one("dead-node", &segs("gone"), Variant::from(2)).await.unwrap();
        store.set_one("live-node", &segs("kept"), Variant::from(3)).await.unwrap();

        store.clean(&["live-node".to_string()]).await.unwrap();

        assert!(store.get_one(GLOBAL_CONTEXT_NAME, &segs("keep")).await.is_ok());
        assert!(store.get_one("dead-node", &segs("gone")).await.is_err());
        assert!(store.get_one("live-node", &segs("kept")).await.is_ok());
    }
}
