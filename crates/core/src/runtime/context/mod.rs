use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use dashmap::DashMap;
use nom::Parser;
use crate::runtime::model::propex::PropexSegment;

use crate::runtime::model::*;
use crate::*;

mod memory;

pub const GLOBAL_CONTEXT_NAME: &str = "global";
pub const DEFAULT_STORE_NAME: &str = "default";
pub const DEFAULT_STORE_NAME_ALIAS: &str = "_";

type StoreFactoryFn = fn(name: String, options: Option<&ContextStoreOptions>) -> crate::Result<Box<dyn ContextStore>>;

#[derive(Debug, Clone, Copy)]
pub struct ProviderMetadata {
    pub type_: &'static str,
    pub factory: StoreFactoryFn,
}

inventory::collect!(ProviderMetadata);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ContextStorageSettings {
    pub default: String,
    pub stores: HashMap<String, ContextStoreOptions>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ContextStoreOptions {
    pub provider: String,

    #[serde(flatten, default)]
    pub options: HashMap<String, config::Value>,
}

/// A context key as written by typed inputs: optional store selector plus
/// the property path, e.g. `#:(file)::foo.bar`.
#[derive(Debug, Clone, Copy)]
pub struct ContextKey<'a> {
    pub store: Option<&'a str>,
    pub key: &'a str,
}

/// The API a context storage provider implements.
#[async_trait]
pub trait ContextStore: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn get_one(&self, scope: &str, path: &[PropexSegment<'_>]) -> Result<Variant>;
    async fn get_keys(&self, scope: &str) -> Result<Vec<String>>;

    async fn set_one(&self, scope: &str, path: &[PropexSegment<'_>], value: Variant) -> Result<()>;

    async fn remove_one(&self, scope: &str, path: &[PropexSegment<'_>]) -> Result<Variant>;

    async fn delete(&self, scope: &str) -> Result<()>;
    async fn clean(&self, active_scopes: &[String]) -> Result<()>;
}

pub type ContextStoreHandle = Arc<dyn ContextStore>;

/// A context scope bound to one flows element (node, flow or the engine).
#[derive(Debug)]
pub struct Context {
    pub parent: Option<Weak<Context>>,
    pub manager: Weak<ContextManager>,
    pub scope: String,
}

pub struct ContextManager {
    default_store: ContextStoreHandle,
    stores: HashMap<String, ContextStoreHandle>,
    contexts: DashMap<String, Arc<Context>>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager").field("scopes", &self.contexts.len()).finish()
    }
}

pub struct ContextManagerBuilder {
    stores: HashMap<String, ContextStoreHandle>,
    default_store: String,
    settings: Option<ContextStorageSettings>,
}

impl Context {
    pub async fn get_one(&self, storage: Option<&str>, key: &str, eval_env: &[PropexEnv<'_>]) -> Option<Variant> {
        let manager = self.manager.upgrade()?;
        let store =
            if let Some(storage) = storage { manager.get_context_store(storage)? } else { manager.get_default_store() };
        let mut path = propex::parse(key).ok()?;
        expand_propex_segments(&mut path, eval_env).ok()?;
        store.get_one(&self.scope, &path).await.ok()
    }

    pub async fn keys(&self, store: Option<&str>) -> Option<Vec<String>> {
        let manager = self.manager.upgrade()?;
        let store =
            if let Some(storage) = store { manager.get_context_store(storage)? } else { manager.get_default_store() };
        store.get_keys(&self.scope).await.ok()
    }

    /// Sets a context property. `None` removes it.
    pub async fn set_one(
        &self,
        storage: Option<&str>,
        key: &str,
        value: Option<Variant>,
        eval_env: &[PropexEnv<'_>],
    ) -> Result<()> {
        let manager =
            self.manager.upgrade().ok_or(WireflowError::InvalidOperation("The context manager is gone".into()))?;
        let store = if let Some(storage) = storage {
            manager
                .get_context_store(storage)
                .ok_or(WireflowError::BadArgument("storage"))
                .with_context(|| format!("Cannot find the storage: '{}'", storage))?
        } else {
            manager.get_default_store()
        };
        let mut path = propex::parse(key).map_err(|_| WireflowError::InvalidExpr(key.into()))?;
        expand_propex_segments(&mut path, eval_env)?;
        if let Some(value) = value {
            store.set_one(&self.scope, &path, value).await
        } else {
            let _ = store.remove_one(&self.scope, &path).await?;
            Ok(())
        }
    }
}

impl Default for ContextManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManagerBuilder {
    pub fn new() -> Self {
        let stores = HashMap::with_capacity(inventory::iter::<ProviderMetadata>.into_iter().count());
        Self { stores, default_store: "memory".into(), settings: None }
    }

    pub fn load_default(&mut self) -> &mut Self {
        let memory_metadata = inventory::iter::<ProviderMetadata>
            .into_iter()
            .find(|x| x.type_ == "memory")
            .expect("The memory context provider must exist");
        let memory_store =
            (memory_metadata.factory)("memory".into(), None).expect("Creating a memory store cannot fail");
        self.stores.clear();
        self.stores.insert("memory".to_string(), Arc::from(memory_store));
        self.default_store = "memory".into();
        self
    }

    pub fn with_config(&mut self, config: &config::Config) -> crate::Result<&mut Self> {
        let settings: ContextStorageSettings = match config.get("runtime.context") {
            Ok(x) => x,
            Err(config::ConfigError::NotFound(_)) => {
                self.load_default();
                return Ok(self);
            }
            Err(e) => return Err(e.into()),
        };
        self.stores.clear();
        for (store_name, store_options) in settings.stores.iter() {
            log::debug!(
                "[CONTEXT] Initializing context store: name='{}', provider='{}' ...",
                store_name,
                store_options.provider
            );
            let meta = inventory::iter::<ProviderMetadata>
                .into_iter()
                .find(|x| x.type_ == store_options.provider)
                .ok_or(WireflowError::Configuration)?;
            let store = (meta.factory)(store_name.into(), Some(store_options))?;
            self.stores.insert(store_name.clone(), Arc::from(store));
        }

        if !settings.stores.contains_key(&settings.default) {
            return Err(WireflowError::Configuration).with_context(|| {
                format!("Cannot find the default context storage '{}', check your configuration file.", settings.default)
            });
        }
        self.default_store = settings.default.clone();
        self.settings = Some(settings);
        Ok(self)
    }

    pub fn default_store(&mut self, default: String) -> &mut Self {
        self.default_store = default;
        self
    }

    pub fn build(&self) -> crate::Result<Arc<ContextManager>> {
        let default_store = self
            .stores
            .get(&self.default_store)
            .ok_or(WireflowError::Configuration)
            .with_context(|| format!("Unknown default context store: '{}'", self.default_store))?;
        let cm = ContextManager {
            default_store: default_store.clone(),
            stores: self.stores.clone(),
            contexts: DashMap::new(),
        };
        Ok(Arc::new(cm))
    }
}

impl ContextManager {
    pub fn new_context(self: &Arc<Self>, parent: &Arc<Context>, scope: String) -> Arc<Context> {
        let c = Arc::new(Context {
            parent: Some(Arc::downgrade(parent)),
            manager: Arc::downgrade(self),
            scope: scope.clone(),
        });
        self.contexts.insert(scope, c.clone());
        c
    }

    pub fn new_global_context(self: &Arc<Self>) -> Arc<Context> {
        let c =
            Arc::new(Context { parent: None, manager: Arc::downgrade(self), scope: GLOBAL_CONTEXT_NAME.to_string() });
        self.contexts.insert(GLOBAL_CONTEXT_NAME.to_string(), c.clone());
        c
    }

    pub fn get_default_store(&self) -> &ContextStoreHandle {
        &self.default_store
    }

    pub fn get_context_store<'a>(&'a self, store_name: &str) -> Option<&'a ContextStoreHandle> {
        match store_name {
            DEFAULT_STORE_NAME | DEFAULT_STORE_NAME_ALIAS | "" => Some(&self.default_store),
            _ => self.stores.get(store_name),
        }
    }

    /// Drops the context scope of an element evicted by a deploy.
    pub async fn delete_context(&self, scope: &str) -> crate::Result<()> {
        self.contexts.remove(scope);
        for store in self.stores.values() {
            store.delete(scope).await?;
        }
        Ok(())
    }
}

fn parse_store_expr(input: &str) -> nom::IResult<&str, &str, nom::error::VerboseError<&str>> {
    use crate::text::nom_parsers::*;
    use nom::{
        bytes::complete::tag,
        character::complete::{char, multispace0},
        sequence::delimited,
    };

    let (input, _) = tag("#:").parse(input)?;
    let (input, store) =
        delimited(char('('), delimited(multispace0, identifier, multispace0), char(')')).parse(input)?;
    let (input, _) = tag("::").parse(input)?;
    Ok((input, store))
}

fn context_store_parser(input: &str) -> nom::IResult<&str, ContextKey, nom::error::VerboseError<&str>> {
    use nom::combinator::{opt, rest};

    let (input, store) = opt(parse_store_expr).parse(input)?;
    let (input, key) = rest(input)?;

    Ok((input, ContextKey { store, key }))
}

/// Parses a context property string to extract the store name if present.
///
/// `#:(file)::foo.bar` yields `ContextKey { store: Some("file"), key: "foo.bar" }`.
pub fn evaluate_key(key: &str) -> crate::Result<ContextKey<'_>> {
    match context_store_parser(key) {
        Ok(res) => Ok(res.1),
        Err(e) => Err(WireflowError::BadArgument("key")).with_context(|| format!("Cannot parse the key: '{0}'", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_store() {
        let res = evaluate_key("#:(file1)::foo.bar").unwrap();
        assert_eq!(Some("file1"), res.store);
        assert_eq!("foo.bar", res.key);

        let res = evaluate_key("#:(memory1)::payload").unwrap();
        assert_eq!(Some("memory1"), res.store);
        assert_eq!("payload", res.key);

        let res = evaluate_key("foo.bar").unwrap();
        assert_eq!(None, res.store);
        assert_eq!("foo.bar", res.key);
    }

    #[tokio::test]
    async fn test_context_manager_can_load_default_config() {
        let ctxman = ContextManagerBuilder::new().load_default().build().unwrap();
        let global = ctxman.new_global_context();
        global.set_one(None, "foo", Some(Variant::from("bar")), &[]).await.unwrap();

        let foo = global.get_one(None, "foo", &[]).await.unwrap();
        assert_eq!(foo, "bar".into());
    }

    #[tokio::test]
    async fn test_context_scopes_are_isolated() {
        let ctxman = ContextManagerBuilder::new().load_default().build().unwrap();
        let global = ctxman.new_global_context();
        let flow_ctx = ctxman.new_context(&global, "flow1".into());

        flow_ctx.set_one(None, "speed", Some(Variant::from(88)), &[]).await.unwrap();
        assert_eq!(flow_ctx.get_one(None, "speed", &[]).await.unwrap(), Variant::from(88));
        assert!(global.get_one(None, "speed", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_nested_context_paths() {
        let ctxman = ContextManagerBuilder::new().load_default().build().unwrap();
        let global = ctxman.new_global_context();
        global.set_one(None, "car.engine.rpm", Some(Variant::from(4500)), &[]).await.unwrap();
        assert_eq!(global.get_one(None, "car.engine.rpm", &[]).await.unwrap(), Variant::from(4500));

        // remove it again
        global.set_one(None, "car.engine.rpm", None, &[]).await.unwrap();
        assert!(global.get_one(None, "car.engine.rpm", &[]).await.is_none());
    }
}
