use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use serde::de;
use serde::ser::SerializeMap;
use tokio::sync::RwLock;

use crate::runtime::model::*;

pub mod wellknown {
    pub const MSG_ID_PROPERTY: &str = "_msgid";
    pub const LINK_SOURCE_PROPERTY: &str = "_linkSource";
    pub const PAYLOAD_PROPERTY: &str = "payload";
    pub const TOPIC_PROPERTY: &str = "topic";
    pub const PARTS_PROPERTY: &str = "parts";
}

/// A message addressed to one output port.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub port: usize,
    pub msg: MsgHandle,
}

pub type MsgBody = BTreeMap<String, Variant>;

/// An opaque handle owned by an external collaborator (the request/response
/// pair of an HTTP binding, for instance). Never deep-cloned; every clone
/// point copies the pointer only.
pub type ExternalRef = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MsgHandle {
    inner: Arc<RwLock<Msg>>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct LinkCallStackEntry {
    pub id: ElementId,
    pub link_call_node_id: ElementId,
}

#[derive(Clone)]
pub struct Msg {
    body: Variant,
    pub link_call_stack: Option<Vec<LinkCallStackEntry>>,

    /// Reference-only collaborator handles. `Clone` copies the `Arc`, so
    /// the original and every clone share the same referent.
    pub req: Option<ExternalRef>,
    pub res: Option<ExternalRef>,
}

impl Default for Msg {
    fn default() -> Self {
        Msg { body: Variant::empty_object(), link_call_stack: None, req: None, res: None }
    }
}

impl Msg {
    pub fn with_body(body: MsgBody) -> Self {
        Msg { body: Variant::Object(body), link_call_stack: None, req: None, res: None }
    }

    pub fn with_payload(payload: Variant) -> Self {
        let body = MsgBody::from([
            (wellknown::MSG_ID_PROPERTY.to_string(), Msg::generate_id_variant()),
            (wellknown::PAYLOAD_PROPERTY.to_string(), payload),
        ]);
        Self::with_body(body)
    }

    pub fn id(&self) -> Option<ElementId> {
        self.get(wellknown::MSG_ID_PROPERTY).and_then(|x| x.as_str()).and_then(|s| s.parse().ok())
    }

    pub fn set_id(&mut self, id: ElementId) {
        self.set(wellknown::MSG_ID_PROPERTY.to_string(), Variant::String(id.to_string()));
    }

    pub fn generate_id() -> ElementId {
        ElementId::new()
    }

    pub fn generate_id_variant() -> Variant {
        Variant::String(Msg::generate_id().to_string())
    }

    pub fn as_variant(&self) -> &Variant {
        &self.body
    }

    pub fn as_variant_mut(&mut self) -> &mut Variant {
        &mut self.body
    }

    pub fn as_variant_object(&self) -> &VariantObjectMap {
        self.body.as_object().expect("msg body must be an object")
    }

    pub fn as_variant_object_mut(&mut self) -> &mut VariantObjectMap {
        self.body.as_object_mut().expect("msg body must be an object")
    }

    pub fn contains(&self, prop: &str) -> bool {
        self.as_variant_object().contains_property(prop)
    }

    pub fn get(&self, prop: &str) -> Option<&Variant> {
        self.as_variant_object().get_property(prop)
    }

    pub fn get_mut(&mut self, prop: &str) -> Option<&mut Variant> {
        self.as_variant_object_mut().get_property_mut(prop)
    }

    /// Get the value of a navigation property.
    ///
    /// The first segment must be a string key, so `payload.x`,
    /// `['payload']` or `lookup[msg.topic]` — never `msg[12]`.
    pub fn get_nav(&self, expr: &str) -> Option<&Variant> {
        self.as_variant_object().get_nav_property(expr, &[PropexEnv::ThisRef("msg")])
    }

    pub fn get_nav_mut(&mut self, expr: &str) -> Option<&mut Variant> {
        self.as_variant_object_mut().get_nav_property_mut(expr, &[PropexEnv::ThisRef("msg")])
    }

    pub fn get_nav_stripped(&self, expr: &str) -> Option<&Variant> {
        let trimmed_expr = expr.trim();
        if let Some(stripped_expr) = trimmed_expr.strip_prefix("msg.") {
            self.get_nav(stripped_expr)
        } else {
            self.get_nav(trimmed_expr)
        }
    }

    pub fn get_nav_stripped_mut(&mut self, expr: &str) -> Option<&mut Variant> {
        let trimmed_expr = expr.trim();
        if let Some(stripped_expr) = trimmed_expr.strip_prefix("msg.") {
            self.get_nav_mut(stripped_expr)
        } else {
            self.get_nav_mut(trimmed_expr)
        }
    }

    pub fn set(&mut self, prop: String, value: Variant) {
        self.as_variant_object_mut().set_property(prop, value)
    }

    pub fn set_nav(&mut self, expr: &str, value: Variant, create_missing: bool) -> crate::Result<()> {
        self.as_variant_object_mut().set_nav_property(expr, value, &[PropexEnv::ThisRef("msg")], create_missing)
    }

    pub fn set_nav_stripped(&mut self, expr: &str, value: Variant, create_missing: bool) -> crate::Result<()> {
        let trimmed_expr = expr.trim();
        if let Some(stripped_expr) = trimmed_expr.strip_prefix("msg.") {
            self.set_nav(stripped_expr, value, create_missing)
        } else {
            self.set_nav(trimmed_expr, value, create_missing)
        }
    }

    pub fn remove(&mut self, prop: &str) -> Option<Variant> {
        self.as_variant_object_mut().remove_property(prop)
    }

    pub fn remove_nav(&mut self, prop: &str) -> Option<Variant> {
        self.as_variant_object_mut().remove_nav_property(prop, &[PropexEnv::ThisRef("msg")])
    }

    pub fn remove_nav_stripped(&mut self, expr: &str) -> Option<Variant> {
        let trimmed_expr = expr.trim();
        if let Some(stripped_expr) = trimmed_expr.strip_prefix("msg.") {
            self.remove_nav(stripped_expr)
        } else {
            self.remove_nav(trimmed_expr)
        }
    }
}

impl Msg {
    pub fn push_link_source(&mut self, lse: LinkCallStackEntry) {
        if let Some(link_source) = &mut self.link_call_stack {
            link_source.push(lse);
        } else {
            self.link_call_stack = Some(vec![lse]);
        }
    }

    pub fn pop_link_source(&mut self) -> Option<LinkCallStackEntry> {
        if let Some(link_source) = &mut self.link_call_stack {
            let p = link_source.pop();
            if link_source.is_empty() {
                self.link_call_stack = None
            }
            p
        } else {
            None
        }
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("body", &self.body)
            .field("link_call_stack", &self.link_call_stack)
            .field("req", &self.req.as_ref().map(|_| "<external>"))
            .field("res", &self.res.as_ref().map(|_| "<external>"))
            .finish()
    }
}

impl Index<&str> for Msg {
    type Output = Variant;

    fn index(&self, key: &str) -> &Self::Output {
        &self.as_variant_object()[key]
    }
}

impl IndexMut<&str> for Msg {
    fn index_mut(&mut self, key: &str) -> &mut Self::Output {
        self.as_variant_object_mut().entry(key.to_string()).or_default()
    }
}

impl serde::Serialize for Msg {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // `req`/`res` never cross a serialization boundary.
        let mut map = serializer.serialize_map(None)?;
        if self.link_call_stack.is_some() {
            map.serialize_entry(wellknown::LINK_SOURCE_PROPERTY, &self.link_call_stack)?;
        }
        for (k, v) in self.as_variant_object().iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for Msg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MsgVisitor;

        impl<'de> serde::de::Visitor<'de> for MsgVisitor {
            type Value = Msg;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct Msg")
            }

            fn visit_map<V>(self, mut map: V) -> Result<Msg, V::Error>
            where
                V: serde::de::MapAccess<'de>,
            {
                let mut link_call_stack = None;
                let mut body: MsgBody = MsgBody::new();

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        wellknown::LINK_SOURCE_PROPERTY => {
                            if link_call_stack.is_some() {
                                return Err(de::Error::duplicate_field(wellknown::LINK_SOURCE_PROPERTY));
                            }
                            link_call_stack = Some(map.next_value()?);
                        }
                        _ => {
                            let value = map.next_value()?;
                            body.insert(key, value);
                        }
                    }
                }

                Ok(Msg { body: Variant::Object(body), link_call_stack, req: None, res: None })
            }
        }

        deserializer.deserialize_map(MsgVisitor)
    }
}

impl Default for MsgHandle {
    fn default() -> Self {
        MsgHandle::new(Msg::with_payload(Variant::Null))
    }
}

impl MsgHandle {
    pub fn new(inner: Msg) -> Self {
        MsgHandle { inner: Arc::new(RwLock::new(inner)) }
    }

    pub fn with_body(body: MsgBody) -> Self {
        MsgHandle::new(Msg::with_body(body))
    }

    pub fn with_payload(payload: Variant) -> Self {
        MsgHandle::new(Msg::with_payload(payload))
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<Msg> {
        self.inner.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<Msg> {
        self.inner.write().await
    }

    pub fn try_write(&self) -> Option<tokio::sync::RwLockWriteGuard<Msg>> {
        self.inner.try_write().ok()
    }

    /// Forks the message. The body is copied by value; `req`/`res` keep
    /// their referent. With `new_id` the fork gets a fresh `_msgid`.
    pub async fn deep_clone(&self, new_id: bool) -> Self {
        let mut inner = self.inner.read().await.clone();
        if new_id {
            inner.set_id(Msg::generate_id());
        }
        MsgHandle::new(inner)
    }

    pub async fn unwrap_msg(self) -> Msg {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner(),
            Err(arc) => arc.read().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_get_nested_nav_property() {
        let jv = json!({"payload": "newValue", "lookup": {"a": 1, "b": 2}, "topic": "b"});
        let msg = Msg::deserialize(jv).unwrap();
        assert!(msg.contains("lookup"));
        assert!(msg.contains("topic"));
        assert_eq!(*msg.get_nav("lookup[msg.topic]").unwrap(), Variant::from(2));
    }

    #[test]
    fn test_get_nested_nav_property_mut() {
        let jv = json!({"payload": "newValue", "lookup": {"a": 1, "b": 2}, "topic": "b"});
        let mut msg = Msg::deserialize(jv).unwrap();
        let b = msg.get_nav_mut("lookup[msg.topic]").unwrap();
        *b = Variant::from(1701);
        assert_eq!(*msg.get_nav("lookup.b").unwrap(), Variant::from(1701));
    }

    #[test]
    fn test_set_deep_msg_property() {
        let jv = json!( {"foo": {"bar": "foo"}, "name": "hello"});
        let mut msg = Msg::deserialize(jv).unwrap();
        {
            let old_foo = msg.get("foo").unwrap();
            assert!(old_foo.is_object());
            assert_eq!(old_foo.as_object().unwrap()["bar"].as_str().unwrap(), "foo");
        }
        msg.set("name".into(), "world".into());
        assert_eq!(msg.get("name").unwrap().as_str().unwrap(), "world");

        msg.set_nav("foo.bar", "changed2".into(), false).unwrap();
        assert_eq!(msg.get_nav("foo.bar").unwrap().as_str().unwrap(), "changed2");

        assert!(msg.set_nav("foo2.new_field", "x".into(), false).is_err());
        assert!(msg.set_nav("foo.new_new_field", "new_new_value".into(), true).is_ok());
        assert_eq!(msg.get_nav("foo.new_new_field").unwrap().as_str().unwrap(), "new_new_value");
    }

    #[test]
    fn test_invalid_expr_leaves_msg_unchanged() {
        let mut msg = Msg::deserialize(json!({"payload": 1})).unwrap();
        let before = msg.as_variant().clone();
        assert!(msg.set_nav("payload[", Variant::from(2), true).is_err());
        assert_eq!(msg.as_variant(), &before);
    }

    #[tokio::test]
    async fn test_deep_clone_generates_fresh_id_and_detached_body() {
        let mut msg = Msg::with_payload(Variant::from(vec![Variant::from(1), Variant::from(2)]));
        msg.set_id(ElementId::new());
        let orig = MsgHandle::new(msg);

        let cloned = orig.deep_clone(true).await;
        {
            let mut cloned_guard = cloned.write().await;
            cloned_guard.get_nav_mut("payload[0]").map(|v| *v = Variant::from(99)).unwrap();
        }

        let orig_guard = orig.read().await;
        let cloned_guard = cloned.read().await;
        assert_eq!(orig_guard.get_nav("payload[0]").unwrap(), &Variant::from(1));
        assert_eq!(cloned_guard.get_nav("payload[0]").unwrap(), &Variant::from(99));
        assert_ne!(orig_guard.id(), cloned_guard.id());
    }

    #[tokio::test]
    async fn test_clone_preserves_external_refs_by_identity() {
        let mut msg = Msg::with_payload(Variant::from("x"));
        let req: ExternalRef = Arc::new("the-request".to_string());
        msg.req = Some(req.clone());
        let handle = MsgHandle::new(msg);

        let cloned = handle.deep_clone(true).await;
        let cloned_guard = cloned.read().await;
        let orig_guard = handle.read().await;

        let cloned_req = cloned_guard.req.as_ref().unwrap();
        let orig_req = orig_guard.req.as_ref().unwrap();
        assert!(Arc::ptr_eq(cloned_req, orig_req));
        assert!(cloned_guard.res.is_none());
    }

    #[test]
    fn test_serialize_skips_external_refs() {
        let mut msg = Msg::with_payload(Variant::from(5));
        msg.req = Some(Arc::new(1234_u32));
        let jv = serde_json::to_value(&msg).unwrap();
        assert!(jv.get("req").is_none());
        assert_eq!(jv.get("payload").cloned(), Some(json!(5)));
    }
}
