use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, Weak},
};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use crate::utils::topo::TopologicalSorter;

use crate::runtime::model::{PropertyType, Variant};
use crate::*;

/// A layered environment-variable store. Lookups that miss locally walk
/// the parent chain (node → group → flow/subflow instance → engine).
#[derive(Debug, Clone)]
pub struct Envs {
    inner: Arc<EnvStore>,
}

#[derive(Debug, Clone)]
pub struct WeakEnvs {
    inner: Weak<EnvStore>,
}

impl WeakEnvs {
    pub fn upgrade(&self) -> Option<Envs> {
        Weak::upgrade(&self.inner).map(|x| Envs { inner: x })
    }
}

#[derive(Debug)]
struct EnvStore {
    parent: RwLock<Option<WeakEnvs>>,
    envs: DashMap<String, Variant>,
}

impl Envs {
    pub fn downgrade(&self) -> WeakEnvs {
        WeakEnvs { inner: Arc::downgrade(&self.inner) }
    }

    /// Evaluates `NAME`, `${NAME}` or a `FOO${NAME}BAR` template.
    pub fn evaluate_env(&self, env_expr: &str) -> Option<Variant> {
        self.get_normalized(env_expr)
    }

    fn get_raw_env(&self, key: &str) -> Option<Variant> {
        if let Some(value) = self.inner.envs.get(key) {
            Some(value.clone())
        } else {
            let parent = self.inner.parent.read().ok()?;
            parent.as_ref().and_then(|p| p.upgrade()).and_then(|p| p.get_raw_env(key))
        }
    }

    fn get_normalized(&self, env_expr: &str) -> Option<Variant> {
        let trimmed = env_expr.trim();
        if trimmed.starts_with("${") && trimmed.ends_with('}') {
            // ${ENV_VAR}
            let to_match = &trimmed[2..(trimmed.len() - 1)];
            self.get_raw_env(to_match.trim())
        } else if !trimmed.contains("${") {
            // ENV_VAR
            self.get_raw_env(trimmed)
        } else {
            // FOO${ENV_VAR}BAR
            Some(Variant::String(replace_vars(trimmed, |env_name| match self.get_raw_env(env_name) {
                Some(v) => v.to_string().unwrap_or_default(),
                _ => "".to_string(),
            })))
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct EnvEntry {
    pub name: String,

    #[serde(default)]
    pub value: String,

    #[serde(alias = "type", default)]
    pub type_: PropertyType,
}

#[derive(Debug, Default, Clone)]
pub struct EnvStoreBuilder {
    parent: Option<WeakEnvs>,
    envs: HashMap<String, Variant>,
}

impl EnvStoreBuilder {
    pub fn with_parent(mut self, parent: &Envs) -> Self {
        self.parent = Some(parent.downgrade());
        self
    }

    /// Loads an `env` JSON block. Entries may reference each other with
    /// the `env` type; the load order follows those references.
    pub fn load_json(mut self, jv: &JsonValue) -> Self {
        if let Ok(entries) = Vec::<EnvEntry>::deserialize(jv) {
            // keep only the last entry per name
            let entries: Vec<EnvEntry> = {
                let mut seen = HashSet::new();
                let mut rev: Vec<EnvEntry> = entries.into_iter().rev().filter(|e| seen.insert(e.name.clone())).collect();
                rev.reverse();
                rev
            };

            let mut topo = TopologicalSorter::new();
            for entry in entries.iter() {
                topo.add_vertex(entry.name.as_str());
                if entry.type_ == PropertyType::Env {
                    topo.add_dep(entry.name.as_str(), entry.value.as_str());
                }
            }
            let sorted_keys = topo.dependency_sort();

            for key in sorted_keys.iter() {
                if let Some(e) = entries.iter().find(|x| &x.name == key) {
                    if let Ok(var) = self.evaluate(&e.value, e.type_) {
                        self.envs.insert(e.name.clone(), var);
                    } else {
                        log::warn!("Failed to evaluate environment variable property: {:?}", e);
                    }
                }
            }
        } else {
            log::warn!("Failed to parse environment variables: \n{}", jv);
        }
        self
    }

    pub fn with_process_env(mut self) -> Self {
        for (k, v) in std::env::vars() {
            self.envs.insert(k, Variant::String(v));
        }
        self
    }

    pub fn extends(mut self, other_iter: impl IntoIterator<Item = (String, Variant)>) -> Self {
        for (k, v) in other_iter {
            self.envs.entry(k).or_insert(v);
        }
        self
    }

    pub fn update_with(mut self, other: &Envs) -> Self {
        for guard in other.inner.envs.iter() {
            self.envs.insert(guard.key().clone(), guard.value().clone());
        }
        self
    }

    pub fn build(self) -> Envs {
        let mut inner = EnvStore { parent: RwLock::new(self.parent), envs: DashMap::with_capacity(self.envs.len()) };
        inner.envs.extend(self.envs);

        Envs { inner: Arc::new(inner) }
    }

    fn evaluate(&self, value: &str, type_: PropertyType) -> crate::Result<Variant> {
        match type_ {
            PropertyType::Str => Ok(Variant::String(value.into())),

            PropertyType::Num | PropertyType::Json => {
                let jv: serde_json::Value = serde_json::from_str(value)?;
                Ok(Variant::deserialize(jv)?)
            }

            PropertyType::Bool => Ok(Variant::Bool(value.trim().parse::<bool>()?)),

            PropertyType::Bin => {
                let jv: serde_json::Value = serde_json::from_str(value)?;
                let arr = Variant::deserialize(&jv)?;
                let bytes = arr
                    .to_bytes()
                    .ok_or(WireflowError::BadArgument("value"))
                    .with_context(|| format!("Expected an array of bytes, got: {:?}", value))?;
                Ok(Variant::Bytes(bytes))
            }

            PropertyType::Env => match self.normalized_and_get_existed(value) {
                Some(ev) => Ok(ev),
                _ => Err(WireflowError::BadArgument("value"))
                    .with_context(|| format!("Cannot find the environment variable: '{}'", value)),
            },

            _ => Err(WireflowError::BadArgument("type_"))
                .with_context(|| format!("Unsupported environment variable type: '{}'", value)),
        }
    }

    fn get_existed(&self, env: &str) -> Option<Variant> {
        if let Some(value) = self.envs.get(env) {
            Some(value.clone())
        } else {
            self.parent.as_ref().and_then(|p| p.upgrade()).and_then(|p| p.evaluate_env(env))
        }
    }

    fn normalized_and_get_existed(&self, value: &str) -> Option<Variant> {
        let trimmed = value.trim();
        if trimmed.starts_with("${") && trimmed.ends_with('}') {
            let to_match = &trimmed[2..(trimmed.len() - 1)];
            self.get_existed(to_match.trim())
        } else if !trimmed.contains("${") {
            self.get_existed(trimmed)
        } else {
            Some(Variant::String(replace_vars(trimmed, |env_name| match self.get_existed(env_name) {
                Some(v) => v.to_string().unwrap_or_default(),
                _ => "".to_string(),
            })))
        }
    }
}

pub fn replace_vars<'a, F, R>(input: &'a str, converter: F) -> String
where
    F: Fn(&'a str) -> R,
    R: AsRef<str>,
{
    fn variable_name(input: &str) -> nom::IResult<&str, &str> {
        nom::sequence::delimited(
            nom::bytes::complete::tag("${"),
            nom::sequence::preceded(
                nom::character::complete::space0,
                nom::bytes::complete::take_while(|c: char| c.is_alphanumeric() || c == '_'),
            ),
            nom::sequence::preceded(nom::character::complete::space0, nom::bytes::complete::tag("}")),
        )(input)
    }

    let mut output = input.to_string();
    let mut remaining_input = input;

    while !remaining_input.is_empty() {
        if let Ok((remaining, var)) = variable_name(remaining_input) {
            let replacement = converter(var);
            output = output.replace(&format!("${{{}}}", var.trim()), replacement.as_ref());
            remaining_input = remaining;
        } else {
            let mut chars = remaining_input.chars();
            chars.next();
            remaining_input = chars.as_str();
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::EnvStoreBuilder;

    #[test]
    fn test_env_store_layering() {
        let json = json!([
            { "name": "FOO", "value": "foofoo", "type": "str" },
            { "name": "AGE", "value": "41", "type": "num" },
        ]);
        let global = EnvStoreBuilder::default()
            .load_json(&json)
            .extends([("FILE_SIZE".into(), crate::runtime::model::Variant::from(123))])
            .build();
        assert_eq!(global.evaluate_env("FOO").unwrap().as_str().unwrap(), "foofoo");
        assert_eq!(global.evaluate_env("AGE").unwrap().as_i64().unwrap(), 41);

        let json = json!([
            { "name": "BAR", "value": "barbar", "type": "str" },
        ]);
        let flow = EnvStoreBuilder::default().with_parent(&global).load_json(&json).build();

        let json = json!([
            { "name": "MY_FOO", "value": "aaa", "type": "str" },
            { "name": "GLOBAL_FOO", "value": "FOO", "type": "env" },
            { "name": "PARENT_BAR", "value": "BAR", "type": "env" },
            { "name": "AGE", "value": "100", "type": "str" }
        ]);
        let node = EnvStoreBuilder::default().with_parent(&flow).load_json(&json).build();
        assert_eq!(node.evaluate_env("MY_FOO").unwrap().as_str().unwrap(), "aaa");
        assert_eq!(node.evaluate_env("${MY_FOO}").unwrap().as_str().unwrap(), "aaa");
        assert_eq!(node.evaluate_env("GLOBAL_FOO").unwrap().as_str().unwrap(), "foofoo");
        assert_eq!(node.evaluate_env("PARENT_BAR").unwrap().as_str().unwrap(), "barbar");
        assert_eq!(node.evaluate_env("AGE").unwrap().as_str().unwrap(), "100");
        assert_eq!(node.evaluate_env("FILE_SIZE").unwrap().as_i64().unwrap(), 123);
    }

    #[test]
    fn test_template_substitution() {
        let json = json!([
            { "name": "HOST", "value": "example.org", "type": "str" },
        ]);
        let envs = EnvStoreBuilder::default().load_json(&json).build();
        let evaluated = envs.evaluate_env("http://${HOST}/api").unwrap();
        assert_eq!(evaluated.as_str().unwrap(), "http://example.org/api");
    }
}
