use std::sync::Arc;
use std::sync::Weak;

use super::env::*;
use super::flow::*;
use super::model::json::*;
use super::model::*;

/// Groups are purely visual: membership, bounding box and style belong to
/// the editor. The runtime keeps them only for env-chain lookups and
/// group-scoped catch/status filtering.
#[derive(Debug, Clone)]
pub struct Group {
    inner: Arc<InnerGroup>,
}

#[derive(Debug, Clone)]
pub struct WeakGroup {
    inner: Weak<InnerGroup>,
}

impl WeakGroup {
    pub fn upgrade(&self) -> Option<Group> {
        Weak::upgrade(&self.inner).map(|x| Group { inner: x })
    }
}

#[derive(Debug, Clone)]
pub enum GroupParent {
    Flow(WeakFlow),
    Group(WeakGroup),
}

#[derive(Debug)]
struct InnerGroup {
    id: ElementId,
    name: String,
    flow: WeakFlow,
    parent: GroupParent,
    envs: Envs,
}

impl Group {
    pub(crate) fn new_flow_group(config: &GroupConfig, flow: &Flow) -> crate::Result<Self> {
        let envs_builder = EnvStoreBuilder::default().with_parent(flow.get_envs());

        let inner = InnerGroup {
            id: config.id,
            name: config.name.clone(),
            flow: flow.downgrade(),
            parent: GroupParent::Flow(flow.downgrade()),
            envs: build_envs(envs_builder, config),
        };
        Ok(Group { inner: Arc::new(inner) })
    }

    pub(crate) fn new_subgroup(config: &GroupConfig, flow: &Flow, parent: &Group) -> crate::Result<Self> {
        let envs_builder = EnvStoreBuilder::default().with_parent(&parent.inner.envs);

        let inner = InnerGroup {
            id: config.id,
            name: config.name.clone(),
            flow: flow.downgrade(),
            parent: GroupParent::Group(parent.downgrade()),
            envs: build_envs(envs_builder, config),
        };
        Ok(Group { inner: Arc::new(inner) })
    }

    pub fn downgrade(&self) -> WeakGroup {
        WeakGroup { inner: Arc::downgrade(&self.inner) }
    }

    pub fn id(&self) -> ElementId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get_parent(&self) -> &GroupParent {
        &self.inner.parent
    }

    pub fn flow(&self) -> Option<Flow> {
        self.inner.flow.upgrade()
    }

    pub fn get_envs(&self) -> &Envs {
        &self.inner.envs
    }

    pub fn get_env(&self, key: &str) -> Option<Variant> {
        self.inner.envs.evaluate_env(key)
    }
}

fn build_envs(mut envs_builder: EnvStoreBuilder, config: &GroupConfig) -> Envs {
    if let Some(env_json) = config.rest.get("env") {
        envs_builder = envs_builder.load_json(env_json);
    }
    envs_builder
        .extends([
            ("WF_GROUP_ID".into(), Variant::String(config.id.to_string())),
            ("WF_GROUP_NAME".into(), Variant::String(config.name.clone())),
        ])
        .build()
}
