use std::fmt::Display;

use crate::runtime::model::*;
use serde_json::Value as JsonValue;

pub mod deser;
pub mod helpers;

/// One output port of a node: the ids it wires to.
#[derive(serde::Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct PortConfig {
    pub node_ids: Vec<ElementId>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GroupConfig {
    #[serde(deserialize_with = "deser::deser_id")]
    pub id: ElementId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, deserialize_with = "deser::deser_id_vec")]
    pub nodes: Vec<ElementId>,

    #[serde(deserialize_with = "deser::deser_id")]
    pub z: ElementId,

    #[serde(default, deserialize_with = "deser::deser_optional_id")]
    pub g: Option<ElementId>,

    #[serde(flatten)]
    pub rest: JsonValue,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub disabled: bool,

    #[serde(deserialize_with = "deser::deser_id")]
    pub id: ElementId,

    #[serde(default)]
    pub info: String,

    #[serde(default)]
    pub label: String,

    #[serde(alias = "type")]
    pub type_name: String,

    #[serde(skip)]
    pub nodes: Vec<FlowNodeConfig>,

    #[serde(skip)]
    pub groups: Vec<GroupConfig>,

    #[serde(default, alias = "in")]
    pub in_ports: Vec<SubflowPort>,

    #[serde(default, alias = "out")]
    pub out_ports: Vec<SubflowPort>,

    #[serde(skip)]
    pub subflow_node_id: Option<ElementId>,

    #[serde(skip, default)]
    pub ordering: usize,

    #[serde(flatten)]
    pub rest: JsonValue,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FlowNodeConfig {
    #[serde(deserialize_with = "deser::deser_id")]
    pub id: ElementId,

    #[serde(alias = "type")]
    pub type_name: String,

    #[serde(default)]
    pub name: String,

    #[serde(deserialize_with = "deser::deser_id")]
    pub z: ElementId,

    #[serde(default, deserialize_with = "deser::deser_optional_id")]
    pub g: Option<ElementId>,

    #[serde(default)]
    pub active: Option<bool>,

    #[serde(default, alias = "d")]
    pub disabled: bool,

    #[serde(default, deserialize_with = "deser::deserialize_wires")]
    pub wires: Vec<PortConfig>,

    #[serde(skip, default)]
    pub ordering: usize,

    #[serde(flatten)]
    pub rest: JsonValue,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GlobalNodeConfig {
    #[serde(deserialize_with = "deser::deser_id")]
    pub id: ElementId,

    #[serde(alias = "type")]
    pub type_name: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub active: Option<bool>,

    #[serde(default, alias = "d")]
    pub disabled: bool,

    #[serde(skip, default)]
    pub ordering: usize,

    #[serde(flatten)]
    pub rest: JsonValue,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubflowPortWire {
    #[serde(deserialize_with = "deser::deser_id")]
    pub id: ElementId,

    #[serde(default)]
    pub port: usize,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubflowPort {
    #[serde(default)]
    pub wires: Vec<SubflowPortWire>,
}

/// The flows document after subflow expansion and dependency ordering.
#[derive(Debug, Clone)]
pub struct ResolvedFlows {
    pub flows: Vec<FlowConfig>,
    pub global_nodes: Vec<GlobalNodeConfig>,
}

impl Display for FlowNodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeJSON(id='{}', name='{}', type='{}')", self.id, self.name, self.type_name)
    }
}
