use crate::runtime::model::*;
use serde;

/// A `type` property split at the first colon, e.g. `subflow:abc123`.
pub struct TypeValue<'a> {
    pub type_name: &'a str,
    pub id: Option<ElementId>,
}

/// The value-kind discriminator used by typed node properties (inject
/// props, change rules, switch operands, env entries).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, PartialOrd)]
pub enum PropertyType {
    #[serde(rename = "str")]
    #[default]
    Str,

    #[serde(rename = "num")]
    Num,

    #[serde(rename = "json")]
    Json,

    #[serde(rename = "re")]
    Re,

    #[serde(rename = "date")]
    Date,

    #[serde(rename = "bin")]
    Bin,

    #[serde(rename = "msg")]
    Msg,

    #[serde(rename = "flow")]
    Flow,

    #[serde(rename = "global")]
    Global,

    #[serde(rename = "bool")]
    Bool,

    #[serde(rename = "env")]
    Env,
}

impl PropertyType {
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            PropertyType::Str | PropertyType::Num | PropertyType::Json | PropertyType::Bin | PropertyType::Bool
        )
    }

    pub fn from_str_kind(ptype: &str) -> crate::Result<PropertyType> {
        match ptype {
            "str" => Ok(PropertyType::Str),
            "num" => Ok(PropertyType::Num),
            "json" => Ok(PropertyType::Json),
            "re" => Ok(PropertyType::Re),
            "date" => Ok(PropertyType::Date),
            "bin" => Ok(PropertyType::Bin),
            "msg" => Ok(PropertyType::Msg),
            "flow" => Ok(PropertyType::Flow),
            "global" => Ok(PropertyType::Global),
            "bool" => Ok(PropertyType::Bool),
            "env" => Ok(PropertyType::Env),
            _ => Err(crate::WireflowError::BadFlowsJson(format!("Unsupported property type: '{}'", ptype)).into()),
        }
    }
}
