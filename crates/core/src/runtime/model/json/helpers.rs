use serde_json::Value as JsonValue;

use crate::runtime::model::{ElementId, TypeValue};

pub fn parse_id_str(id_str: &str) -> Option<ElementId> {
    id_str.parse().ok()
}

pub fn parse_id_value(id_value: &JsonValue) -> Option<ElementId> {
    id_value.as_str().and_then(|s| s.parse().ok())
}

/// Splits `subflow:abc` style type names.
pub fn parse_type_value(t: &str) -> TypeValue {
    match t.split_once(':') {
        Some((x, y)) => TypeValue { type_name: x, id: parse_id_str(y) },
        None => TypeValue { type_name: t, id: None },
    }
}
