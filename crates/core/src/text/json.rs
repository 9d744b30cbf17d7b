use serde_json::Value;

pub static EMPTY_ARRAY: Vec<serde_json::Value> = Vec::new();

pub fn value_equals_str(jv: &Value, target: &str) -> bool {
    jv.as_str().map(|s| s == target).unwrap_or(false)
}

pub fn option_value_equals_str(jv: &Option<&Value>, target: &str) -> bool {
    match jv {
        Some(v) => value_equals_str(v, target),
        _ => false,
    }
}

/// The `type` property of a record, or an empty string.
pub fn type_of(jv: &Value) -> &str {
    jv.get("type").and_then(|x| x.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_equals_str() {
        assert!(value_equals_str(&json!("tab"), "tab"));
        assert!(!value_equals_str(&json!(1), "tab"));
        assert_eq!(type_of(&json!({"type": "inject"})), "inject");
        assert_eq!(type_of(&json!({})), "");
    }
}
