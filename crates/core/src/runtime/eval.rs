use base64::prelude::*;
use regex::Regex;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::runtime::flow::*;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use crate::utils;
use crate::*;

/// Resolves an environment-variable reference against the node, group,
/// flow and engine env chains.
fn evaluate_env_property(name: &str, node: Option<&dyn FlowNodeBehavior>, flow: Option<&Flow>) -> Option<Variant> {
    if let Some(node) = node {
        if let Some(var) = node.get_env(name) {
            return Some(var);
        }
    }

    if let Some(flow_ref) = flow {
        if let Some(node) = node {
            if let Some(ref group) = node.group() {
                return group.get_env(name);
            }
        }

        return flow_ref.get_env(name);
    }

    flow.and_then(|f| f.engine()).or(node.and_then(|n| n.engine())).and_then(|x| x.get_env(name))
}

/// Evaluates a typed node property (`v`/`vt` pairs in the flows JSON).
pub async fn evaluate_node_property(
    value: &str,
    type_: PropertyType,
    node: Option<&dyn FlowNodeBehavior>,
    flow: Option<&Flow>,
    msg: Option<&Msg>,
) -> crate::Result<Variant> {
    match type_ {
        PropertyType::Str => Ok(Variant::String(value.into())),

        PropertyType::Num | PropertyType::Json => {
            let jv: serde_json::Value = serde_json::from_str(value)?;
            Ok(Variant::deserialize(jv)?)
        }

        PropertyType::Re => Ok(Variant::Regexp(Regex::new(value)?)),

        PropertyType::Date => match value {
            "object" => Ok(Variant::now()),
            "iso" => Ok(Variant::String(utils::time::iso_now())),
            _ => Ok(Variant::Number(utils::time::unix_now().into())),
        },

        PropertyType::Bin => {
            // a JSON byte-array literal, or base64 text
            if let Ok(jv) = serde_json::from_str::<serde_json::Value>(value) {
                let arr = Variant::deserialize(&jv)?;
                let bytes = arr
                    .to_bytes()
                    .ok_or(WireflowError::BadArgument("value"))
                    .with_context(|| format!("Expected an array of bytes, got: {:?}", value))?;
                Ok(Variant::from(bytes))
            } else {
                let bytes = BASE64_STANDARD
                    .decode(value.trim())
                    .map_err(|e| WireflowError::InvalidOperation(format!("Bad binary literal: {}", e)))?;
                Ok(Variant::Bytes(bytes))
            }
        }

        PropertyType::Msg => {
            if let Some(msg) = msg {
                if let Some(pv) = msg.get_nav_stripped(value) {
                    Ok(pv.clone())
                } else {
                    Err(WireflowError::BadArgument("value"))
                        .with_context(|| format!("Cannot get the property(s) from `msg`: {}", value))
                }
            } else {
                Err(WireflowError::BadArgument("msg")).with_context(|| "`msg` is not available".to_string())
            }
        }

        PropertyType::Global => {
            let ctx_prop = crate::runtime::context::evaluate_key(value)?;
            let ctx = flow
                .and_then(|f| f.engine())
                .or(node.and_then(|n| n.engine()))
                .map(|e| e.context().clone())
                .ok_or(WireflowError::BadArgument("flow,node"))?;

            let msg_env = msg.map(|m| SmallVec::<[PropexEnv; 1]>::from_buf([PropexEnv::ExtRef("msg", m.as_variant())])).unwrap_or_default();
            if let Some(ctx_value) = ctx.get_one(ctx_prop.store, ctx_prop.key, &msg_env).await {
                Ok(ctx_value)
            } else {
                Err(WireflowError::BadArgument("value"))
                    .with_context(|| format!("Cannot find the global context variable `{}`", value))
            }
        }

        PropertyType::Flow => {
            let ctx_prop = crate::runtime::context::evaluate_key(value)?;
            let ctx = flow
                .cloned()
                .or(node.and_then(|n| n.flow()))
                .map(|f| f.context().clone())
                .ok_or(WireflowError::BadArgument("flow,node"))?;

            let msg_env = msg.map(|m| SmallVec::<[PropexEnv; 1]>::from_buf([PropexEnv::ExtRef("msg", m.as_variant())])).unwrap_or_default();
            if let Some(ctx_value) = ctx.get_one(ctx_prop.store, ctx_prop.key, &msg_env).await {
                Ok(ctx_value)
            } else {
                Err(WireflowError::BadArgument("value"))
                    .with_context(|| format!("Cannot find the flow context variable `{}`", value))
            }
        }

        PropertyType::Bool => Ok(Variant::Bool(value.trim().parse::<bool>()?)),

        PropertyType::Env => match evaluate_env_property(value, node, flow) {
            Some(ev) => Ok(ev),
            _ => Err(WireflowError::BadArgument("value"))
                .with_context(|| format!("Cannot find the environment variable `{}`", value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_constant_types() {
        assert_eq!(
            evaluate_node_property("hello", PropertyType::Str, None, None, None).await.unwrap(),
            Variant::from("hello")
        );
        assert_eq!(
            evaluate_node_property("42", PropertyType::Num, None, None, None).await.unwrap(),
            Variant::from(42)
        );
        assert_eq!(
            evaluate_node_property("true", PropertyType::Bool, None, None, None).await.unwrap(),
            Variant::Bool(true)
        );
        let json = evaluate_node_property(r#"{"a": [1, 2]}"#, PropertyType::Json, None, None, None).await.unwrap();
        assert_eq!(json.get_nav("a[1]", &[]).unwrap(), &Variant::from(2));
    }

    #[tokio::test]
    async fn test_bin_accepts_byte_array_and_base64() {
        let from_array = evaluate_node_property("[1, 2, 3]", PropertyType::Bin, None, None, None).await.unwrap();
        assert_eq!(from_array, Variant::Bytes(vec![1, 2, 3]));

        let from_b64 = evaluate_node_property("aGVsbG8=", PropertyType::Bin, None, None, None).await.unwrap();
        assert_eq!(from_b64, Variant::Bytes(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_date_is_epoch_millis() {
        let before = utils::time::unix_now();
        let v = evaluate_node_property("", PropertyType::Date, None, None, None).await.unwrap();
        let after = utils::time::unix_now();
        let ts = v.as_i64().unwrap();
        assert!(ts >= before && ts <= after);
    }

    #[tokio::test]
    async fn test_msg_property() {
        use serde::Deserialize;
        let msg = Msg::deserialize(serde_json::json!({"payload": {"deep": 7}})).unwrap();
        let v = evaluate_node_property("msg.payload.deep", PropertyType::Msg, None, None, Some(&msg)).await.unwrap();
        assert_eq!(v, Variant::from(7));
        assert!(evaluate_node_property("missing.prop", PropertyType::Msg, None, None, Some(&msg)).await.is_err());
    }
}
