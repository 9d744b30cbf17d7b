use std::sync::Arc;

use serde::Deserialize;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
enum RangeAction {
    #[default]
    #[serde(rename = "scale")]
    Scale,

    #[serde(rename = "clamp")]
    Clamp,

    #[serde(rename = "roll")]
    Roll,
}

#[derive(Deserialize, Debug)]
struct RangeNodeConfig {
    #[serde(default)]
    action: RangeAction,

    #[serde(default, deserialize_with = "json::deser::deser_f64_or_string_nan")]
    minin: f64,

    #[serde(default = "one_default", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    maxin: f64,

    #[serde(default, deserialize_with = "json::deser::deser_f64_or_string_nan")]
    minout: f64,

    #[serde(default = "one_default", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    maxout: f64,

    #[serde(default)]
    round: bool,

    #[serde(default = "property_default")]
    property: String,
}

fn one_default() -> f64 {
    1.0
}

fn property_default() -> String {
    "payload".to_string()
}

/// Maps a numeric property from an input range onto an output range,
/// optionally clamping or wrapping the input first.
#[derive(Debug)]
#[flow_node("range")]
struct RangeNode {
    base: FlowNode,
    config: RangeNodeConfig,
}

impl RangeNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let range_config = RangeNodeConfig::deserialize(&config.rest)?;
        let node = RangeNode { base, config: range_config };
        Ok(Box::new(node))
    }

    async fn uow(&self, msg: MsgHandle, cancel: CancellationToken) -> crate::Result<()> {
        {
            let mut guard = msg.write().await;
            let value = guard
                .get_nav_stripped(&self.config.property)
                .and_then(|v| v.as_f64())
                .ok_or(WireflowError::InvalidOperation(format!(
                    "The property '{}' is not a number",
                    self.config.property
                )))?;
            let mapped = map_range(&self.config, value);
            guard.set_nav_stripped(&self.config.property, Variant::from(mapped), true)?;
        }
        self.fan_out_one(Envelope { port: 0, msg }, cancel).await
    }
}

fn map_range(c: &RangeNodeConfig, value: f64) -> f64 {
    let span_in = c.maxin - c.minin;
    let span_out = c.maxout - c.minout;
    if span_in == 0.0 {
        return c.minout;
    }

    let value = match c.action {
        RangeAction::Clamp => value.clamp(c.minin.min(c.maxin), c.minin.max(c.maxin)),
        RangeAction::Roll => {
            let pos = (value - c.minin) % span_in;
            c.minin + if pos < 0.0 { pos + span_in } else { pos }
        }
        RangeAction::Scale => value,
    };

    let mut mapped = ((value - c.minin) / span_in) * span_out + c.minout;
    if c.round {
        mapped = mapped.round();
    }
    mapped
}

#[async_trait]
impl FlowNodeBehavior for RangeNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                node.uow(msg, cancel.child_token()).await
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_node_config(action: &str) -> RangeNodeConfig {
        RangeNodeConfig::deserialize(&json!({
            "action": action,
            "minin": 0, "maxin": 10,
            "minout": 0, "maxout": 100
        }))
        .unwrap()
    }

    #[test]
    fn test_mapping_math() {
        let scale = make_node_config("scale");
        assert_eq!(map_range(&scale, 5.0), 50.0);
        assert_eq!(map_range(&scale, 15.0), 150.0);

        let clamp = make_node_config("clamp");
        assert_eq!(map_range(&clamp, 15.0), 100.0);
        assert_eq!(map_range(&clamp, -5.0), 0.0);

        let roll = make_node_config("roll");
        assert_eq!(map_range(&roll, 12.0), 20.0);
        assert_eq!(map_range(&roll, -2.0), 80.0);
    }
}
