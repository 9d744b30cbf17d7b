use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::{helpers, FlowNodeConfig};
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// Which error sources a catch node listens to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CatchScope {
    /// Every node in the same flow.
    #[default]
    All,
    /// Every node inside the catch node's group hierarchy.
    Group,
    /// The listed node ids only.
    Nodes(Vec<ElementId>),
}

impl CatchScope {
    pub(crate) fn parse(jv: Option<&JsonValue>) -> Self {
        match jv {
            Some(JsonValue::String(s)) if s == "group" => CatchScope::Group,
            Some(JsonValue::Array(ids)) => {
                let ids: Vec<ElementId> = ids.iter().filter_map(helpers::parse_id_value).collect();
                if ids.is_empty() {
                    CatchScope::All
                } else {
                    CatchScope::Nodes(ids)
                }
            }
            _ => CatchScope::All,
        }
    }
}

#[derive(Debug)]
#[flow_node("catch")]
pub(crate) struct CatchNode {
    base: FlowNode,
    pub scope: CatchScope,
    pub uncaught: bool,
}

impl CatchNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let scope = CatchScope::parse(config.rest.get("scope"));
        let uncaught = config.rest.get("uncaught").and_then(|x| x.as_bool()).unwrap_or(false);
        let node = CatchNode { base, scope, uncaught };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for CatchNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            let cancel = stop_token.child_token();
            with_uow(self.as_ref(), cancel.child_token(), |node, msg| async move {
                node.fan_out_one(Envelope { port: 0, msg }, cancel.child_token()).await
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_parsing() {
        assert_eq!(CatchScope::parse(None), CatchScope::All);
        assert_eq!(CatchScope::parse(Some(&json!(null))), CatchScope::All);
        assert_eq!(CatchScope::parse(Some(&json!("group"))), CatchScope::Group);
        assert_eq!(CatchScope::parse(Some(&json!([]))), CatchScope::All);
        let scoped = CatchScope::parse(Some(&json!(["000000000000000a"])));
        assert_eq!(scoped, CatchScope::Nodes(vec!["000000000000000a".parse().unwrap()]));
    }
}
