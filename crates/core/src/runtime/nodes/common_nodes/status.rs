use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::{helpers, FlowNodeConfig};
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusScope {
    #[default]
    All,
    Group,
    Nodes(Vec<ElementId>),
}

impl StatusScope {
    pub(crate) fn parse(jv: Option<&JsonValue>) -> Self {
        match jv {
            Some(JsonValue::String(s)) if s == "group" => StatusScope::Group,
            Some(JsonValue::Array(ids)) => {
                let ids: Vec<ElementId> = ids.iter().filter_map(helpers::parse_id_value).collect();
                if ids.is_empty() {
                    StatusScope::All
                } else {
                    StatusScope::Nodes(ids)
                }
            }
            _ => StatusScope::All,
        }
    }
}

/// Passive receiver of status updates published by same-flow nodes.
#[derive(Debug)]
#[flow_node("status")]
pub(crate) struct StatusNode {
    base: FlowNode,
    pub scope: StatusScope,
}

impl StatusNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let scope = StatusScope::parse(config.rest.get("scope"));
        let node = StatusNode { base, scope };
        Ok(Box::new(node))
    }
}

#[async_trait]
impl FlowNodeBehavior for StatusNode {
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
