use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::runtime::eval;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

#[derive(Debug, Clone, Deserialize)]
struct PropertyTriple {
    p: String,

    #[serde(default)]
    vt: PropertyType,

    #[serde(default)]
    v: String,
}

#[derive(Deserialize, Debug)]
struct InjectNodeConfig {
    #[serde(default)]
    props: Vec<PropertyTriple>,

    #[serde(default, deserialize_with = "json::deser::str_to_option_f64")]
    repeat: Option<f64>,

    #[serde(default)]
    crontab: String,

    #[serde(default)]
    once: bool,

    #[serde(rename = "onceDelay", default)]
    once_delay: Option<f64>,
}

/// The message source: emits once after a delay, periodically, or on a
/// cron schedule. The emitted properties come from the `props` triples.
#[derive(Debug)]
#[flow_node("inject")]
struct InjectNode {
    base: FlowNode,
    config: InjectNodeConfig,
}

impl InjectNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let json = handle_legacy_json(&config.rest);
        let mut inject_node_config = InjectNodeConfig::deserialize(&json)?;

        // a 5-field cron expression gets a seconds column
        if !inject_node_config.crontab.is_empty() && inject_node_config.crontab.split_whitespace().count() != 6 {
            inject_node_config.crontab = format!("0 {}", inject_node_config.crontab);
        }

        let node = InjectNode { base, config: inject_node_config };
        Ok(Box::new(node))
    }

    async fn once_task(&self, stop_token: CancellationToken) -> crate::Result<()> {
        if let Some(once_delay_value) = self.config.once_delay {
            crate::utils::async_util::delay(Duration::from_secs_f64(once_delay_value), stop_token.clone()).await?;
        }

        self.inject_msg_now(stop_token).await?;
        Ok(())
    }

    async fn cron_task(self: Arc<Self>, stop_token: CancellationToken) -> crate::Result<()> {
        let mut sched = JobScheduler::new().await.map_err(|e| {
            WireflowError::InvalidOperation(format!("Failed to create the cron scheduler: {}", e))
        })?;

        if self.config.crontab.is_empty() {
            return Err(WireflowError::BadFlowsJson("Cron expression is missing".to_string()).into());
        }

        log::debug!("cron_expr='{}'", &self.config.crontab);

        let cron_job_stop_token = stop_token.clone();
        let self1 = Arc::clone(&self);

        let cron_job = Job::new_async(self.config.crontab.as_ref(), move |_, _| {
            let self2 = Arc::clone(&self1);
            let job_stop_token = cron_job_stop_token.clone();
            Box::pin(async move {
                if let Err(e) = self2.inject_msg_now(job_stop_token).await {
                    log::error!("Failed to inject: {}", e);
                }
            })
        })
        .map_err(|e| {
            log::error!("Failed to parse cron '{}' [node.name='{}']: {}", self.config.crontab, self.name(), e);
            WireflowError::BadFlowsJson(format!("Bad cron expression: '{}'", self.config.crontab))
        })?;

        sched
            .add(cron_job)
            .await
            .map_err(|e| WireflowError::InvalidOperation(format!("Failed to add the cron job: {}", e)))?;
        sched
            .start()
            .await
            .map_err(|e| WireflowError::InvalidOperation(format!("Failed to start the cron scheduler: {}", e)))?;

        stop_token.cancelled().await;

        if let Err(e) = sched.shutdown().await {
            log::warn!("Failed to shutdown the cron scheduler: {}", e);
        }

        log::debug!("The cron task has been stopped.");
        Ok(())
    }

    async fn repeat_task(&self, repeat_interval: f64, stop_token: CancellationToken) -> crate::Result<()> {
        while !stop_token.is_cancelled() {
            crate::utils::async_util::delay(Duration::from_secs_f64(repeat_interval), stop_token.clone()).await?;
            self.inject_msg_now(stop_token.clone()).await?;
        }
        log::debug!("The `repeat` task has been stopped.");
        Ok(())
    }

    async fn inject_msg_now(&self, stop_token: CancellationToken) -> crate::Result<()> {
        let mut msg_body: BTreeMap<String, Variant> = BTreeMap::new();
        for prop in self.config.props.iter() {
            let v =
                eval::evaluate_node_property(&prop.v, prop.vt, Some(self), self.flow().as_ref(), None).await?;
            msg_body.insert(prop.p.clone(), v);
        }
        msg_body.insert(wellknown::MSG_ID_PROPERTY.to_string(), Msg::generate_id_variant());

        let envelope = Envelope { port: 0, msg: MsgHandle::with_body(msg_body) };

        self.fan_out_one(envelope.clone(), stop_token.clone()).await?;
        self.notify_uow_completed(envelope.msg, stop_token).await;
        Ok(())
    }
}

#[async_trait]
impl FlowNodeBehavior for InjectNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        let mut is_executed = false;
        if self.config.once {
            is_executed = true;
            if let Err(e) = self.once_task(stop_token.child_token()).await {
                log::warn!("The 'once_task' failed: {}", e);
            }
        }

        if let Some(repeat_interval) = self.config.repeat.filter(|x| *x > 0.0) {
            is_executed = true;
            if let Err(e) = self.repeat_task(repeat_interval, stop_token.child_token()).await {
                log::warn!("The 'repeat_task' failed: {}", e);
            }
        } else if !self.config.crontab.is_empty() {
            is_executed = true;
            if let Err(e) = self.clone().cron_task(stop_token.child_token()).await {
                log::warn!("The cron task failed: {}", e);
            }
        }

        if !is_executed {
            log::debug!("The InjectNode(id='{}', name='{}') has no trigger.", self.id(), self.name());
        }
        stop_token.cancelled().await;
    }
}

/// Folds the legacy `payload`/`payloadType`/`topic` properties into the
/// `props` triples the current format uses.
fn handle_legacy_json(orig: &Value) -> Value {
    let mut n = orig.clone();
    if let Value::Object(ref mut map) = n {
        if let Some(Value::Array(ref mut props_array)) = map.get_mut("props") {
            for prop in props_array {
                if let Value::Object(ref mut prop_map) = prop {
                    match prop_map.get("p") {
                        Some(p) if p == "payload" && !prop_map.contains_key("v") => {
                            prop_map.insert(
                                "v".to_string(),
                                orig.get("payload").cloned().unwrap_or_else(|| Value::String("".into())),
                            );
                            prop_map.insert(
                                "vt".to_string(),
                                orig.get("payloadType").cloned().unwrap_or_else(|| Value::String("str".into())),
                            );
                        }
                        Some(p)
                            if p == "topic"
                                && prop_map.get("vt") == Some(&Value::String("str".to_string()))
                                && !prop_map.contains_key("v") =>
                        {
                            prop_map.insert(
                                "v".to_string(),
                                orig.get("topic").cloned().unwrap_or_else(|| Value::String("".into())),
                            );
                        }
                        _ => {}
                    }
                }
            }
        } else {
            let new_props = vec![
                serde_json::json!({
                    "p": "payload",
                    "v": orig.get("payload").cloned().unwrap_or_else(|| Value::String("".into())),
                    "vt": orig.get("payloadType").cloned().unwrap_or_else(|| Value::String("str".into()))
                }),
                serde_json::json!({
                    "p": "topic",
                    "v": orig.get("topic").cloned().unwrap_or_else(|| Value::String("".into())),
                    "vt": "str"
                }),
            ];
            map.insert("props".to_string(), Value::Array(new_props));
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_property_triple_should_be_ok() {
        let data = r#"
        [{
            "p": "timestamp",
            "v": "",
            "vt": "date"
        }]
        "#;

        let v: serde_json::Value = serde_json::from_str(data).unwrap();
        let triples = Vec::<PropertyTriple>::deserialize(&v).unwrap();
        assert_eq!(1, triples.len());
        assert_eq!("timestamp", triples[0].p);
        assert_eq!(PropertyType::Date, triples[0].vt);
    }

    #[test]
    fn test_legacy_json_folding() {
        let legacy = serde_json::json!({
            "payload": "42",
            "payloadType": "num",
            "topic": "t"
        });
        let fixed = handle_legacy_json(&legacy);
        let props = fixed["props"].as_array().unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0]["p"], "payload");
        assert_eq!(props[0]["vt"], "num");
        assert_eq!(props[1]["p"], "topic");
        assert_eq!(props[1]["v"], "t");
    }
}
