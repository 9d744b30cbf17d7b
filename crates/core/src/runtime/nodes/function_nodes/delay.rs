use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::runtime::flow::Flow;
use crate::runtime::model::json::FlowNodeConfig;
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

/// Queued messages beyond this produce a slow-consumer warning.
const QUEUE_WARN_THRESHOLD: usize = 1000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
enum PauseKind {
    #[default]
    #[serde(rename = "delay")]
    Delay,

    #[serde(rename = "delayv")]
    DelayVariable,

    #[serde(rename = "random")]
    Random,

    #[serde(rename = "rate")]
    Rate,

    #[serde(rename = "queue")]
    Queue,
}

#[derive(Deserialize, Debug)]
struct DelayNodeConfig {
    #[serde(default, rename = "pauseType")]
    pause_type: PauseKind,

    #[serde(default = "timeout_default", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    timeout: f64,

    #[serde(default = "unit_default", rename = "timeoutUnits")]
    timeout_units: String,

    #[serde(default, rename = "randomFirst", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    random_first: f64,

    #[serde(default = "one_default", rename = "randomLast", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    random_last: f64,

    #[serde(default = "unit_default", rename = "randomUnits")]
    random_units: String,

    #[serde(default = "one_default", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    rate: f64,

    #[serde(default = "one_default", rename = "nbRateUnits", deserialize_with = "json::deser::deser_f64_or_string_nan")]
    nb_rate_units: f64,

    #[serde(default = "rate_unit_default", rename = "rateUnits")]
    rate_units: String,

    #[serde(default)]
    drop: bool,
}

fn timeout_default() -> f64 {
    5.0
}

fn one_default() -> f64 {
    1.0
}

fn unit_default() -> String {
    "seconds".to_string()
}

fn rate_unit_default() -> String {
    "second".to_string()
}

fn units_to_millis(value: f64, units: &str) -> f64 {
    match units {
        "milliseconds" | "ms" => value,
        "minutes" | "minute" => value * 60_000.0,
        "hours" | "hour" => value * 3_600_000.0,
        "days" | "day" => value * 86_400_000.0,
        // seconds
        _ => value * 1000.0,
    }
}

impl DelayNodeConfig {
    fn fixed_delay(&self) -> Duration {
        let millis = units_to_millis(self.timeout, &self.timeout_units);
        Duration::from_millis(if millis.is_nan() || millis < 0.0 { 0.0 } else { millis } as u64)
    }

    fn random_delay(&self) -> Duration {
        let low = units_to_millis(self.random_first, &self.random_units).max(0.0);
        let high = units_to_millis(self.random_last, &self.random_units).max(low);
        let millis = if high > low { rand::thread_rng().gen_range(low..=high) } else { low };
        Duration::from_millis(millis as u64)
    }

    /// The emission interval: `period / rate * nbRateUnits`.
    fn rate_interval(&self) -> Duration {
        let period_ms = units_to_millis(1.0, &self.rate_units);
        let rate = if self.rate.is_nan() || self.rate <= 0.0 { 1.0 } else { self.rate };
        let nb = if self.nb_rate_units.is_nan() || self.nb_rate_units <= 0.0 { 1.0 } else { self.nb_rate_units };
        Duration::from_millis((period_ms / rate * nb).max(1.0) as u64)
    }
}

/// Delays individual messages or meters them out at a fixed rate.
#[derive(Debug)]
#[flow_node("delay")]
struct DelayNode {
    base: FlowNode,
    config: DelayNodeConfig,
}

impl DelayNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let delay_config = DelayNodeConfig::deserialize(&config.rest)?;
        let node = DelayNode { base, config: delay_config };
        Ok(Box::new(node))
    }

    async fn msg_delay(&self, msg: &MsgHandle) -> Duration {
        match self.config.pause_type {
            PauseKind::DelayVariable => {
                let guard = msg.read().await;
                match guard.get("delay").and_then(|d| d.as_f64()).filter(|x| *x >= 0.0) {
                    Some(ms) => Duration::from_millis(ms as u64),
                    None => self.config.fixed_delay(),
                }
            }
            PauseKind::Random => self.config.random_delay(),
            _ => self.config.fixed_delay(),
        }
    }

    /// Per-message sleeping: every message gets its own timer task so
    /// deliveries overlap freely.
    async fn run_delay(self: Arc<Self>, stop_token: CancellationToken) {
        let mut inflight: JoinSet<()> = JoinSet::new();
        while !stop_token.is_cancelled() {
            match self.recv_msg(stop_token.clone()).await {
                Ok(msg) => {
                    let delay = self.msg_delay(&msg).await;
                    let node = self.clone();
                    let cancel = stop_token.child_token();
                    inflight.spawn(async move {
                        if crate::utils::async_util::delay(delay, cancel.clone()).await.is_ok() {
                            if let Err(e) = node.fan_out_one(Envelope { port: 0, msg: msg.clone() }, cancel.clone()).await
                            {
                                log::warn!("[delay:{}] Failed to emit: {}", node.name(), e);
                            }
                            node.notify_uow_completed(msg, cancel).await;
                        }
                    });
                }
                Err(_) => break,
            }
        }
        inflight.abort_all();
    }

    /// Rate metering: one emission per interval. Without `drop`, excess
    /// messages queue and drain one per tick; with it, early arrivals are
    /// discarded.
    async fn run_rate(self: Arc<Self>, stop_token: CancellationToken) {
        let interval = self.config.rate_interval();
        let mut queue: VecDeque<MsgHandle> = VecDeque::new();
        let mut last_emit: Option<Instant> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.recv_msg(stop_token.clone()) => {
                    let msg = match received {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    let now = Instant::now();
                    let due = last_emit.map(|t| now.duration_since(t) >= interval).unwrap_or(true);

                    if self.config.drop {
                        if due {
                            last_emit = Some(now);
                            self.emit_now(msg, &stop_token).await;
                        }
                        // else: dropped
                    } else if due && queue.is_empty() {
                        last_emit = Some(now);
                        ticker.reset();
                        self.emit_now(msg, &stop_token).await;
                    } else {
                        queue.push_back(msg);
                        if queue.len() == QUEUE_WARN_THRESHOLD {
                            log::warn!(
                                "[delay:{}] {} messages queued, the consumer is falling behind",
                                self.name(),
                                queue.len()
                            );
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Some(msg) = queue.pop_front() {
                        last_emit = Some(Instant::now());
                        self.emit_now(msg, &stop_token).await;
                    }
                }

                _ = stop_token.cancelled() => break,
            }
        }
    }

    async fn emit_now(&self, msg: MsgHandle, stop_token: &CancellationToken) {
        if let Err(e) = self.fan_out_one(Envelope { port: 0, msg: msg.clone() }, stop_token.clone()).await {
            log::warn!("[delay:{}] Failed to emit: {}", self.name(), e);
        }
        self.notify_uow_completed(msg, stop_token.clone()).await;
    }
}

#[async_trait]
impl FlowNodeBehavior for DelayNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        match self.config.pause_type {
            PauseKind::Delay | PauseKind::DelayVariable | PauseKind::Random => self.run_delay(stop_token).await,
            PauseKind::Rate | PauseKind::Queue => self.run_rate(stop_token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rate_interval() {
        let cfg: DelayNodeConfig =
            DelayNodeConfig::deserialize(&json!({"pauseType": "rate", "rate": 2, "rateUnits": "second"})).unwrap();
        assert_eq!(cfg.rate_interval(), Duration::from_millis(500));

        let cfg: DelayNodeConfig = DelayNodeConfig::deserialize(
            &json!({"pauseType": "rate", "rate": 1, "nbRateUnits": 2, "rateUnits": "second"}),
        )
        .unwrap();
        assert_eq!(cfg.rate_interval(), Duration::from_millis(2000));
    }

    #[test]
    fn test_fixed_delay_units() {
        let cfg: DelayNodeConfig =
            DelayNodeConfig::deserialize(&json!({"timeout": "5", "timeoutUnits": "seconds"})).unwrap();
        assert_eq!(cfg.fixed_delay(), Duration::from_secs(5));

        let cfg: DelayNodeConfig =
            DelayNodeConfig::deserialize(&json!({"timeout": 250, "timeoutUnits": "milliseconds"})).unwrap();
        assert_eq!(cfg.fixed_delay(), Duration::from_millis(250));
    }
}
