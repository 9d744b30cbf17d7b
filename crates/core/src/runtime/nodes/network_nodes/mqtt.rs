use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};

use crate::runtime::engine::Engine;
use crate::runtime::flow::Flow;
use crate::runtime::model::json::{FlowNodeConfig, GlobalNodeConfig};
use crate::runtime::model::*;
use crate::runtime::nodes::*;
use wireflow_macro::*;

const TRANSPORT_CHANNEL_CAPACITY: usize = 64;

/// One message arriving from (or going to) the broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

/// The wire collaborator the broker config node drives. The runtime ships
/// an in-process loopback; a real client maps onto the same calls.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn connect(&self) -> crate::Result<()>;
    async fn disconnect(&self) -> crate::Result<()>;
    async fn publish(&self, msg: MqttMessage) -> crate::Result<()>;
    /// Returns the retained messages matching the filter plus the live
    /// feed. Subscribers filter the feed with [`topic_matches`].
    async fn subscribe(&self, filter: &str, qos: u8)
        -> crate::Result<(Vec<MqttMessage>, broadcast::Receiver<MqttMessage>)>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process broker: a broadcast bus plus a retained-message table.
pub struct LoopbackMqttTransport {
    bus: broadcast::Sender<MqttMessage>,
    retained: Mutex<HashMap<String, MqttMessage>>,
    connected: AtomicBool,
}

impl Default for LoopbackMqttTransport {
    fn default() -> Self {
        let (bus, _) = broadcast::channel(TRANSPORT_CHANNEL_CAPACITY);
        LoopbackMqttTransport { bus, retained: Mutex::new(HashMap::new()), connected: AtomicBool::new(false) }
    }
}

#[async_trait]
impl MqttTransport for LoopbackMqttTransport {
    async fn connect(&self) -> crate::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> crate::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, msg: MqttMessage) -> crate::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(WireflowError::InvalidOperation("The broker is not connected".into()).into());
        }
        if msg.retained {
            let mut retained = self.retained.lock().await;
            if msg.payload.is_empty() {
                retained.remove(&msg.topic);
            } else {
                retained.insert(msg.topic.clone(), msg.clone());
            }
        }
        // no subscriber is not an error
        let _ = self.bus.send(msg);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: u8,
    ) -> crate::Result<(Vec<MqttMessage>, broadcast::Receiver<MqttMessage>)> {
        let retained = self.retained.lock().await;
        let matching = retained.values().filter(|m| topic_matches(filter, &m.topic)).cloned().collect();
        Ok((matching, self.bus.subscribe()))
    }
}

#[derive(Deserialize, Debug)]
struct MqttBrokerConfig {
    #[serde(default)]
    broker: String,

    #[serde(default, deserialize_with = "json::deser::str_to_option_u64")]
    port: Option<u64>,
}

/// The shared broker resource. User nodes register themselves; the
/// connection dies with the last user.
#[derive(Debug)]
#[global_node("mqtt-broker")]
pub(crate) struct MqttBrokerNode {
    base: GlobalNode,
    address: String,
    transport: Arc<dyn MqttTransport>,
}

impl std::fmt::Debug for dyn MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport").finish()
    }
}

impl MqttBrokerNode {
    fn build(
        _engine: &Engine,
        base: GlobalNode,
        config: &GlobalNodeConfig,
    ) -> crate::Result<Box<dyn GlobalNodeBehavior>> {
        let broker_config = MqttBrokerConfig::deserialize(&config.rest)?;
        let address = match broker_config.port {
            Some(port) => format!("{}:{}", broker_config.broker, port),
            None => broker_config.broker.clone(),
        };

        let node = MqttBrokerNode { base, address, transport: Arc::new(LoopbackMqttTransport::default()) };
        Ok(Box::new(node))
    }

    pub(crate) fn transport(&self) -> &Arc<dyn MqttTransport> {
        &self.transport
    }

    pub(crate) async fn register_user_node(&self, user: ElementId) -> crate::Result<()> {
        let count = self.get_base().register_user(user);
        if count == 1 {
            log::info!("[mqtt-broker:{}] Connecting to '{}'...", self.name(), self.address);
            self.transport.connect().await?;
        }
        Ok(())
    }

    pub(crate) async fn remove_user_node(&self, user: ElementId) {
        let count = self.get_base().remove_user(user);
        if count == 0 {
            log::info!("[mqtt-broker:{}] The last user left, disconnecting.", self.name());
            if let Err(e) = self.transport.disconnect().await {
                log::warn!("[mqtt-broker:{}] Failed to disconnect: {}", self.name(), e);
            }
        }
    }
}

#[async_trait]
impl GlobalNodeBehavior for MqttBrokerNode {
    fn get_base(&self) -> &GlobalNode {
        &self.base
    }

    async fn close(&self) {
        if let Err(e) = self.transport.disconnect().await {
            log::warn!("[mqtt-broker:{}] Failed to disconnect: {}", self.name(), e);
        }
    }
}

fn find_broker(engine: &Engine, id: &ElementId) -> crate::Result<Arc<dyn GlobalNodeBehavior>> {
    engine
        .get_global_node(id)
        .ok_or(WireflowError::BadFlowsJson(format!("Cannot find the mqtt-broker config node '{}'", id)))
        .map_err(Into::into)
}

fn as_broker(node: &Arc<dyn GlobalNodeBehavior>) -> crate::Result<&MqttBrokerNode> {
    node.as_any()
        .downcast_ref::<MqttBrokerNode>()
        .ok_or(WireflowError::InvalidOperation("The referenced config node is not an mqtt-broker".into()))
        .map_err(Into::into)
}

#[derive(Deserialize, Debug)]
struct MqttInNodeConfig {
    #[serde(default)]
    topic: String,

    #[serde(default, deserialize_with = "json::deser::deser_u8_loose")]
    qos: u8,

    #[serde(default = "datatype_default")]
    datatype: String,

    #[serde(deserialize_with = "json::deser::deser_id")]
    broker: ElementId,
}

fn datatype_default() -> String {
    "auto".to_string()
}

#[derive(Debug)]
#[flow_node("mqtt in")]
struct MqttInNode {
    base: FlowNode,
    config: MqttInNodeConfig,
}

impl MqttInNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let in_config = MqttInNodeConfig::deserialize(&config.rest)?;
        let node = MqttInNode { base, config: in_config };
        Ok(Box::new(node))
    }

    fn map_payload(&self, bytes: Vec<u8>) -> Variant {
        match self.config.datatype.as_str() {
            "buffer" => Variant::Bytes(bytes),
            "base64" => {
                use base64::prelude::*;
                Variant::String(BASE64_STANDARD.encode(bytes))
            }
            "utf8" => Variant::String(String::from_utf8_lossy(&bytes).into_owned()),
            "json" => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(jv) => Variant::from(jv),
                Err(_) => Variant::String(String::from_utf8_lossy(&bytes).into_owned()),
            },
            // auto: a string when it decodes, upgraded to JSON when it parses
            _ => match String::from_utf8(bytes) {
                Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(jv) if jv.is_object() || jv.is_array() => Variant::from(jv),
                    _ => Variant::String(text),
                },
                Err(e) => Variant::Bytes(e.into_bytes()),
            },
        }
    }

    async fn deliver(&self, mqtt_msg: MqttMessage, cancel: CancellationToken) {
        if !topic_matches(&self.config.topic, &mqtt_msg.topic) {
            return;
        }
        let mut out = Msg::with_payload(self.map_payload(mqtt_msg.payload));
        out.set(wellknown::TOPIC_PROPERTY.to_string(), Variant::String(mqtt_msg.topic));
        out.set("qos".to_string(), Variant::from(mqtt_msg.qos as u64));
        out.set("retain".to_string(), Variant::Bool(mqtt_msg.retained));
        if let Err(e) = self.fan_out_one(Envelope { port: 0, msg: MsgHandle::new(out) }, cancel).await {
            log::warn!("[mqtt in:{}] Failed to deliver: {}", self.name(), e);
        }
    }
}

#[async_trait]
impl FlowNodeBehavior for MqttInNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        let engine = match self.engine() {
            Some(engine) => engine,
            None => return,
        };

        let broker_node = match find_broker(&engine, &self.config.broker) {
            Ok(b) => b,
            Err(e) => {
                log::error!("[mqtt in:{}] {:?}", self.name(), e);
                stop_token.cancelled().await;
                return;
            }
        };

        let (retained, mut feed) = {
            let broker = match as_broker(&broker_node) {
                Ok(b) => b,
                Err(e) => {
                    log::error!("[mqtt in:{}] {:?}", self.name(), e);
                    stop_token.cancelled().await;
                    return;
                }
            };
            if let Err(e) = broker.register_user_node(self.id()).await {
                log::error!("[mqtt in:{}] Failed to connect: {:?}", self.name(), e);
                stop_token.cancelled().await;
                return;
            }
            match broker.transport().subscribe(&self.config.topic, self.config.qos).await {
                Ok(sub) => sub,
                Err(e) => {
                    log::error!("[mqtt in:{}] Failed to subscribe: {:?}", self.name(), e);
                    stop_token.cancelled().await;
                    return;
                }
            }
        };

        self.set_status(
            NodeStatus {
                fill: Some(StatusFill::Green),
                shape: Some(StatusShape::Dot),
                text: Some("connected".to_string()),
            },
            stop_token.child_token(),
        )
        .await;

        for mqtt_msg in retained.into_iter() {
            self.deliver(mqtt_msg, stop_token.child_token()).await;
        }

        loop {
            tokio::select! {
                received = feed.recv() => {
                    match received {
                        Ok(mqtt_msg) => self.deliver(mqtt_msg, stop_token.child_token()).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[mqtt in:{}] Dropped {} messages, the consumer is falling behind", self.name(), n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = stop_token.cancelled() => break,
            }
        }

        if let Ok(broker) = as_broker(&broker_node) {
            broker.remove_user_node(self.id()).await;
        }
    }
}

#[derive(Deserialize, Debug)]
struct MqttOutNodeConfig {
    #[serde(default)]
    topic: String,

    #[serde(default, deserialize_with = "json::deser::deser_u8_loose")]
    qos: u8,

    #[serde(default)]
    retain: bool,

    #[serde(deserialize_with = "json::deser::deser_id")]
    broker: ElementId,
}

#[derive(Debug)]
#[flow_node("mqtt out")]
struct MqttOutNode {
    base: FlowNode,
    config: MqttOutNodeConfig,
}

impl MqttOutNode {
    fn build(_flow: &Flow, base: FlowNode, config: &FlowNodeConfig) -> crate::Result<Box<dyn FlowNodeBehavior>> {
        let out_config = MqttOutNodeConfig::deserialize(&config.rest)?;
        let node = MqttOutNode { base, config: out_config };
        Ok(Box::new(node))
    }

    async fn uow(&self, msg: MsgHandle, broker_node: &Arc<dyn GlobalNodeBehavior>) -> crate::Result<()> {
        let (topic, payload, qos, retain) = {
            let guard = msg.read().await;
            let topic = if self.config.topic.is_empty() {
                guard
                    .get(wellknown::TOPIC_PROPERTY)
                    .and_then(|t| t.as_str())
                    .map(|s| s.to_string())
                    .ok_or(WireflowError::InvalidOperation("No topic set on the message or the node".into()))?
            } else {
                self.config.topic.clone()
            };
            let payload = match guard.get(wellknown::PAYLOAD_PROPERTY) {
                Some(Variant::Bytes(b)) => b.clone(),
                Some(Variant::String(s)) => s.clone().into_bytes(),
                Some(other) => serde_json::to_vec(other)?,
                None => Vec::new(),
            };
            let qos = guard.get("qos").and_then(|q| q.as_u64()).map(|q| q as u8).unwrap_or(self.config.qos);
            let retain = guard.get("retain").and_then(|r| r.as_bool()).unwrap_or(self.config.retain);
            (topic, payload, qos, retain)
        };

        let broker = as_broker(broker_node)?;
        broker.transport().publish(MqttMessage { topic, payload, qos, retained: retain }).await
    }
}

#[async_trait]
impl FlowNodeBehavior for MqttOutNode {
    fn get_base(&self) -> &FlowNode {
        &self.base
    }

    async fn run(self: Arc<Self>, stop_token: CancellationToken) {
        let engine = match self.engine() {
            Some(engine) => engine,
            None => return,
        };
        let broker_node = match find_broker(&engine, &self.config.broker) {
            Ok(b) => b,
            Err(e) => {
                log::error!("[mqtt out:{}] {:?}", self.name(), e);
                stop_token.cancelled().await;
                return;
            }
        };
        if let Ok(broker) = as_broker(&broker_node) {
            if let Err(e) = broker.register_user_node(self.id()).await {
                log::error!("[mqtt out:{}] Failed to connect: {:?}", self.name(), e);
            }
        }

        while !stop_token.is_cancelled() {
            let broker_ref = &broker_node;
            with_uow(self.as_ref(), stop_token.child_token(), |node, msg| async move {
                node.uow(msg, broker_ref).await
            })
            .await;
        }

        if let Ok(broker) = as_broker(&broker_node) {
            broker.remove_user_node(self.id()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[tokio::test]
    async fn test_loopback_transport_round_trip() {
        let transport = LoopbackMqttTransport::default();
        transport.connect().await.unwrap();

        let (_, mut feed) = transport.subscribe("sensors/#", 0).await.unwrap();
        transport
            .publish(MqttMessage { topic: "sensors/t1".into(), payload: b"21.5".to_vec(), qos: 0, retained: false })
            .await
            .unwrap();

        let received = feed.recv().await.unwrap();
        assert_eq!(received.topic, "sensors/t1");
        assert_eq!(received.payload, b"21.5");
    }

    #[tokio::test]
    async fn test_loopback_retained_messages() {
        let transport = LoopbackMqttTransport::default();
        transport.connect().await.unwrap();

        transport
            .publish(MqttMessage { topic: "state/a".into(), payload: b"on".to_vec(), qos: 1, retained: true })
            .await
            .unwrap();

        let (retained, _) = transport.subscribe("state/+", 1).await.unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].payload, b"on");

        // an empty retained payload clears the entry
        transport
            .publish(MqttMessage { topic: "state/a".into(), payload: Vec::new(), qos: 1, retained: true })
            .await
            .unwrap();
        let (retained, _) = transport.subscribe("state/+", 1).await.unwrap();
        assert!(retained.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_rejects_publish_when_disconnected() {
        let transport = LoopbackMqttTransport::default();
        let res = transport
            .publish(MqttMessage { topic: "x".into(), payload: vec![], qos: 0, retained: false })
            .await;
        assert!(res.is_err());
    }
}
