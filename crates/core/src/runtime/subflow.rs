use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    engine::Engine,
    flow::{Flow, FlowArgs},
    nodes::FlowNodeBehavior,
};
use crate::runtime::model::json::{FlowConfig, SubflowPort};
use crate::runtime::model::*;

/// One output port of a subflow: interior nodes send into `msg_tx`, the
/// forward task relays to the instance node's wires.
#[derive(Debug)]
pub(crate) struct SubflowOutputPort {
    pub index: usize,
    pub instance_node: Option<Weak<dyn FlowNodeBehavior>>,
    pub msg_tx: MsgSender,
    pub msg_rx: MsgReceiverHolder,
}

#[derive(Debug)]
pub(crate) struct SubflowState {
    pub instance_node: Option<Arc<dyn FlowNodeBehavior>>,
    in_nodes: std::sync::RwLock<Vec<Arc<dyn FlowNodeBehavior>>>,
    out_ports: Vec<SubflowPort>,
    tx_ports: SmallVec<[Arc<SubflowOutputPort>; 4]>,
    tx_tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl SubflowOutputPort {
    pub(crate) async fn tx_task(&self, stop_token: CancellationToken) {
        while !stop_token.is_cancelled() {
            match self.msg_rx.recv_msg(stop_token.clone()).await {
                Ok(msg) => {
                    if let Some(instance_node) = self.instance_node.clone().and_then(|x| x.upgrade()) {
                        let envelope = Envelope { port: self.index, msg };
                        if let Err(e) = instance_node.fan_out_one(envelope, stop_token.clone()).await {
                            log::warn!("Failed to fan-out message: {:?}", e);
                        }
                    } else {
                        log::warn!("The subflow does not have an instance node");
                    }
                }

                Err(_) => break,
            }
        }
    }
}

impl SubflowState {
    pub(crate) fn new(engine: &Engine, flow_config: &FlowConfig, args: &FlowArgs) -> crate::Result<Self> {
        let subflow_instance = flow_config.subflow_node_id.and_then(|x| engine.find_flow_node_by_id(&x));

        let mut tx_ports = SmallVec::with_capacity(flow_config.out_ports.len());
        for (index, _) in flow_config.out_ports.iter().enumerate() {
            let (msg_root_tx, msg_rx) = tokio::sync::mpsc::channel(args.node_msg_queue_capacity);

            tx_ports.push(Arc::new(SubflowOutputPort {
                index,
                instance_node: subflow_instance.clone().map(|x| Arc::downgrade(&x)),
                msg_tx: msg_root_tx.clone(),
                msg_rx: MsgReceiverHolder::new(msg_rx),
            }));
        }

        Ok(Self {
            instance_node: subflow_instance,
            in_nodes: std::sync::RwLock::new(Vec::new()),
            out_ports: flow_config.out_ports.clone(),
            tx_ports,
            tx_tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    pub(crate) fn populate_in_nodes(&self, flow: &Flow, flow_config: &FlowConfig) -> crate::Result<()> {
        let mut in_nodes = self.in_nodes.write().expect("`in_nodes` write lock");
        for wire_obj in flow_config.in_ports.iter().flat_map(|x| x.wires.iter()) {
            if let Some(node) = flow.get_node_by_id(&wire_obj.id) {
                if !in_nodes.iter().any(|x| x.id() == node.id()) {
                    in_nodes.push(node.clone());
                }
            } else {
                log::warn!("Cannot find node(id='{}')", wire_obj.id);
            }
        }
        Ok(())
    }

    pub(crate) fn in_nodes(&self) -> Vec<Arc<dyn FlowNodeBehavior>> {
        self.in_nodes.read().expect("`in_nodes` read lock").clone()
    }

    pub(crate) fn out_ports(&self) -> &[SubflowPort] {
        &self.out_ports
    }

    pub(crate) fn tx_port(&self, index: usize) -> Option<&Arc<SubflowOutputPort>> {
        self.tx_ports.get(index)
    }

    pub(crate) async fn start_tx_tasks(&self, stop_token: CancellationToken) -> crate::Result<()> {
        let mut tasks = self.tx_tasks.lock().await;
        for tx_port in self.tx_ports.iter() {
            let child_stop_token = stop_token.clone();
            let port_cloned = tx_port.clone();
            tasks.spawn(async move {
                port_cloned.tx_task(child_stop_token.clone()).await;
            });
        }
        Ok(())
    }
}
