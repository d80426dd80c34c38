//! Message routing
//!
//! Resolves the subscribers of a published topic through the
//! coordinator's route table and fans the message out: local targets are
//! queued on their sessions, remote targets are batched per node into one
//! `Deliver` request. Each remote node has a forwarder task so messages
//! to that node keep their publish order.

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cluster::{Coordinator, DeliveryTarget, RemoteOp, RemoteReply};
use crate::metrics::Metrics;
use crate::protocol::{Publish, QoS};
use crate::retained::RetainedStore;
use crate::session::{Enqueued, Message, SessionStore};

pub struct MessageRouter {
    node_id: String,
    coordinator: Arc<dyn Coordinator>,
    sessions: Arc<SessionStore>,
    retained: Arc<RetainedStore>,
    metrics: Arc<Metrics>,
    max_qos: QoS,
    retain_available: bool,
    forwarders: DashMap<String, mpsc::UnboundedSender<RemoteOp>>,
}

impl MessageRouter {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        sessions: Arc<SessionStore>,
        retained: Arc<RetainedStore>,
        metrics: Arc<Metrics>,
        max_qos: QoS,
        retain_available: bool,
    ) -> Self {
        Self {
            node_id: coordinator.node_id().to_string(),
            coordinator,
            sessions,
            retained,
            metrics,
            max_qos,
            retain_available,
            forwarders: DashMap::new(),
        }
    }

    /// Handle an application message accepted from a client (or a will).
    ///
    /// Applies the retain flag, then routes. Returns the number of local
    /// sessions that accepted the message.
    pub fn publish(&self, publish: &Publish) -> usize {
        if publish.retain && self.retain_available {
            let message = Message::from(publish);
            self.apply_retained(&message);
            for node in self.coordinator.live_nodes() {
                if node != self.node_id {
                    self.forward(
                        &node,
                        RemoteOp::Retain {
                            message: message.clone(),
                        },
                    );
                }
            }
        }
        self.route(publish)
    }

    /// Store or clear a retained message on this node
    pub fn apply_retained(&self, message: &Message) {
        let stored = self.retained.set(
            &message.topic,
            bytes::Bytes::copy_from_slice(&message.payload),
            message.qos,
        );
        trace!(
            "Retained {} for '{}'",
            if stored { "set" } else { "cleared" },
            message.topic
        );
        self.metrics.set_topics(self.retained.len());
    }

    /// Fan `publish` out to every matching subscriber in the cluster
    pub fn route(&self, publish: &Publish) -> usize {
        let routes = self.coordinator.match_routes(&publish.topic);
        if routes.is_empty() {
            trace!("No subscribers for '{}'", publish.topic);
            return 0;
        }

        // Overlapping filters of one client collapse to its highest QoS
        let mut local: AHashMap<String, QoS> = AHashMap::new();
        let mut remote: AHashMap<String, AHashMap<String, QoS>> = AHashMap::new();
        for route in routes {
            let targets = if route.node_id == self.node_id {
                &mut local
            } else {
                remote.entry(route.node_id).or_default()
            };
            let qos = targets.entry(route.client_id).or_insert(route.qos);
            if route.qos > *qos {
                *qos = route.qos;
            }
        }

        let accepted = self.deliver_local(
            publish,
            local.iter().map(|(client_id, qos)| (client_id.as_str(), *qos)),
        );

        if !remote.is_empty() {
            let message = Message {
                retain: false,
                ..Message::from(publish)
            };
            for (node, targets) in remote {
                let targets = targets
                    .into_iter()
                    .map(|(client_id, qos)| DeliveryTarget { client_id, qos })
                    .collect();
                self.forward(
                    &node,
                    RemoteOp::Deliver {
                        message: message.clone(),
                        targets,
                    },
                );
            }
        }

        accepted
    }

    /// Queue `publish` on the named local sessions at the effective QoS
    pub fn deliver_local<'a>(
        &self,
        publish: &Publish,
        targets: impl IntoIterator<Item = (&'a str, QoS)>,
    ) -> usize {
        let mut accepted = 0;
        let mut stale: SmallVec<[&str; 4]> = SmallVec::new();

        for (client_id, sub_qos) in targets {
            let Some(session) = self.sessions.get(client_id) else {
                stale.push(client_id);
                continue;
            };

            let mut outgoing = publish.clone();
            outgoing.qos = publish.qos.min(sub_qos).min(self.max_qos);
            outgoing.retain = false;
            outgoing.dup = false;
            outgoing.packet_id = None;

            match session.write().enqueue(outgoing) {
                Enqueued::Queued => accepted += 1,
                Enqueued::DroppedOldest => {
                    accepted += 1;
                    self.metrics.message_dropped();
                    debug!("Queue full for {}, dropped oldest message", client_id);
                }
                Enqueued::Rejected => {}
            };
        }

        if !stale.is_empty() {
            debug!("Routes without a local session: {:?}", stale);
        }
        accepted
    }

    /// Retained messages matching `filter`, retain flag set
    pub fn retained_for(&self, filter: &str) -> Vec<Publish> {
        self.retained
            .matching(filter)
            .iter()
            .map(|m| m.to_publish())
            .collect()
    }

    fn forward(&self, node: &str, op: RemoteOp) {
        let sender = self.forwarders.get(node).map(|tx| tx.clone());
        let op = match sender {
            Some(tx) => match tx.send(op) {
                Ok(()) => return,
                Err(mpsc::error::SendError(op)) => {
                    self.forwarders.remove(node);
                    op
                }
            },
            None => op,
        };
        let _ = self.spawn_forwarder(node).send(op);
    }

    fn spawn_forwarder(&self, node: &str) -> mpsc::UnboundedSender<RemoteOp> {
        self.forwarders
            .entry(node.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(forwarder(
                    node.to_string(),
                    self.coordinator.clone(),
                    self.metrics.clone(),
                    rx,
                ));
                tx
            })
            .clone()
    }
}

/// Sends ops to one node, one at a time, in submission order
async fn forwarder(
    node: String,
    coordinator: Arc<dyn Coordinator>,
    metrics: Arc<Metrics>,
    mut rx: mpsc::UnboundedReceiver<RemoteOp>,
) {
    while let Some(op) = rx.recv().await {
        let is_delivery = matches!(op, RemoteOp::Deliver { .. });
        let name = op.name();
        match coordinator.compute_on_node(&node, op).await {
            Ok(RemoteReply::Delivered { accepted }) => {
                trace!("Forwarded to {}: {} accepted", node, accepted);
                metrics.message_forwarded();
            }
            Ok(RemoteReply::Retained) => {}
            Ok(other) => {
                warn!("Unexpected reply to {} from {}: {:?}", name, node, other);
                if is_delivery {
                    metrics.message_dropped();
                }
            }
            Err(e) => {
                warn!("Failed to forward {} to {}: {}", name, node, e);
                if is_delivery {
                    metrics.message_dropped();
                }
            }
        }
    }
}
