//! Prometheus metrics for StuartMQ
//!
//! One `Metrics` instance is created at startup and handed to every
//! component that counts something. Nothing here is global.

use bincode::{Decode, Encode};
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use serde::{Deserialize, Serialize};

use crate::protocol::{PacketType, QoS};

mod server;

pub use server::MetricsServer;

/// Broker counters and gauges, registered in a private registry
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Packets by type
    pub packets_received: IntCounterVec,
    pub packets_sent: IntCounterVec,
    /// Acknowledgements that matched no inflight entry
    pub acks_missed: IntCounterVec,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,

    // Application messages
    pub messages_received: IntCounterVec,
    pub messages_sent: IntCounterVec,
    pub messages_dropped: IntCounter,
    pub messages_retransmitted: IntCounter,
    pub messages_forwarded: IntCounter,

    // Node gauges
    pub connections_current: IntGauge,
    pub connections_max: IntGauge,
    pub sessions_current: IntGauge,
    pub sessions_max: IntGauge,
    pub subscriptions_current: IntGauge,
    pub subscriptions_max: IntGauge,
    pub topics_current: IntGauge,
    pub topics_max: IntGauge,
    pub listener_connections: IntGaugeVec,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
}

fn counter_vec(name: &str, help: &str, label: &str) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), &[label])
}

fn gauge(name: &str, help: &str) -> prometheus::Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let packets_received = counter_vec(
            "stuartmq_packets_received_total",
            "MQTT packets received by type",
            "type",
        )?;
        let packets_sent = counter_vec(
            "stuartmq_packets_sent_total",
            "MQTT packets sent by type",
            "type",
        )?;
        let acks_missed = counter_vec(
            "stuartmq_acks_missed_total",
            "Acknowledgements without a matching inflight entry",
            "type",
        )?;
        let bytes_received = counter("stuartmq_bytes_received_total", "Bytes received")?;
        let bytes_sent = counter("stuartmq_bytes_sent_total", "Bytes sent")?;

        let messages_received = counter_vec(
            "stuartmq_messages_received_total",
            "PUBLISH messages received from clients by QoS",
            "qos",
        )?;
        let messages_sent = counter_vec(
            "stuartmq_messages_sent_total",
            "PUBLISH messages sent to clients by QoS",
            "qos",
        )?;
        let messages_dropped = counter(
            "stuartmq_messages_dropped_total",
            "Messages dropped (denied, overflow, abandoned, undeliverable)",
        )?;
        let messages_retransmitted = counter(
            "stuartmq_messages_retransmitted_total",
            "QoS 1/2 messages resent after the retry interval",
        )?;
        let messages_forwarded = counter(
            "stuartmq_messages_forwarded_total",
            "Messages forwarded to other cluster nodes",
        )?;

        let connections_current = gauge("stuartmq_connections_current", "Live connections")?;
        let connections_max = gauge("stuartmq_connections_max", "Peak live connections")?;
        let sessions_current = gauge("stuartmq_sessions_current", "Sessions held by this node")?;
        let sessions_max = gauge("stuartmq_sessions_max", "Peak sessions held by this node")?;
        let subscriptions_current =
            gauge("stuartmq_subscriptions_current", "Subscriptions owned by this node")?;
        let subscriptions_max = gauge(
            "stuartmq_subscriptions_max",
            "Peak subscriptions owned by this node",
        )?;
        let topics_current = gauge("stuartmq_topics_current", "Retained topics")?;
        let topics_max = gauge("stuartmq_topics_max", "Peak retained topics")?;
        let listener_connections = IntGaugeVec::new(
            Opts::new(
                "stuartmq_listener_connections",
                "Live connections per listener",
            ),
            &["protocol", "bind"],
        )?;

        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_sent.clone()))?;
        registry.register(Box::new(acks_missed.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(messages_retransmitted.clone()))?;
        registry.register(Box::new(messages_forwarded.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(connections_max.clone()))?;
        registry.register(Box::new(sessions_current.clone()))?;
        registry.register(Box::new(sessions_max.clone()))?;
        registry.register(Box::new(subscriptions_current.clone()))?;
        registry.register(Box::new(subscriptions_max.clone()))?;
        registry.register(Box::new(topics_current.clone()))?;
        registry.register(Box::new(topics_max.clone()))?;
        registry.register(Box::new(listener_connections.clone()))?;

        Ok(Self {
            registry,
            packets_received,
            packets_sent,
            acks_missed,
            bytes_received,
            bytes_sent,
            messages_received,
            messages_sent,
            messages_dropped,
            messages_retransmitted,
            messages_forwarded,
            connections_current,
            connections_max,
            sessions_current,
            sessions_max,
            subscriptions_current,
            subscriptions_max,
            topics_current,
            topics_max,
            listener_connections,
        })
    }

    pub fn packet_received(&self, packet_type: PacketType, bytes: usize) {
        self.packets_received
            .with_label_values(&[packet_type.as_str()])
            .inc();
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn packet_sent(&self, packet_type: PacketType, bytes: usize) {
        self.packets_sent
            .with_label_values(&[packet_type.as_str()])
            .inc();
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn ack_missed(&self, packet_type: PacketType) {
        self.acks_missed
            .with_label_values(&[packet_type.as_str()])
            .inc();
    }

    pub fn message_received(&self, qos: QoS) {
        self.messages_received
            .with_label_values(&[qos_label(qos)])
            .inc();
    }

    pub fn message_sent(&self, qos: QoS) {
        self.messages_sent.with_label_values(&[qos_label(qos)]).inc();
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.inc();
    }

    pub fn message_retransmitted(&self) {
        self.messages_retransmitted.inc();
    }

    pub fn message_forwarded(&self) {
        self.messages_forwarded.inc();
    }

    pub fn client_connected(&self) {
        self.connections_current.inc();
        track_max(&self.connections_current, &self.connections_max);
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn set_sessions(&self, count: usize) {
        self.sessions_current.set(count as i64);
        track_max(&self.sessions_current, &self.sessions_max);
    }

    pub fn set_subscriptions(&self, count: usize) {
        self.subscriptions_current.set(count as i64);
        track_max(&self.subscriptions_current, &self.subscriptions_max);
    }

    pub fn set_topics(&self, count: usize) {
        self.topics_current.set(count as i64);
        track_max(&self.topics_current, &self.topics_max);
    }

    pub fn set_listener_connections(&self, protocol: &str, bind: &str, count: usize) {
        self.listener_connections
            .with_label_values(&[protocol, bind])
            .set(count as i64);
    }

    /// Point-in-time copy answered to `NodeMetrics` requests
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sum = |vec: &IntCounterVec, labels: &[&str]| -> u64 {
            labels
                .iter()
                .map(|label| vec.with_label_values(&[*label]).get())
                .sum()
        };
        let qos_labels = ["0", "1", "2"];

        MetricsSnapshot {
            connections: self.connections_current.get().max(0) as u64,
            connections_max: self.connections_max.get().max(0) as u64,
            sessions: self.sessions_current.get().max(0) as u64,
            subscriptions: self.subscriptions_current.get().max(0) as u64,
            topics: self.topics_current.get().max(0) as u64,
            messages_received: sum(&self.messages_received, &qos_labels),
            messages_sent: sum(&self.messages_sent, &qos_labels),
            messages_dropped: self.messages_dropped.get(),
            messages_retransmitted: self.messages_retransmitted.get(),
            messages_forwarded: self.messages_forwarded.get(),
            bytes_received: self.bytes_received.get(),
            bytes_sent: self.bytes_sent.get(),
        }
    }
}

fn qos_label(qos: QoS) -> &'static str {
    match qos {
        QoS::AtMostOnce => "0",
        QoS::AtLeastOnce => "1",
        QoS::ExactlyOnce => "2",
    }
}

fn track_max(current: &IntGauge, max: &IntGauge) {
    let value = current.get();
    if value > max.get() {
        max.set(value);
    }
}

/// Counter values carried over the cluster RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub connections_max: u64,
    pub sessions: u64,
    pub subscriptions: u64,
    pub topics: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_retransmitted: u64,
    pub messages_forwarded: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}
