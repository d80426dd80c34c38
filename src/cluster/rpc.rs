//! Typed node-to-node operations
//!
//! `compute_on_node` carries one of a fixed set of [`RemoteOp`]s to a target
//! node, where the registered [`OpHandler`] answers with a [`RemoteReply`].

use async_trait::async_trait;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use super::records::{ListenerRecord, NodeRecord, Record, RecordKey, VersionedRecord};
use super::store::CasOutcome;
use crate::metrics::MetricsSnapshot;
use crate::protocol::QoS;
use crate::session::{Message, SessionSnapshot};

/// One local subscriber of a forwarded message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeliveryTarget {
    pub client_id: String,
    /// Granted subscription QoS
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub remote_addr: String,
    pub protocol: String,
    pub username: Option<String>,
    pub keep_alive: u16,
    pub clean_session: bool,
    /// Unix millis
    pub connected_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ConnectionsPage {
    pub total: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// Store access forwarded to the node that serializes a key
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum KvRequest {
    Get(RecordKey),
    Cas {
        key: RecordKey,
        expected: Option<u64>,
        new: Option<Record>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum KvResponse {
    Record(Option<VersionedRecord>),
    Cas(CasOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RemoteOp {
    NodeInfo,
    NodeMetrics,
    Connections { offset: usize, limit: usize },
    Listeners,
    /// Deliver `message` to the given local subscribers
    Deliver {
        message: Message,
        targets: Vec<DeliveryTarget>,
    },
    /// Close the client's connection on the target node and hand back its
    /// session state, or drop that state when `discard` is set
    Takeover { client_id: String, discard: bool },
    /// Apply a retained set or clear
    Retain { message: Message },
    Kv(KvRequest),
}

impl RemoteOp {
    /// Operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RemoteOp::NodeInfo => "node_info",
            RemoteOp::NodeMetrics => "node_metrics",
            RemoteOp::Connections { .. } => "connections",
            RemoteOp::Listeners => "listeners",
            RemoteOp::Deliver { .. } => "deliver",
            RemoteOp::Takeover { .. } => "takeover",
            RemoteOp::Retain { .. } => "retain",
            RemoteOp::Kv(_) => "kv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RemoteReply {
    NodeInfo(NodeRecord),
    NodeMetrics(MetricsSnapshot),
    Connections(ConnectionsPage),
    Listeners(Vec<ListenerRecord>),
    /// Number of targets that accepted the message
    Delivered { accepted: usize },
    /// State of the session that was taken over, if there was one
    Takeover(Option<SessionSnapshot>),
    Retained,
    Kv(KvResponse),
    Error(String),
}

/// Executes operations addressed to this node
#[async_trait]
pub trait OpHandler: Send + Sync {
    async fn handle(&self, op: RemoteOp) -> RemoteReply;
}
