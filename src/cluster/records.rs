//! Replicated records
//!
//! Plain data kept in the coordinator: one record per node, per listener,
//! per session (keyed by client id) and per route (client id + filter).
//! Records travel as JSON in gossip state and as bincode over peer RPC.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::protocol::QoS;

/// Node lifecycle status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub enum NodeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Starting => "starting",
            NodeStatus::Running => "running",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
        }
    }

    /// Peers forward messages only to starting or running nodes
    pub fn accepts_routes(self) -> bool {
        matches!(self, NodeStatus::Starting | NodeStatus::Running)
    }
}

/// Process runtime figures sampled periodically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RuntimeSnapshot {
    /// Available parallelism
    pub cpu: u32,
    /// Runtime worker threads
    pub thread: u32,
    /// Resident set size in bytes, where the platform reports it
    pub heap: Option<u64>,
    /// Soft limit on open file descriptors, where the platform reports it
    pub max_file_descriptors: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct NodeRecord {
    pub node_id: String,
    /// Fresh per process start
    pub instance_id: String,
    pub listen_addr: String,
    pub version: String,
    pub local_auth: bool,
    pub status: NodeStatus,
    pub runtime: RuntimeSnapshot,
    /// Unix millis of the last update
    pub update_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ListenerRecord {
    pub node_id: String,
    pub protocol: String,
    pub bind: String,
    pub max_connections: u64,
    pub connections: u64,
}

/// Which node owns the session of a client id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SessionRecord {
    pub node_id: String,
    pub client_id: String,
    pub clean_session: bool,
    /// Unix millis when the session was first created
    pub create_time: u64,
    /// A connection is currently attached
    pub connected: bool,
    /// Connection epoch on the owning node
    pub epoch: u64,
}

impl SessionRecord {
    /// Whether this record was written by connection `epoch` on `node_id`
    pub fn owned_by(&self, node_id: &str, epoch: u64) -> bool {
        self.node_id == node_id && self.epoch == epoch
    }
}

/// One subscription: client `client_id` on `node_id` subscribed to `topic`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct RouterRecord {
    pub node_id: String,
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
}

/// Key of a CAS-managed record
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub enum RecordKey {
    Node(String),
    Listener {
        node_id: String,
        protocol: String,
        bind: String,
    },
    Session(String),
}

impl RecordKey {
    pub fn session(client_id: &str) -> Self {
        RecordKey::Session(client_id.to_string())
    }

    pub fn node(node_id: &str) -> Self {
        RecordKey::Node(node_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Record {
    Node(NodeRecord),
    Listener(ListenerRecord),
    Session(SessionRecord),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Node(n) => RecordKey::Node(n.node_id.clone()),
            Record::Listener(l) => RecordKey::Listener {
                node_id: l.node_id.clone(),
                protocol: l.protocol.clone(),
                bind: l.bind.clone(),
            },
            Record::Session(s) => RecordKey::Session(s.client_id.clone()),
        }
    }

    pub fn as_session(&self) -> Option<&SessionRecord> {
        match self {
            Record::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeRecord> {
        match self {
            Record::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_listener(&self) -> Option<&ListenerRecord> {
        match self {
            Record::Listener(l) => Some(l),
            _ => None,
        }
    }
}

/// A record with the store version it was read at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct VersionedRecord {
    pub version: u64,
    pub record: Record,
}
