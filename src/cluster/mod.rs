//! Cluster Coordination
//!
//! Everything that must agree across nodes goes through a [`Coordinator`]:
//!
//! - a versioned [`KvStore`] with compare-and-swap for session ownership,
//!   node status and listener records
//! - a read-only [`QueryIndex`] for listing and pagination
//! - the route registry used to resolve subscribers at publish time
//! - `compute_on_node`, a typed request to a specific node
//!
//! Two implementations exist. [`LocalCoordinator`] keeps everything in
//! process (single node, or several brokers sharing one [`LocalCluster`]
//! in tests). [`ClusterCoordinator`] gossips records with chitchat over UDP
//! and sends requests over persistent peer TCP connections.
//!
//! ```toml
//! [cluster]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ```

mod index;
mod local;
mod manager;
mod peer;
mod protocol;
mod records;
mod routes;
mod rpc;
mod store;

use std::fmt;
use std::sync::Weak;

use async_trait::async_trait;

pub use index::{Page, QueryIndex, RouteFilter, SessionFilter};
pub use local::{LocalCluster, LocalCoordinator};
pub use manager::ClusterCoordinator;
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};
pub use records::{
    ListenerRecord, NodeRecord, NodeStatus, Record, RecordKey, RouterRecord, RuntimeSnapshot,
    SessionRecord, VersionedRecord,
};
pub use routes::RouteTable;
pub use rpc::{
    ConnectionInfo, ConnectionsPage, DeliveryTarget, KvRequest, KvResponse, OpHandler, RemoteOp,
    RemoteReply,
};
pub use store::{CasOutcome, KvStore, MemoryStore};

pub use crate::config::ClusterConfig;

/// Errors from coordinator operations
#[derive(Debug)]
pub enum CoordinatorError {
    /// Target node is not reachable (no connection, no handler, or dead)
    Unreachable(String),
    /// Request did not complete within the RPC timeout
    Timeout,
    /// Record is owned by another node and cannot be written here
    NotOwner(String),
    /// Failed to encode or decode a frame or record
    Codec(String),
    /// Peer or store refused the request
    Rejected(String),
    Io(std::io::Error),
    /// Coordinator is shutting down
    Shutdown,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Unreachable(node) => write!(f, "node unreachable: {}", node),
            CoordinatorError::Timeout => write!(f, "request timed out"),
            CoordinatorError::NotOwner(owner) => write!(f, "record owned by {}", owner),
            CoordinatorError::Codec(msg) => write!(f, "codec error: {}", msg),
            CoordinatorError::Rejected(msg) => write!(f, "rejected: {}", msg),
            CoordinatorError::Io(e) => write!(f, "IO error: {}", e),
            CoordinatorError::Shutdown => write!(f, "coordinator shut down"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        CoordinatorError::Io(e)
    }
}

impl From<bincode::error::EncodeError> for CoordinatorError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CoordinatorError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoordinatorError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CoordinatorError::Codec(e.to_string())
    }
}

/// Cluster-wide state and messaging used by the broker
#[async_trait]
pub trait Coordinator: Send + Sync {
    fn node_id(&self) -> &str;

    /// CAS store for sessions, nodes and listeners
    fn store(&self) -> &dyn KvStore;

    /// Read-only listing of every record kind
    fn index(&self) -> &dyn QueryIndex;

    /// Install the handler that answers `compute_on_node` requests for
    /// this node
    fn register_handler(&self, handler: Weak<dyn OpHandler>);

    /// Register (or replace) a route owned by this node
    async fn add_route(&self, record: RouterRecord) -> Result<(), CoordinatorError>;

    /// Remove this node's route for `client_id` and `topic`
    async fn remove_route(&self, client_id: &str, topic: &str) -> Result<bool, CoordinatorError>;

    /// Remove every route this node holds for `client_id`
    async fn remove_client_routes(&self, client_id: &str) -> Result<usize, CoordinatorError>;

    /// Routes whose filter matches `topic`, skipping nodes known to be stopped
    fn match_routes(&self, topic: &str) -> Vec<RouterRecord>;

    /// Nodes currently able to serve requests, including this one
    fn live_nodes(&self) -> Vec<String>;

    /// Run `op` on `node_id` and wait for its reply
    async fn compute_on_node(
        &self,
        node_id: &str,
        op: RemoteOp,
    ) -> Result<RemoteReply, CoordinatorError>;

    /// Release cluster resources; called last during node shutdown
    async fn shutdown(&self);
}

/// Rendezvous hash: the node responsible for `key` among `nodes`.
///
/// Every node computes the same answer for the same membership.
pub fn home_node<'a>(key: &str, nodes: &'a [String]) -> Option<&'a str> {
    let hasher = ahash::RandomState::with_seeds(
        0x5f3a_9c21_0d4e_7b61,
        0x13c8_e2a7_94f0_6d35,
        0x7a61_0b9e_c4d2_3f58,
        0x2e94_d17c_6b05_a8f3,
    );
    nodes
        .iter()
        .max_by_key(|node| hasher.hash_one((node.as_str(), key)))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_home_node_is_stable() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let first = home_node("client-1", &nodes);
        assert!(first.is_some());
        assert_eq!(home_node("client-1", &nodes), first);

        let mut reordered = nodes.clone();
        reordered.reverse();
        assert_eq!(home_node("client-1", &reordered), first);
    }

    #[test]
    fn test_home_node_moves_only_when_owner_leaves() {
        let nodes: Vec<String> = (0..5).map(|i| format!("node-{i}")).collect();
        let survivors: Vec<String> = nodes[1..].to_vec();
        for i in 0..50 {
            let key = format!("client-{i}");
            let owner = home_node(&key, &nodes).unwrap();
            if owner != "node-0" {
                assert_eq!(home_node(&key, &survivors), Some(owner));
            }
        }
    }

    #[test]
    fn test_home_node_empty() {
        assert_eq!(home_node("x", &[]), None);
    }
}
