//! In-process coordinator
//!
//! A [`LocalCluster`] is a shared store, route table and handler registry.
//! Every broker built from one of its [`LocalCoordinator`]s sees the same
//! records, and `compute_on_node` is a direct call into the target
//! broker's handler. A standalone node is a cluster of one.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::index::QueryIndex;
use super::records::{
    ListenerRecord, NodeRecord, NodeStatus, Record, RecordKey, RouterRecord, SessionRecord,
};
use super::routes::RouteTable;
use super::rpc::{KvRequest, KvResponse, OpHandler, RemoteOp, RemoteReply};
use super::store::{KvStore, MemoryStore};
use super::{Coordinator, CoordinatorError};

type Handlers = DashMap<String, Weak<dyn OpHandler>>;

#[derive(Clone, Default)]
pub struct LocalCluster {
    store: Arc<MemoryStore>,
    routes: Arc<RouteTable>,
    handlers: Arc<Handlers>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator for a member node
    pub fn coordinator(&self, node_id: &str) -> Arc<LocalCoordinator> {
        Arc::new(LocalCoordinator {
            node_id: node_id.to_string(),
            store: self.store.clone(),
            routes: self.routes.clone(),
            handlers: self.handlers.clone(),
        })
    }

    /// Simulate a crash: the node stops answering and is marked Stopped
    pub fn fail_node(&self, node_id: &str) {
        self.handlers.remove(node_id);
        mark_stopped(&self.store, node_id);
        info!("Node '{}' marked stopped", node_id);
    }
}

fn mark_stopped(store: &MemoryStore, node_id: &str) {
    let key = RecordKey::node(node_id);
    loop {
        let Some(current) = store.get_sync(&key) else {
            return;
        };
        let Some(node) = current.record.as_node() else {
            return;
        };
        let mut node = node.clone();
        node.status = NodeStatus::Stopped;
        match store.cas_sync(&key, Some(current.version), Some(Record::Node(node))) {
            Ok(outcome) if outcome.is_applied() => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

pub struct LocalCoordinator {
    node_id: String,
    store: Arc<MemoryStore>,
    routes: Arc<RouteTable>,
    handlers: Arc<Handlers>,
}

impl LocalCoordinator {
    /// Coordinator for a single node with no peers
    pub fn standalone(node_id: &str) -> Arc<Self> {
        LocalCluster::new().coordinator(node_id)
    }

    fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.store
            .get_sync(&RecordKey::node(node_id))
            .and_then(|v| v.record.as_node().map(|n| n.status))
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    fn index(&self) -> &dyn QueryIndex {
        self
    }

    fn register_handler(&self, handler: Weak<dyn OpHandler>) {
        self.handlers.insert(self.node_id.clone(), handler);
    }

    async fn add_route(&self, record: RouterRecord) -> Result<(), CoordinatorError> {
        if record.node_id != self.node_id {
            return Err(CoordinatorError::NotOwner(record.node_id));
        }
        self.routes.add(record);
        Ok(())
    }

    async fn remove_route(&self, client_id: &str, topic: &str) -> Result<bool, CoordinatorError> {
        Ok(self.routes.remove(&self.node_id, client_id, topic).is_some())
    }

    async fn remove_client_routes(&self, client_id: &str) -> Result<usize, CoordinatorError> {
        Ok(self
            .routes
            .remove_client(client_id, Some(&self.node_id))
            .len())
    }

    fn match_routes(&self, topic: &str) -> Vec<RouterRecord> {
        self.routes
            .matches(topic)
            .into_iter()
            .filter(|r| {
                r.node_id == self.node_id
                    || self.node_status(&r.node_id).map_or(true, NodeStatus::accepts_routes)
            })
            .collect()
    }

    fn live_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .filter(|id| self.node_status(id) != Some(NodeStatus::Stopped))
            .collect();
        if !nodes.contains(&self.node_id) {
            nodes.push(self.node_id.clone());
        }
        nodes.sort();
        nodes
    }

    async fn compute_on_node(
        &self,
        node_id: &str,
        op: RemoteOp,
    ) -> Result<RemoteReply, CoordinatorError> {
        if let RemoteOp::Kv(request) = op {
            let response = match request {
                KvRequest::Get(key) => KvResponse::Record(self.store.get_sync(&key)),
                KvRequest::Cas { key, expected, new } => {
                    KvResponse::Cas(self.store.cas_sync(&key, expected, new)?)
                }
            };
            return Ok(RemoteReply::Kv(response));
        }

        let handler = self
            .handlers
            .get(node_id)
            .and_then(|h| h.value().upgrade())
            .ok_or_else(|| CoordinatorError::Unreachable(node_id.to_string()))?;
        debug!("compute_on_node {} -> {}", op.name(), node_id);
        Ok(handler.handle(op).await)
    }

    async fn shutdown(&self) {
        self.handlers.remove(&self.node_id);
    }
}

impl QueryIndex for LocalCoordinator {
    fn nodes(&self) -> Vec<NodeRecord> {
        self.store
            .records()
            .into_iter()
            .filter_map(|v| v.record.as_node().cloned())
            .collect()
    }

    fn listeners(&self, node_id: Option<&str>) -> Vec<ListenerRecord> {
        self.store
            .records()
            .into_iter()
            .filter_map(|v| v.record.as_listener().cloned())
            .filter(|l| node_id.map_or(true, |n| l.node_id == n))
            .collect()
    }

    fn all_sessions(&self) -> Vec<SessionRecord> {
        self.store
            .records()
            .into_iter()
            .filter_map(|v| v.record.as_session().cloned())
            .collect()
    }

    fn all_routes(&self) -> Vec<RouterRecord> {
        self.routes.records()
    }
}
