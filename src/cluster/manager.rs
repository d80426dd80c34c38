//! Cluster Coordinator
//!
//! Gossip (chitchat over UDP) carries membership and each node's own
//! records: its node record, listeners, the sessions it owns and its
//! routes. Peer TCP carries typed requests.
//!
//! Session records are written through a home node picked by rendezvous
//! hashing over the live members, so every CAS on a client id is
//! serialized in one place. Node and listener records are written only
//! by the node they describe.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;

use super::index::QueryIndex;
use super::peer::{serve_peer, ClusterPeer};
use super::records::{
    ListenerRecord, NodeRecord, NodeStatus, Record, RecordKey, RouterRecord, SessionRecord,
    VersionedRecord,
};
use super::routes::RouteTable;
use super::rpc::{KvRequest, KvResponse, OpHandler, RemoteOp, RemoteReply};
use super::store::{CasOutcome, KvStore, MemoryStore};
use super::{home_node, Coordinator, CoordinatorError};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_NODE: &str = "node";
const KEY_LISTENERS: &str = "listeners";
const KEY_SESSIONS: &str = "sessions";
const KEY_ROUTES: &str = "routes";

/// One node's gossip state, copied out of chitchat
#[derive(Debug, Clone, Default)]
struct GossipEntry {
    node_id: String,
    values: HashMap<String, String>,
}

impl GossipEntry {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Records learned from other nodes' gossip state
#[derive(Default)]
struct ClusterView {
    nodes: BTreeMap<String, NodeRecord>,
    listeners: BTreeMap<String, Vec<ListenerRecord>>,
    sessions: BTreeMap<String, Vec<SessionRecord>>,
    /// Remote nodes the failure detector considers alive
    live: BTreeSet<String>,
    /// Last routes value seen per node, to skip unchanged rebuilds
    routes_raw: HashMap<String, String>,
}

struct Inner {
    node_id: String,
    config: ClusterConfig,
    /// Own node and listener records, plus the session records this node
    /// is home for
    home: MemoryStore,
    /// Session records naming this node as owner
    owned_sessions: DashMap<String, SessionRecord>,
    local_routes: RouteTable,
    remote_routes: RouteTable,
    view: RwLock<ClusterView>,
    peers: DashMap<String, Arc<ClusterPeer>>,
    handler: RwLock<Option<Weak<dyn OpHandler>>>,
    /// Own records changed since the last gossip publish
    dirty: AtomicBool,
}

/// Coordinator for multi-node deployments
pub struct ClusterCoordinator {
    inner: Arc<Inner>,
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    chitchat_handle: Mutex<Option<ChitchatHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// Join the cluster: start gossip, bind the peer listener and spawn the
    /// background loops
    pub async fn start(node_id: String, config: ClusterConfig) -> Result<Self, CoordinatorError> {
        let gossip_advertise_addr = config.get_gossip_advertise_addr();
        let peer_advertise_addr = config.get_peer_advertise_addr();

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            node_id, gossip_advertise_addr, peer_advertise_addr
        );

        // Generation distinguishes restarts of the same node id
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let chitchat_id = ChitchatId::new(node_id.clone(), generation, gossip_advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "stuartmq".to_string(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string()),
            (KEY_ROUTES.to_string(), "[]".to_string()),
            (KEY_SESSIONS.to_string(), "[]".to_string()),
            (KEY_LISTENERS.to_string(), "[]".to_string()),
        ];

        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| CoordinatorError::Rejected(format!("gossip: {}", e)))?;

        let listener = TcpListener::bind(config.peer_addr).await?;
        info!(
            "Cluster coordinator listening on gossip={}, peer={}",
            config.gossip_addr, config.peer_addr
        );

        let inner = Arc::new(Inner::new(node_id, config));
        let chitchat = handle.chitchat();

        let accept = tokio::spawn(peer_listener_loop(listener, inner.clone()));
        let gossip = tokio::spawn(gossip_watcher_loop(inner.clone(), chitchat.clone()));

        Ok(Self {
            inner,
            chitchat,
            chitchat_handle: Mutex::new(Some(handle)),
            tasks: Mutex::new(vec![accept, gossip]),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }
}

impl Inner {
    fn new(node_id: String, config: ClusterConfig) -> Self {
        Self {
            node_id,
            config,
            home: MemoryStore::new(),
            owned_sessions: DashMap::new(),
            local_routes: RouteTable::new(),
            remote_routes: RouteTable::new(),
            view: RwLock::new(ClusterView::default()),
            peers: DashMap::new(),
            handler: RwLock::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    /// Live members able to own records, including this node
    fn live_nodes(&self) -> Vec<String> {
        let view = self.view.read();
        let mut nodes: Vec<String> = view
            .live
            .iter()
            .filter(|id| {
                view.nodes
                    .get(*id)
                    .is_some_and(|n| n.status != NodeStatus::Stopped)
            })
            .cloned()
            .collect();
        nodes.push(self.node_id.clone());
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn home_for(&self, client_id: &str) -> String {
        let nodes = self.live_nodes();
        home_node(client_id, &nodes)
            .unwrap_or(&self.node_id)
            .to_string()
    }

    fn node_is_routable(&self, node_id: &str) -> bool {
        if node_id == self.node_id {
            return true;
        }
        let view = self.view.read();
        view.live.contains(node_id)
            && view
                .nodes
                .get(node_id)
                .map_or(true, |n| n.status.accepts_routes())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn forget_session(&self, client_id: &str) {
        if self.owned_sessions.remove(client_id).is_some() {
            debug!("Session '{}' now owned elsewhere", client_id);
            self.mark_dirty();
        }
    }

    /// Send `op` to `node_id`; requests to self are answered in place
    async fn request(&self, node_id: &str, op: RemoteOp) -> Result<RemoteReply, CoordinatorError> {
        if node_id == self.node_id {
            return Ok(self.handle(op).await);
        }
        let peer = self
            .peers
            .get(node_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| CoordinatorError::Unreachable(node_id.to_string()))?;
        peer.request(op, self.config.rpc_timeout).await
    }

    async fn session_get(&self, key: &RecordKey, client_id: &str) -> Result<Option<VersionedRecord>, CoordinatorError> {
        let home = self.home_for(client_id);
        let current = if home == self.node_id {
            self.home.get_sync(key)
        } else {
            match self.request(&home, RemoteOp::Kv(KvRequest::Get(key.clone()))).await? {
                RemoteReply::Kv(KvResponse::Record(record)) => record,
                other => return Err(unexpected_reply(&other)),
            }
        };

        if let Some(session) = current.as_ref().and_then(|v| v.record.as_session()) {
            if session.node_id != self.node_id {
                self.forget_session(client_id);
            }
        }
        Ok(current)
    }

    async fn session_cas(
        &self,
        key: &RecordKey,
        client_id: &str,
        expected: Option<u64>,
        new: Option<Record>,
    ) -> Result<CasOutcome, CoordinatorError> {
        let home = self.home_for(client_id);
        let outcome = if home == self.node_id {
            self.home.cas_sync(key, expected, new.clone())?
        } else {
            let request = KvRequest::Cas {
                key: key.clone(),
                expected,
                new: new.clone(),
            };
            match self.request(&home, RemoteOp::Kv(request)).await? {
                RemoteReply::Kv(KvResponse::Cas(outcome)) => outcome,
                RemoteReply::Error(msg) => return Err(CoordinatorError::Rejected(msg)),
                other => return Err(unexpected_reply(&other)),
            }
        };

        match &outcome {
            CasOutcome::Applied { .. } => {
                match new.as_ref().and_then(Record::as_session) {
                    Some(session) if session.node_id == self.node_id => {
                        self.owned_sessions
                            .insert(client_id.to_string(), session.clone());
                        self.mark_dirty();
                    }
                    _ => self.forget_session(client_id),
                }
            }
            CasOutcome::Conflict { current } => {
                if let Some(session) = current.as_ref().and_then(|v| v.record.as_session()) {
                    if session.node_id != self.node_id {
                        self.forget_session(client_id);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Read-only view of a record owned by another node
    fn remote_record(&self, key: &RecordKey) -> Option<VersionedRecord> {
        let view = self.view.read();
        let record = match key {
            RecordKey::Node(id) => view.nodes.get(id).cloned().map(Record::Node),
            RecordKey::Listener {
                node_id,
                protocol,
                bind,
            } => view
                .listeners
                .get(node_id)
                .and_then(|ls| {
                    ls.iter()
                        .find(|l| l.protocol == *protocol && l.bind == *bind)
                        .cloned()
                })
                .map(Record::Listener),
            RecordKey::Session(_) => None,
        };
        record.map(|record| VersionedRecord { version: 0, record })
    }

    fn owner_of(&self, key: &RecordKey) -> Option<String> {
        match key {
            RecordKey::Node(id) => Some(id.clone()),
            RecordKey::Listener { node_id, .. } => Some(node_id.clone()),
            RecordKey::Session(_) => None,
        }
    }

    /// Own records as gossip key/values
    fn gossip_values(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let own = self.home.records();
        let mut values = Vec::with_capacity(4);

        if let Some(node) = own
            .iter()
            .filter_map(|v| v.record.as_node())
            .find(|n| n.node_id == self.node_id)
        {
            values.push((KEY_NODE.to_string(), serde_json::to_string(node)?));
        }

        let listeners: Vec<&ListenerRecord> = own
            .iter()
            .filter_map(|v| v.record.as_listener())
            .filter(|l| l.node_id == self.node_id)
            .collect();
        values.push((KEY_LISTENERS.to_string(), serde_json::to_string(&listeners)?));

        let mut sessions: Vec<SessionRecord> = self
            .owned_sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        values.push((KEY_SESSIONS.to_string(), serde_json::to_string(&sessions)?));

        let routes = self.local_routes.node_records(&self.node_id);
        values.push((KEY_ROUTES.to_string(), serde_json::to_string(&routes)?));

        Ok(values)
    }

    /// Re-register owned sessions with their (possibly new) home nodes and
    /// drop home records this node is no longer responsible for
    async fn reassert_sessions(&self) {
        let owned: Vec<SessionRecord> = self
            .owned_sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for record in owned {
            let key = RecordKey::session(&record.client_id);
            match self.session_get(&key, &record.client_id).await {
                Ok(None) => {
                    let result = self
                        .session_cas(&key, &record.client_id, None, Some(Record::Session(record.clone())))
                        .await;
                    if let Err(e) = result {
                        warn!("Cluster: re-asserting session '{}' failed: {}", record.client_id, e);
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!("Cluster: re-asserting session '{}' failed: {}", record.client_id, e);
                }
            }
        }

        for versioned in self.home.records() {
            let Some(session) = versioned.record.as_session() else {
                continue;
            };
            if self.home_for(&session.client_id) != self.node_id {
                let key = RecordKey::session(&session.client_id);
                let _ = self.home.cas_sync(&key, Some(versioned.version), None);
            }
        }
    }

    /// Fold one gossip snapshot into the view. Returns peers to stop.
    fn apply_gossip(&self, entries: &[GossipEntry], live: &BTreeSet<String>) -> Vec<Arc<ClusterPeer>> {
        let mut stopped = Vec::new();
        let mut present = BTreeSet::new();
        let mut view = self.view.write();

        for node_state in entries {
            let node_id = node_state.node_id.clone();
            if node_id == self.node_id {
                continue;
            }
            present.insert(node_id.clone());
            let alive = live.contains(&node_id);

            if alive && !self.peers.contains_key(&node_id) {
                if let Some(peer_addr) = node_state
                    .get(KEY_PEER_ADDR)
                    .and_then(|s| s.parse::<SocketAddr>().ok())
                {
                    info!("Discovered new cluster peer: {} at {}", node_id, peer_addr);
                    let peer = ClusterPeer::spawn(node_id.clone(), peer_addr, self.node_id.clone());
                    self.peers.insert(node_id.clone(), peer);
                }
            }

            if let Some(json) = node_state.get(KEY_NODE) {
                match serde_json::from_str::<NodeRecord>(json) {
                    Ok(mut record) => {
                        if !alive {
                            record.status = NodeStatus::Stopped;
                        }
                        view.nodes.insert(node_id.clone(), record);
                    }
                    Err(e) => warn!("Cluster: bad node record from '{}': {}", node_id, e),
                }
            }
            if let Some(json) = node_state.get(KEY_LISTENERS) {
                if let Ok(listeners) = serde_json::from_str::<Vec<ListenerRecord>>(json) {
                    view.listeners.insert(node_id.clone(), listeners);
                }
            }
            if let Some(json) = node_state.get(KEY_SESSIONS) {
                if let Ok(sessions) = serde_json::from_str::<Vec<SessionRecord>>(json) {
                    view.sessions.insert(node_id.clone(), sessions);
                }
            }

            if alive {
                if let Some(json) = node_state.get(KEY_ROUTES) {
                    if view.routes_raw.get(&node_id).map(String::as_str) != Some(json) {
                        match serde_json::from_str::<Vec<RouterRecord>>(json) {
                            Ok(routes) => {
                                debug!("Cluster: {} routes from '{}'", routes.len(), node_id);
                                self.remote_routes.replace_node(&node_id, routes);
                                view.routes_raw.insert(node_id.clone(), json.to_string());
                            }
                            Err(e) => warn!("Cluster: bad routes from '{}': {}", node_id, e),
                        }
                    }
                }
            } else if view.routes_raw.remove(&node_id).is_some() {
                info!("Cluster peer '{}' is unreachable; excluding its routes", node_id);
                self.remote_routes.remove_node(&node_id);
            }

            if !alive {
                if let Some((_, peer)) = self.peers.remove(&node_id) {
                    stopped.push(peer);
                }
            }
        }

        // Nodes gone from gossip state entirely
        let departed: Vec<String> = view
            .nodes
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for node_id in departed {
            info!("Cluster peer '{}' left the cluster", node_id);
            if let Some(record) = view.nodes.get_mut(&node_id) {
                record.status = NodeStatus::Stopped;
            }
            view.sessions.remove(&node_id);
            view.listeners.remove(&node_id);
            view.routes_raw.remove(&node_id);
            self.remote_routes.remove_node(&node_id);
            if let Some((_, peer)) = self.peers.remove(&node_id) {
                stopped.push(peer);
            }
        }

        view.live = live.iter().filter(|id| **id != self.node_id).cloned().collect();
        stopped
    }
}

/// Push own records into gossip state
async fn publish(inner: &Inner, chitchat: &tokio::sync::Mutex<Chitchat>) {
    inner.dirty.store(false, Ordering::Release);
    let values = match inner.gossip_values() {
        Ok(values) => values,
        Err(e) => {
            error!("Cluster: failed to encode gossip state: {}", e);
            return;
        }
    };

    let mut cc = chitchat.lock().await;
    let state = cc.self_node_state();
    for (key, value) in values {
        state.set(key, value);
    }
    debug!("Cluster: gossip state published");
}

fn unexpected_reply(reply: &RemoteReply) -> CoordinatorError {
    match reply {
        RemoteReply::Error(msg) => CoordinatorError::Rejected(msg.clone()),
        other => CoordinatorError::Codec(format!("unexpected reply {:?}", other)),
    }
}

#[async_trait]
impl OpHandler for Inner {
    async fn handle(&self, op: RemoteOp) -> RemoteReply {
        match op {
            RemoteOp::Kv(KvRequest::Get(key)) => {
                RemoteReply::Kv(KvResponse::Record(self.home.get_sync(&key)))
            }
            RemoteOp::Kv(KvRequest::Cas { key, expected, new }) => {
                match self.home.cas_sync(&key, expected, new) {
                    Ok(outcome) => RemoteReply::Kv(KvResponse::Cas(outcome)),
                    Err(e) => RemoteReply::Error(e.to_string()),
                }
            }
            op => {
                let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
                match handler {
                    Some(handler) => handler.handle(op).await,
                    None => RemoteReply::Error("node is not serving requests".into()),
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for Inner {
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>, CoordinatorError> {
        match key {
            RecordKey::Session(client_id) => self.session_get(key, client_id).await,
            _ if self.owner_of(key).as_deref() == Some(self.node_id.as_str()) => {
                Ok(self.home.get_sync(key))
            }
            _ => Ok(self.remote_record(key)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &RecordKey,
        expected: Option<u64>,
        new: Option<Record>,
    ) -> Result<CasOutcome, CoordinatorError> {
        match key {
            RecordKey::Session(client_id) => {
                self.session_cas(key, client_id, expected, new).await
            }
            _ => match self.owner_of(key) {
                Some(owner) if owner == self.node_id => {
                    let outcome = self.home.cas_sync(key, expected, new)?;
                    if outcome.is_applied() {
                        self.mark_dirty();
                    }
                    Ok(outcome)
                }
                Some(owner) => Err(CoordinatorError::NotOwner(owner)),
                None => Err(CoordinatorError::Rejected("unowned key".into())),
            },
        }
    }
}

impl QueryIndex for Inner {
    fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: BTreeMap<String, NodeRecord> = self.view.read().nodes.clone();
        for versioned in self.home.records() {
            if let Some(node) = versioned.record.as_node() {
                nodes.insert(node.node_id.clone(), node.clone());
            }
        }
        nodes.into_values().collect()
    }

    fn listeners(&self, node_id: Option<&str>) -> Vec<ListenerRecord> {
        let mut listeners: Vec<ListenerRecord> = self
            .home
            .records()
            .into_iter()
            .filter_map(|v| v.record.as_listener().cloned())
            .collect();
        listeners.extend(self.view.read().listeners.values().flatten().cloned());
        listeners.retain(|l| node_id.map_or(true, |n| l.node_id == n));
        listeners.sort_by(|a, b| {
            (&a.node_id, &a.protocol, &a.bind).cmp(&(&b.node_id, &b.protocol, &b.bind))
        });
        listeners
    }

    fn all_sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .owned_sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.extend(self.view.read().sessions.values().flatten().cloned());
        sessions.sort_by(|a, b| (&a.client_id, &a.node_id).cmp(&(&b.client_id, &b.node_id)));
        sessions
    }

    fn all_routes(&self) -> Vec<RouterRecord> {
        let mut routes = self.local_routes.records();
        routes.extend(self.remote_routes.records());
        routes.sort_by(|a, b| {
            (&a.client_id, &a.topic, &a.node_id).cmp(&(&b.client_id, &b.topic, &b.node_id))
        });
        routes
    }
}

/// Listen for incoming peer connections
async fn peer_listener_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Incoming cluster peer connection from {}", addr);
                let handler: Arc<dyn OpHandler> = inner.clone();
                let node_id = inner.node_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, node_id, handler).await {
                        debug!("Incoming peer connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept peer connection: {}", e);
            }
        }
    }
}

/// Track membership and peers' records; publish own records when changed
async fn gossip_watcher_loop(inner: Arc<Inner>, chitchat: Arc<tokio::sync::Mutex<Chitchat>>) {
    let mut known_live: BTreeSet<String> = BTreeSet::new();

    loop {
        tokio::time::sleep(inner.config.gossip_interval).await;

        let (entries, live) = {
            let cc = chitchat.lock().await;
            let live: BTreeSet<String> = cc.live_nodes().map(|id| id.node_id.clone()).collect();
            let entries: Vec<GossipEntry> = cc
                .state_snapshot()
                .node_states
                .iter()
                .map(|node_state| GossipEntry {
                    node_id: node_state.chitchat_id().node_id.clone(),
                    values: [KEY_PEER_ADDR, KEY_NODE, KEY_LISTENERS, KEY_SESSIONS, KEY_ROUTES]
                        .iter()
                        .filter_map(|key| {
                            node_state.get(key).map(|v| (key.to_string(), v.to_string()))
                        })
                        .collect(),
                })
                .collect();
            (entries, live)
        };

        let stopped = inner.apply_gossip(&entries, &live);
        for peer in stopped {
            peer.stop().await;
        }

        let live_now: BTreeSet<String> = inner.live_nodes().into_iter().collect();
        if live_now != known_live {
            info!("Cluster membership: {:?}", live_now);
            known_live = live_now;
            inner.reassert_sessions().await;
        }

        if inner.dirty.load(Ordering::Acquire) {
            publish(&inner, &chitchat).await;
        }
    }
}

#[async_trait]
impl Coordinator for ClusterCoordinator {
    fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    fn store(&self) -> &dyn KvStore {
        self.inner.as_ref()
    }

    fn index(&self) -> &dyn QueryIndex {
        self.inner.as_ref()
    }

    fn register_handler(&self, handler: Weak<dyn OpHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    async fn add_route(&self, record: RouterRecord) -> Result<(), CoordinatorError> {
        if record.node_id != self.inner.node_id {
            return Err(CoordinatorError::NotOwner(record.node_id));
        }
        if self.inner.local_routes.add(record) {
            self.inner.mark_dirty();
        }
        Ok(())
    }

    async fn remove_route(&self, client_id: &str, topic: &str) -> Result<bool, CoordinatorError> {
        let removed = self
            .inner
            .local_routes
            .remove(&self.inner.node_id, client_id, topic)
            .is_some();
        if removed {
            self.inner.mark_dirty();
        }
        Ok(removed)
    }

    async fn remove_client_routes(&self, client_id: &str) -> Result<usize, CoordinatorError> {
        let removed = self
            .inner
            .local_routes
            .remove_client(client_id, Some(&self.inner.node_id))
            .len();
        if removed > 0 {
            self.inner.mark_dirty();
        }
        Ok(removed)
    }

    fn match_routes(&self, topic: &str) -> Vec<RouterRecord> {
        let mut routes = self.inner.local_routes.matches(topic);
        routes.extend(
            self.inner
                .remote_routes
                .matches(topic)
                .into_iter()
                .filter(|r| self.inner.node_is_routable(&r.node_id)),
        );
        routes
    }

    fn live_nodes(&self) -> Vec<String> {
        self.inner.live_nodes()
    }

    async fn compute_on_node(
        &self,
        node_id: &str,
        op: RemoteOp,
    ) -> Result<RemoteReply, CoordinatorError> {
        self.inner.request(node_id, op).await
    }

    async fn shutdown(&self) {
        info!("Stopping cluster coordinator");

        // Give the final node status one gossip round to spread
        publish(&self.inner, &self.chitchat).await;
        tokio::time::sleep(self.inner.config.gossip_interval * 2).await;

        let peers: Vec<Arc<ClusterPeer>> = self
            .inner
            .peers
            .iter()
            .map(|p| p.value().clone())
            .collect();
        for peer in peers {
            peer.stop().await;
        }
        self.inner.peers.clear();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Chitchat stops when its handle is dropped
        drop(self.chitchat_handle.lock().take());
    }
}
