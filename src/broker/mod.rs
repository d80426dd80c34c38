//! MQTT Broker Core
//!
//! A [`Broker`] is one cluster node: it binds the configured listeners,
//! runs a task per client connection, routes publishes through the
//! coordinator's route table and answers requests from peer nodes.
//!
//! ```ignore
//! let broker = Broker::new(config, coordinator, auth, metrics);
//! broker.start().await?;
//! tokio::signal::ctrl_c().await?;
//! broker.shutdown().await;
//! ```

mod connection;
mod listener;
mod node;
mod router;
mod takeover;
pub mod tls;

pub use connection::{Connection, ConnectionError};
pub use listener::{ConnectionSlot, Listener};
pub use router::MessageRouter;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthService;
use crate::cluster::{
    ConnectionInfo, ConnectionsPage, Coordinator, CoordinatorError, ListenerRecord, NodeStatus,
    OpHandler, Record, RemoteOp, RemoteReply, RuntimeSnapshot,
};
use crate::config::{Config, ListenerConfig, ListenerProtocol};
use crate::metrics::Metrics;
use crate::protocol::QoS;
use crate::retained::RetainedStore;
use crate::session::{unix_millis, SessionStore};
use connection::Control;
use tls::TlsError;

/// Time allowed for live connections to close during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Broker lifecycle errors
#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    Tls(TlsError),
    Coordinator(CoordinatorError),
    /// Another process holds this node id
    NodeActive(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Tls(e) => write!(f, "TLS error: {}", e),
            BrokerError::Coordinator(e) => write!(f, "Coordinator error: {}", e),
            BrokerError::NodeActive(node) => write!(f, "Node {} is already active", node),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<TlsError> for BrokerError {
    fn from(e: TlsError) -> Self {
        BrokerError::Tls(e)
    }
}

impl From<CoordinatorError> for BrokerError {
    fn from(e: CoordinatorError) -> Self {
        BrokerError::Coordinator(e)
    }
}

/// A live connection as seen by the rest of the node
pub(crate) struct ConnectionHandle {
    pub epoch: u64,
    pub control: mpsc::UnboundedSender<Control>,
    pub info: ConnectionInfo,
}

/// The MQTT Broker
pub struct Broker {
    pub(crate) config: Arc<Config>,
    pub(crate) node_id: String,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) auth: Arc<dyn AuthService>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) retained: Arc<RetainedStore>,
    pub(crate) router: MessageRouter,
    /// Live connections by client id
    pub(crate) connections: DashMap<Arc<str>, ConnectionHandle>,
    instance_id: String,
    max_qos: QoS,
    status: Mutex<NodeStatus>,
    runtime: Mutex<RuntimeSnapshot>,
    listeners: RwLock<Vec<Arc<Listener>>>,
    next_epoch: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(
        config: Config,
        coordinator: Arc<dyn Coordinator>,
        auth: Arc<dyn AuthService>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let max_qos = QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
        let sessions = Arc::new(SessionStore::new(config.limits.max_queued_messages));
        let retained = Arc::new(RetainedStore::new());
        let router = MessageRouter::new(
            coordinator.clone(),
            sessions.clone(),
            retained.clone(),
            metrics.clone(),
            max_qos,
            config.mqtt.retain_available,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            node_id: coordinator.node_id().to_string(),
            config: Arc::new(config),
            coordinator,
            auth,
            metrics,
            sessions,
            retained,
            router,
            connections: DashMap::new(),
            instance_id: Uuid::new_v4().to_string(),
            max_qos,
            status: Mutex::new(NodeStatus::Stopped),
            runtime: Mutex::new(node::sample_runtime()),
            listeners: RwLock::new(Vec::new()),
            next_epoch: AtomicU64::new(unix_millis().saturating_mul(1000).max(1)),
            shutdown_tx,
            accept_tasks: Mutex::new(Vec::new()),
            sampler: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn max_qos(&self) -> QoS {
        self.max_qos
    }

    /// New connections are admitted only while the node is running
    pub(crate) fn is_accepting(&self) -> bool {
        self.status() == NodeStatus::Running && !*self.shutdown_tx.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `handle` the live connection of `client_id`.
    ///
    /// Returns the handle it displaced, or the epoch of a newer connection
    /// already registered under the id.
    pub(crate) fn register_connection(
        &self,
        client_id: Arc<str>,
        handle: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, u64> {
        match self.connections.entry(client_id) {
            Entry::Occupied(mut current) => {
                if current.get().epoch > handle.epoch {
                    return Err(current.get().epoch);
                }
                Ok(Some(current.insert(handle)))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(None)
            }
        }
    }

    /// Bound address of the first listener speaking `protocol`
    pub fn local_addr(&self, protocol: ListenerProtocol) -> Option<SocketAddr> {
        self.listeners
            .read()
            .iter()
            .find(|l| l.protocol() == protocol)
            .map(|l| l.local_addr())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Bind listeners and announce the node to the cluster
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        let handler: Arc<dyn OpHandler> = self.clone();
        self.coordinator.register_handler(Arc::downgrade(&handler));

        self.register_node().await?;

        let configs = self.config.listeners.clone();
        for config in &configs {
            self.bind_listener(config).await?;
        }

        self.set_status(NodeStatus::Running).await?;

        let broker = self.clone();
        *self.sampler.lock() = Some(tokio::spawn(async move {
            broker.run_sampler().await;
        }));

        info!(
            "Node {} running with {} listener(s)",
            self.node_id,
            self.listeners.read().len()
        );
        Ok(())
    }

    async fn bind_listener(self: &Arc<Self>, config: &ListenerConfig) -> Result<(), BrokerError> {
        let tls = if config.protocol.is_tls() {
            let tls_config = config.tls.as_ref().ok_or_else(|| {
                TlsError::Config(format!("{} listener on {} needs [tls]", config.protocol, config.bind))
            })?;
            Some(tls::acceptor(tls_config)?)
        } else {
            None
        };

        let socket = TcpListener::bind(config.bind).await?;
        let bound = socket.local_addr()?;
        let listener = Arc::new(Listener::new(config, bound, self.metrics.clone()));

        self.put_record(Record::Listener(listener.record(&self.node_id)))
            .await?;
        self.listeners.write().push(listener.clone());

        let task = tokio::spawn(listener::accept_loop(
            self.clone(),
            listener,
            socket,
            tls,
            self.shutdown_signal(),
        ));
        self.accept_tasks.lock().push(task);
        Ok(())
    }

    /// Stop accepting, close every connection and leave the cluster
    pub async fn shutdown(&self) {
        if !matches!(self.status(), NodeStatus::Running | NodeStatus::Starting) {
            return;
        }
        info!("Node {} shutting down", self.node_id);

        if let Err(e) = self.set_status(NodeStatus::Stopping).await {
            warn!("Failed to mark node stopping: {}", e);
        }
        if let Some(sampler) = self.sampler.lock().take() {
            sampler.abort();
        }

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.accept_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_connections() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.active_connections();
        if remaining > 0 {
            warn!("{} connection(s) still open after {:?}", remaining, SHUTDOWN_GRACE);
        }

        self.publish_listener_records().await;
        if let Err(e) = self.set_status(NodeStatus::Stopped).await {
            warn!("Failed to mark node stopped: {}", e);
        }
        self.coordinator.shutdown().await;
        info!("Node {} stopped", self.node_id);
    }

    fn active_connections(&self) -> usize {
        self.listeners.read().iter().map(|l| l.connections()).sum()
    }

    pub(crate) fn listener_records(&self) -> Vec<ListenerRecord> {
        self.listeners
            .read()
            .iter()
            .map(|l| l.record(&self.node_id))
            .collect()
    }

    /// Local connections ordered by client id
    pub fn connections_page(&self, offset: usize, limit: usize) -> ConnectionsPage {
        let mut connections: Vec<ConnectionInfo> =
            self.connections.iter().map(|h| h.info.clone()).collect();
        connections.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let total = connections.len();
        ConnectionsPage {
            total,
            connections: connections.into_iter().skip(offset).take(limit).collect(),
        }
    }

    fn refresh_gauges(&self) {
        self.metrics.set_sessions(self.sessions.len());
        self.metrics
            .set_subscriptions(self.sessions.subscription_count());
        self.metrics.set_topics(self.retained.len());
    }
}

#[async_trait]
impl OpHandler for Broker {
    async fn handle(&self, op: RemoteOp) -> RemoteReply {
        match op {
            RemoteOp::NodeInfo => RemoteReply::NodeInfo(self.node_record(self.status())),
            RemoteOp::NodeMetrics => RemoteReply::NodeMetrics(self.metrics.snapshot()),
            RemoteOp::Connections { offset, limit } => {
                RemoteReply::Connections(self.connections_page(offset, limit))
            }
            RemoteOp::Listeners => RemoteReply::Listeners(self.listener_records()),
            RemoteOp::Deliver { message, targets } => {
                let publish = message.to_publish();
                let accepted = self.router.deliver_local(
                    &publish,
                    targets.iter().map(|t| (t.client_id.as_str(), t.qos)),
                );
                RemoteReply::Delivered { accepted }
            }
            RemoteOp::Takeover { client_id, discard } => {
                RemoteReply::Takeover(self.take_over_local(&client_id, discard).await)
            }
            RemoteOp::Retain { message } => {
                self.router.apply_retained(&message);
                RemoteReply::Retained
            }
            RemoteOp::Kv(_) => {
                RemoteReply::Error("store requests are served by the coordinator".to_string())
            }
        }
    }
}
