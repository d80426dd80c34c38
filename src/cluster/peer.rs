//! Cluster Peer
//!
//! Outgoing request channel to one other node, plus the accept side that
//! serves requests arriving from peers. Requests and responses are matched
//! by id on the same connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::protocol::{frame_message, take_frame, ClusterMessage, CLUSTER_PROTOCOL_VERSION};
use super::rpc::{OpHandler, RemoteOp, RemoteReply};
use super::CoordinatorError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next reconnect attempt
    Backoff,
}

#[derive(Debug)]
enum PeerCommand {
    Send(ClusterMessage),
    Shutdown,
}

type Pending = DashMap<u64, oneshot::Sender<RemoteReply>>;

/// A connection to another cluster node
pub struct ClusterPeer {
    node_id: String,
    peer_addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    command_tx: mpsc::Sender<PeerCommand>,
    pending: Arc<Pending>,
    next_request_id: AtomicU64,
}

impl ClusterPeer {
    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(node_id: String, peer_addr: SocketAddr, local_node_id: String) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(1000);
        let peer = Arc::new(Self {
            node_id: node_id.clone(),
            peer_addr,
            status: Arc::new(RwLock::new(PeerStatus::Disconnected)),
            command_tx,
            pending: Arc::new(DashMap::new()),
            next_request_id: AtomicU64::new(1),
        });

        let status = peer.status.clone();
        let pending = peer.pending.clone();
        tokio::spawn(async move {
            connection_loop(node_id, local_node_id, peer_addr, status, command_rx, pending).await;
        });

        peer
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Send `op` and wait for the peer's reply
    pub async fn request(
        &self,
        op: RemoteOp,
        timeout: Duration,
    ) -> Result<RemoteReply, CoordinatorError> {
        if self.status() != PeerStatus::Connected {
            return Err(CoordinatorError::Unreachable(self.node_id.clone()));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let sent = self
            .command_tx
            .send(PeerCommand::Send(ClusterMessage::Request { request_id, op }))
            .await;
        if sent.is_err() {
            self.pending.remove(&request_id);
            return Err(CoordinatorError::Unreachable(self.node_id.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CoordinatorError::Unreachable(self.node_id.clone())),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(CoordinatorError::Timeout)
            }
        }
    }

    pub async fn stop(&self) {
        let _ = self.command_tx.send(PeerCommand::Shutdown).await;
        info!("ClusterPeer '{}': Stopped", self.node_id);
    }
}

/// Run the connection loop with reconnection
async fn connection_loop(
    node_id: String,
    local_node_id: String,
    peer_addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    mut command_rx: mpsc::Receiver<PeerCommand>,
    pending: Arc<Pending>,
) {
    let mut retry_interval = Duration::from_secs(1);

    loop {
        *status.write() = PeerStatus::Connecting;
        debug!("ClusterPeer '{}': Connecting to {}", node_id, peer_addr);

        let result = connect_and_run(
            &node_id,
            &local_node_id,
            peer_addr,
            &status,
            &mut command_rx,
            &pending,
        )
        .await;

        // Waiters of a dead connection will never get their response
        pending.clear();

        match result {
            Ok(()) => {
                info!("ClusterPeer '{}': Disconnected gracefully", node_id);
                *status.write() = PeerStatus::Disconnected;
                return;
            }
            Err(e) => {
                warn!("ClusterPeer '{}': Connection failed: {}", node_id, e);
                *status.write() = PeerStatus::Backoff;
            }
        }

        // Requests queued for the lost connection are abandoned
        loop {
            match command_rx.try_recv() {
                Ok(PeerCommand::Send(_)) => continue,
                Ok(PeerCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("ClusterPeer '{}': Shutdown requested", node_id);
                    *status.write() = PeerStatus::Disconnected;
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        debug!(
            "ClusterPeer '{}': Reconnecting in {:?}",
            node_id, retry_interval
        );
        tokio::time::sleep(retry_interval).await;
        retry_interval = std::cmp::min(retry_interval * 2, MAX_BACKOFF);
    }
}

async fn write_message(
    write_half: &mut OwnedWriteHalf,
    msg: &ClusterMessage,
) -> Result<(), CoordinatorError> {
    let frame = frame_message(msg)?;
    write_half.write_all(&frame).await?;
    Ok(())
}

/// Read until one whole frame is buffered
async fn read_message<R>(
    read_half: &mut R,
    buf: &mut BytesMut,
) -> Result<ClusterMessage, CoordinatorError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = take_frame(buf)? {
            return Ok(msg);
        }
        let n = read_half.read_buf(buf).await?;
        if n == 0 {
            return Err(CoordinatorError::Unreachable("connection closed".into()));
        }
    }
}

/// Connect to the peer and run the message loop
async fn connect_and_run(
    node_id: &str,
    local_node_id: &str,
    peer_addr: SocketAddr,
    status: &RwLock<PeerStatus>,
    command_rx: &mut mpsc::Receiver<PeerCommand>,
    pending: &Pending,
) -> Result<(), CoordinatorError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer_addr))
        .await
        .map_err(|_| CoordinatorError::Timeout)??;
    let _ = stream.set_nodelay(true);

    debug!("ClusterPeer '{}': TCP connected", node_id);

    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    let hello = ClusterMessage::Hello {
        node_id: local_node_id.to_string(),
        version: CLUSTER_PROTOCOL_VERSION,
    };
    write_message(&mut write_half, &hello).await?;

    let ack = tokio::time::timeout(CONNECT_TIMEOUT, read_message(&mut read_half, &mut read_buf))
        .await
        .map_err(|_| CoordinatorError::Timeout)??;
    match ack {
        ClusterMessage::HelloAck {
            node_id: peer_id,
            version,
        } => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(CoordinatorError::Rejected(format!(
                    "Protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            info!("ClusterPeer '{}': Connected (peer_id={})", node_id, peer_id);
        }
        other => {
            return Err(CoordinatorError::Rejected(format!(
                "Expected HelloAck, got {}",
                other.type_name()
            )));
        }
    }

    *status.write() = PeerStatus::Connected;

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.reset();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(PeerCommand::Send(msg)) => {
                        write_message(&mut write_half, &msg).await?;
                    }
                    Some(PeerCommand::Shutdown) | None => {
                        let _ = write_message(&mut write_half, &ClusterMessage::Goodbye).await;
                        return Ok(());
                    }
                }
            }

            result = read_half.read_buf(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(CoordinatorError::Unreachable(node_id.to_string()));
                }

                while let Some(msg) = take_frame(&mut read_buf)? {
                    match msg {
                        ClusterMessage::Response { request_id, reply } => {
                            match pending.remove(&request_id) {
                                Some((_, waiter)) => {
                                    let _ = waiter.send(reply);
                                }
                                None => debug!(
                                    "ClusterPeer '{}': late response {}",
                                    node_id, request_id
                                ),
                            }
                        }
                        ClusterMessage::Ping => {
                            write_message(&mut write_half, &ClusterMessage::Pong).await?;
                        }
                        ClusterMessage::Pong => {
                            debug!("ClusterPeer '{}': Pong received", node_id);
                        }
                        ClusterMessage::Goodbye => {
                            info!("ClusterPeer '{}': Received Goodbye", node_id);
                            return Err(CoordinatorError::Unreachable(node_id.to_string()));
                        }
                        other => {
                            warn!(
                                "ClusterPeer '{}': unexpected {} on outgoing connection",
                                node_id,
                                other.type_name()
                            );
                        }
                    }
                }
            }

            _ = ping_timer.tick() => {
                write_message(&mut write_half, &ClusterMessage::Ping).await?;
            }
        }
    }
}

/// Serve one incoming peer connection: handshake, then answer requests.
///
/// Each request runs on its own task; replies are written in completion
/// order.
pub async fn serve_peer(
    stream: TcpStream,
    local_node_id: String,
    handler: Arc<dyn OpHandler>,
) -> Result<(), CoordinatorError> {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    let hello = tokio::time::timeout(CONNECT_TIMEOUT, read_message(&mut read_half, &mut read_buf))
        .await
        .map_err(|_| CoordinatorError::Timeout)??;

    let peer_node_id = match hello {
        ClusterMessage::Hello { node_id, version } => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(CoordinatorError::Rejected(format!(
                    "Protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            node_id
        }
        other => {
            return Err(CoordinatorError::Rejected(format!(
                "Expected Hello, got {}",
                other.type_name()
            )))
        }
    };

    info!("Incoming cluster peer: {}", peer_node_id);

    let ack = ClusterMessage::HelloAck {
        node_id: local_node_id,
        version: CLUSTER_PROTOCOL_VERSION,
    };
    write_message(&mut write_half, &ack).await?;

    let (reply_tx, mut reply_rx) = mpsc::channel::<ClusterMessage>(1000);

    loop {
        tokio::select! {
            Some(msg) = reply_rx.recv() => {
                write_message(&mut write_half, &msg).await?;
            }

            result = read_half.read_buf(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    info!("Cluster peer '{}' disconnected", peer_node_id);
                    return Ok(());
                }

                while let Some(msg) = take_frame(&mut read_buf)? {
                    match msg {
                        ClusterMessage::Request { request_id, op } => {
                            debug!(
                                "Cluster inbound: {} request {} from {}",
                                op.name(), request_id, peer_node_id
                            );
                            let handler = handler.clone();
                            let reply_tx = reply_tx.clone();
                            tokio::spawn(async move {
                                let reply = handler.handle(op).await;
                                let _ = reply_tx
                                    .send(ClusterMessage::Response { request_id, reply })
                                    .await;
                            });
                        }
                        ClusterMessage::Ping => {
                            write_message(&mut write_half, &ClusterMessage::Pong).await?;
                        }
                        ClusterMessage::Goodbye => {
                            info!("Cluster peer '{}' said goodbye", peer_node_id);
                            return Ok(());
                        }
                        other => {
                            error!(
                                "Cluster peer '{}': unexpected {} on incoming connection",
                                peer_node_id,
                                other.type_name()
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    struct NameHandler;

    #[async_trait]
    impl OpHandler for NameHandler {
        async fn handle(&self, op: RemoteOp) -> RemoteReply {
            RemoteReply::Error(op.name().to_string())
        }
    }

    async fn wait_connected(peer: &ClusterPeer) {
        for _ in 0..100 {
            if peer.status() == PeerStatus::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer never connected");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let handler: Arc<dyn OpHandler> = Arc::new(NameHandler);
            let _ = serve_peer(stream, "server".into(), handler).await;
        });

        let peer = ClusterPeer::spawn("server".into(), addr, "client".into());
        wait_connected(&peer).await;

        let reply = peer
            .request(RemoteOp::Listeners, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, RemoteReply::Error("listeners".into()));

        peer.stop().await;
    }

    #[tokio::test]
    async fn test_request_fails_fast_when_not_connected() {
        // Nothing listens on this port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = ClusterPeer::spawn("ghost".into(), addr, "client".into());
        let result = peer
            .request(RemoteOp::NodeInfo, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CoordinatorError::Unreachable(_))));
        peer.stop().await;
    }
}
