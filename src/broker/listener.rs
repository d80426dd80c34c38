//! Listeners and connection admission
//!
//! Each configured listener owns an atomic connection counter. Admission
//! is a compare-and-swap increment that fails once the count reaches
//! `max_connections`; the returned [`ConnectionSlot`] gives the slot back
//! when dropped, whatever way the connection ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::connection::Connection;
use super::Broker;
use crate::cluster::ListenerRecord;
use crate::config::{ListenerConfig, ListenerProtocol};
use crate::metrics::Metrics;
use crate::transport::{configure_stream, TransportConfig, WsStream};

/// A bound listener and its live connection count
pub struct Listener {
    protocol: ListenerProtocol,
    bind: SocketAddr,
    max_connections: usize,
    path: String,
    active: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl Listener {
    pub fn new(config: &ListenerConfig, bind: SocketAddr, metrics: Arc<Metrics>) -> Self {
        Self {
            protocol: config.protocol,
            bind,
            max_connections: config.max_connections,
            path: config.path.clone(),
            active: AtomicUsize::new(0),
            metrics,
        }
    }

    pub fn protocol(&self) -> ListenerProtocol {
        self.protocol
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.bind
    }

    pub fn connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Take a connection slot unless the listener is full
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max_connections {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.publish_gauge(current + 1);
                    return Some(ConnectionSlot {
                        listener: self.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        self.publish_gauge(previous.saturating_sub(1));
    }

    fn publish_gauge(&self, count: usize) {
        self.metrics.set_listener_connections(
            self.protocol.as_str(),
            &self.bind.to_string(),
            count,
        );
    }

    pub fn record(&self, node_id: &str) -> ListenerRecord {
        ListenerRecord {
            node_id: node_id.to_string(),
            protocol: self.protocol.as_str().to_string(),
            bind: self.bind.to_string(),
            max_connections: self.max_connections as u64,
            connections: self.connections() as u64,
        }
    }
}

/// One admitted connection; dropping it frees the slot
pub struct ConnectionSlot {
    listener: Arc<Listener>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.listener.release();
    }
}

/// Accept connections until shutdown is signalled
pub(crate) async fn accept_loop(
    broker: Arc<Broker>,
    listener: Arc<Listener>,
    socket: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let transport = TransportConfig::default();
    info!(
        "MQTT/{} listening on {}",
        listener.protocol(),
        listener.local_addr()
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                debug!("Listener {} stopping", listener.local_addr());
                break;
            }
            accepted = socket.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept on {}: {}", listener.local_addr(), e);
                        continue;
                    }
                };

                let Some(slot) = listener.try_acquire() else {
                    debug!(
                        "Listener {} full ({} connections), rejecting {}",
                        listener.local_addr(),
                        listener.max_connections,
                        addr
                    );
                    drop(stream);
                    continue;
                };

                if let Err(e) = configure_stream(&stream, &transport) {
                    debug!("Failed to tune socket for {}: {}", addr, e);
                }

                let broker = broker.clone();
                let listener = listener.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    serve(broker, &listener, tls, stream, addr).await;
                    drop(slot);
                });
            }
        }
    }
}

/// Run the transport handshake for the listener's protocol, then the
/// MQTT connection
async fn serve(
    broker: Arc<Broker>,
    listener: &Listener,
    tls: Option<TlsAcceptor>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let handshake_timeout = broker.config.limits.connect_timeout;
    let protocol = listener.protocol();

    match (protocol, tls) {
        (ListenerProtocol::Tcp, _) => run(broker, stream, addr, protocol).await,
        (ListenerProtocol::Ws, _) => {
            match timeout(handshake_timeout, WsStream::accept_with_path(stream, &listener.path)).await {
                Ok(Ok(ws)) => run(broker, ws, addr, protocol).await,
                Ok(Err(e)) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                Err(_) => debug!("WebSocket handshake timed out for {}", addr),
            }
        }
        (ListenerProtocol::Ssl | ListenerProtocol::Wss, Some(acceptor)) => {
            let tls_stream = match timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!("TLS handshake failed for {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake timed out for {}", addr);
                    return;
                }
            };
            if protocol == ListenerProtocol::Ssl {
                run(broker, tls_stream, addr, protocol).await;
                return;
            }
            match timeout(
                handshake_timeout,
                WsStream::accept_with_path(tls_stream, &listener.path),
            )
            .await
            {
                Ok(Ok(ws)) => run(broker, ws, addr, protocol).await,
                Ok(Err(e)) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                Err(_) => debug!("WebSocket handshake timed out for {}", addr),
            }
        }
        (_, None) => error!("Listener {} has no TLS acceptor", listener.local_addr()),
    }
}

async fn run<S>(broker: Arc<Broker>, stream: S, addr: SocketAddr, protocol: ListenerProtocol)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection = Connection::new(stream, addr, protocol, broker);
    if let Err(e) = connection.run().await {
        debug!("Connection from {} ended: {}", addr, e);
    }
}
