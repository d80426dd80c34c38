//! MQTT Connection Handler
//!
//! One task per client connection runs the protocol state machine:
//! CONNECT (with timeout) and session claim, then a select loop over
//! socket reads, queued deliveries, retransmissions, takeover requests,
//! node shutdown and the keep-alive deadline. Every exit path goes
//! through `close`, which publishes the will unless the client
//! disconnected gracefully and releases or parks the session.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::codec::{Decoder, Encoder};
use crate::config::ListenerProtocol;
use crate::protocol::{
    ConnectReturnCode, DecodeError, EncodeError, Packet, ProtocolError, Will,
};
use crate::session::Session;

pub(crate) use disconnect::CloseReason;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// CONNECT answered with a refusal code
    Refused(ConnectReturnCode),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {:?}", code),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Requests from the broker to a running connection
pub(crate) enum Control {
    /// Another connection claimed the client id; close and signal when
    /// the close path has finished
    Kick(oneshot::Sender<()>),
}

/// State of an accepted client, owned by the connection task
pub(crate) struct Client {
    pub client_id: Arc<str>,
    pub session: Arc<RwLock<Session>>,
    pub epoch: u64,
    pub clean_session: bool,
    /// Negotiated keep-alive in seconds, 0 disables the timeout
    pub keep_alive: u16,
    pub username: Option<String>,
    pub will: Option<Will>,
    pub wake: Arc<Notify>,
    pub control_rx: mpsc::UnboundedReceiver<Control>,
    pub resend_rx: mpsc::UnboundedReceiver<u16>,
    pub retransmitter: JoinHandle<()>,
    /// Incoming QoS 2 ids acknowledged but dropped by authorization
    pub denied_rel: AHashSet<u16>,
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) protocol: ListenerProtocol,
    pub(crate) broker: Arc<Broker>,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, protocol: ListenerProtocol, broker: Arc<Broker>) -> Self {
        let decoder = Decoder::new().with_max_packet_size(broker.config.limits.max_packet_size);
        let shutdown = broker.shutdown_signal();
        Self {
            stream,
            addr,
            protocol,
            broker,
            decoder,
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            shutdown,
        }
    }

    /// Run the connection to completion
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.broker.config.limits.connect_timeout;
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(ConnectionError::Shutdown);
        }

        let connect = tokio::select! {
            result = tokio::time::timeout(connect_timeout, self.read_connect()) => match result {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    return Err(ConnectionError::Timeout);
                }
            },
            _ = shutdown.changed() => return Err(ConnectionError::Shutdown),
        };

        let client = self.handle_connect(connect).await?;
        self.run_connected(client).await
    }

    /// Main loop once CONNACK has been sent
    async fn run_connected(&mut self, mut client: Client) -> Result<(), ConnectionError> {
        let keep_alive = Duration::from_millis(client.keep_alive as u64 * 1500);
        let keep_alive_enabled = client.keep_alive > 0;
        let mut keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

        let outcome = loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed by {}", client.client_id);
                            break (CloseReason::Error, Ok(()));
                        }
                        Ok(_) => {
                            keep_alive_deadline = tokio::time::Instant::now() + keep_alive;
                            match self.process_read_buf(&mut client).await {
                                Ok(None) => {}
                                Ok(Some(reason)) => break (reason, Ok(())),
                                Err(e) => {
                                    debug!("Closing {}: {}", client.client_id, e);
                                    break (CloseReason::Error, Err(e));
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Read error from {}: {}", client.client_id, e);
                            break (CloseReason::Error, Err(e.into()));
                        }
                    }
                }

                _ = client.wake.notified() => {
                    if let Err(e) = self.flush_pending(&client).await {
                        break (CloseReason::Error, Err(e));
                    }
                }

                Some(packet_id) = client.resend_rx.recv() => {
                    if let Err(e) = self.resend(&client, packet_id).await {
                        break (CloseReason::Error, Err(e));
                    }
                }

                control = client.control_rx.recv() => {
                    match control {
                        Some(Control::Kick(done)) => {
                            info!("Client {} taken over, closing {}", client.client_id, self.addr);
                            self.close(&mut client, CloseReason::TakenOver).await;
                            let _ = done.send(());
                            return Ok(());
                        }
                        None => break (CloseReason::Error, Ok(())),
                    }
                }

                _ = self.shutdown.changed() => {
                    break (CloseReason::Shutdown, Err(ConnectionError::Shutdown));
                }

                _ = tokio::time::sleep_until(keep_alive_deadline), if keep_alive_enabled => {
                    info!("Keep alive timeout for {} - disconnecting", client.client_id);
                    break (CloseReason::KeepAlive, Err(ConnectionError::Timeout));
                }
            }
        };

        let (reason, result) = outcome;
        self.close(&mut client, reason).await;
        result
    }

    /// Decode and handle every complete packet in the read buffer.
    ///
    /// Returns a close reason when a packet ends the connection.
    async fn process_read_buf(
        &mut self,
        client: &mut Client,
    ) -> Result<Option<CloseReason>, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            self.broker
                .metrics
                .packet_received(packet.packet_type(), consumed);

            if let Some(reason) = self.handle_packet(client, packet).await? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        client: &mut Client,
        packet: Packet,
    ) -> Result<Option<CloseReason>, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::Violation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(client, publish).await.map(|_| None),
            Packet::PubAck(packet_id) => self.handle_puback(client, packet_id).await.map(|_| None),
            Packet::PubRec(packet_id) => self.handle_pubrec(client, packet_id).await.map(|_| None),
            Packet::PubRel(packet_id) => self.handle_pubrel(client, packet_id).await.map(|_| None),
            Packet::PubComp(packet_id) => {
                self.handle_pubcomp(client, packet_id).await.map(|_| None)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client, subscribe).await.map(|_| None)
            }
            Packet::Unsubscribe(unsubscribe) => self
                .handle_unsubscribe(client, unsubscribe)
                .await
                .map(|_| None),
            Packet::PingReq => self.send(&Packet::PingResp).await.map(|_| None),
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client.client_id);
                Ok(Some(CloseReason::Graceful))
            }
            other => {
                warn!(
                    "Unexpected {} packet from {}",
                    other.packet_type().as_str(),
                    client.client_id
                );
                Err(ProtocolError::Violation("server-only packet from client").into())
            }
        }
    }

    /// Encode and write one packet
    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.broker
            .metrics
            .packet_sent(packet.packet_type(), self.write_buf.len());
        Ok(())
    }
}
