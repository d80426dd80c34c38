//! CONNECT packet handling

use std::sync::Arc;

use ahash::AHashSet;
use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Client, Connection, ConnectionError, Control};
use crate::auth::{Access, AccessRequest, Authority};
use crate::broker::ConnectionHandle;
use crate::cluster::{ConnectionInfo, RouterRecord};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, QoS};
use crate::session::{unix_millis, Link};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read until the first packet, which must be CONNECT
    pub(crate) async fn read_connect(&mut self) -> Result<Connect, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    self.broker
                        .metrics
                        .packet_received(packet.packet_type(), consumed);

                    return match packet {
                        Packet::Connect(connect) => Ok(*connect),
                        other => {
                            debug!(
                                "First packet from {} was {}, not CONNECT",
                                self.addr,
                                other.packet_type().as_str()
                            );
                            Err(ProtocolError::Violation("first packet must be CONNECT").into())
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    return self
                        .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await;
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Validate, authenticate and admit the client, then send CONNACK
    pub(crate) async fn handle_connect(&mut self, connect: Connect) -> Result<Client, ConnectionError> {
        let config = self.broker.config.clone();

        // [MQTT-3.1.3-8] empty id needs clean session, and server policy must allow it
        if connect.client_id.is_empty()
            && (!connect.clean_session || !config.session.allow_empty_client_id)
        {
            debug!("Rejecting empty client id from {}", self.addr);
            return self.refuse(ConnectReturnCode::IdentifierRejected).await;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("stuart-{}", Uuid::new_v4().simple()).into()
        } else {
            connect.client_id.as_str().into()
        };

        if let Some(will) = &connect.will {
            if validate_topic_name(&will.topic).is_err() {
                return Err(ProtocolError::Violation("invalid will topic").into());
            }
        }

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        match self
            .broker
            .auth
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Authentication failed for {}", client_id);
                let code = if connect.username.is_some() {
                    ConnectReturnCode::BadUsernameOrPassword
                } else {
                    ConnectReturnCode::NotAuthorized
                };
                return self.refuse(code).await;
            }
            Err(e) => {
                warn!("Authentication error for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
        }

        let request = AccessRequest {
            username: connect.username.as_deref(),
            ip: self.addr.ip(),
            client_id: &client_id,
            topic: "",
            qos: QoS::AtMostOnce,
            access: Access::Connect,
        };
        match self.broker.auth.authorize(&request).await {
            Ok(Authority::Allow) => {}
            Ok(Authority::Deny) => {
                debug!("Connect denied for {}", client_id);
                return self.refuse(ConnectReturnCode::NotAuthorized).await;
            }
            Err(e) => {
                warn!("Authorization error for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
        }

        if !self.broker.is_accepting() {
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }

        let keep_alive = if connect.keep_alive == 0 {
            config.session.default_keep_alive
        } else {
            connect.keep_alive.min(config.session.max_keep_alive)
        };
        let clean_session = connect.clean_session;
        let epoch = self.broker.next_epoch();

        // Kicks must reach this connection from before its session claim
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            epoch,
            control: control_tx,
            info: ConnectionInfo {
                client_id: client_id.to_string(),
                remote_addr: self.addr.to_string(),
                protocol: self.protocol.as_str().to_string(),
                username: connect.username.clone(),
                keep_alive,
                clean_session,
                connected_at: unix_millis(),
            },
        };
        match self.broker.register_connection(client_id.clone(), handle) {
            Ok(Some(displaced)) => self.broker.kick(&client_id, &displaced.control).await,
            Ok(None) => {}
            Err(newer) => {
                info!("Connect of {} superseded by epoch {}", client_id, newer);
                return self.refuse(ConnectReturnCode::ServerUnavailable).await;
            }
        }

        let transferred = match self
            .broker
            .claim_session(&client_id, clean_session, epoch)
            .await
        {
            Ok(transferred) => transferred,
            Err(code) => {
                self.broker.abandon_claim(&client_id, epoch, false).await;
                return self.refuse(code).await;
            }
        };

        let kicked = match control_rx.try_recv() {
            Ok(Control::Kick(done)) => Some(done),
            Err(_) => None,
        };
        if kicked.is_some() || !self.broker.owns_session(&client_id, epoch).await {
            info!("Client {} lost its session to a concurrent connect", client_id);
            self.broker.abandon_claim(&client_id, epoch, clean_session).await;
            if let Some(done) = kicked {
                let _ = done.send(());
            }
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }

        let (session, resumed) = self.broker.sessions.get_or_create(&client_id, clean_session);
        let mut session_present = resumed;

        if clean_session {
            if let Err(e) = self.broker.coordinator.remove_client_routes(&client_id).await {
                warn!("Failed to drop stale routes of {}: {}", client_id, e);
            }
        } else if let Some(snapshot) = transferred {
            let filters: Vec<_> = snapshot
                .subscriptions
                .iter()
                .map(|s| (s.filter.clone(), s.qos))
                .collect();
            session.write().restore(snapshot);
            session_present = true;

            for (filter, qos) in filters {
                let route = RouterRecord {
                    node_id: self.broker.node_id.clone(),
                    client_id: client_id.to_string(),
                    topic: filter,
                    qos,
                };
                if let Err(e) = self.broker.coordinator.add_route(route).await {
                    warn!("Failed to restore route for {}: {}", client_id, e);
                }
            }
        }

        let wake = Arc::new(Notify::new());
        let outgoing = {
            let mut s = session.write();
            s.attach(Link {
                epoch,
                wake: wake.clone(),
            });
            s.outgoing.clone()
        };

        let (resend_tx, resend_rx) = mpsc::unbounded_channel();
        let retransmitter = super::qos::spawn_retransmitter(
            outgoing,
            wake.clone(),
            resend_tx,
            config.limits.retry_interval,
            config.limits.max_retries,
            self.broker.metrics.clone(),
            client_id.clone(),
        );

        let mut client = Client {
            client_id,
            session,
            epoch,
            clean_session,
            keep_alive,
            username: connect.username,
            will: connect.will,
            wake,
            control_rx,
            resend_rx,
            retransmitter,
            denied_rel: AHashSet::new(),
        };

        self.broker.metrics.client_connected();
        self.broker.metrics.set_sessions(self.broker.sessions.len());
        info!(
            "Client {} connected from {} over {} (clean_session={}, session_present={})",
            client.client_id, self.addr, self.protocol, clean_session, session_present
        );

        let ready = async {
            self.send(&Packet::ConnAck(ConnAck::accepted(session_present)))
                .await?;
            if session_present {
                self.replay_inflight(&client).await?;
            }
            self.flush_pending(&client).await
        }
        .await;

        if let Err(e) = ready {
            self.close(&mut client, super::CloseReason::Error).await;
            return Err(e);
        }

        Ok(client)
    }

    /// Send a refusing CONNACK and end the connection
    async fn refuse<T>(&mut self, code: ConnectReturnCode) -> Result<T, ConnectionError> {
        debug!("Refusing {} with {:?}", self.addr, code);
        let _ = self.send(&Packet::ConnAck(ConnAck::rejected(code))).await;
        Err(ConnectionError::Refused(code))
    }
}
