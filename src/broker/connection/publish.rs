//! Incoming PUBLISH and PUBREL handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Client, Connection, ConnectionError};
use crate::auth::{Access, AccessRequest};
use crate::protocol::{Packet, PacketType, ProtocolError, Publish, QoS, Will};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(
        &mut self,
        client: &mut Client,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        validate_topic_name(&publish.topic).map_err(ProtocolError::Violation)?;
        if publish.qos > self.broker.max_qos() {
            return Err(ProtocolError::Violation("QoS above server maximum").into());
        }

        let mut publish = publish;
        if publish.retain && !self.broker.config.mqtt.retain_available {
            publish.retain = false;
        }

        self.broker.metrics.message_received(publish.qos);
        let allowed = self
            .authorize(client, &publish.topic, publish.qos, Access::Publish)
            .await;
        if !allowed {
            debug!("Publish to '{}' denied for {}", publish.topic, client.client_id);
        }

        match publish.qos {
            QoS::AtMostOnce => {
                if allowed {
                    self.broker.router.publish(&publish);
                } else {
                    self.broker.metrics.message_dropped();
                }
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::Violation("QoS 1 PUBLISH without packet id"))?;

                let duplicate = client.session.write().note_qos1(packet_id, &publish);

                if duplicate {
                    debug!("Duplicate QoS 1 PUBLISH {} from {}", packet_id, client.client_id);
                } else if allowed {
                    self.broker.router.publish(&publish);
                } else {
                    self.broker.metrics.message_dropped();
                }
                self.send(&Packet::PubAck(packet_id)).await
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::Violation("QoS 2 PUBLISH without packet id"))?;
                let max_awaiting_rel = self.broker.config.limits.max_awaiting_rel;

                if !allowed {
                    if client.denied_rel.insert(packet_id) {
                        self.broker.metrics.message_dropped();
                    }
                    return self.send(&Packet::PubRec(packet_id)).await;
                }

                let stored = {
                    let mut session = client.session.write();
                    if session.awaiting_rel.contains_key(&packet_id) {
                        true
                    } else if session.awaiting_rel.len() >= max_awaiting_rel {
                        false
                    } else {
                        session.awaiting_rel.insert(packet_id, publish);
                        true
                    }
                };

                if !stored {
                    warn!(
                        "Dropping QoS 2 PUBLISH {} from {}: {} messages await PUBREL",
                        packet_id, client.client_id, max_awaiting_rel
                    );
                    self.broker.metrics.message_dropped();
                    return Ok(());
                }
                self.send(&Packet::PubRec(packet_id)).await
            }
        }
    }

    /// PUBREL releases a stored QoS 2 message for routing
    pub(crate) async fn handle_pubrel(
        &mut self,
        client: &mut Client,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let released = client.session.write().awaiting_rel.remove(&packet_id);
        match released {
            Some(publish) => {
                self.broker.router.publish(&publish);
            }
            None if client.denied_rel.remove(&packet_id) => {}
            None => {
                warn!("PUBREL for unknown packet id {} from {}", packet_id, client.client_id);
                self.broker.metrics.ack_missed(PacketType::PubRel);
            }
        }
        self.send(&Packet::PubComp(packet_id)).await
    }

    /// Route the will message, if the client may publish it
    pub(crate) async fn publish_will(&mut self, client: &Client, will: Will) {
        if !self.authorize(client, &will.topic, will.qos, Access::Publish).await {
            debug!("Will of {} to '{}' denied", client.client_id, will.topic);
            self.broker.metrics.message_dropped();
            return;
        }

        let publish = Publish {
            dup: false,
            qos: will.qos.min(self.broker.max_qos()),
            retain: will.retain && self.broker.config.mqtt.retain_available,
            topic: Arc::from(will.topic.as_str()),
            packet_id: None,
            payload: will.payload,
        };
        debug!("Publishing will of {} to '{}'", client.client_id, publish.topic);
        self.broker.router.publish(&publish);
    }

    /// Ask the auth service whether `client` may perform `access` on `topic`
    pub(crate) async fn authorize(&mut self, client: &Client, topic: &str, qos: QoS, access: Access) -> bool {
        let request = AccessRequest {
            username: client.username.as_deref(),
            ip: self.addr.ip(),
            client_id: &client.client_id,
            topic,
            qos,
            access,
        };
        match self.broker.auth.authorize(&request).await {
            Ok(authority) => authority.is_allowed(),
            Err(e) => {
                warn!("Authorization error for {}: {}", client.client_id, e);
                false
            }
        }
    }
}
