//! SUBSCRIBE and UNSUBSCRIBE handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Client, Connection, ConnectionError};
use crate::auth::Access;
use crate::cluster::RouterRecord;
use crate::protocol::{Packet, ProtocolError, QoS, SubAck, SubAckReturnCode, Subscribe, Unsubscribe};
use crate::session::Enqueued;
use crate::topic::{has_wildcards, validate_topic_filter};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        client: &mut Client,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        // [MQTT-3.8.3-3]
        if subscribe.subscriptions.is_empty() {
            return Err(ProtocolError::Violation("SUBSCRIBE without filters").into());
        }

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted = Vec::new();
        for subscription in &subscribe.subscriptions {
            let code = self
                .subscribe_one(client, &subscription.filter, subscription.qos)
                .await;
            if let SubAckReturnCode::Granted(qos) = code {
                granted.push((subscription.filter.as_str(), qos));
            }
            return_codes.push(code);
        }

        self.send(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained messages follow the SUBACK
        for (filter, qos) in granted {
            self.queue_retained(client, filter, qos).await;
        }
        self.flush_pending(client).await
    }

    async fn subscribe_one(&mut self, client: &Client, filter: &str, qos: QoS) -> SubAckReturnCode {
        if let Err(reason) = validate_topic_filter(filter) {
            debug!("Invalid filter '{}' from {}: {}", filter, client.client_id, reason);
            return SubAckReturnCode::Failure;
        }
        if !self.broker.config.mqtt.wildcard_subscriptions && has_wildcards(filter) {
            debug!("Wildcard filter '{}' refused for {}", filter, client.client_id);
            return SubAckReturnCode::Failure;
        }
        if !self.authorize(client, filter, qos, Access::Subscribe).await {
            debug!("Subscribe to '{}' denied for {}", filter, client.client_id);
            return SubAckReturnCode::Failure;
        }

        let granted = qos.min(self.broker.max_qos());
        let route = RouterRecord {
            node_id: self.broker.node_id.clone(),
            client_id: client.client_id.to_string(),
            topic: filter.to_string(),
            qos: granted,
        };
        if let Err(e) = self.broker.coordinator.add_route(route).await {
            warn!("Failed to add route '{}' for {}: {}", filter, client.client_id, e);
            return SubAckReturnCode::Failure;
        }

        client
            .session
            .write()
            .add_subscription(filter.to_string(), granted);
        debug!("{} subscribed to '{}' at {:?}", client.client_id, filter, granted);
        SubAckReturnCode::Granted(granted)
    }

    /// Queue the retained messages matching a new subscription
    async fn queue_retained(&mut self, client: &Client, filter: &str, granted: QoS) {
        for mut retained in self.broker.router.retained_for(filter) {
            if !self
                .authorize(client, &retained.topic, retained.qos, Access::Subscribe)
                .await
            {
                continue;
            }
            retained.qos = retained.qos.min(granted);
            if client.session.write().enqueue(retained) == Enqueued::DroppedOldest {
                self.broker.metrics.message_dropped();
            }
        }
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client: &mut Client,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            client.session.write().remove_subscription(filter);
            if let Err(e) = self
                .broker
                .coordinator
                .remove_route(&client.client_id, filter)
                .await
            {
                warn!("Failed to remove route '{}' for {}: {}", filter, client.client_id, e);
            }
            debug!("{} unsubscribed from '{}'", client.client_id, filter);
        }
        self.send(&Packet::UnsubAck(unsubscribe.packet_id)).await
    }
}
