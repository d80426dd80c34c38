//! Outgoing QoS 1/2 delivery: queue flushing, acknowledgements and
//! retransmission

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Client, Connection, ConnectionError};
use crate::metrics::Metrics;
use crate::protocol::{Packet, PacketType, QoS};
use crate::session::{DeliveryState, InflightEntry, InflightTable, Phase, RetryClaim};

/// Lower bound on the retransmitter tick
const MIN_RETRY_TICK: Duration = Duration::from_millis(50);

/// Watch the inflight table and hand due packet ids to the connection.
///
/// Runs for the lifetime of one connection; the connection aborts it on
/// close.
pub(crate) fn spawn_retransmitter(
    outgoing: Arc<InflightTable>,
    wake: Arc<Notify>,
    resend_tx: mpsc::UnboundedSender<u16>,
    retry_interval: Duration,
    max_retries: u32,
    metrics: Arc<Metrics>,
    client_id: Arc<str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval((retry_interval / 2).max(MIN_RETRY_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let mut freed = false;
            for packet_id in outgoing.due(retry_interval) {
                match outgoing.claim_retry(packet_id, max_retries) {
                    RetryClaim::Resend => {
                        if resend_tx.send(packet_id).is_err() {
                            return;
                        }
                    }
                    RetryClaim::Abandoned => {
                        warn!(
                            "Giving up on packet {} to {} after {} retries",
                            packet_id, client_id, max_retries
                        );
                        metrics.message_dropped();
                        freed = true;
                    }
                    RetryClaim::Skip => {}
                }
            }

            if freed {
                wake.notify_one();
            }
        }
    })
}

/// The packet that moves an inflight entry forward from its phase
fn retransmission(entry: &InflightEntry) -> Packet {
    match entry.phase() {
        Phase::AwaitPubComp => Packet::PubRel(entry.packet_id),
        Phase::AwaitPubAck | Phase::AwaitPubRec => {
            let mut publish = entry.publish.clone();
            publish.dup = true;
            Packet::Publish(publish)
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send queued messages while the inflight window has room
    pub(crate) async fn flush_pending(&mut self, client: &Client) -> Result<(), ConnectionError> {
        let max_inflight = self.broker.config.limits.max_inflight as usize;

        loop {
            let publish = {
                let mut session = client.session.write();
                let Some(qos) = session.front_pending().map(|p| p.qos) else {
                    break;
                };

                if qos == QoS::AtMostOnce {
                    session.pop_pending()
                } else {
                    if session.outgoing.len() >= max_inflight {
                        break;
                    }
                    let Some(packet_id) = session.outgoing.allocate_id() else {
                        break;
                    };
                    let outgoing = session.outgoing.clone();
                    session.pop_pending().map(|mut publish| {
                        publish.packet_id = Some(packet_id);
                        publish.dup = false;
                        outgoing.insert(packet_id, publish.clone());
                        publish
                    })
                }
            };

            let Some(publish) = publish else {
                break;
            };
            let qos = publish.qos;
            trace!("Delivering '{}' to {} at {:?}", publish.topic, client.client_id, qos);
            self.send(&Packet::Publish(publish)).await?;
            self.broker.metrics.message_sent(qos);
        }

        Ok(())
    }

    /// Resend every unacknowledged message after a session resumes
    pub(crate) async fn replay_inflight(&mut self, client: &Client) -> Result<(), ConnectionError> {
        let outgoing = client.session.read().outgoing.clone();
        outgoing.reset_claims();

        let entries = outgoing.ordered();
        if !entries.is_empty() {
            debug!("Replaying {} inflight message(s) to {}", entries.len(), client.client_id);
        }
        for entry in entries {
            self.send(&retransmission(&entry)).await?;
            outgoing.touch(entry.packet_id);
        }
        Ok(())
    }

    /// Resend one entry claimed by the retransmitter
    pub(crate) async fn resend(&mut self, client: &Client, packet_id: u16) -> Result<(), ConnectionError> {
        let outgoing = client.session.read().outgoing.clone();
        let Some(entry) = outgoing.get(packet_id) else {
            return Ok(());
        };
        if entry.state() != DeliveryState::Retransmitting {
            return Ok(());
        }

        self.send(&retransmission(&entry)).await?;
        if outgoing.release(packet_id) {
            debug!(
                "Retransmitted packet {} to {} (attempt {})",
                packet_id,
                client.client_id,
                entry.retries()
            );
            self.broker.metrics.message_retransmitted();
        }
        Ok(())
    }

    pub(crate) async fn handle_puback(&mut self, client: &Client, packet_id: u16) -> Result<(), ConnectionError> {
        let outgoing = client.session.read().outgoing.clone();
        if outgoing.complete(packet_id, Phase::AwaitPubAck) {
            return self.flush_pending(client).await;
        }
        warn!("PUBACK for unknown packet id {} from {}", packet_id, client.client_id);
        self.broker.metrics.ack_missed(PacketType::PubAck);
        Ok(())
    }

    /// PUBREC moves a QoS 2 delivery to its release phase. Repeats are
    /// answered with PUBREL again.
    pub(crate) async fn handle_pubrec(&mut self, client: &Client, packet_id: u16) -> Result<(), ConnectionError> {
        let outgoing = client.session.read().outgoing.clone();
        if !outgoing.received(packet_id) {
            match outgoing.get(packet_id) {
                Some(entry) if entry.phase() == Phase::AwaitPubComp => {
                    warn!("Duplicate PUBREC {} from {}", packet_id, client.client_id);
                }
                _ => warn!("PUBREC for unknown packet id {} from {}", packet_id, client.client_id),
            }
            self.broker.metrics.ack_missed(PacketType::PubRec);
        }
        self.send(&Packet::PubRel(packet_id)).await
    }

    pub(crate) async fn handle_pubcomp(&mut self, client: &Client, packet_id: u16) -> Result<(), ConnectionError> {
        let outgoing = client.session.read().outgoing.clone();
        if outgoing.complete(packet_id, Phase::AwaitPubComp) {
            return self.flush_pending(client).await;
        }
        warn!("PUBCOMP for unknown packet id {} from {}", packet_id, client.client_id);
        self.broker.metrics.ack_missed(PacketType::PubComp);
        Ok(())
    }
}
