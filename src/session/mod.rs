//! MQTT Session Management
//!
//! A session is the node-local state of one client id: subscriptions,
//! both inflight tables, and the queue of messages waiting to be sent.
//! Persistent sessions (clean_session=false) outlive their connection;
//! `SessionSnapshot` carries one across nodes during takeover.

pub mod inflight;

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::{AHashMap, AHasher};
use bincode::{Decode, Encode};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub use inflight::{DeliveryState, InflightEntry, InflightTable, Phase, RetryClaim};

use crate::protocol::{Publish, QoS};

/// Remembered QoS 1 ids per session before the window restarts
const QOS1_DEDUP_WINDOW: usize = 1024;

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Application message in a form that crosses node boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

impl Message {
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: Arc::from(self.topic.as_str()),
            packet_id: None,
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }
}

/// Handle to the connection currently serving a session
#[derive(Debug, Clone)]
pub struct Link {
    /// Identifies the connection; reattaching bumps it
    pub epoch: u64,
    /// Signalled when `pending` gains messages
    pub wake: Arc<Notify>,
}

/// Outcome of queueing a message on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued, and the oldest message was dropped to make room
    DroppedOldest,
    /// Not queued (QoS 0 for an offline session)
    Rejected,
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    /// Unix millis at creation
    pub created_at: u64,
    /// Topic filter -> granted QoS
    pub subscriptions: AHashMap<String, QoS>,
    /// Outgoing QoS 1/2 messages awaiting acknowledgement
    pub outgoing: Arc<InflightTable>,
    /// Incoming QoS 2 messages waiting for PUBREL
    pub awaiting_rel: AHashMap<u16, Publish>,
    /// Incoming QoS 1 id -> fingerprint of the message last routed under it
    qos1_received: AHashMap<u16, u64>,
    /// Messages waiting for a connection or for inflight room
    pending: VecDeque<Publish>,
    max_pending: usize,
    link: Option<Link>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, max_pending: usize) -> Self {
        Self {
            client_id,
            clean_session,
            created_at: unix_millis(),
            subscriptions: AHashMap::new(),
            outgoing: Arc::new(InflightTable::new()),
            awaiting_rel: AHashMap::new(),
            qos1_received: AHashMap::new(),
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            link: None,
        }
    }

    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.link.is_some()
    }

    pub fn attach(&mut self, link: Link) {
        self.link = Some(link);
    }

    /// Detach the link if it still belongs to `epoch`
    pub fn detach(&mut self, epoch: u64) -> bool {
        match &self.link {
            Some(link) if link.epoch == epoch => {
                self.link = None;
                true
            }
            _ => false,
        }
    }

    /// Record an incoming QoS 1 PUBLISH.
    ///
    /// Returns true for a DUP retransmission of the message last routed
    /// under the same packet id. A different message reusing the id
    /// replaces the remembered one.
    pub fn note_qos1(&mut self, packet_id: u16, publish: &Publish) -> bool {
        let fingerprint = fingerprint(publish);
        if publish.dup && self.qos1_received.get(&packet_id) == Some(&fingerprint) {
            return true;
        }
        if self.qos1_received.len() >= QOS1_DEDUP_WINDOW
            && !self.qos1_received.contains_key(&packet_id)
        {
            self.qos1_received.clear();
        }
        self.qos1_received.insert(packet_id, fingerprint);
        false
    }

    /// Queue a message for delivery and wake the connection if one is attached
    pub fn enqueue(&mut self, publish: Publish) -> Enqueued {
        if self.link.is_none() && publish.qos == QoS::AtMostOnce {
            return Enqueued::Rejected;
        }

        let mut outcome = Enqueued::Queued;
        if self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            outcome = Enqueued::DroppedOldest;
        }
        self.pending.push_back(publish);

        if let Some(link) = &self.link {
            link.wake.notify_one();
        }
        outcome
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn front_pending(&self) -> Option<&Publish> {
        self.pending.front()
    }

    pub fn pop_pending(&mut self) -> Option<Publish> {
        self.pending.pop_front()
    }

    /// Add or replace a subscription, returning the previous QoS
    pub fn add_subscription(&mut self, filter: String, qos: QoS) -> Option<QoS> {
        self.subscriptions.insert(filter, qos)
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Transferable copy of the session state
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut subscriptions: Vec<_> = self
            .subscriptions
            .iter()
            .map(|(filter, qos)| SubscriptionSnapshot {
                filter: filter.clone(),
                qos: *qos,
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        let inflight = self
            .outgoing
            .ordered()
            .into_iter()
            .map(|entry| InflightSnapshot {
                packet_id: entry.packet_id,
                message: Message::from(&entry.publish),
                awaiting_comp: entry.phase() == Phase::AwaitPubComp,
            })
            .collect();

        let mut awaiting_rel: Vec<_> = self
            .awaiting_rel
            .iter()
            .map(|(id, publish)| AwaitingRelSnapshot {
                packet_id: *id,
                message: Message::from(publish),
            })
            .collect();
        awaiting_rel.sort_by_key(|a| a.packet_id);

        SessionSnapshot {
            created_at: self.created_at,
            subscriptions,
            inflight,
            awaiting_rel,
            pending: self.pending.iter().map(Message::from).collect(),
        }
    }

    /// Rebuild state from a snapshot taken on another node
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        self.created_at = snapshot.created_at;
        for sub in snapshot.subscriptions {
            self.subscriptions.insert(sub.filter, sub.qos);
        }
        for entry in snapshot.inflight {
            let mut publish = entry.message.to_publish();
            publish.packet_id = Some(entry.packet_id);
            let phase = entry.awaiting_comp.then_some(Phase::AwaitPubComp);
            self.outgoing
                .insert_with_phase(entry.packet_id, publish, phase);
        }
        for rel in snapshot.awaiting_rel {
            self.awaiting_rel
                .insert(rel.packet_id, rel.message.to_publish());
        }
        for message in snapshot.pending {
            if self.pending.len() >= self.max_pending {
                self.pending.pop_front();
            }
            self.pending.push_back(message.to_publish());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SubscriptionSnapshot {
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct InflightSnapshot {
    pub packet_id: u16,
    pub message: Message,
    /// PUBREC already received; only PUBREL remains to be resent
    pub awaiting_comp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AwaitingRelSnapshot {
    pub packet_id: u16,
    pub message: Message,
}

/// Session state handed over by a previous owner node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SessionSnapshot {
    pub created_at: u64,
    pub subscriptions: Vec<SubscriptionSnapshot>,
    pub inflight: Vec<InflightSnapshot>,
    pub awaiting_rel: Vec<AwaitingRelSnapshot>,
    pub pending: Vec<Message>,
}

/// Node-local sessions keyed by client id
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    max_pending: usize,
}

impl SessionStore {
    pub fn new(max_pending: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_pending,
        }
    }

    /// Fetch or create the session for a connecting client.
    ///
    /// A clean session always starts from scratch. Returns the session
    /// and whether existing state was resumed.
    pub fn get_or_create(&self, client_id: &str, clean_session: bool) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_session {
            if let Some(session) = self.sessions.get(&client_id) {
                let resumed = session.clone();
                drop(session);
                resumed.write().clean_session = false;
                return (resumed, true);
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_session,
            self.max_pending,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Remove the session only if it is still `session`
    pub fn remove_if_same(&self, client_id: &str, session: &Arc<RwLock<Session>>) -> bool {
        self.sessions
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total subscriptions across local sessions
    pub fn subscription_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().read().subscriptions.len())
            .sum()
    }
}

fn fingerprint(publish: &Publish) -> u64 {
    let mut hasher = AHasher::default();
    publish.topic.hash(&mut hasher);
    publish.payload.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn publish(topic: &str, qos: QoS) -> Publish {
        Publish {
            qos,
            topic: Arc::from(topic),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        }
    }

    fn link(epoch: u64) -> Link {
        Link {
            epoch,
            wake: Arc::new(Notify::new()),
        }
    }

    #[test]
    fn test_offline_queue_rejects_qos0() {
        let mut session = Session::new("c".into(), false, 10);
        assert_eq!(session.enqueue(publish("t", QoS::AtMostOnce)), Enqueued::Rejected);
        assert_eq!(session.enqueue(publish("t", QoS::AtLeastOnce)), Enqueued::Queued);
        assert_eq!(session.pending_len(), 1);
    }

    #[test]
    fn test_queue_drops_oldest() {
        let mut session = Session::new("c".into(), false, 2);
        session.enqueue(publish("a", QoS::AtLeastOnce));
        session.enqueue(publish("b", QoS::AtLeastOnce));
        assert_eq!(
            session.enqueue(publish("c", QoS::AtLeastOnce)),
            Enqueued::DroppedOldest
        );
        let topics: Vec<String> = std::iter::from_fn(|| session.pop_pending())
            .map(|p| p.topic.to_string())
            .collect();
        assert_eq!(topics, vec!["b", "c"]);
    }

    #[test]
    fn test_qos1_dup_matches_message_not_just_id() {
        let mut session = Session::new("c".into(), false, 10);
        let first = publish("t", QoS::AtLeastOnce);
        let resend = Publish {
            dup: true,
            ..first.clone()
        };
        assert!(!session.note_qos1(7, &first));
        assert!(session.note_qos1(7, &resend));

        // Id 7 reused for a new message whose first copy was lost
        let reused = Publish {
            dup: true,
            payload: Bytes::from_static(b"other"),
            ..first.clone()
        };
        assert!(!session.note_qos1(7, &reused));
        assert!(session.note_qos1(7, &reused));

        // Without DUP the message is always new
        assert!(!session.note_qos1(7, &first));
    }

    #[test]
    fn test_online_accepts_qos0() {
        let mut session = Session::new("c".into(), true, 10);
        session.attach(link(1));
        assert_eq!(session.enqueue(publish("t", QoS::AtMostOnce)), Enqueued::Queued);
    }

    #[test]
    fn test_detach_checks_epoch() {
        let mut session = Session::new("c".into(), false, 10);
        session.attach(link(2));
        assert!(!session.detach(1));
        assert!(session.is_online());
        assert!(session.detach(2));
        assert!(!session.is_online());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut session = Session::new("c".into(), false, 10);
        session.add_subscription("a/+".into(), QoS::AtLeastOnce);
        session.add_subscription("b/#".into(), QoS::ExactlyOnce);

        let mut inflight = publish("a/1", QoS::ExactlyOnce);
        inflight.packet_id = Some(4);
        session.outgoing.insert(4, inflight);
        session.outgoing.received(4);
        session.awaiting_rel.insert(9, publish("in", QoS::ExactlyOnce));
        session.enqueue(publish("b/1", QoS::AtLeastOnce));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.subscriptions.len(), 2);
        assert!(snapshot.inflight[0].awaiting_comp);

        let mut restored = Session::new("c".into(), false, 10);
        restored.restore(snapshot.clone());
        assert_eq!(restored.subscriptions.get("b/#"), Some(&QoS::ExactlyOnce));
        assert_eq!(
            restored.outgoing.get(4).unwrap().phase(),
            Phase::AwaitPubComp
        );
        assert!(restored.awaiting_rel.contains_key(&9));
        assert_eq!(restored.pending_len(), 1);
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_store_resume_and_clean() {
        let store = SessionStore::new(10);
        let (first, resumed) = store.get_or_create("c", false);
        assert!(!resumed);
        first.write().add_subscription("t".into(), QoS::AtMostOnce);

        let (second, resumed) = store.get_or_create("c", false);
        assert!(resumed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.subscription_count(), 1);

        let (third, resumed) = store.get_or_create("c", true);
        assert!(!resumed);
        assert!(third.read().subscriptions.is_empty());
        assert!(!store.remove_if_same("c", &first));
        assert!(store.remove_if_same("c", &third));
        assert!(store.is_empty());
    }
}
