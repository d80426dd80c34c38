//! Outgoing QoS 1/2 inflight table
//!
//! Entries are shared between the connection task, which sends and
//! acknowledges, and the retransmitter task, which resends on timeout.
//! Both sides move an entry's state with atomic swaps so an ack racing a
//! retry is counted exactly once.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::protocol::{Publish, QoS};

/// Delivery state of an inflight entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryState {
    /// Sent, waiting for the next acknowledgement
    Pending = 0,
    /// Claimed by the retransmitter
    Retransmitting = 1,
    /// Terminal acknowledgement received
    Acked = 2,
    /// Given up after too many retries
    Abandoned = 3,
}

impl DeliveryState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Retransmitting,
            2 => Self::Acked,
            _ => Self::Abandoned,
        }
    }
}

/// Which acknowledgement an outgoing message waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// QoS 1 PUBLISH sent
    AwaitPubAck = 0,
    /// QoS 2 PUBLISH sent
    AwaitPubRec = 1,
    /// QoS 2 PUBREL sent
    AwaitPubComp = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AwaitPubAck,
            1 => Self::AwaitPubRec,
            _ => Self::AwaitPubComp,
        }
    }

    pub fn initial(qos: QoS) -> Self {
        if qos == QoS::ExactlyOnce {
            Self::AwaitPubRec
        } else {
            Self::AwaitPubAck
        }
    }
}

/// A message sent to the client and not yet fully acknowledged
#[derive(Debug)]
pub struct InflightEntry {
    pub packet_id: u16,
    /// The PUBLISH as first sent (dup clear, packet id set)
    pub publish: Publish,
    /// Insertion order, used for replay
    seq: u64,
    state: AtomicU8,
    phase: AtomicU8,
    retries: AtomicU32,
    /// Milliseconds since the table's origin at last (re)send
    sent_at: AtomicU64,
}

impl InflightEntry {
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    fn transition(&self, from: DeliveryState, to: DeliveryState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of a retransmission claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClaim {
    /// Not yet due, or owned by someone else
    Skip,
    /// Caller must resend and then call `release`
    Resend,
    /// Retry budget exhausted and the entry was removed
    Abandoned,
}

/// Outgoing inflight messages for one session
#[derive(Debug)]
pub struct InflightTable {
    entries: Mutex<AHashMap<u16, Arc<InflightEntry>>>,
    next_packet_id: Mutex<u16>,
    next_seq: AtomicU64,
    origin: Instant,
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            next_packet_id: Mutex::new(1),
            next_seq: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.lock().contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<Arc<InflightEntry>> {
        self.entries.lock().get(&packet_id).cloned()
    }

    /// Next packet id not held by an outstanding entry, or `None` when all
    /// 65535 ids are in use.
    pub fn allocate_id(&self) -> Option<u16> {
        let entries = self.entries.lock();
        if entries.len() >= u16::MAX as usize {
            return None;
        }
        let mut next = self.next_packet_id.lock();
        loop {
            let id = *next;
            *next = next.checked_add(1).unwrap_or(1);
            if !entries.contains_key(&id) {
                return Some(id);
            }
        }
    }

    /// Track `publish`, which must carry the allocated packet id
    pub fn insert(&self, packet_id: u16, publish: Publish) -> Arc<InflightEntry> {
        self.insert_with_phase(packet_id, publish, None)
    }

    /// Track an entry restored from a transferred session
    pub fn insert_with_phase(
        &self,
        packet_id: u16,
        publish: Publish,
        phase: Option<Phase>,
    ) -> Arc<InflightEntry> {
        let phase = phase.unwrap_or_else(|| Phase::initial(publish.qos));
        let entry = Arc::new(InflightEntry {
            packet_id,
            publish,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(DeliveryState::Pending as u8),
            phase: AtomicU8::new(phase as u8),
            retries: AtomicU32::new(0),
            sent_at: AtomicU64::new(self.now_ms()),
        });
        self.entries.lock().insert(packet_id, entry.clone());
        entry
    }

    /// Apply a terminal acknowledgement (PUBACK, or PUBCOMP).
    ///
    /// Returns false when the ack is missed: no entry, wrong phase, or the
    /// entry was already acknowledged.
    pub fn complete(&self, packet_id: u16, expected: Phase) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&packet_id) else {
            return false;
        };
        if entry.phase() != expected {
            return false;
        }
        let previous = DeliveryState::from_u8(
            entry
                .state
                .swap(DeliveryState::Acked as u8, Ordering::AcqRel),
        );
        if previous == DeliveryState::Acked || previous == DeliveryState::Abandoned {
            return false;
        }
        entries.remove(&packet_id);
        true
    }

    /// PUBREC received: move a QoS 2 entry to awaiting PUBCOMP.
    ///
    /// Returns false for an unknown id or a repeated PUBREC.
    pub fn received(&self, packet_id: u16) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&packet_id) else {
            return false;
        };
        let moved = entry
            .phase
            .compare_exchange(
                Phase::AwaitPubRec as u8,
                Phase::AwaitPubComp as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            entry.sent_at.store(self.now_ms(), Ordering::Relaxed);
            entry.retries.store(0, Ordering::Relaxed);
        }
        moved
    }

    /// Ids of entries whose last send is at least `interval` old
    pub fn due(&self, interval: Duration) -> Vec<u16> {
        let now = self.now_ms();
        let interval = interval.as_millis() as u64;
        let entries = self.entries.lock();
        let mut due: Vec<_> = entries
            .values()
            .filter(|e| {
                e.state() == DeliveryState::Pending
                    && now.saturating_sub(e.sent_at.load(Ordering::Relaxed)) >= interval
            })
            .map(|e| (e.seq, e.packet_id))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Claim an entry for retransmission: Pending -> Retransmitting.
    ///
    /// `max_retries` of 0 retries forever. When the budget is spent the
    /// entry moves Pending -> Abandoned and its id is freed.
    pub fn claim_retry(&self, packet_id: u16, max_retries: u32) -> RetryClaim {
        let Some(entry) = self.get(packet_id) else {
            return RetryClaim::Skip;
        };

        if max_retries > 0 && entry.retries() >= max_retries {
            if entry.transition(DeliveryState::Pending, DeliveryState::Abandoned) {
                self.entries.lock().remove(&packet_id);
                return RetryClaim::Abandoned;
            }
            return RetryClaim::Skip;
        }

        if entry.transition(DeliveryState::Pending, DeliveryState::Retransmitting) {
            entry.retries.fetch_add(1, Ordering::Relaxed);
            RetryClaim::Resend
        } else {
            RetryClaim::Skip
        }
    }

    /// Return a claimed entry to Pending after its resend was queued.
    ///
    /// Returns false when an ack won the race meanwhile.
    pub fn release(&self, packet_id: u16) -> bool {
        let Some(entry) = self.get(packet_id) else {
            return false;
        };
        entry.sent_at.store(self.now_ms(), Ordering::Relaxed);
        entry.transition(DeliveryState::Retransmitting, DeliveryState::Pending)
    }

    /// Reset the send time of an entry, e.g. after replay on reconnect
    pub fn touch(&self, packet_id: u16) {
        if let Some(entry) = self.get(packet_id) {
            entry.sent_at.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Return entries claimed by a retransmitter that no longer runs to
    /// Pending, e.g. when a new connection adopts the table
    pub fn reset_claims(&self) {
        for entry in self.entries.lock().values() {
            entry.transition(DeliveryState::Retransmitting, DeliveryState::Pending);
        }
    }

    /// Entries in send order
    pub fn ordered(&self) -> Vec<Arc<InflightEntry>> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_unstable_by_key(|e| e.seq);
        entries
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc as StdArc;

    fn publish(qos: QoS, id: u16) -> Publish {
        Publish {
            qos,
            topic: StdArc::from("t"),
            packet_id: Some(id),
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_skip_outstanding() {
        let table = InflightTable::new();
        let a = table.allocate_id().unwrap();
        table.insert(a, publish(QoS::AtLeastOnce, a));
        let b = table.allocate_id().unwrap();
        assert_ne!(a, b);

        *table.next_packet_id.lock() = a;
        let c = table.allocate_id().unwrap();
        assert_ne!(c, a);
    }

    #[test]
    fn test_id_wraps_past_zero() {
        let table = InflightTable::new();
        *table.next_packet_id.lock() = u16::MAX;
        assert_eq!(table.allocate_id(), Some(u16::MAX));
        assert_eq!(table.allocate_id(), Some(1));
    }

    #[test]
    fn test_qos1_ack_once() {
        let table = InflightTable::new();
        table.insert(7, publish(QoS::AtLeastOnce, 7));

        assert!(table.complete(7, Phase::AwaitPubAck));
        assert!(!table.complete(7, Phase::AwaitPubAck));
        assert!(table.is_empty());
    }

    #[test]
    fn test_qos2_phases() {
        let table = InflightTable::new();
        table.insert(3, publish(QoS::ExactlyOnce, 3));

        // PUBCOMP before PUBREC is out of order
        assert!(!table.complete(3, Phase::AwaitPubComp));
        assert!(table.received(3));
        assert!(!table.received(3));
        assert_eq!(table.get(3).unwrap().phase(), Phase::AwaitPubComp);
        assert!(table.complete(3, Phase::AwaitPubComp));
        assert!(!table.contains(3));
    }

    #[test]
    fn test_retry_claim_and_release() {
        let table = InflightTable::new();
        table.insert(1, publish(QoS::AtLeastOnce, 1));

        assert_eq!(table.due(Duration::ZERO), vec![1]);
        assert_eq!(table.claim_retry(1, 5), RetryClaim::Resend);
        // Already claimed
        assert_eq!(table.claim_retry(1, 5), RetryClaim::Skip);
        assert!(table.due(Duration::ZERO).is_empty());
        assert!(table.release(1));
        assert_eq!(table.get(1).unwrap().retries(), 1);
    }

    #[test]
    fn test_ack_during_retransmit() {
        let table = InflightTable::new();
        table.insert(1, publish(QoS::AtLeastOnce, 1));

        assert_eq!(table.claim_retry(1, 0), RetryClaim::Resend);
        assert!(table.complete(1, Phase::AwaitPubAck));
        // The retransmitter loses the race back to Pending
        assert!(!table.release(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let table = InflightTable::new();
        table.insert(9, publish(QoS::AtLeastOnce, 9));

        for _ in 0..2 {
            assert_eq!(table.claim_retry(9, 2), RetryClaim::Resend);
            assert!(table.release(9));
        }
        assert_eq!(table.claim_retry(9, 2), RetryClaim::Abandoned);
        assert!(!table.contains(9));
        assert!(!table.complete(9, Phase::AwaitPubAck));
    }

    #[test]
    fn test_unlimited_retries() {
        let table = InflightTable::new();
        table.insert(2, publish(QoS::AtLeastOnce, 2));
        for _ in 0..50 {
            assert_eq!(table.claim_retry(2, 0), RetryClaim::Resend);
            assert!(table.release(2));
        }
    }

    #[test]
    fn test_concurrent_ack_and_retry_count_once() {
        for _ in 0..200 {
            let table = StdArc::new(InflightTable::new());
            table.insert(1, publish(QoS::AtLeastOnce, 1));

            let retry_table = table.clone();
            let retry = std::thread::spawn(move || {
                if retry_table.claim_retry(1, 0) == RetryClaim::Resend {
                    retry_table.release(1);
                }
            });
            let acked = table.complete(1, Phase::AwaitPubAck);
            retry.join().unwrap();

            assert!(acked);
            assert!(!table.complete(1, Phase::AwaitPubAck));
        }
    }

    #[test]
    fn test_reset_claims() {
        let table = InflightTable::new();
        table.insert(1, publish(QoS::AtLeastOnce, 1));
        assert_eq!(table.claim_retry(1, 0), RetryClaim::Resend);
        assert_eq!(table.get(1).unwrap().state(), DeliveryState::Retransmitting);
        table.reset_claims();
        assert_eq!(table.get(1).unwrap().state(), DeliveryState::Pending);
    }

    #[test]
    fn test_ordered_by_send() {
        let table = InflightTable::new();
        table.insert(30, publish(QoS::AtLeastOnce, 30));
        table.insert(2, publish(QoS::AtLeastOnce, 2));
        table.insert(17, publish(QoS::ExactlyOnce, 17));
        let ids: Vec<u16> = table.ordered().iter().map(|e| e.packet_id).collect();
        assert_eq!(ids, vec![30, 2, 17]);
    }
}
