//! Retained message store
//!
//! Last-value cache per topic. A retained publish with an empty payload
//! deletes the entry for its topic.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::{Publish, QoS};
use crate::topic::topic_matches_filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedMessage {
    /// PUBLISH carrying this message with the retain flag set
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear the retained message for `topic`.
    ///
    /// Returns true when an entry was stored, false when one was cleared
    /// (or nothing was there to clear).
    pub fn set(&self, topic: &str, payload: Bytes, qos: QoS) -> bool {
        if payload.is_empty() {
            self.messages.remove(topic);
            return false;
        }
        let topic: Arc<str> = Arc::from(topic);
        self.messages.insert(
            topic.clone(),
            RetainedMessage {
                topic,
                payload,
                qos,
            },
        );
        true
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// Retained messages whose topic matches `filter`, ordered by topic
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        let mut matches: Vec<_> = self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.topic.cmp(&b.topic));
        matches
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_last_writer_wins() {
        let store = RetainedStore::new();
        store.set("t", Bytes::from_static(b"1"), QoS::AtMostOnce);
        store.set("t", Bytes::from_static(b"2"), QoS::AtLeastOnce);

        let message = store.get("t").unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"2"));
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_payload_clears() {
        let store = RetainedStore::new();
        assert!(store.set("t", Bytes::from_static(b"x"), QoS::AtMostOnce));
        assert!(!store.set("t", Bytes::new(), QoS::AtMostOnce));
        assert!(store.get("t").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_matching_wildcards() {
        let store = RetainedStore::new();
        store.set("a/1", Bytes::from_static(b"x"), QoS::AtMostOnce);
        store.set("a/2", Bytes::from_static(b"y"), QoS::AtMostOnce);
        store.set("b/1", Bytes::from_static(b"z"), QoS::AtMostOnce);
        store.set("$SYS/a", Bytes::from_static(b"s"), QoS::AtMostOnce);

        let topics: Vec<String> = store
            .matching("a/+")
            .iter()
            .map(|m| m.topic.to_string())
            .collect();
        assert_eq!(topics, vec!["a/1", "a/2"]);
        assert_eq!(store.matching("#").len(), 3);
    }

    #[test]
    fn test_replay_sets_retain_flag() {
        let store = RetainedStore::new();
        store.set("t", Bytes::from_static(b"x"), QoS::ExactlyOnce);
        let publish = store.get("t").unwrap().to_publish();
        assert!(publish.retain);
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        assert_eq!(publish.packet_id, None);
    }
}
