//! Route table
//!
//! Router records indexed two ways: a topic trie for publish-time matching
//! and an ordered map keyed by (client id, filter, node) for listing and
//! per-client teardown.

use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::RwLock;

use super::records::RouterRecord;
use crate::topic::TopicTrie;

type RouteKey = (String, String, String);

#[derive(Default)]
struct Inner {
    /// filter -> (node, client) -> record
    trie: TopicTrie<AHashMap<(String, String), RouterRecord>>,
    records: BTreeMap<RouteKey, RouterRecord>,
}

impl Inner {
    fn remove_key(&mut self, key: &RouteKey) -> Option<RouterRecord> {
        let record = self.records.remove(key)?;
        let (client_id, topic, node_id) = key;
        let now_empty = match self.trie.get_mut(topic) {
            Some(holders) => {
                holders.remove(&(node_id.clone(), client_id.clone()));
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.trie.remove(topic);
        }
        Some(record)
    }
}

#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<Inner>,
}

fn key_of(record: &RouterRecord) -> RouteKey {
    (
        record.client_id.clone(),
        record.topic.clone(),
        record.node_id.clone(),
    )
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a route. Returns true when the route is new.
    pub fn add(&self, record: RouterRecord) -> bool {
        let mut inner = self.inner.write();
        let holders = inner
            .trie
            .get_or_insert_with(&record.topic, AHashMap::new);
        holders.insert(
            (record.node_id.clone(), record.client_id.clone()),
            record.clone(),
        );
        inner.records.insert(key_of(&record), record).is_none()
    }

    /// Remove the route `node_id` holds for `client_id` on `topic`
    pub fn remove(&self, node_id: &str, client_id: &str, topic: &str) -> Option<RouterRecord> {
        let key = (client_id.to_string(), topic.to_string(), node_id.to_string());
        self.inner.write().remove_key(&key)
    }

    /// Remove every route of `client_id`, limited to `node_id` when given
    pub fn remove_client(&self, client_id: &str, node_id: Option<&str>) -> Vec<RouterRecord> {
        let mut inner = self.inner.write();
        let keys: Vec<RouteKey> = inner
            .records
            .range((client_id.to_string(), String::new(), String::new())..)
            .take_while(|(key, _)| key.0 == client_id)
            .filter(|(_, record)| node_id.map_or(true, |n| record.node_id == n))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| inner.remove_key(key))
            .collect()
    }

    /// Drop every route of `node_id`
    pub fn remove_node(&self, node_id: &str) -> usize {
        let mut inner = self.inner.write();
        let keys: Vec<RouteKey> = inner
            .records
            .keys()
            .filter(|key| key.2 == node_id)
            .cloned()
            .collect();
        keys.iter().filter(|key| inner.remove_key(key).is_some()).count()
    }

    /// Replace everything `node_id` holds with `records`
    pub fn replace_node(&self, node_id: &str, records: Vec<RouterRecord>) {
        self.remove_node(node_id);
        for record in records.into_iter().filter(|r| r.node_id == node_id) {
            self.add(record);
        }
    }

    /// Routes whose filter matches `topic`
    pub fn matches(&self, topic: &str) -> Vec<RouterRecord> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        inner.trie.matches(topic, |holders| {
            out.extend(holders.values().cloned());
        });
        out
    }

    /// All routes ordered by (client id, filter, node)
    pub fn records(&self) -> Vec<RouterRecord> {
        self.inner.read().records.values().cloned().collect()
    }

    /// Routes held by `node_id`
    pub fn node_records(&self, node_id: &str) -> Vec<RouterRecord> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Number of distinct filters
    pub fn filter_count(&self) -> usize {
        self.inner.read().trie.len()
    }
}
