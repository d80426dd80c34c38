//! Versioned key-value store with compare-and-swap
//!
//! Every write bumps a store-wide version. A CAS names the version it read
//! (or `None` for "must be absent") and fails with the current record when
//! someone else wrote in between.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use parking_lot::RwLock;

use super::records::{Record, RecordKey, VersionedRecord};
use super::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum CasOutcome {
    /// Written; the record now has `version` (0 after a delete)
    Applied { version: u64 },
    /// Expected version did not match
    Conflict { current: Option<VersionedRecord> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// CAS-capable store for correctness-critical records
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>, CoordinatorError>;

    /// Replace the record at `key` if its version is `expected`.
    ///
    /// `new = None` deletes. `expected = None` requires the key be absent.
    async fn compare_and_swap(
        &self,
        key: &RecordKey,
        expected: Option<u64>,
        new: Option<Record>,
    ) -> Result<CasOutcome, CoordinatorError>;
}

/// In-memory store used directly by single-node setups and as each
/// node's authoritative partition in a cluster
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, VersionedRecord>,
    version: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_sync(&self, key: &RecordKey) -> Option<VersionedRecord> {
        self.inner.read().records.get(key).cloned()
    }

    pub fn cas_sync(
        &self,
        key: &RecordKey,
        expected: Option<u64>,
        new: Option<Record>,
    ) -> Result<CasOutcome, CoordinatorError> {
        if let Some(record) = &new {
            if &record.key() != key {
                return Err(CoordinatorError::Rejected(
                    "record does not belong to key".into(),
                ));
            }
        }

        let mut inner = self.inner.write();
        let current = inner.records.get(key);
        if current.map(|c| c.version) != expected {
            return Ok(CasOutcome::Conflict {
                current: current.cloned(),
            });
        }

        match new {
            Some(record) => {
                inner.version += 1;
                let version = inner.version;
                inner
                    .records
                    .insert(key.clone(), VersionedRecord { version, record });
                Ok(CasOutcome::Applied { version })
            }
            None => {
                inner.records.remove(key);
                Ok(CasOutcome::Applied { version: 0 })
            }
        }
    }

    /// All records, in key order
    pub fn records(&self) -> Vec<VersionedRecord> {
        self.inner.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>, CoordinatorError> {
        Ok(self.get_sync(key))
    }

    async fn compare_and_swap(
        &self,
        key: &RecordKey,
        expected: Option<u64>,
        new: Option<Record>,
    ) -> Result<CasOutcome, CoordinatorError> {
        self.cas_sync(key, expected, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::records::SessionRecord;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn session(node: &str, epoch: u64) -> Record {
        Record::Session(SessionRecord {
            node_id: node.into(),
            client_id: "c".into(),
            clean_session: true,
            create_time: 0,
            connected: true,
            epoch,
        })
    }

    #[test]
    fn test_create_requires_absent() {
        let store = MemoryStore::new();
        let key = RecordKey::session("c");

        let first = store.cas_sync(&key, None, Some(session("n1", 1))).unwrap();
        assert!(first.is_applied());

        match store.cas_sync(&key, None, Some(session("n2", 1))).unwrap() {
            CasOutcome::Conflict { current } => {
                assert_eq!(current.unwrap().record, session("n1", 1));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_version_conflicts() {
        let store = MemoryStore::new();
        let key = RecordKey::session("c");
        let CasOutcome::Applied { version } =
            store.cas_sync(&key, None, Some(session("n1", 1))).unwrap()
        else {
            panic!("create failed");
        };

        assert!(store
            .cas_sync(&key, Some(version), Some(session("n2", 2)))
            .unwrap()
            .is_applied());
        assert!(!store
            .cas_sync(&key, Some(version), Some(session("n3", 3)))
            .unwrap()
            .is_applied());
    }

    #[test]
    fn test_delete_with_version() {
        let store = MemoryStore::new();
        let key = RecordKey::session("c");
        let CasOutcome::Applied { version } =
            store.cas_sync(&key, None, Some(session("n1", 1))).unwrap()
        else {
            panic!("create failed");
        };
        assert!(store.cas_sync(&key, Some(version), None).unwrap().is_applied());
        assert!(store.get_sync(&key).is_none());
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let store = MemoryStore::new();
        let result = store.cas_sync(&RecordKey::session("other"), None, Some(session("n1", 1)));
        assert!(matches!(result, Err(CoordinatorError::Rejected(_))));
    }

    #[test]
    fn test_racing_creators_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .cas_sync(&RecordKey::session("c"), None, Some(session(&format!("n{i}"), i)))
                        .unwrap()
                        .is_applied()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
