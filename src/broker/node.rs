//! Node and listener records
//!
//! The broker writes its own Node record through each lifecycle step and
//! refreshes it, together with the Listener records, on a timer. All
//! writes are compare-and-swap against the version just read.

use tracing::{debug, info, warn};

use super::{Broker, BrokerError};
use crate::cluster::{CasOutcome, CoordinatorError, NodeRecord, NodeStatus, Record, RecordKey, RuntimeSnapshot};
use crate::config::ListenerProtocol;
use crate::session::unix_millis;

/// CAS attempts before a record write gives up
const MAX_WRITE_ATTEMPTS: usize = 5;

impl Broker {
    pub(crate) fn node_record(&self, status: NodeStatus) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id.clone(),
            instance_id: self.instance_id.clone(),
            listen_addr: self.advertised_addr(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            local_auth: self.config.node.local_auth,
            status,
            runtime: self.runtime.lock().clone(),
            update_time: unix_millis(),
        }
    }

    fn advertised_addr(&self) -> String {
        if self.config.cluster.enabled {
            return self.config.cluster.get_peer_advertise_addr().to_string();
        }
        self.local_addr(ListenerProtocol::Tcp)
            .or_else(|| self.config.listeners.first().map(|l| l.bind))
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Claim the node id: allowed when no record exists or the previous
    /// holder stopped
    pub(super) async fn register_node(&self) -> Result<(), BrokerError> {
        let key = RecordKey::node(&self.node_id);
        let store = self.coordinator.store();
        let current = store.get(&key).await?;

        if let Some(existing) = current.as_ref().and_then(|v| v.record.as_node()) {
            if existing.status != NodeStatus::Stopped {
                return Err(BrokerError::NodeActive(self.node_id.clone()));
            }
        }

        let record = Record::Node(self.node_record(NodeStatus::Starting));
        match store
            .compare_and_swap(&key, current.map(|v| v.version), Some(record))
            .await?
        {
            CasOutcome::Applied { .. } => {
                *self.status.lock() = NodeStatus::Starting;
                debug!("Node {} registered", self.node_id);
                Ok(())
            }
            CasOutcome::Conflict { .. } => Err(BrokerError::NodeActive(self.node_id.clone())),
        }
    }

    /// Move the node record to `status`
    pub(super) async fn set_status(&self, status: NodeStatus) -> Result<(), CoordinatorError> {
        *self.status.lock() = status;
        self.put_record(Record::Node(self.node_record(status))).await?;
        info!("Node {} is {}", self.node_id, status.as_str());
        Ok(())
    }

    /// Write a record this node owns, replacing whatever version is there
    pub(super) async fn put_record(&self, record: Record) -> Result<(), CoordinatorError> {
        let key = record.key();
        let store = self.coordinator.store();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let version = store.get(&key).await?.map(|v| v.version);
            if store
                .compare_and_swap(&key, version, Some(record.clone()))
                .await?
                .is_applied()
            {
                return Ok(());
            }
        }
        Err(CoordinatorError::Rejected(format!(
            "record {:?} kept changing",
            key
        )))
    }

    pub(super) async fn publish_listener_records(&self) {
        for record in self.listener_records() {
            if let Err(e) = self.put_record(Record::Listener(record)).await {
                warn!("Failed to update listener record: {}", e);
            }
        }
    }

    /// Periodically refresh runtime figures, records and gauges
    pub(super) async fn run_sampler(&self) {
        let mut ticker = tokio::time::interval(self.config.node.runtime_sample_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            *self.runtime.lock() = sample_runtime();
            let status = self.status();
            if status == NodeStatus::Running {
                if let Err(e) = self.put_record(Record::Node(self.node_record(status))).await {
                    warn!("Failed to refresh node record: {}", e);
                }
            }
            self.publish_listener_records().await;
            self.refresh_gauges();
        }
    }
}

/// Runtime figures for the node record
pub(super) fn sample_runtime() -> RuntimeSnapshot {
    let cpu = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let thread = tokio::runtime::Handle::try_current()
        .map(|h| h.metrics().num_workers() as u32)
        .unwrap_or(0);

    RuntimeSnapshot {
        cpu,
        thread,
        heap: resident_bytes(),
        max_file_descriptors: max_open_files(),
    }
}

/// Resident set size from /proc/self/statm
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

/// Soft open-files limit from /proc/self/limits
fn max_open_files() -> Option<u64> {
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    limits
        .lines()
        .find(|line| line.starts_with("Max open files"))
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|soft| soft.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_runtime_reports_cpus() {
        let runtime = sample_runtime();
        assert!(runtime.cpu >= 1);
        assert_eq!(runtime.thread, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sample_runtime_counts_workers() {
        assert_eq!(sample_runtime().thread, 2);
    }
}
