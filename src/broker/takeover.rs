//! Session ownership across connections and nodes
//!
//! A connecting client first registers its control channel, closing the
//! local connection it displaces, then claims its session record with
//! compare-and-swap, stamping it with this node and the new connection
//! epoch. A previous owner on another node is closed through a `Takeover`
//! request that also returns the persistent state. Before its CONNACK the
//! connection checks that it still owns the record and has not been
//! kicked; otherwise it backs out. Closing connections only touch the
//! record while it still carries their own epoch.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connection::Control;
use super::Broker;
use crate::cluster::{
    CasOutcome, Page, Record, RecordKey, RemoteOp, RemoteReply, SessionFilter, SessionRecord,
};
use crate::protocol::ConnectReturnCode;
use crate::session::{unix_millis, Session, SessionSnapshot};

/// CAS attempts for a session claim before the connect is refused
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Time a kicked connection gets to publish its will and close
const KICK_TIMEOUT: Duration = Duration::from_secs(5);

impl Broker {
    /// Make connection `epoch` the owner of `client_id` cluster-wide.
    ///
    /// Returns the state transferred from a previous owner node, if any.
    /// A lost race against another live connection refuses the connect.
    pub(crate) async fn claim_session(
        &self,
        client_id: &str,
        clean_session: bool,
        epoch: u64,
    ) -> Result<Option<SessionSnapshot>, ConnectReturnCode> {
        let key = RecordKey::session(client_id);
        let store = self.coordinator.store();
        let mut previous: Option<SessionRecord> = None;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = match store.get(&key).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Session lookup for {} failed, continuing locally: {}", client_id, e);
                    break;
                }
            };
            let existing = current
                .as_ref()
                .and_then(|v| v.record.as_session())
                .cloned();

            if let Some(r) = &existing {
                if r.connected && r.node_id == self.node_id && r.epoch > epoch {
                    info!("A newer connection of {} holds the session", client_id);
                    return Err(ConnectReturnCode::ServerUnavailable);
                }
            }

            let create_time = match &existing {
                Some(r) if !clean_session && !r.clean_session => r.create_time,
                _ => unix_millis(),
            };
            let record = SessionRecord {
                node_id: self.node_id.clone(),
                client_id: client_id.to_string(),
                clean_session,
                create_time,
                connected: true,
                epoch,
            };

            match store
                .compare_and_swap(
                    &key,
                    current.as_ref().map(|v| v.version),
                    Some(Record::Session(record)),
                )
                .await
            {
                Ok(CasOutcome::Applied { .. }) => {
                    previous = existing;
                    break;
                }
                Ok(CasOutcome::Conflict { current }) => {
                    let contended = current
                        .as_ref()
                        .and_then(|v| v.record.as_session())
                        .map_or(false, |r| r.connected);
                    if contended || attempts >= MAX_CLAIM_ATTEMPTS {
                        info!("Lost session claim for {} to a concurrent connect", client_id);
                        return Err(ConnectReturnCode::ServerUnavailable);
                    }
                    debug!("Session record of {} changed, retrying claim", client_id);
                }
                Err(e) => {
                    warn!("Session claim for {} failed, continuing locally: {}", client_id, e);
                    break;
                }
            }
        }

        let remote_owner = match &previous {
            Some(record) if record.node_id != self.node_id => Some(record.node_id.clone()),
            Some(_) => None,
            None => self
                .coordinator
                .index()
                .sessions(
                    &SessionFilter {
                        node_id: None,
                        client_id: Some(client_id.to_string()),
                    },
                    Page::all(),
                )
                .into_iter()
                .find(|r| r.node_id != self.node_id)
                .map(|r| r.node_id),
        };

        let Some(node) = remote_owner else {
            return Ok(None);
        };
        if !self.coordinator.live_nodes().contains(&node) {
            debug!("Previous owner {} of {} is gone, starting fresh", node, client_id);
            return Ok(None);
        }

        let op = RemoteOp::Takeover {
            client_id: client_id.to_string(),
            discard: clean_session,
        };
        match self.coordinator.compute_on_node(&node, op).await {
            Ok(RemoteReply::Takeover(snapshot)) => {
                info!("Took over session {} from {}", client_id, node);
                Ok(if clean_session { None } else { snapshot })
            }
            Ok(other) => {
                warn!("Unexpected takeover reply from {}: {:?}", node, other);
                Ok(None)
            }
            Err(e) => {
                warn!("Takeover of {} on {} failed: {}", client_id, node, e);
                Ok(None)
            }
        }
    }

    /// Close the local connection of `client_id` unless it is `epoch`,
    /// waiting until its close path has finished
    pub(crate) async fn kick_local(&self, client_id: &str, epoch: u64) {
        let control = self
            .connections
            .get(client_id)
            .and_then(|h| (h.epoch != epoch).then(|| h.control.clone()));
        if let Some(control) = control {
            self.kick(client_id, &control).await;
        }
    }

    /// Ask the connection behind `control` to close and wait for it
    pub(crate) async fn kick(&self, client_id: &str, control: &mpsc::UnboundedSender<Control>) {
        let (done_tx, done_rx) = oneshot::channel();
        if control.send(Control::Kick(done_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(KICK_TIMEOUT, done_rx).await.is_err() {
            warn!("Connection of {} did not close within {:?}", client_id, KICK_TIMEOUT);
        }
    }

    /// Whether connection `epoch` still holds the session record of
    /// `client_id`. An unreachable store counts as owned.
    pub(crate) async fn owns_session(&self, client_id: &str, epoch: u64) -> bool {
        match self.coordinator.store().get(&RecordKey::session(client_id)).await {
            Ok(current) => current
                .as_ref()
                .and_then(|v| v.record.as_session())
                .map_or(false, |r| r.owned_by(&self.node_id, epoch)),
            Err(e) => {
                warn!("Session record of {} unavailable: {}", client_id, e);
                true
            }
        }
    }

    /// Back out of a connect that lost its session before the CONNACK
    pub(crate) async fn abandon_claim(&self, client_id: &str, epoch: u64, clean_session: bool) {
        self.connections
            .remove_if(client_id, |_, handle| handle.epoch == epoch);
        self.release_record(client_id, epoch, clean_session).await;
    }

    /// Give up the session of `client_id` to another node.
    ///
    /// Returns the persistent state unless `discard` is set or the session
    /// was clean.
    pub(crate) async fn take_over_local(&self, client_id: &str, discard: bool) -> Option<SessionSnapshot> {
        self.kick_local(client_id, 0).await;

        if let Err(e) = self.coordinator.remove_client_routes(client_id).await {
            warn!("Failed to remove routes of {}: {}", client_id, e);
        }
        let session = self.sessions.remove(client_id)?;
        self.refresh_gauges();

        let session = session.read();
        debug!("Handing over session {} (discard={})", client_id, discard);
        if discard || session.clean_session {
            None
        } else {
            Some(session.snapshot())
        }
    }

    /// Detach a closing connection from its session and record
    pub(crate) async fn release_session(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        epoch: u64,
        clean_session: bool,
    ) {
        session.write().detach(epoch);
        self.connections
            .remove_if(client_id.as_ref(), |_, handle| handle.epoch == epoch);

        if clean_session && self.sessions.remove_if_same(client_id, session) {
            if let Err(e) = self.coordinator.remove_client_routes(client_id).await {
                warn!("Failed to remove routes of {}: {}", client_id, e);
            }
        }

        self.release_record(client_id, epoch, clean_session).await;
        self.refresh_gauges();
    }

    /// Delete (clean) or mark disconnected (persistent) the session record,
    /// if connection `epoch` still owns it
    async fn release_record(&self, client_id: &str, epoch: u64, delete: bool) {
        let key = RecordKey::session(client_id);
        let store = self.coordinator.store();

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let current = match store.get(&key).await {
                Ok(Some(current)) => current,
                Ok(None) => return,
                Err(e) => {
                    warn!("Session record of {} unavailable: {}", client_id, e);
                    return;
                }
            };
            let Some(record) = current.record.as_session() else {
                return;
            };
            if !record.owned_by(&self.node_id, epoch) {
                return;
            }

            let new = if delete {
                None
            } else {
                Some(Record::Session(SessionRecord {
                    connected: false,
                    ..record.clone()
                }))
            };
            match store.compare_and_swap(&key, Some(current.version), new).await {
                Ok(CasOutcome::Applied { .. }) => return,
                Ok(CasOutcome::Conflict { .. }) => continue,
                Err(e) => {
                    warn!("Failed to release session record of {}: {}", client_id, e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::broker::ConnectionHandle;
    use crate::cluster::{ConnectionInfo, Coordinator, LocalCluster, LocalCoordinator};
    use crate::config::Config;
    use crate::metrics::Metrics;
    use pretty_assertions::assert_eq;

    fn broker(coordinator: Arc<LocalCoordinator>) -> Arc<Broker> {
        Broker::new(
            Config::default(),
            coordinator,
            Arc::new(AllowAll),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn record(coordinator: &LocalCoordinator, client_id: &str) -> Option<SessionRecord> {
        coordinator
            .store()
            .get(&RecordKey::session(client_id))
            .await
            .unwrap()
            .and_then(|v| v.record.as_session().cloned())
    }

    #[tokio::test]
    async fn test_claim_writes_owned_record() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator.clone());

        assert_eq!(broker.claim_session("c1", false, 7).await, Ok(None));
        let record = record(&coordinator, "c1").await.unwrap();
        assert!(record.owned_by("n1", 7));
        assert!(record.connected);
    }

    #[tokio::test]
    async fn test_persistent_reclaim_keeps_create_time() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator.clone());

        broker.claim_session("c1", false, 1).await.unwrap();
        let first = record(&coordinator, "c1").await.unwrap();
        broker.claim_session("c1", false, 2).await.unwrap();
        let second = record(&coordinator, "c1").await.unwrap();

        assert_eq!(second.create_time, first.create_time);
        assert_eq!(second.epoch, 2);
    }

    #[tokio::test]
    async fn test_release_ignores_foreign_epoch() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator.clone());
        let (session, _) = broker.sessions.get_or_create("c1", false);

        broker.claim_session("c1", false, 2).await.unwrap();
        broker.release_session(&Arc::from("c1"), &session, 1, false).await;
        assert!(record(&coordinator, "c1").await.unwrap().connected);

        broker.release_session(&Arc::from("c1"), &session, 2, false).await;
        assert!(!record(&coordinator, "c1").await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_clean_release_deletes_record_and_session() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator.clone());
        let (session, _) = broker.sessions.get_or_create("c1", true);

        broker.claim_session("c1", true, 3).await.unwrap();
        broker.release_session(&Arc::from("c1"), &session, 3, true).await;

        assert_eq!(record(&coordinator, "c1").await, None);
        assert_eq!(broker.session_count(), 0);
    }

    fn handle(epoch: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<Control>) {
        let (control, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            epoch,
            control,
            info: ConnectionInfo {
                client_id: "c1".to_string(),
                remote_addr: "127.0.0.1:1883".to_string(),
                protocol: "mqtt".to_string(),
                username: None,
                keep_alive: 60,
                clean_session: true,
                connected_at: 0,
            },
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_register_displaces_older_connection() {
        let broker = broker(LocalCoordinator::standalone("n1"));
        let (first, mut first_rx) = handle(1);
        let (second, _second_rx) = handle(2);
        let (stale, _stale_rx) = handle(1);

        assert!(broker.register_connection(Arc::from("c1"), first).unwrap().is_none());
        let displaced = broker
            .register_connection(Arc::from("c1"), second)
            .unwrap()
            .unwrap();
        assert_eq!(displaced.epoch, 1);
        assert_eq!(broker.register_connection(Arc::from("c1"), stale).err(), Some(2));

        let kick = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.kick("c1", &displaced.control).await })
        };
        match first_rx.recv().await {
            Some(Control::Kick(done)) => done.send(()).unwrap(),
            None => panic!("displaced connection was not kicked"),
        }
        kick.await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_refused_while_newer_connection_holds_record() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator.clone());

        broker.claim_session("c1", true, 5).await.unwrap();
        assert_eq!(
            broker.claim_session("c1", true, 4).await,
            Err(ConnectReturnCode::ServerUnavailable)
        );
        assert!(record(&coordinator, "c1").await.unwrap().owned_by("n1", 5));
    }

    #[tokio::test]
    async fn test_overwritten_claim_backs_out() {
        let cluster = LocalCluster::new();
        let n1 = broker(cluster.coordinator("n1"));
        let n2 = broker(cluster.coordinator("n2"));
        let (h1, _rx1) = handle(1);
        n1.register_connection(Arc::from("c1"), h1).unwrap();

        n1.claim_session("c1", false, 1).await.unwrap();
        n2.claim_session("c1", false, 9).await.unwrap();
        assert!(!n1.owns_session("c1", 1).await);
        assert!(n2.owns_session("c1", 9).await);

        n1.abandon_claim("c1", 1, false).await;
        assert_eq!(n1.connection_count(), 0);
        let record = record(&cluster.coordinator("n1"), "c1").await.unwrap();
        assert!(record.owned_by("n2", 9));
        assert!(record.connected);
    }

    #[tokio::test]
    async fn test_take_over_local_returns_persistent_state() {
        let coordinator = LocalCoordinator::standalone("n1");
        let broker = broker(coordinator);
        let (session, _) = broker.sessions.get_or_create("c1", false);
        session
            .write()
            .add_subscription("a/#".to_string(), crate::protocol::QoS::AtLeastOnce);

        let snapshot = broker.take_over_local("c1", false).await.unwrap();
        assert_eq!(snapshot.subscriptions.len(), 1);
        assert_eq!(broker.session_count(), 0);

        broker.sessions.get_or_create("c2", false);
        assert_eq!(broker.take_over_local("c2", true).await, None);
    }
}
