//! StuartMQ - clustered MQTT v3.1.1 broker
//!
//! Each process is one node. Nodes agree on session ownership, node and
//! listener status through a [`cluster::Coordinator`] and forward
//! publishes to the nodes holding matching subscriptions, so a client may
//! connect to any node and resume its session there.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::AclAuthorizer;
pub use auth::{AuthService, CompositeAuth, StaticAuth};
pub use broker::{Broker, BrokerError};
pub use cluster::{ClusterConfig, ClusterCoordinator, Coordinator, LocalCluster, LocalCoordinator};
pub use config::Config;
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{ProtocolVersion, QoS};
