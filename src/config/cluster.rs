//! Cluster Configuration
//!
//! Gossip membership (chitchat over UDP) and peer RPC (TCP) settings.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier override; falls back to `node.id`
    pub node_id: Option<String>,

    /// Address for gossip protocol (chitchat) to bind to
    /// Default: 0.0.0.0:7946
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: SocketAddr,

    /// Advertise address for gossip protocol (what peers use to reach us)
    /// If not set, resolved from hostname or falls back to gossip_addr
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// Address for peer RPC to bind to
    /// Default: 0.0.0.0:7947
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,

    /// Advertise address for peer connections
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Seed nodes for cluster discovery
    /// Format: "host:port" (gossip port)
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// How long a dead node's state is kept before chitchat forgets it
    #[serde(default = "default_dead_node_grace_period", with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// Upper bound on a single peer request
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7947))
}

fn default_gossip_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dead_node_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            gossip_addr: default_gossip_addr(),
            gossip_advertise_addr: None,
            peer_addr: default_peer_addr(),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: default_gossip_interval(),
            dead_node_grace_period: default_dead_node_grace_period(),
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

impl ClusterConfig {
    /// Get the gossip advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.gossip_advertise_addr {
            return addr;
        }
        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.gossip_addr.port());
        }
        self.gossip_addr
    }

    /// Get the peer advertise address
    pub fn get_peer_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.peer_advertise_addr {
            return addr;
        }
        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.peer_addr.port());
        }
        self.peer_addr
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let addr_str = format!("{}:0", hostname.to_string_lossy());
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert!(config.node_id.is_none());
        assert_eq!(config.gossip_addr, "0.0.0.0:7946".parse().unwrap());
        assert_eq!(config.peer_addr, "0.0.0.0:7947".parse().unwrap());
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_explicit_advertise_addr_wins() {
        let config = ClusterConfig {
            peer_advertise_addr: Some("10.0.0.5:9000".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(
            config.get_peer_advertise_addr(),
            "10.0.0.5:9000".parse().unwrap()
        );
    }

    #[test]
    fn test_humantime_durations() {
        let config: ClusterConfig = toml::from_str(
            r#"
            gossip_interval = "500ms"
            dead_node_grace_period = "1m"
            rpc_timeout = "2s"
            "#,
        )
        .unwrap();
        assert_eq!(config.gossip_interval, Duration::from_millis(500));
        assert_eq!(config.dead_node_grace_period, Duration::from_secs(60));
        assert_eq!(config.rpc_timeout, Duration::from_secs(2));
    }
}
