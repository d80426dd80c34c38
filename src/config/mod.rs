//! Configuration Module
//!
//! TOML configuration for StuartMQ with support for:
//! - Node identity and runtime sampling
//! - One or more listeners (TCP, TLS, WebSocket, WebSocket over TLS)
//! - Connection, inflight and retransmission limits
//! - Authentication and ACL
//! - Clustering
//! - Environment variable overrides (STUARTMQ__* prefix)

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use metrics::MetricsConfig;

mod cluster;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub node: NodeConfig,
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    pub cluster: ClusterConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            node: NodeConfig::default(),
            listeners: default_listeners(),
            limits: LimitsConfig::default(),
            session: SessionConfig::default(),
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            acl: AclConfig::default(),
            cluster: ClusterConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-unique node id; hostname when unset
    pub id: Option<String>,
    /// Advertised in the node record for the admin layer
    pub local_auth: bool,
    #[serde(with = "humantime_serde")]
    pub runtime_sample_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            local_auth: false,
            runtime_sample_interval: Duration::from_secs(30),
        }
    }
}

/// Transport a listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl ListenerProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerProtocol::Tcp => "tcp",
            ListenerProtocol::Ssl => "ssl",
            ListenerProtocol::Ws => "ws",
            ListenerProtocol::Wss => "wss",
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, ListenerProtocol::Ssl | ListenerProtocol::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, ListenerProtocol::Ws | ListenerProtocol::Wss)
    }
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_protocol")]
    pub protocol: ListenerProtocol,
    pub bind: SocketAddr,
    /// Live connection cap for this listener
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// WebSocket request path
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// Required for `ssl` and `wss`
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    pub fn tcp(bind: SocketAddr) -> Self {
        Self {
            protocol: ListenerProtocol::Tcp,
            bind,
            max_connections: default_max_connections(),
            path: default_ws_path(),
            tls: None,
        }
    }
}

/// TLS configuration for a listener
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
    /// Path to CA certificate file for client authentication (PEM format, optional)
    pub ca_cert: Option<String>,
    /// Require client certificate authentication
    #[serde(default)]
    pub require_client_cert: bool,
}

fn default_protocol() -> ListenerProtocol {
    ListenerProtocol::Tcp
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig::tcp(SocketAddr::from(([0, 0, 0, 0], 1883)))]
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Unacknowledged outgoing QoS 1/2 messages per session
    pub max_inflight: u16,
    /// Messages held per session while offline or while the window is full
    pub max_queued_messages: usize,
    /// Incoming QoS 2 ids awaiting PUBREL
    pub max_awaiting_rel: usize,
    /// Time before an unacknowledged message is resent
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Resends before a message is abandoned (0 = unlimited)
    pub max_retries: u32,
    /// Time allowed between accept and CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1024 * 1024,
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(20),
            max_retries: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive applied when a client sends 0 (0 = none)
    pub default_keep_alive: u16,
    /// Upper bound on the keep alive a client may ask for
    pub max_keep_alive: u16,
    /// Assign an id to clean-session clients that connect without one
    pub allow_empty_client_id: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 0,
            max_keep_alive: 65535,
            allow_empty_client_id: true,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
    /// Whether retained messages are available
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    pub wildcard_subscriptions: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow anonymous connections when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Permissions for users without a role (including anonymous)
    pub default: AclPermissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `STUARTMQ__` prefix with double underscores for nesting:
    ///    - `STUARTMQ__NODE__ID=node-2` overrides `node.id`
    ///    - `STUARTMQ__LIMITS__MAX_INFLIGHT=64` overrides `limits.max_inflight`
    ///    - `STUARTMQ__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_inflight", 32)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("limits.retry_interval", "20s")?
            .set_default("limits.max_retries", 5)?
            .set_default("limits.connect_timeout", "10s")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?
            .set_default("cluster.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("STUARTMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Node id: cluster override, then `node.id`, then hostname, then a
    /// random id
    pub fn node_id(&self) -> String {
        if let Some(id) = self.cluster.node_id.as_ref().or(self.node.id.as_ref()) {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.limits.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "limits.max_inflight must be at least 1".to_string(),
            ));
        }

        if self.listeners.is_empty() {
            return Err(ConfigError::Validation(
                "at least one listener is required".to_string(),
            ));
        }

        let mut binds = HashSet::new();
        for listener in &self.listeners {
            if !binds.insert(listener.bind) {
                return Err(ConfigError::Validation(format!(
                    "listener address {} is configured twice",
                    listener.bind
                )));
            }
            if listener.protocol.is_tls() {
                match &listener.tls {
                    Some(tls) if tls.cert.is_empty() || tls.key.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "{} listener on {} needs tls.cert and tls.key",
                            listener.protocol, listener.bind
                        )));
                    }
                    Some(_) => {}
                    None => {
                        return Err(ConfigError::Validation(format!(
                            "{} listener on {} needs a [listeners.tls] section",
                            listener.protocol, listener.bind
                        )));
                    }
                }
            }
            if listener.protocol.is_websocket() && !listener.path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "websocket path '{}' must start with '/'",
                    listener.path
                )));
            }
        }

        for user in &self.auth.users {
            match (&user.password, &user.password_hash) {
                (None, None) => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' must have either 'password' or 'password_hash'",
                        user.username
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' cannot have both 'password' and 'password_hash'",
                        user.username
                    )));
                }
                (Some(pwd), None) if pwd.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has empty password",
                        user.username
                    )));
                }
                (None, Some(hash)) if !hash.starts_with("$argon2") => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                        user.username
                    )));
                }
                _ => {}
            }
        }

        if self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();
            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Username to role name, for users that have one
    pub fn build_user_roles(&self) -> HashMap<String, String> {
        self.auth
            .users
            .iter()
            .filter_map(|user| Some((user.username.clone(), user.role.clone()?)))
            .collect()
    }
}
