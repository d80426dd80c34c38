//! StuartMQ - clustered MQTT v3.1.1 broker
//!
//! Usage:
//!   stuartmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -b, --bind <ADDR>        Replace the TCP listener address
//!   --max-connections <N>    Connection cap for every listener
//!   -n, --node-id <ID>       Node id (default: hostname)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stuartmq::acl::AclAuthorizer;
use stuartmq::auth::{AuthService, CompositeAuth, StaticAuth};
use stuartmq::broker::Broker;
use stuartmq::cluster::{ClusterCoordinator, Coordinator, LocalCoordinator};
use stuartmq::config::{Config, ListenerConfig, ListenerProtocol};
use stuartmq::metrics::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// StuartMQ - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "stuartmq")]
#[command(version)]
#[command(about = "Clustered MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP listener address, replacing configured TCP listeners
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Connection cap applied to every listener
    #[arg(long)]
    max_connections: Option<usize>,

    /// Node id, overriding the configuration and the hostname
    #[arg(short, long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // RUST_LOG wins over --log-level, which wins over the config file
    let level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_tracing_level().as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    apply_overrides(&mut config, &args);
    config.validate()?;

    let node_id = config.node_id();
    info!("Starting StuartMQ node {}", node_id);
    for listener in &config.listeners {
        info!(
            "  Listener: {}://{} (max {} connections)",
            listener.protocol, listener.bind, listener.max_connections
        );
    }
    info!(
        "  Limits: inflight={}, queue={}, retry={:?}x{}",
        config.limits.max_inflight,
        config.limits.max_queued_messages,
        config.limits.retry_interval,
        config.limits.max_retries
    );
    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }

    let coordinator: Arc<dyn Coordinator> = if config.cluster.enabled {
        info!(
            "  Cluster: enabled (gossip={}, peer={})",
            config.cluster.gossip_addr, config.cluster.peer_addr
        );
        if !config.cluster.seeds.is_empty() {
            info!("    Seeds: {}", config.cluster.seeds.join(", "));
        }
        match ClusterCoordinator::start(node_id.clone(), config.cluster.clone()).await {
            Ok(coordinator) => Arc::new(coordinator),
            Err(e) => {
                eprintln!("Error joining cluster: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("  Cluster: disabled");
        LocalCoordinator::standalone(&node_id)
    };

    let auth: Arc<dyn AuthService> = Arc::new(CompositeAuth::new(vec![
        Arc::new(StaticAuth::new(&config.auth)),
        Arc::new(AclAuthorizer::new(&config.acl, config.build_user_roles())),
    ]));

    let metrics = Arc::new(Metrics::new()?);
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{}/metrics)", config.metrics.bind);
        let server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let broker = Broker::new(config, coordinator, auth, metrics);
    if let Err(e) = broker.start().await {
        error!("Failed to start broker: {}", e);
        broker.shutdown().await;
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    broker.shutdown().await;
    Ok(())
}

/// Apply command line overrides on top of the loaded configuration
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(node_id) = &args.node_id {
        config.node.id = Some(node_id.clone());
        config.cluster.node_id = None;
    }

    if let Some(bind) = args.bind {
        config
            .listeners
            .retain(|l| l.protocol != ListenerProtocol::Tcp);
        config.listeners.insert(0, ListenerConfig::tcp(bind));
    }

    if let Some(max) = args.max_connections {
        for listener in &mut config.listeners {
            listener.max_connections = max;
        }
    }
}
