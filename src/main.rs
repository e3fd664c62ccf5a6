//! mqgate - MQTT 3.1.1 connection gateway
//!
//! Usage:
//!   mqgate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>  Maximum live sessions (default: 100000)
//!   --max-packet-size <N>  Maximum packet size (default: 1MB)
//!   --keep-alive <SECS>    Keep alive for clients that request 0
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqgate::auth::AuthProvider;
use mqgate::broker::{Broker, BrokerConfig};
use mqgate::config::Config;
use mqgate::hooks::CompositeHooks;
use mqgate::metrics::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
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

/// mqgate - MQTT 3.1.1 connection gateway
#[derive(Parser, Debug)]
#[command(name = "mqgate")]
#[command(version)]
#[command(about = "MQTT 3.1.1 connection handshake and session gateway")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum live sessions (0 = unbounded)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Keep alive in seconds for clients that request 0
    #[arg(long)]
    keep_alive: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max_connections) = args.max_connections {
        config.limits.max_connections = max_connections;
    }
    if let Some(max_packet_size) = args.max_packet_size {
        config.limits.max_packet_size = max_packet_size;
    }
    if let Some(keep_alive) = args.keep_alive {
        config.session.default_keep_alive = keep_alive;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let broker_config = BrokerConfig::from_config(&config);

    info!("Starting mqgate");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Connect timeout: {:?}", broker_config.connect_timeout);
    info!(
        "  Keep alive: default {}s, max {}s",
        broker_config.default_keep_alive, broker_config.max_keep_alive
    );
    info!("  Takeover policy: {:?}", broker_config.takeover);

    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured, anonymous {})",
            config.auth.users.len(),
            if config.auth.allow_anonymous {
                "allowed"
            } else {
                "denied"
            }
        );
    } else {
        info!("  Authentication: disabled");
    }

    let auth_provider = Arc::new(AuthProvider::new(&config.auth));
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider));

    let mut broker = Broker::with_hooks(broker_config, hooks);

    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        broker.set_metrics(metrics.clone());
        info!("  Metrics: enabled (http://{})", config.metrics.bind);

        let metrics_server = MetricsServer::new(metrics, config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    // Runs until Ctrl+C, then tears every session down
    broker.run().await?;

    Ok(())
}
