//! Configuration Module
//!
//! Provides TOML-based configuration for mqgate with support for:
//! - Server settings (bind address, socket options)
//! - Connection limits
//! - Session parameters and takeover policy
//! - Authentication
//! - Metrics endpoint
//! - Environment variable overrides (MQGATE__ prefix)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::codec::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::session::TakeoverPolicy;

pub use metrics::MetricsConfig;

mod metrics;


/// Hex digits appended to the prefix of a server-assigned client id
pub const GENERATED_ID_SUFFIX_LEN: usize = 16;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
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

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time (e.g., "60s"), unset to leave the OS default
    #[serde(default, with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of live sessions (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Time allowed between accept and a complete CONNECT (e.g., "10s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_max_connections() -> usize {
    100_000
}
fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive applied when a client asks for 0 (0 = disabled)
    #[serde(default)]
    pub default_keep_alive: u16,
    /// Maximum keep alive in seconds, larger requests are clamped
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
    /// Longest accepted client identifier in bytes (0 = unbounded)
    #[serde(default = "default_max_client_id_len")]
    pub max_client_id_len: usize,
    /// Prefix of server-assigned client identifiers
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Behaviour when a CONNECT reuses a live client identifier
    #[serde(default)]
    pub takeover: TakeoverPolicy,
}

fn default_max_keep_alive() -> u16 {
    65535
}
fn default_max_client_id_len() -> usize {
    23
}
fn default_client_id_prefix() -> String {
    "mqgate-".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 0,
            max_keep_alive: default_max_keep_alive(),
            max_client_id_len: default_max_client_id_len(),
            client_id_prefix: default_client_id_prefix(),
            takeover: TakeoverPolicy::default(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    #[serde(default)]
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
    /// Username
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQGATE__` prefix with double underscores for nesting:
    ///    - `MQGATE__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `MQGATE__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `MQGATE__SESSION__TAKEOVER=reject` overrides `session.takeover`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.tcp_nodelay", true)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("limits.connect_timeout", "10s")?
            .set_default("session.default_keep_alive", 0)?
            .set_default("session.max_keep_alive", 65535)?
            .set_default("session.max_client_id_len", 23)?
            .set_default("session.client_id_prefix", "mqgate-")?
            .set_default("session.takeover", "replace")?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
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
                Environment::with_prefix("MQGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size == 0 || self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }

        if self.limits.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }

        if self.session.max_keep_alive != 0
            && self.session.default_keep_alive > self.session.max_keep_alive
        {
            return Err(ConfigError::Validation(
                "default_keep_alive cannot exceed max_keep_alive".to_string(),
            ));
        }

        // Server-assigned ids must themselves pass the length check
        let generated_len = self.session.client_id_prefix.len() + GENERATED_ID_SUFFIX_LEN;
        if self.session.max_client_id_len != 0 && generated_len > self.session.max_client_id_len {
            return Err(ConfigError::Validation(format!(
                "client_id_prefix '{}' is too long for max_client_id_len {}",
                self.session.client_id_prefix, self.session.max_client_id_len
            )));
        }

        // Validate user password configuration
        if self.auth.enabled {
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
        }

        Ok(())
    }

    /// Build a user lookup map for efficient auth checks
    pub fn build_user_map(&self) -> HashMap<String, &UserConfig> {
        self.auth
            .users
            .iter()
            .map(|user| (user.username.clone(), user))
            .collect()
    }
}
