//! Server configuration.
//!
//! Configuration is layered from:
//! - A TOML file (`roomcast.toml`, `/etc/roomcast/roomcast.toml` or
//!   `~/.config/roomcast/roomcast.toml`, first match wins)
//! - Environment variables (`ROOMCAST__PORT`, `ROOMCAST__REDIS__URL`, ...)

use anyhow::{Context, Result};
use roomcast_core::{
    BusConfig, HubConfig, HubSettings, Identity, InviteConfig, RateLimitConfig, RegistryConfig,
    RoomConfig, StaticSessionGate,
};
use roomcast_core::ratelimit::LimitRule;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file search path.
const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Environment variable prefix.
const ENV_PREFIX: &str = "ROOMCAST";

/// Settings that parse but cannot be used together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("rooms.min_capacity ({min}) is greater than rooms.max_capacity ({max})")]
    CapacityRange { min: u32, max: u32 },

    #[error("rooms.default_capacity ({0}) is outside the room capacity range")]
    DefaultCapacity(u32),

    #[error("invites.min_expires_in_secs is greater than invites.max_expires_in_secs")]
    ExpiryRange,

    #[error("invites.default_expires_in_secs is outside the invite expiry range")]
    DefaultExpiry,

    #[error("rate_limits.{0} needs a positive max and window")]
    EmptyRule(&'static str),

    #[error("heartbeat.interval_ms and heartbeat.timeout_ms must be positive")]
    Heartbeat,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifies this process in bus envelopes. Generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub connections: ConnectionsConfig,

    #[serde(default)]
    pub rooms: RoomsConfig,

    #[serde(default)]
    pub invites: InvitesConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// WebSocket liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// A socket write taking longer than this drops the connection.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Connection limits and idle reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Dead connections idle longer than this are reclaimed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Room limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,

    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,

    #[serde(default = "default_max_description_length")]
    pub max_description_length: usize,

    /// Maximum chat message length in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

/// Invite limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitesConfig {
    #[serde(default = "default_expires_in")]
    pub default_expires_in_secs: u64,

    #[serde(default = "default_min_expires_in")]
    pub min_expires_in_secs: u64,

    #[serde(default = "default_max_expires_in")]
    pub max_expires_in_secs: u64,

    #[serde(default = "default_max_usage_limit")]
    pub max_usage_limit: u32,

    /// How long records outlive their expiry so late redemptions read as expired.
    #[serde(default = "default_retention_grace")]
    pub retention_grace_secs: u64,
}

/// One rate limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub max: u32,
    pub window_secs: u64,
}

impl From<RuleConfig> for LimitRule {
    fn from(rule: RuleConfig) -> Self {
        LimitRule {
            max: rule.max,
            window: Duration::from_secs(rule.window_secs),
        }
    }
}

/// Rate limit policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_login_rule")]
    pub login: RuleConfig,

    #[serde(default = "default_registration_rule")]
    pub registration: RuleConfig,

    #[serde(default = "default_api_rule")]
    pub api: RuleConfig,

    #[serde(default = "default_messages_rule")]
    pub messages: RuleConfig,

    /// Deadline for each window store call; past it the request is allowed.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

/// Redis connection. Without a URL, in-process backends are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// Postgres connection. Without a URL, rooms are kept in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

/// A fixed session token, for development.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSession {
    pub token: String,
    pub user_id: i64,
    pub username: String,
}

/// Session resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Tokens accepted when no Redis session store is configured.
    #[serde(default)]
    pub sessions: Vec<StaticSession>,
}

impl AuthConfig {
    /// Build a gate from the configured tokens.
    #[must_use]
    pub fn static_gate(&self) -> StaticSessionGate {
        self.sessions
            .iter()
            .fold(StaticSessionGate::new(), |gate, s| {
                gate.with_session(s.token.clone(), Identity::new(s.user_id, s.username.clone()))
            })
    }
}

/// Graceful shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on draining after a shutdown signal.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_capacity() -> u32 {
    10
}

fn default_min_capacity() -> u32 {
    2
}

fn default_max_capacity() -> u32 {
    100
}

fn default_max_name_length() -> usize {
    100
}

fn default_max_description_length() -> usize {
    500
}

fn default_max_message_length() -> usize {
    2_000
}

fn default_expires_in() -> u64 {
    86_400 // 1 day
}

fn default_min_expires_in() -> u64 {
    300
}

fn default_max_expires_in() -> u64 {
    604_800 // 7 days
}

fn default_max_usage_limit() -> u32 {
    100
}

fn default_retention_grace() -> u64 {
    3_600
}

fn default_login_rule() -> RuleConfig {
    RuleConfig { max: 5, window_secs: 900 }
}

fn default_registration_rule() -> RuleConfig {
    RuleConfig { max: 3, window_secs: 3_600 }
}

fn default_api_rule() -> RuleConfig {
    RuleConfig { max: 100, window_secs: 900 }
}

fn default_messages_rule() -> RuleConfig {
    RuleConfig { max: 30, window_secs: 10 }
}

fn default_store_timeout() -> u64 {
    100
}

fn default_db_connections() -> u32 {
    10
}

fn default_grace_period() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: None,
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connections: ConnectionsConfig::default(),
            rooms: RoomsConfig::default(),
            invites: InvitesConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_capacity(),
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
            max_name_length: default_max_name_length(),
            max_description_length: default_max_description_length(),
            max_message_length: default_max_message_length(),
        }
    }
}

impl Default for InvitesConfig {
    fn default() -> Self {
        Self {
            default_expires_in_secs: default_expires_in(),
            min_expires_in_secs: default_min_expires_in(),
            max_expires_in_secs: default_max_expires_in(),
            max_usage_limit: default_max_usage_limit(),
            retention_grace_secs: default_retention_grace(),
        }
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            login: default_login_rule(),
            registration: default_registration_rule(),
            api: default_api_rule(),
            messages: default_messages_rule(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_db_connections(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, an
    /// environment override has the wrong type, or validation fails.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS.iter().find_map(|path| {
            let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
            expanded.exists().then_some(expanded)
        })
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first constraint that does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rooms = &self.rooms;
        if rooms.min_capacity > rooms.max_capacity {
            return Err(ConfigError::CapacityRange {
                min: rooms.min_capacity,
                max: rooms.max_capacity,
            });
        }
        if !(rooms.min_capacity..=rooms.max_capacity).contains(&rooms.default_capacity) {
            return Err(ConfigError::DefaultCapacity(rooms.default_capacity));
        }

        let invites = &self.invites;
        if invites.min_expires_in_secs > invites.max_expires_in_secs {
            return Err(ConfigError::ExpiryRange);
        }
        if !(invites.min_expires_in_secs..=invites.max_expires_in_secs)
            .contains(&invites.default_expires_in_secs)
        {
            return Err(ConfigError::DefaultExpiry);
        }

        let limits = &self.rate_limits;
        for (name, rule) in [
            ("login", limits.login),
            ("registration", limits.registration),
            ("api", limits.api),
            ("messages", limits.messages),
        ] {
            if rule.max == 0 || rule.window_secs == 0 {
                return Err(ConfigError::EmptyRule(name));
            }
        }

        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(ConfigError::Heartbeat);
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Service settings derived from this configuration.
    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        let rooms = RoomConfig {
            default_capacity: self.rooms.default_capacity,
            min_capacity: self.rooms.min_capacity,
            max_capacity: self.rooms.max_capacity,
            max_name_length: self.rooms.max_name_length,
            max_description_length: self.rooms.max_description_length,
            ..RoomConfig::default()
        };

        let invites = InviteConfig {
            default_ttl: Duration::from_secs(self.invites.default_expires_in_secs),
            min_ttl: Duration::from_secs(self.invites.min_expires_in_secs),
            max_ttl: Duration::from_secs(self.invites.max_expires_in_secs),
            max_usage_limit: self.invites.max_usage_limit,
            retention_grace: Duration::from_secs(self.invites.retention_grace_secs),
            ..InviteConfig::default()
        };

        let rate_limits = RateLimitConfig {
            login: self.rate_limits.login.into(),
            registration: self.rate_limits.registration.into(),
            api: self.rate_limits.api.into(),
            messages: self.rate_limits.messages.into(),
            store_timeout: Duration::from_millis(self.rate_limits.store_timeout_ms),
        };

        let registry = RegistryConfig {
            max_connections: self.connections.max_connections,
            max_subscriptions_per_connection: self.connections.max_subscriptions_per_connection,
            idle_timeout: Duration::from_secs(self.connections.idle_timeout_secs),
        };

        let bus = match &self.node_id {
            Some(node_id) => BusConfig {
                node_id: node_id.clone(),
                ..BusConfig::default()
            },
            None => BusConfig::default(),
        };

        let hub = HubConfig {
            max_message_length: self.rooms.max_message_length,
            max_frame_size: self.transport.max_message_size,
            ..HubConfig::default()
        };

        HubSettings {
            rooms,
            invites,
            rate_limits,
            registry,
            bus,
            hub,
        }
    }
}
