use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use relay_protocol::{ChatPolicy, DEFAULT_RESTRICTED_INITIATOR};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [cache]
//                    backend = "redis"
//
//   env var:         RELAY_CACHE__BACKEND=redis   (double underscore = nesting)
//
//   (single underscore stays within field names: RELAY_CACHE__USER_TTL_SECS)
//
// Instances of one fleet must point `[database] url` at the same store and
// share a redis bus; the default SQLite file is private to one host.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub database: DatabaseFileConfig,
    #[serde(default)]
    pub cache: CacheFileConfig,
    #[serde(default)]
    pub bus: BusFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Tags connection records owned by this process. When unset a name unique
    /// to the process (`<hostname>-<pid>`) is generated at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            ws_port: default_ws_port(),
            instance_name: None,
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Durable store (lives under `[database]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseFileConfig {
    /// `sqlite://...` or `postgres://...`. Defaults to `relay.db` in the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

/// Cache tunables (lives under `[cache]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheFileConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_user_ttl_secs")]
    pub user_ttl_secs: u64,
    #[serde(default = "default_window_ttl_secs")]
    pub window_ttl_secs: u64,
}

impl Default for CacheFileConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            redis_url: default_redis_url(),
            user_ttl_secs: default_user_ttl_secs(),
            window_ttl_secs: default_window_ttl_secs(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusBackendKind {
    /// In-process broadcast; only correct for a single instance.
    #[default]
    Local,
    Redis,
}

/// Cross-instance bus tunables (lives under `[bus]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusFileConfig {
    #[serde(default)]
    pub backend: BusBackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
    #[serde(default = "default_resubscribe_delay_secs")]
    pub resubscribe_delay_secs: u64,
}

impl Default for BusFileConfig {
    fn default() -> Self {
        Self {
            backend: BusBackendKind::default(),
            redis_url: default_redis_url(),
            channel: default_channel(),
            capacity: default_bus_capacity(),
            resubscribe_delay_secs: default_resubscribe_delay_secs(),
        }
    }
}

/// Token validation tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub validation_endpoint: Option<String>,
    #[serde(default = "default_success_status_code")]
    pub success_status_code: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Accept the built-in demo tokens (`visitor1`, `exhibitor1`, …).
    #[serde(default)]
    pub demo_users: bool,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            validation_endpoint: None,
            success_status_code: default_success_status_code(),
            request_timeout_secs: default_request_timeout_secs(),
            demo_users: false,
        }
    }
}

/// Chat policy (lives under `[chat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    /// User type that may reply but never open a chat window. Empty disables the rule.
    #[serde(default = "default_restricted_initiator")]
    pub restricted_initiator: String,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            restricted_initiator: default_restricted_initiator(),
        }
    }
}

/// Liveness sweep (lives under `[heartbeat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            retry_delay_ms: default_heartbeat_retry_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_ws_port() -> u16 {
    8081
}
fn default_poll_timeout_ms() -> u16 {
    500
}
fn default_max_connections() -> u32 {
    5
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_user_ttl_secs() -> u64 {
    30 * 60
}
fn default_window_ttl_secs() -> u64 {
    10 * 60
}
fn default_channel() -> String {
    "chat-relay-outgoing".to_string()
}
fn default_bus_capacity() -> usize {
    1024
}
fn default_resubscribe_delay_secs() -> u64 {
    2
}
fn default_success_status_code() -> i64 {
    800200
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_restricted_initiator() -> String {
    DEFAULT_RESTRICTED_INITIATOR.to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_heartbeat_retry_delay_ms() -> u64 {
    2000
}

/// `<hostname>-<pid>`: distinct for every live relay process on a host.
pub fn default_instance_name() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "chat-relay".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Build a figment that layers: defaults → config.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_BUS__BACKEND=redis`  →  `bus.backend = "redis"`
///   `RELAY_HEARTBEAT__INTERVAL_SECS=30`  →  `heartbeat.interval_secs = 30`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub instance_name: String,
    /// The name came from configuration rather than `default_instance_name`.
    pub instance_name_explicit: bool,
    /// Upper bound on one readiness wait before the poll loop re-polls.
    pub poll_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        let explicit = fc
            .instance_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        Self {
            host: fc.host.clone(),
            http_port: fc.http_port,
            ws_port: fc.ws_port,
            instance_name: explicit.map_or_else(default_instance_name, str::to_string),
            instance_name_explicit: explicit.is_some(),
            poll_timeout: Duration::from_millis(u64::from(fc.poll_timeout_ms)),
        }
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .with_context(|| format!("Invalid HTTP listen address {}:{}", self.host, self.http_port))
    }

    pub fn ws_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.ws_port)
            .parse()
            .with_context(|| format!("Invalid WebSocket listen address {}:{}", self.host, self.ws_port))
    }
}

/// Database configuration (runtime view).
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_file(fc: &DatabaseFileConfig, relay: &RelayConfig) -> Self {
        Self {
            url: fc
                .url
                .clone()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| relay.db_url()),
            max_connections: fc.max_connections.max(1),
        }
    }

    /// Whether other hosts can reach this store.
    pub fn is_shareable(&self) -> bool {
        !self.url.starts_with("sqlite:")
    }
}

/// Cache configuration (runtime view).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: String,
    /// TTL for users, session owners and auth tokens.
    pub user_ttl: Duration,
    /// TTL for chat windows.
    pub window_ttl: Duration,
}

impl CacheConfig {
    pub fn from_file(fc: &CacheFileConfig) -> Self {
        Self {
            backend: fc.backend,
            redis_url: fc.redis_url.clone(),
            user_ttl: Duration::from_secs(fc.user_ttl_secs),
            window_ttl: Duration::from_secs(fc.window_ttl_secs),
        }
    }
}

/// Bus configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub backend: BusBackendKind,
    pub redis_url: String,
    pub channel: String,
    pub capacity: usize,
    pub resubscribe_delay: Duration,
}

impl BusConfig {
    pub fn from_file(fc: &BusFileConfig) -> Self {
        Self {
            backend: fc.backend,
            redis_url: fc.redis_url.clone(),
            channel: fc.channel.clone(),
            capacity: fc.capacity.max(1),
            resubscribe_delay: Duration::from_secs(fc.resubscribe_delay_secs),
        }
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub validation_endpoint: Option<String>,
    pub success_status_code: i64,
    pub request_timeout: Duration,
    pub demo_users: bool,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            validation_endpoint: fc.validation_endpoint.clone().filter(|e| !e.is_empty()),
            success_status_code: fc.success_status_code,
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
            demo_users: fc.demo_users,
        }
    }
}

/// Heartbeat configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub retry_delay: Duration,
}

impl HeartbeatConfig {
    pub fn from_file(fc: &HeartbeatFileConfig) -> Self {
        Self {
            interval: Duration::from_secs(fc.interval_secs.max(1)),
            retry_delay: Duration::from_millis(fc.retry_delay_ms),
        }
    }
}

pub fn chat_policy_from_file(fc: &ChatFileConfig) -> ChatPolicy {
    ChatPolicy::new(Some(fc.restricted_initiator.clone()))
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl RelayConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("relay.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
