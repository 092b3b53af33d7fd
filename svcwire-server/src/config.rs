//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SVCWIRE_CONFIG)
//! 3. Environment variables

use crate::auth::TokenValidator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use svcwire_protocol::codec::SplitConfig;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Framing and splitting limits.
    pub protocol: ProtocolConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// File upload storage.
    pub uploads: UploadConfig,
    /// Proxied resources.
    pub resources: ResourceConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SVCWIRE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.uploads.apply_env_overrides();
        self.resources.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        if self.auth.required && self.auth.token_hashes.is_empty() && self.auth.grants.is_empty()
        {
            return Err(ConfigError::Validation(
                "auth required but no token hashes configured".to_string(),
            ));
        }
        if self.uploads.enabled && self.uploads.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "uploads enabled but root_dir is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the hello frame.
    pub handshake_timeout_secs: u64,
    /// Server ping interval; 0 disables the heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Time allowed for a pong.
    pub heartbeat_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, svcwire_protocol::DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("SVCWIRE_BIND") {
            self.bind_addr = addr;
        }
        if let Some(secs) = env_parse("SVCWIRE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = env_parse("SVCWIRE_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
        if let Some(secs) = env_parse("SVCWIRE_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = secs;
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Heartbeat interval, `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Framing and splitting limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Outbound messages larger than this are split.
    pub split_threshold_bytes: usize,
    /// Fragment size for split messages.
    pub split_chunk_bytes: usize,
    /// Cap on one reassembled message.
    pub max_message_bytes: u64,
    /// Idle time after which a partial inbound transfer is dropped.
    pub reassembly_timeout_secs: u64,
    /// Include stacks in error responses.
    pub expose_stack: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            split_threshold_bytes: svcwire_protocol::DEFAULT_SPLIT_THRESHOLD,
            split_chunk_bytes: svcwire_protocol::DEFAULT_SPLIT_CHUNK,
            max_message_bytes: svcwire_protocol::MAX_MESSAGE_SIZE,
            reassembly_timeout_secs: 60,
            expose_stack: true,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("SVCWIRE_SPLIT_THRESHOLD") {
            self.split_threshold_bytes = n;
        }
        if let Some(n) = env_parse("SVCWIRE_MAX_MESSAGE_BYTES") {
            self.max_message_bytes = n;
        }
        if let Some(flag) = env_flag("SVCWIRE_EXPOSE_STACK") {
            self.expose_stack = flag;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.split_chunk_bytes == 0 {
            return Err(ConfigError::Validation(
                "split_chunk_bytes must be positive".to_string(),
            ));
        }
        if self.split_chunk_bytes > svcwire_protocol::MAX_PAYLOAD_SIZE as usize {
            return Err(ConfigError::Validation(format!(
                "split_chunk_bytes exceeds the frame payload limit of {} bytes",
                svcwire_protocol::MAX_PAYLOAD_SIZE
            )));
        }
        if self.split_threshold_bytes > svcwire_protocol::MAX_PAYLOAD_SIZE as usize {
            return Err(ConfigError::Validation(
                "split_threshold_bytes must fit in one frame".to_string(),
            ));
        }
        Ok(())
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            threshold: self.split_threshold_bytes,
            chunk_size: self.split_chunk_bytes,
            max_message_size: self.max_message_bytes,
        }
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether a valid token is required at handshake.
    pub required: bool,
    /// List of valid token hashes (SHA-256 hex strings).
    /// Generate hashes with: `svcwire-cli hash-token <your-token>`
    pub token_hashes: Vec<String>,
    /// Permissions granted per token hash.
    pub grants: BTreeMap<String, Vec<String>>,
    /// Optional path to a secrets file, one `hash[:perm,perm]` per line.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("SVCWIRE_AUTH_REQUIRED") {
            self.required = flag;
        }
        if let Ok(hash) = std::env::var("SVCWIRE_AUTH_TOKEN_HASH") {
            if !hash.is_empty() {
                self.token_hashes.push(hash);
            }
        }
        if let Ok(path) = std::env::var("SVCWIRE_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads token hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.secrets_file.clone() else {
            return Ok(());
        };
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path, e))?;
        for (hash, perms) in content.lines().filter_map(TokenValidator::parse_line) {
            if perms.is_empty() {
                self.token_hashes.push(hash);
            } else {
                self.grants.entry(hash).or_default().extend(perms);
            }
        }
        Ok(())
    }

    /// Builds the validator for the configured tokens.
    pub fn validator(&self) -> TokenValidator {
        let mut validator = TokenValidator::new(self.token_hashes.iter().cloned());
        for (hash, perms) in &self.grants {
            validator.grant(hash, perms.iter().cloned());
        }
        validator
    }

    /// Returns whether authentication is effectively disabled.
    pub fn is_disabled(&self) -> bool {
        !self.required
    }
}

/// Upload storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    /// Directory uploaded paths are resolved against.
    pub root_dir: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root_dir: PathBuf::from("./uploads"),
        }
    }
}

impl UploadConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("SVCWIRE_UPLOADS_ENABLED") {
            self.enabled = flag;
        }
        if let Ok(dir) = std::env::var("SVCWIRE_UPLOAD_DIR") {
            self.root_dir = PathBuf::from(dir);
        }
    }
}

/// Which resource driver backs the `DbProxy` service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDriverKind {
    #[default]
    None,
    /// In-process transactional key/value store.
    Memory,
}

/// Proxied resource configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub driver: ResourceDriverKind,
}

impl ResourceConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(driver) = std::env::var("SVCWIRE_RESOURCE_DRIVER") {
            self.driver = match driver.to_lowercase().as_str() {
                "memory" => ResourceDriverKind::Memory,
                _ => ResourceDriverKind::None,
            };
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("SVCWIRE_METRICS_ENABLED") {
            self.enabled = flag;
        }
        if let Some(addr) = env_parse("SVCWIRE_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
