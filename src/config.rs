//! Configuration management for toolmesh
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::aggregator::backoff::BackoffConfig;
use crate::aggregator::connector::{parse_http_url, validate_connection_config};
use crate::aggregator::health::HealthConfig;
use crate::aggregator::models::ServerRegistration;
use crate::aggregator::registry::validate_server_name;
use crate::aggregator::session::SessionConfig;
use crate::aggregator::store::{MemoryStore, SqliteStore, Store};
use crate::aggregator::AggregatorSettings;
use crate::error::{AggregatorError, Result};

/// Main configuration structure for toolmesh
///
/// Every section is optional in the file; missing sections take their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Timeouts and client identity
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Health monitor settings
    #[serde(default)]
    pub health: HealthSettings,
    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: BackoffConfig,
    /// Where server records and the catalog live
    #[serde(default)]
    pub storage: StorageConfig,
    /// Servers registered at startup
    #[serde(default)]
    pub servers: Vec<ServerRegistration>,
}

/// Gateway timeouts and identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bound on transport setup plus the MCP handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Bound on one forwarded tool call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Bound on one discovery run
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_seconds: u64,

    /// Name reported to servers as `clientInfo.name`
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    60
}

fn default_discovery_timeout() -> u64 {
    30
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            call_timeout_seconds: default_call_timeout(),
            discovery_timeout_seconds: default_discovery_timeout(),
            client_name: default_client_name(),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Run the health loop in `serve`
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Seconds between ticks
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,

    /// Deadline of one probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Consecutive failed probes before a server goes to ERROR
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_seconds: default_health_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Nothing survives a restart
    #[default]
    Memory,
    /// SQLite database file
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = AggregatorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(AggregatorError::Config(format!(
                "Invalid storage backend: {other}. Must be one of: memory, sqlite"
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite file; defaults to `toolmesh.db` in the platform data dir
    #[serde(default)]
    pub path: Option<String>,
}

impl StorageConfig {
    /// The SQLite path to use, creating the default data dir if needed.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(path));
        }
        let proj_dirs = ProjectDirs::from("dev", "toolmesh", "toolmesh")
            .ok_or_else(|| AggregatorError::Storage("Could not determine data directory".into()))?;
        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("Failed to create data directory")
            .map_err(|e| AggregatorError::Storage(format!("{e:#}")))?;
        Ok(data_dir.join("toolmesh.db"))
    }

    /// Open the configured store.
    pub fn open(&self) -> Result<Arc<dyn Store>> {
        match self.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StorageBackend::Sqlite => {
                let path = self.resolved_path()?;
                tracing::info!("Using SQLite store at {}", path.display());
                Ok(Arc::new(SqliteStore::open(path)?))
            }
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AggregatorError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parse a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| AggregatorError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(backend) = std::env::var("TOOLMESH_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.storage.backend = backend,
                Err(e) => tracing::warn!("Ignoring TOOLMESH_STORAGE_BACKEND: {}", e),
            }
        }

        if let Ok(path) = std::env::var("TOOLMESH_STORAGE_PATH") {
            self.storage.path = Some(path);
        }

        if let Ok(interval) = std::env::var("TOOLMESH_HEALTH_INTERVAL_SECONDS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.health.interval_seconds = value;
            } else {
                tracing::warn!("Invalid TOOLMESH_HEALTH_INTERVAL_SECONDS: {}", interval);
            }
        }

        if let Ok(threshold) = std::env::var("TOOLMESH_HEALTH_FAILURE_THRESHOLD") {
            if let Ok(value) = threshold.parse::<u32>() {
                self.health.failure_threshold = value;
            } else {
                tracing::warn!("Invalid TOOLMESH_HEALTH_FAILURE_THRESHOLD: {}", threshold);
            }
        }

        if let Ok(timeout) = std::env::var("TOOLMESH_CALL_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.gateway.call_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid TOOLMESH_CALL_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(timeout) = std::env::var("TOOLMESH_CONNECT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.gateway.connect_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid TOOLMESH_CONNECT_TIMEOUT_SECONDS: {}", timeout);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
        if let Some(path) = &cli.storage_path {
            self.storage.backend = StorageBackend::Sqlite;
            self.storage.path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// Ensures timeouts and intervals are positive, the backoff is sane, and
    /// every configured server would be accepted by the registry.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("gateway.connect_timeout_seconds", self.gateway.connect_timeout_seconds),
            ("gateway.call_timeout_seconds", self.gateway.call_timeout_seconds),
            ("gateway.discovery_timeout_seconds", self.gateway.discovery_timeout_seconds),
            ("health.interval_seconds", self.health.interval_seconds),
            ("health.probe_timeout_seconds", self.health.probe_timeout_seconds),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AggregatorError::Config(format!("{name} must be greater than 0")).into());
            }
        }

        if self.health.failure_threshold == 0 {
            return Err(AggregatorError::Config(
                "health.failure_threshold must be greater than 0".to_string(),
            )
            .into());
        }

        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(AggregatorError::Config(
                "reconnect.max_delay_seconds must not be less than reconnect.base_delay_seconds"
                    .to_string(),
            )
            .into());
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(AggregatorError::Config(
                "reconnect.jitter_ratio must be between 0.0 and 1.0".to_string(),
            )
            .into());
        }

        if self.reconnect.multiplier.is_nan() || self.reconnect.multiplier < 1.0 {
            return Err(AggregatorError::Config(
                "reconnect.multiplier must be at least 1.0".to_string(),
            )
            .into());
        }

        if self.gateway.client_name.trim().is_empty() {
            return Err(AggregatorError::Config("gateway.client_name cannot be empty".to_string()).into());
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            let invalid = |e: AggregatorError| {
                AggregatorError::Config(format!("Invalid server '{}': {}", server.name, e))
            };
            validate_server_name(&server.name).map_err(invalid)?;
            validate_connection_config(server.transport_kind, &server.connection_config).map_err(invalid)?;
            if let Some(url) = &server.health_check_url {
                parse_http_url(url).map_err(invalid)?;
            }
            if !names.insert(server.name.as_str()) {
                return Err(AggregatorError::Config(format!(
                    "Server '{}' is configured more than once",
                    server.name
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Runtime settings for [`crate::aggregator::Aggregator`].
    pub fn settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            session: SessionConfig {
                connect_timeout: Duration::from_secs(self.gateway.connect_timeout_seconds),
                client_name: self.gateway.client_name.clone(),
                ..SessionConfig::default()
            },
            call_timeout: Duration::from_secs(self.gateway.call_timeout_seconds),
            discovery_timeout: Duration::from_secs(self.gateway.discovery_timeout_seconds),
            health: HealthConfig {
                enabled: self.health.enabled,
                interval: Duration::from_secs(self.health.interval_seconds),
                probe_timeout: Duration::from_secs(self.health.probe_timeout_seconds),
                failure_threshold: self.health.failure_threshold,
            },
            backoff: self.reconnect.clone(),
        }
    }
}
