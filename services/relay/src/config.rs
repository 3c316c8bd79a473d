//! Relay configuration.
//!
//! Loaded once from a TOML file at startup and passed by reference to
//! everything that needs it; there is no reload.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;

use crate::error::RelayError;
use crate::logging::LogFormat;
use crate::proxy::{BackendAddr, BackendPool, DEFAULT_BACKLOG};

/// One listening port and its backend pool.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    /// Port as written in the file; range-checked when binding.
    pub port: u32,
    /// Backends for this port.
    pub pool: BackendPool,
}

/// Validated relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listeners in file order.
    pub listeners: Vec<ListenerSpec>,

    /// Address every listener binds on.
    pub bind_host: IpAddr,

    /// Listen backlog.
    pub backlog: u32,

    /// Fixed seed for backend selection; OS entropy when unset.
    pub selection_seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_format: Option<LogFormat>,
    #[serde(default)]
    bind_host: Option<IpAddr>,
    #[serde(default)]
    backlog: Option<u32>,
    #[serde(default)]
    selection_seed: Option<u64>,
    #[serde(default)]
    listeners: Vec<ListenerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenerEntry {
    port: u32,
    #[serde(default)]
    backends: Vec<BackendEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendEntry {
    host: String,
    port: u32,
}

impl RelayConfig {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let content = fs::read_to_string(path).map_err(|source| RelayError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, RelayError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| RelayError::Config(e.to_string()))?;

        if file.listeners.is_empty() {
            return Err(RelayError::Config(
                "at least one [[listeners]] entry is required".to_string(),
            ));
        }

        let listeners = file
            .listeners
            .into_iter()
            .map(ListenerEntry::into_spec)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            listeners,
            bind_host: file
                .bind_host
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            backlog: file.backlog.unwrap_or(DEFAULT_BACKLOG).max(1),
            selection_seed: file.selection_seed,
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
            log_format: file.log_format.unwrap_or_default(),
        })
    }

    /// Ports in configured order.
    pub fn ports(&self) -> Vec<u32> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    fn apply_env_overrides(&mut self) -> Result<(), RelayError> {
        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Ok(format) = std::env::var("RELAY_LOG_FORMAT") {
            self.log_format = format.parse().map_err(|_| {
                RelayError::Config(format!(
                    "RELAY_LOG_FORMAT must be 'json' or 'compact', got '{}'",
                    format
                ))
            })?;
        }

        Ok(())
    }
}

impl ListenerEntry {
    fn into_spec(self) -> Result<ListenerSpec, RelayError> {
        let port = self.port;
        if self.backends.is_empty() {
            return Err(RelayError::Config(format!(
                "listener on port {} has no backends",
                port
            )));
        }

        let backends = self
            .backends
            .into_iter()
            .map(|b| b.into_addr(port))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListenerSpec {
            port,
            pool: BackendPool::new(backends)?,
        })
    }
}

impl BackendEntry {
    fn into_addr(self, listen_port: u32) -> Result<BackendAddr, RelayError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(RelayError::Config(format!(
                "listener on port {} has a backend with an empty host",
                listen_port
            )));
        }

        let port = u16::try_from(self.port).map_err(|_| {
            RelayError::Config(format!(
                "listener on port {}: backend {} has invalid port {} (must be 0-65535)",
                listen_port, host, self.port
            ))
        })?;

        Ok(BackendAddr::new(host, port))
    }
}
