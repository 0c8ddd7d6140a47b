//! Configuration system for Beacon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BEACON_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/beacon/config.toml
//!   3. ~/.config/beacon/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::policy::{Cidr, FilterRule, PolicyError, PolicySet, ShareDefault};
use crate::wire::{DISCOVERY_PORT, RELAY_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Visibility rules, in priority-tie order.
    pub filters: Vec<FilterConfig>,
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    pub relay: RelayConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the discovery listener binds.
    pub bind: String,
    /// TCP port for the discovery protocol.
    pub discovery_port: u16,
    /// TCP keepalive idle time in seconds. 0 = disabled.
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Delay between a source losing its last owner and its removal.
    pub grace_period_secs: u64,
    pub ownership: Ownership,
}

/// What a source's owner set is made of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    /// Each connection owns what it announced.
    #[default]
    Connection,
    /// The remote address owns what any of its connections announced.
    Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// `host:port` of the discovery server being fronted.
    pub upstream: String,
    /// Flush unfiltered after this long without a complete source list.
    pub flush_timeout_ms: u64,
    pub visibility: RelayVisibilityMode,
    /// Prefix length for `visibility = "subnet"`.
    pub subnet_prefix: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayVisibilityMode {
    /// Same rules as the discovery server.
    #[default]
    Rules,
    /// Client sees only sources in its own subnet.
    Subnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Status API port, bound on 127.0.0.1.
    pub port: u16,
}

/// A filter rule as written in the config file. CIDRs stay textual until
/// [`BeaconConfig::policy`] validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub name: String,
    pub range: String,
    pub default: Option<String>,
    pub authorized: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            discovery_port: DISCOVERY_PORT,
            keepalive_secs: 30,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 60,
            ownership: Ownership::Connection,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_string(),
            port: RELAY_PORT,
            upstream: format!("127.0.0.1:{DISCOVERY_PORT}"),
            flush_timeout_ms: 3000,
            visibility: RelayVisibilityMode::Rules,
            subnet_prefix: 24,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("beacon")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("filter {name:?}: {source}")]
    InvalidFilter {
        name: String,
        source: PolicyError,
    },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BeaconConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BeaconConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BEACON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BeaconConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Validate the filter list into a policy set.
    pub fn policy(&self) -> Result<PolicySet, ConfigError> {
        let rules = self
            .filters
            .iter()
            .map(|f| -> Result<FilterRule, ConfigError> {
                let invalid = |source: PolicyError| ConfigError::InvalidFilter {
                    name: f.name.clone(),
                    source,
                };
                Ok(FilterRule {
                    name: f.name.clone(),
                    range: f.range.parse().map_err(invalid)?,
                    default: f.default.clone().map(ShareDefault::from).unwrap_or_default(),
                    authorized: f
                        .authorized
                        .iter()
                        .map(|c| c.parse::<Cidr>())
                        .collect::<Result<_, _>>()
                        .map_err(invalid)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(PolicySet::new(rules))
    }

    /// Apply BEACON_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BEACON_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Ok(v) = std::env::var("BEACON_REGISTRY__GRACE_PERIOD_SECS") {
            if let Ok(s) = v.parse() {
                self.registry.grace_period_secs = s;
            }
        }
        if let Ok(v) = std::env::var("BEACON_RELAY__ENABLED") {
            self.relay.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BEACON_RELAY__PORT") {
            if let Ok(p) = v.parse() {
                self.relay.port = p;
            }
        }
        if let Ok(v) = std::env::var("BEACON_RELAY__UPSTREAM") {
            self.relay.upstream = v;
        }
        if let Ok(v) = std::env::var("BEACON_API__ENABLED") {
            self.api.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BEACON_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
