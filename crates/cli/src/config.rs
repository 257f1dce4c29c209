//! Configuration loading from switchboard.toml.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use gateway::{MetaOptions, ProviderConfig, validate_provider_id};
use mcp::ServerConfig;
use sandbox::SandboxOptions;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Tool servers to start, one per `[[providers]]` table.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogConfig {
    /// How long a tool listing is reused before asking providers again.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SandboxConfig {
    /// Deadline for scripts that don't ask for one.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cap on a script's requested `timeoutMs`.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

/// One tool server.
#[derive(Debug, Deserialize)]
pub struct ProviderEntry {
    /// Prefix of this provider's tool ids.
    pub id: String,

    /// Display name; defaults to the id.
    pub name: Option<String>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-request timeout for this server.
    pub timeout_secs: Option<u64>,
}

fn default_ttl_secs() -> u64 {
    gateway::DEFAULT_TTL.as_secs()
}

fn default_timeout_ms() -> u64 {
    sandbox::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_timeout_ms() -> u64 {
    gateway::MAX_TIMEOUT.as_millis() as u64
}

fn default_max_log_entries() -> usize {
    sandbox::MAX_LOG_ENTRIES
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// No providers, default limits.
    pub fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            validate_provider_id(&provider.id)
                .map_err(|e| ConfigError::InvalidProvider(e.to_string()))?;
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::InvalidProvider(format!(
                    "duplicate provider id {:?}",
                    provider.id
                )));
            }
        }
        if self.sandbox.timeout_ms == 0 || self.sandbox.max_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox timeouts must be at least 1ms".into(),
            ));
        }
        Ok(())
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog.ttl_secs)
    }

    pub fn meta_options(&self) -> MetaOptions {
        MetaOptions {
            sandbox: SandboxOptions {
                timeout: Duration::from_millis(self.sandbox.timeout_ms),
                max_log_entries: self.sandbox.max_log_entries,
            },
            max_timeout: Duration::from_millis(self.sandbox.max_timeout_ms),
        }
    }

    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        self.providers
            .iter()
            .map(|entry| {
                let mut server = ServerConfig::new(&entry.id, &entry.command).with_args(&entry.args);
                server.env = entry.env.clone();
                if let Some(secs) = entry.timeout_secs {
                    server.timeout = Duration::from_secs(secs);
                }
                ProviderConfig::new(
                    &entry.id,
                    entry.name.as_deref().unwrap_or(&entry.id),
                    server,
                )
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
