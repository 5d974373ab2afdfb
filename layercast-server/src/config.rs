use layercast_core::{
    DEFAULT_EXPIRATION, DEFAULT_LOOKUP_CONCURRENCY, DEFAULT_SCAN_COUNT, LayercastError, Result,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address peers know this node by. Written as the value of every
    /// presence record and excluded from lookups.
    pub address: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5080".to_string()
}

/// Shared store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    #[serde(default)]
    pub peers: Vec<String>,
    pub dns: Option<DnsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    Static,
    Dns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub host: String,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

fn default_dns_port() -> u16 {
    5080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    /// Defaults to half the expiration window.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    #[serde(default = "default_lookup_concurrency")]
    pub lookup_concurrency: usize,
}

fn default_expiration_secs() -> u64 {
    DEFAULT_EXPIRATION.as_secs()
}

fn default_scan_count() -> usize {
    DEFAULT_SCAN_COUNT
}

fn default_lookup_concurrency() -> usize {
    DEFAULT_LOOKUP_CONCURRENCY
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            expiration_secs: default_expiration_secs(),
            refresh_interval_secs: None,
            scan_count: default_scan_count(),
            lookup_concurrency: default_lookup_concurrency(),
        }
    }
}

impl RegistrySettings {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.expiration() / 2,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("LAYERCAST").separator("__"))
            .build()
            .map_err(|e| LayercastError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| LayercastError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.address.trim().is_empty() {
            return Err(LayercastError::Config(
                "node.address cannot be empty".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis.is_none() {
            return Err(LayercastError::Config(
                "redis configuration is required for redis backend".to_string(),
            ));
        }

        if self.discovery.mode == DiscoveryMode::Dns && self.discovery.dns.is_none() {
            return Err(LayercastError::Config(
                "dns configuration is required for dns discovery".to_string(),
            ));
        }

        let expiration = self.registry.expiration();
        if expiration.is_zero() {
            return Err(LayercastError::Config(
                "registry.expiration_secs must be greater than zero".to_string(),
            ));
        }

        let refresh = self.registry.refresh_interval();
        if refresh.is_zero() || refresh >= expiration {
            return Err(LayercastError::Config(format!(
                "registry.refresh_interval_secs ({}) must be between 1 and {}",
                refresh.as_secs(),
                self.registry.expiration_secs.saturating_sub(1)
            )));
        }

        Ok(())
    }
}
