//! Strategy configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file named by the `HVD_CONFIG_PATH` environment variable
//! 3. Environment variables prefixed `HVD_` (e.g. `HVD_ROOT_RANK=1`)
//!
//! ```toml
//! parallel_devices = ["cuda:0", "cuda:1"]
//! root_rank = 0
//! ```

use crate::error::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use hvd_core::Device;
use serde::{Deserialize, Serialize};

/// ENV naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "HVD_CONFIG_PATH";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "HVD_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Devices of one host, indexed by local rank. Empty means one CPU per local rank.
    pub parallel_devices: Vec<Device>,

    /// Default source rank of object broadcasts. Initial state always comes from rank 0.
    pub root_rank: usize,
}

impl StrategyConfig {
    pub fn new(parallel_devices: Vec<Device>) -> Self {
        Self {
            parallel_devices,
            ..Self::default()
        }
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(StrategyConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["log", "config_path"]))
    }

    /// Load configuration from the default figment (env and files).
    pub fn from_env() -> Result<Self> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    pub fn extract_from<P: Provider>(provider: P) -> Result<Self> {
        Ok(Figment::from(provider).extract()?)
    }

    /// The devices ranks on this host bind to.
    pub fn resolve_devices(&self, local_size: usize) -> Vec<Device> {
        if self.parallel_devices.is_empty() {
            vec![Device::Cpu; local_size.max(1)]
        } else {
            self.parallel_devices.clone()
        }
    }
}
