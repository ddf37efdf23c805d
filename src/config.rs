//! Process configuration (§10.3): a small `Config` struct behind a global
//! `ArcSwap`, following the teacher's `config/mod.rs` pattern — detect
//! format from the file extension, parse via `serde`, publish a clone
//! for readers, swap the whole thing on reload.

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::ConfigError;

/// Configuration file format, detected from the path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn detect(path: &str) -> Self {
        let lower = path.to_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        }
    }
}

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Address the accept loop binds to (§10.4).
    #[serde(default = "Config::default_listen_address")]
    pub listen_address: String,

    /// Whether newly constructed connections start with their compiled-
    /// query cache enabled (mirrors the per-`Connection` field, §3).
    #[serde(default = "Config::default_query_cache_enabled")]
    pub query_cache_enabled: bool,

    /// Controls whether the `'pgaddr'` parameter status is emitted during
    /// auth (§4.3). Read once per connection, during the handshake (§9:
    /// "global mutable debug flags... do not read it per-message").
    #[serde(default)]
    pub developer_mode: bool,

    /// Flush threshold for the write buffer, in bytes (§4.1, §5).
    #[serde(default = "Config::default_max_buffered_write_bytes")]
    pub max_buffered_write_bytes: usize,

    /// Default module alias registered by initcon (§4.3).
    #[serde(default = "Config::default_module_alias")]
    pub default_module_alias: String,

    /// Bound on the number of entries the compiled-query cache keeps per
    /// connection (§9: "no eviction policy is specified... implementers
    /// are free to add LRU bounds").
    #[serde(default = "Config::default_query_cache_capacity")]
    pub query_cache_capacity: usize,
}

impl Config {
    fn default_listen_address() -> String {
        "127.0.0.1:5656".to_string()
    }

    fn default_query_cache_enabled() -> bool {
        true
    }

    fn default_max_buffered_write_bytes() -> usize {
        crate::framing::DEFAULT_FLUSH_THRESHOLD
    }

    fn default_module_alias() -> String {
        "default".to_string()
    }

    fn default_query_cache_capacity() -> usize {
        1024
    }

    pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
        let format = ConfigFormat::detect(path);
        let contents = load_file(path).await?;
        parse(&contents, format)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: Config::default_listen_address(),
            query_cache_enabled: Config::default_query_cache_enabled(),
            developer_mode: false,
            max_buffered_write_bytes: Config::default_max_buffered_write_bytes(),
            default_module_alias: Config::default_module_alias(),
            query_cache_capacity: Config::default_query_cache_capacity(),
        }
    }
}

fn parse(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Toml => Ok(toml::from_str(contents)?),
        ConfigFormat::Yaml => Ok(serde_yaml::from_str(contents)?),
    }
}

async fn load_file(path: &str) -> Result<String, ConfigError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ConfigError::Open {
            path: path.to_string(),
            source,
        })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .await
        .map_err(|source| ConfigError::Open {
            path: path.to_string(),
            source,
        })?;
    Ok(contents)
}

/// Read-only snapshot of the current configuration. Cheap: `ArcSwap`
/// makes this a load plus a clone.
pub fn get_config() -> Config {
    (**CONFIG.load()).clone()
}

pub fn set_config(config: Config) {
    CONFIG.store(std::sync::Arc::new(config));
}
