use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use object_store_factory::ObjectStoreConfig;
use serde::Deserialize;

use crate::blob::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_ENTRY_TTL};
use crate::repository::{RepositoryOptions, DEFAULT_ROOT};
use crate::schema::cache::DEFAULT_VALIDATOR_CACHE_SIZE;
use crate::session::{
    Session, DEFAULT_READ_RETRIES, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_BACKOFF,
};

/// Prefix of environment overrides, e.g. `BLOBTABLE__STORE__ROOT=tenant1`.
pub const ENV_PREFIX: &str = "BLOBTABLE";

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct BlobtableConfig {
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub cache: Option<Cache>,
    #[serde(default)]
    pub misc: Misc,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Store {
    pub root: String,
    pub conditional_writes: bool,
    pub retract_on_delete: bool,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            conditional_writes: false,
            retract_on_delete: true,
        }
    }
}

impl Store {
    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            root: self.root.clone(),
            conditional_writes: self.conditional_writes,
            retract_on_delete: self.retract_on_delete,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Cache {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl_secs: DEFAULT_CACHE_ENTRY_TTL.as_secs(),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Misc {
    pub request_timeout_ms: u64,
    pub read_retries: u32,
    pub retry_backoff_ms: u64,
    pub validator_cache_size: u64,
}

impl Default for Misc {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            read_retries: DEFAULT_READ_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            validator_cache_size: DEFAULT_VALIDATOR_CACHE_SIZE,
        }
    }
}

impl Misc {
    /// Session that requests start from unless they override it.
    pub fn session(&self) -> Session {
        Session {
            timeout: Duration::from_millis(self.request_timeout_ms),
            read_retries: self.read_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            actor: None,
        }
    }
}

pub fn validate_config(config: BlobtableConfig) -> Result<BlobtableConfig, ConfigError> {
    if config.store.root.is_empty() || config.store.root.contains('/') {
        return Err(ConfigError::Message(format!(
            "store.root must be a non-empty name without '/', got {:?}",
            config.store.root
        )));
    }

    if config.misc.request_timeout_ms == 0 {
        return Err(ConfigError::Message(
            "misc.request_timeout_ms must be greater than 0".to_string(),
        ));
    }

    if config.misc.validator_cache_size == 0 {
        return Err(ConfigError::Message(
            "misc.validator_cache_size must be greater than 0".to_string(),
        ));
    }

    if let Some(cache) = &config.cache {
        if cache.capacity == 0 || cache.ttl_secs == 0 {
            return Err(ConfigError::Message(
                "cache.capacity and cache.ttl_secs must be greater than 0; \
                remove the [cache] section to disable caching"
                    .to_string(),
            ));
        }
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<BlobtableConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<BlobtableConfig, ConfigError> {
    let config = Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
