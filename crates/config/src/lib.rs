//! Downstream connection pool configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! - `RPCPOOL_<FIELD>` sets a pool default, e.g. `RPCPOOL_POOL_SIZE=8`
//! - `<SERVICE>_ADDR` sets the target of a declared service, e.g.
//!   `ORDER_SERVICE_ADDR` sets `order-service`
//!
//! ```toml
//! [pool]
//! pool_size = 5
//! max_age_secs = 1800
//!
//! [services]
//! order-service = "orders.internal:9000"
//! user-service = ""   # not deployed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Prefix of environment variables overriding [`PoolDefaults`].
pub const ENV_PREFIX: &str = "RPCPOOL_";

/// Suffix of environment variables overriding a service target.
pub const SERVICE_ADDR_SUFFIX: &str = "_ADDR";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),

    #[error("Configuration validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

// ============================================================================
// Pool defaults
// ============================================================================

/// Settings applied to every downstream pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PoolDefaults {
    /// Connections per pool
    #[validate(range(min = 1, max = 1024))]
    pub pool_size: usize,

    #[validate(range(min = 1))]
    pub keepalive_interval_secs: u64,

    #[validate(range(min = 1))]
    pub keepalive_timeout_secs: u64,

    /// Unused time after which a connection reports idle
    #[validate(range(min = 1))]
    pub max_idle_secs: u64,

    /// Age at which a connection is recycled
    #[validate(range(min = 1))]
    pub max_age_secs: u64,

    pub max_age_grace_secs: u64,

    #[validate(range(min = 1))]
    pub connect_timeout_secs: u64,

    /// Per-request timeout; unbounded when unset
    #[validate(range(min = 1))]
    pub request_timeout_secs: Option<u64>,

    /// Period of the background repair pass
    #[validate(range(min = 1))]
    pub repair_interval_secs: u64,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            pool_size: 5,
            keepalive_interval_secs: 10,
            keepalive_timeout_secs: 3,
            max_idle_secs: 900,
            max_age_secs: 1800,
            max_age_grace_secs: 5,
            connect_timeout_secs: 5,
            request_timeout_secs: None,
            repair_interval_secs: 30,
        }
    }
}

/// Environment overrides; unset variables leave the loaded value alone.
#[derive(Debug, Deserialize)]
struct PoolOverrides {
    pool_size: Option<usize>,
    keepalive_interval_secs: Option<u64>,
    keepalive_timeout_secs: Option<u64>,
    max_idle_secs: Option<u64>,
    max_age_secs: Option<u64>,
    max_age_grace_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    repair_interval_secs: Option<u64>,
}

impl PoolOverrides {
    fn apply(self, pool: &mut PoolDefaults) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut pool.pool_size, self.pool_size);
        set(&mut pool.keepalive_interval_secs, self.keepalive_interval_secs);
        set(&mut pool.keepalive_timeout_secs, self.keepalive_timeout_secs);
        set(&mut pool.max_idle_secs, self.max_idle_secs);
        set(&mut pool.max_age_secs, self.max_age_secs);
        set(&mut pool.max_age_grace_secs, self.max_age_grace_secs);
        set(&mut pool.connect_timeout_secs, self.connect_timeout_secs);
        set(&mut pool.repair_interval_secs, self.repair_interval_secs);
        if self.request_timeout_secs.is_some() {
            pool.request_timeout_secs = self.request_timeout_secs;
        }
    }
}

// ============================================================================
// Downstream configuration
// ============================================================================

/// Pool defaults plus the downstream services to provision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DownstreamConfig {
    #[validate(nested)]
    pub pool: PoolDefaults,

    /// Service name to target address; an empty target means not deployed
    pub services: BTreeMap<String, String>,
}

impl DownstreamConfig {
    /// Read, override from the process environment, and validate.
    ///
    /// Without a path only the environment and built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = ?path, "Loaded downstream configuration");
        Self::from_str(&content)
    }

    /// Parse TOML content without applying overrides.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(std::env::vars())
    }

    /// Apply overrides from an explicit set of variables.
    ///
    /// Only services already declared in the config can be retargeted.
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();

        let overrides: PoolOverrides = envy::prefixed(ENV_PREFIX).from_iter(vars.iter().cloned())?;
        overrides.apply(&mut self.pool);

        for (key, value) in &vars {
            if key.starts_with(ENV_PREFIX) {
                continue;
            }
            let Some(service) = service_for_env_key(key) else {
                continue;
            };
            if let Some(target) = self.services.get_mut(&service) {
                debug!(service = %service, variable = %key, "Service target overridden from environment");
                *target = value.trim().to_string();
            }
        }
        Ok(())
    }

    /// Services with a non-empty target, in name order.
    pub fn configured_services(&self) -> impl Iterator<Item = (&str, &str)> {
        self.services
            .iter()
            .map(|(name, target)| (name.as_str(), target.trim()))
            .filter(|(_, target)| !target.is_empty())
    }
}

/// `ORDER_SERVICE_ADDR` -> `order-service`.
fn service_for_env_key(key: &str) -> Option<String> {
    let stem = key.strip_suffix(SERVICE_ADDR_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_ascii_lowercase().replace('_', "-"))
}
