//! Toolkit configuration.
//!
//! Supports YAML files and environment variable overrides. Each backend
//! section may override the global `defaults`; the result feeds the per-client
//! layer of option precedence (see [`crate::policy::resolve`]).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::policy::ClientDefaults;
use crate::utils::retry::RetryConfig;

/// Environment variable naming an extra configuration file.
pub const CONFIG_ENV_VAR: &str = "TRIALKIT_CONFIG";

/// Prefix for environment overrides, e.g. `TRIALKIT__SQL__URL`.
pub const CONFIG_ENV_PREFIX: &str = "TRIALKIT";

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "trialkit";

/// Configuration load failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Per-client defaults as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Operation timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Propagate backend failures as `Err` instead of failure results.
    pub throw_on_error: Option<bool>,
    pub retry: Option<RetryConfig>,
}

impl DefaultsConfig {
    pub fn to_client_defaults(&self) -> ClientDefaults {
        ClientDefaults {
            timeout: self.timeout_ms.map(Duration::from_millis),
            throw_on_error: self.throw_on_error,
            retry: self.retry.clone(),
        }
    }
}

/// HTTP client section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: Option<String>,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

/// Connect-protocol (gRPC over HTTP/JSON) section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

/// GraphQL section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GraphqlConfig {
    /// Full endpoint URL, e.g. `http://localhost:4000/graphql`.
    pub endpoint: Option<String>,
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

/// SQL section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Database URL (`postgres://`, `mysql://`, `sqlite:`).
    pub url: Option<String>,
    pub max_connections: u32,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            defaults: DefaultsConfig::default(),
        }
    }
}

/// Redis section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

/// AMQP section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub url: Option<String>,
    pub pool_size: usize,
    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 4,
            defaults: DefaultsConfig::default(),
        }
    }
}

/// Main toolkit configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Defaults shared by every client.
    pub defaults: DefaultsConfig,
    pub http: HttpConfig,
    pub connect: ConnectConfig,
    pub graphql: GraphqlConfig,
    pub sql: SqlConfig,
    pub redis: RedisConfig,
    pub amqp: AmqpConfig,
}

impl ToolkitConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `trialkit.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML document, without file or env lookup.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Global defaults overlaid with one section's overrides.
    pub fn client_defaults(&self, section: &DefaultsConfig) -> ClientDefaults {
        self.defaults
            .to_client_defaults()
            .overlay(&section.to_client_defaults())
    }

    pub fn http_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.http.defaults)
    }

    pub fn connect_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.connect.defaults)
    }

    pub fn graphql_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.graphql.defaults)
    }

    pub fn sql_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.sql.defaults)
    }

    pub fn redis_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.redis.defaults)
    }

    pub fn amqp_defaults(&self) -> ClientDefaults {
        self.client_defaults(&self.amqp.defaults)
    }
}
