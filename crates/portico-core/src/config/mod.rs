//! Gateway configuration: typed model, YAML loading, validation.
//!
//! Configuration lives under a top-level `portico` key in a YAML file:
//!
//! ```yaml
//! portico:
//!   keyspace: "my-gateway"
//!   servers:
//!     - "http://backend-1:8000"
//!     - "http://backend-2:8000"
//!
//!   paths:
//!     - pattern: "/api/*"
//!       features:
//!         timeout:
//!           seconds: 5.0
//!         rate_limit:
//!           quota: 100
//!           duration: 60
//!           algorithm: "sliding_window"
//!         retry:
//!           max_attempts: 3
//!           wait: [0.1, 0.2]
//!         circuit_breaker:
//!           failure_threshold: 5
//!           recovery_timeout: 60.0
//!
//!   default_features:
//!     timeout:
//!       seconds: 10.0
//! ```
//!
//! Loading goes through the `config` crate; validation runs eagerly so a bad
//! file refuses to start the gateway (or is rejected by the hot-reload
//! watcher while the running snapshot stays in effect).

pub mod watcher;

use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::{
    auth::{rbac::RbacSettings, JwtSettings},
    reliability::retry::{RetryPolicy, WaitStrategy},
    throttle::ThrottleAlgo,
};

/// Namespace key the gateway reads from the config file.
pub const CONFIG_NAMESPACE: &str = "portico";

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Pattern(#[from] crate::router::PatternError),

    #[error(transparent)]
    Rbac(#[from] crate::auth::rbac::RbacError),
}

/// Response caching settings for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFeature {
    /// Entry TTL in seconds.
    pub expire_s: u64,
    /// Fixed cache key overriding request-derived keys, for endpoints whose
    /// response does not depend on the query string.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Request headers whose values partition the cache.
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

/// Rate limiting settings for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitFeature {
    pub quota: u32,
    /// Window length in seconds.
    pub duration: u64,
    #[serde(default)]
    pub algorithm: ThrottleAlgo,
    /// Leaky bucket capacity; defaults to `quota`.
    #[serde(default)]
    pub bucket_size: Option<u32>,
    #[serde(default = "default_rate_limit_status")]
    pub error_status: u16,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_rate_limit_status() -> u16 {
    429
}

/// Per-request deadline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutFeature {
    pub seconds: f64,
    #[serde(default = "default_timeout_status")]
    pub error_status: u16,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_timeout_status() -> u16 {
    504
}

/// Wait schedule as written in YAML: a scalar, a list, or `"expo"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitSpec {
    Scalar(f64),
    Schedule(Vec<f64>),
    Named(String),
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self::Scalar(1.0)
    }
}

impl WaitSpec {
    /// Converts to the runtime strategy.
    ///
    /// # Errors
    ///
    /// Rejects unknown named strategies.
    pub fn to_strategy(&self) -> Result<WaitStrategy, ConfigError> {
        match self {
            Self::Scalar(secs) => Ok(WaitStrategy::Fixed(*secs)),
            Self::Schedule(waits) => Ok(WaitStrategy::Sequence(waits.clone())),
            Self::Named(name) if name == "expo" => Ok(WaitStrategy::Exponential { base: 1.0 }),
            Self::Named(other) => {
                Err(ConfigError::Invalid(format!("unknown wait strategy {other:?}")))
            }
        }
    }
}

/// Retry settings for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFeature {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub wait: WaitSpec,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryFeature {
    /// Builds the runtime policy.
    ///
    /// # Errors
    ///
    /// As [`WaitSpec::to_strategy`].
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        Ok(RetryPolicy { max_attempts: self.max_attempts, wait: self.wait.to_strategy()? })
    }
}

/// Circuit breaker settings for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerFeature {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    60.0
}

/// Slow-request logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringFeature {
    /// Requests slower than this many seconds are logged at warn level.
    #[serde(default = "default_log_threshold")]
    pub log_threshold: f64,
}

fn default_log_threshold() -> f64 {
    0.1
}

/// Authentication settings for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthFeature {
    Basic {
        username: String,
        password: String,
        #[serde(default)]
        rbac: Option<RbacSettings>,
    },
    Jwt {
        #[serde(flatten)]
        jwt: JwtSettings,
        #[serde(default)]
        rbac: Option<RbacSettings>,
    },
}

impl AuthFeature {
    #[must_use]
    pub fn rbac(&self) -> Option<&RbacSettings> {
        match self {
            Self::Basic { rbac, .. } | Self::Jwt { rbac, .. } => rbac.as_ref(),
        }
    }
}

/// The feature subset a path policy enables, with per-feature parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub cache: Option<CacheFeature>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitFeature>,
    #[serde(default)]
    pub timeout: Option<TimeoutFeature>,
    #[serde(default)]
    pub retry: Option<RetryFeature>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerFeature>,
    #[serde(default)]
    pub monitoring: Option<MonitoringFeature>,
    #[serde(default)]
    pub auth: Option<AuthFeature>,
}

impl FeatureSet {
    /// Names of the enabled features, for logs and the admin surface.
    #[must_use]
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.auth.is_some() {
            features.push("auth");
        }
        if self.rate_limit.is_some() {
            features.push("rate_limit");
        }
        if self.cache.is_some() {
            features.push("cache");
        }
        if self.timeout.is_some() {
            features.push("timeout");
        }
        if self.retry.is_some() {
            features.push("retry");
        }
        if self.circuit_breaker.is_some() {
            features.push("circuit_breaker");
        }
        if self.monitoring.is_some() {
            features.push("monitoring");
        }
        features
    }
}

/// One path pattern and the features it enables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub pattern: String,
    #[serde(default)]
    pub features: FeatureSet,
}

/// Root gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Prefix namespacing all store keys for this gateway instance.
    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    /// Backend servers for standalone mode; empty means plugin mode.
    #[serde(default)]
    pub servers: Vec<String>,

    /// Ordered path policies.
    #[serde(default)]
    pub paths: Vec<PathConfig>,

    /// Features applied when no pattern matches.
    #[serde(default)]
    pub default_features: Option<FeatureSet>,

    /// Redis URL for the shared store; unset selects the in-process store.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Seconds between health probes of unhealthy backends.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_s: u64,
}

fn default_keyspace() -> String {
    "portico-gateway".to_string()
}

fn default_probe_interval() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keyspace: default_keyspace(),
            servers: Vec::new(),
            paths: Vec::new(),
            default_features: None,
            redis_url: None,
            probe_interval_s: default_probe_interval(),
        }
    }
}

impl GatewayConfig {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file is missing, unparseable, or invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let raw = Config::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Self = raw.get(CONFIG_NAMESPACE)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string, mainly for tests.
    ///
    /// # Errors
    ///
    /// As [`from_file`](Self::from_file).
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let raw = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Yaml))
            .build()?;
        let config: Self = raw.get(CONFIG_NAMESPACE)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyspace.is_empty() {
            return Err(ConfigError::Invalid("keyspace cannot be empty".to_string()));
        }
        if self.keyspace.contains(':') {
            return Err(ConfigError::Invalid(
                "keyspace cannot contain ':' (it is the key separator)".to_string(),
            ));
        }

        for server in &self.servers {
            if !server.starts_with("http://") && !server.starts_with("https://") {
                return Err(ConfigError::Invalid(format!("invalid server url {server:?}")));
            }
        }

        for path in &self.paths {
            if path.pattern.is_empty() {
                return Err(ConfigError::Invalid("empty path pattern".to_string()));
            }
            Self::validate_features(&path.pattern, &path.features)?;
        }
        if let Some(default) = &self.default_features {
            Self::validate_features("default_features", default)?;
        }

        Ok(())
    }

    fn validate_features(context: &str, features: &FeatureSet) -> Result<(), ConfigError> {
        if let Some(rate_limit) = &features.rate_limit {
            if rate_limit.quota == 0 {
                return Err(ConfigError::Invalid(format!("{context}: quota must be >= 1")));
            }
            if rate_limit.duration == 0 {
                return Err(ConfigError::Invalid(format!("{context}: duration must be >= 1")));
            }
            if rate_limit.bucket_size == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "{context}: bucket_size must be >= 1"
                )));
            }
            if !(100..=599).contains(&rate_limit.error_status) {
                return Err(ConfigError::Invalid(format!(
                    "{context}: error_status {} is not a valid http status",
                    rate_limit.error_status
                )));
            }
        }

        if let Some(timeout) = &features.timeout {
            if timeout.seconds <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{context}: timeout seconds must be positive"
                )));
            }
            if !(100..=599).contains(&timeout.error_status) {
                return Err(ConfigError::Invalid(format!(
                    "{context}: error_status {} is not a valid http status",
                    timeout.error_status
                )));
            }
        }

        if let Some(retry) = &features.retry {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{context}: max_attempts must be >= 1"
                )));
            }
            retry.wait.to_strategy()?;
        }

        if let Some(cache) = &features.cache {
            if cache.expire_s == 0 {
                return Err(ConfigError::Invalid(format!("{context}: expire_s must be >= 1")));
            }
        }

        if let Some(breaker) = &features.circuit_breaker {
            if breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{context}: failure_threshold must be >= 1"
                )));
            }
            if breaker.recovery_timeout <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{context}: recovery_timeout must be positive"
                )));
            }
        }

        if let Some(auth) = &features.auth {
            match auth {
                AuthFeature::Basic { username, password, .. } => {
                    if username.is_empty() || password.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "{context}: basic auth requires username and password"
                        )));
                    }
                }
                AuthFeature::Jwt { jwt, .. } => {
                    if jwt.secret.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "{context}: jwt auth requires a secret"
                        )));
                    }
                }
            }
            // A dangling role reference must fail here, not silently grant
            // nothing at runtime.
            if let Some(rbac) = auth.rbac() {
                rbac.validate()?;
            }
        }

        Ok(())
    }

    /// `true` when the gateway forwards to configured backends rather than
    /// wrapping an in-process application.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        !self.servers.is_empty()
    }
}
