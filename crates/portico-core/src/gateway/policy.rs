//! Compiled path policies.
//!
//! Raw [`FeatureSet`]s from configuration are compiled once per snapshot
//! into runtime shapes: throttle parameters, retry policies, auth handlers,
//! RBAC engines. Per-request work is then resolve + execute, with no
//! recompilation or reflection on the hot path.

use std::{sync::Arc, time::Duration};

use http::StatusCode;

use crate::{
    auth::{rbac::RbacEngine, AuthHandler, BasicAuth, JwtAuth},
    config::{AuthFeature, CacheFeature, ConfigError, FeatureSet, GatewayConfig},
    reliability::{breaker::BreakerConfig, retry::RetryPolicy},
    router::PathRouter,
    throttle::ThrottlePolicy,
    types::{response_cache_digest, GatewayRequest},
};

/// Compiled auth: a validator plus optional RBAC rules.
pub struct AuthRuntime {
    pub handler: Arc<dyn AuthHandler>,
    pub rbac: Option<RbacEngine>,
}

/// Compiled rate limit with its error surface.
pub struct RateLimitRuntime {
    pub policy: ThrottlePolicy,
    pub error_status: StatusCode,
    pub error_message: Option<String>,
}

/// Compiled cache settings.
pub struct CacheRuntime {
    pub ttl: Duration,
    cache_key: Option<String>,
    vary_headers: Vec<String>,
}

impl CacheRuntime {
    fn new(feature: &CacheFeature) -> Self {
        Self {
            ttl: Duration::from_secs(feature.expire_s),
            cache_key: feature.cache_key.clone(),
            vary_headers: feature.vary_headers.clone(),
        }
    }

    /// Cache digest for a request: the configured fixed key, or one derived
    /// from method, path, sorted query and vary headers.
    #[must_use]
    pub fn digest(&self, request: &GatewayRequest) -> String {
        match &self.cache_key {
            Some(fixed) => fixed.clone(),
            None => response_cache_digest(request, &self.vary_headers),
        }
    }
}

/// Compiled deadline with its error surface.
pub struct TimeoutRuntime {
    pub duration: Duration,
    pub error_status: StatusCode,
    pub error_message: Option<String>,
}

/// One path policy, compiled and ready to execute.
pub struct CompiledPolicy {
    /// Pattern source, used for throttle/breaker keys and telemetry.
    pub pattern: String,
    pub auth: Option<AuthRuntime>,
    pub rate_limit: Option<RateLimitRuntime>,
    pub cache: Option<CacheRuntime>,
    pub timeout: Option<TimeoutRuntime>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<BreakerConfig>,
    /// Seconds above which a request is logged as slow.
    pub monitoring_threshold: Option<f64>,
}

impl CompiledPolicy {
    fn compile(pattern: &str, features: &FeatureSet) -> Result<Self, ConfigError> {
        let auth = match &features.auth {
            Some(feature) => Some(compile_auth(feature)?),
            None => None,
        };

        let rate_limit = features.rate_limit.as_ref().map(|feature| {
            let mut policy =
                ThrottlePolicy::new(feature.algorithm, feature.quota, feature.duration);
            if let Some(bucket_size) = feature.bucket_size {
                policy = policy.with_bucket_size(bucket_size);
            }
            RateLimitRuntime {
                policy,
                error_status: StatusCode::from_u16(feature.error_status)
                    .unwrap_or(StatusCode::TOO_MANY_REQUESTS),
                error_message: feature.error_message.clone(),
            }
        });

        let timeout = features.timeout.as_ref().map(|feature| TimeoutRuntime {
            duration: Duration::from_secs_f64(feature.seconds),
            error_status: StatusCode::from_u16(feature.error_status)
                .unwrap_or(StatusCode::GATEWAY_TIMEOUT),
            error_message: feature.error_message.clone(),
        });

        let retry = match &features.retry {
            Some(feature) => Some(feature.to_policy()?),
            None => None,
        };

        let circuit_breaker = features.circuit_breaker.as_ref().map(|feature| BreakerConfig {
            failure_threshold: feature.failure_threshold,
            recovery_timeout_s: feature.recovery_timeout,
        });

        Ok(Self {
            pattern: pattern.to_string(),
            auth,
            rate_limit,
            cache: features.cache.as_ref().map(CacheRuntime::new),
            timeout,
            retry,
            circuit_breaker,
            monitoring_threshold: features.monitoring.as_ref().map(|m| m.log_threshold),
        })
    }
}

fn compile_auth(feature: &AuthFeature) -> Result<AuthRuntime, ConfigError> {
    let handler: Arc<dyn AuthHandler> = match feature {
        AuthFeature::Basic { username, password, .. } => {
            Arc::new(BasicAuth::new(username, password))
        }
        AuthFeature::Jwt { jwt, .. } => Arc::new(
            JwtAuth::new(jwt).map_err(|e| ConfigError::Invalid(e.to_string()))?,
        ),
    };

    let rbac = match feature.rbac() {
        Some(settings) => Some(RbacEngine::new(settings)?),
        None => None,
    };

    Ok(AuthRuntime { handler, rbac })
}

/// An immutable, fully-compiled view of the gateway's routing config.
///
/// Snapshots are swapped atomically on reload; each request resolves against
/// exactly one snapshot for its whole lifetime.
pub struct GatewaySnapshot {
    router: PathRouter<Arc<CompiledPolicy>>,
    default_policy: Option<Arc<CompiledPolicy>>,
}

impl GatewaySnapshot {
    /// Compiles every path policy and the default feature set.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for uncompilable patterns or feature settings.
    pub fn compile(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let mut routes = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let policy = Arc::new(CompiledPolicy::compile(&path.pattern, &path.features)?);
            routes.push((path.pattern.clone(), policy));
        }
        let router = PathRouter::new(routes)?;

        let default_policy = match &config.default_features {
            Some(features) => {
                Some(Arc::new(CompiledPolicy::compile("__default__", features)?))
            }
            None => None,
        };

        Ok(Self { router, default_policy })
    }

    /// Resolves a request to its policy.
    ///
    /// Returns the matched pattern (`None` for the default policy) and the
    /// compiled policy, or `None` overall when neither patterns nor default
    /// features apply.
    #[must_use]
    pub fn resolve(
        &self,
        method: &http::Method,
        path: &str,
    ) -> Option<(Option<String>, Arc<CompiledPolicy>)> {
        if let Some((pattern, policy)) = self.router.resolve(method, path) {
            return Some((Some(pattern.to_string()), Arc::clone(policy)));
        }
        self.default_policy.as_ref().map(|policy| (None, Arc::clone(policy)))
    }

    /// Number of compiled path policies.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.router.len()
    }
}
