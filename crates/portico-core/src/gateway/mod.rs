//! The request pipeline.
//!
//! For each request the gateway resolves a policy from the path, then runs
//! the enabled features in a fixed order:
//!
//! auth -> rate limit -> cache lookup -> deadline [ retry [ breaker [ forward ] ] ]
//!
//! Rate limiting runs before the cache so heavy users cannot saturate cache
//! lookups; the cache runs before the expensive backend path; the deadline
//! envelopes only the parts that can block; retry wraps the breaker so
//! retries observe breaker state. Every request emits one telemetry event.

mod policy;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::{Method, StatusCode};
use tokio::sync::watch;

use crate::{
    cache::ResponseCache,
    config::{ConfigError, GatewayConfig},
    errors::GatewayError,
    events::{EventSink, RequestEvent},
    reliability::{retry::retry, CircuitBreaker},
    store::{InMemoryStore, RedisStore, SharedStore},
    throttle::{Admission, Throttler},
    types::{GatewayRequest, GatewayResponse, Principal},
    upstream::{backend_ws_url, HttpForwarder, LoadBalancer},
};

pub use policy::{CompiledPolicy, GatewaySnapshot, RateLimitRuntime};

/// In-process upstream application for plugin mode.
///
/// The wrapped application is opaque to the gateway: it receives the request
/// after the policy prefix has run and its response flows back through
/// caching and telemetry.
#[async_trait]
pub trait UpstreamApp: Send + Sync {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

enum Mode {
    /// Wrap an in-process application.
    Plugin(Option<Arc<dyn UpstreamApp>>),
    /// Forward to a pool of backend servers.
    Standalone { balancer: Arc<LoadBalancer>, forwarder: HttpForwarder },
}

/// What the host should do with a WebSocket upgrade after the policy prefix
/// has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPlan {
    /// Plugin mode: hand the socket to the wrapped application.
    PassThrough,
    /// Standalone mode: connect to this backend URL and pump frames.
    Forward { target_url: String },
}

/// Builder for [`Gateway`], mirroring how the host wires it.
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<SharedStore>,
    app: Option<Arc<dyn UpstreamApp>>,
    start_background_tasks: bool,
}

impl GatewayBuilder {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self { config, store: None, app: None, start_background_tasks: true }
    }

    /// Overrides the store, bypassing `redis_url` selection. Tests use this
    /// to inject a clock-controlled in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the wrapped application for plugin mode.
    #[must_use]
    pub fn with_app(mut self, app: Arc<dyn UpstreamApp>) -> Self {
        self.app = Some(app);
        self
    }

    /// Disables the sweeper and probe loops, for tests where no background
    /// work should outlive the assertion.
    #[must_use]
    pub fn without_background_tasks(mut self) -> Self {
        self.start_background_tasks = false;
        self
    }

    /// Builds the gateway, connecting the store and compiling the snapshot.
    ///
    /// # Errors
    ///
    /// [`GatewayError`] for store connection failures or uncompilable
    /// configuration (bad patterns, unsupported auth settings).
    pub async fn build(self) -> Result<Gateway, GatewayError> {
        self.config
            .validate()
            .map_err(|e| GatewayError::Internal(format!("invalid configuration: {e}")))?;

        let store: SharedStore = match self.store {
            Some(store) => store,
            None => match &self.config.redis_url {
                Some(url) => Arc::new(RedisStore::connect(url).await?),
                None => {
                    let memory = Arc::new(InMemoryStore::new());
                    if self.start_background_tasks {
                        memory.start_sweeper(Duration::from_secs(30));
                    }
                    memory
                }
            },
        };

        let keyspace = self.config.keyspace.clone();
        let mode = if self.config.is_standalone() {
            // The pool health threshold reuses the breaker threshold the
            // default policy carries.
            let failure_threshold = self
                .config
                .default_features
                .as_ref()
                .and_then(|f| f.circuit_breaker.as_ref())
                .map_or(5, |cb| cb.failure_threshold);
            let balancer =
                Arc::new(LoadBalancer::new(&self.config.servers, failure_threshold));
            let forwarder = HttpForwarder::new()?;
            if self.start_background_tasks {
                balancer.start_probe_loop(
                    forwarder.client(),
                    Duration::from_secs(self.config.probe_interval_s),
                );
            }
            Mode::Standalone { balancer, forwarder }
        } else {
            Mode::Plugin(self.app)
        };

        let snapshot = GatewaySnapshot::compile(&self.config)
            .map_err(|e| GatewayError::Internal(format!("policy compilation: {e}")))?;

        tracing::info!(
            keyspace = %keyspace,
            paths = self.config.paths.len(),
            standalone = self.config.is_standalone(),
            "gateway ready"
        );

        Ok(Gateway {
            throttler: Throttler::new(Arc::clone(&store), &keyspace),
            cache: ResponseCache::new(Arc::clone(&store), &keyspace),
            breaker: CircuitBreaker::new(Arc::clone(&store), &keyspace),
            store,
            mode,
            events: EventSink::new(),
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }
}

/// The gateway object owning every policy subsystem.
///
/// The host wires one of these per listener. All methods take `&self`; the
/// gateway is shared behind an `Arc` across connections.
pub struct Gateway {
    store: SharedStore,
    throttler: Throttler,
    cache: ResponseCache,
    breaker: CircuitBreaker,
    mode: Mode,
    events: EventSink,
    snapshot: ArcSwap<GatewaySnapshot>,
}

impl Gateway {
    /// Starts building a gateway from validated configuration.
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// The telemetry sink; subscribe for per-request events.
    #[must_use]
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// The shared store, for embedding hosts that want to inspect state.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// The response cache, exposed for host-driven invalidation.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Swaps in a new configuration snapshot.
    ///
    /// In-flight requests keep the snapshot they resolved; only new requests
    /// see the change. The keyspace and mode are fixed at construction, so a
    /// reload only affects path policies.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the new config does not compile; the running
    /// snapshot stays in effect.
    pub fn apply_config(&self, config: &GatewayConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let snapshot = GatewaySnapshot::compile(config)?;
        self.snapshot.store(Arc::new(snapshot));
        tracing::info!(paths = config.paths.len(), "configuration snapshot swapped");
        Ok(())
    }

    /// Spawns a task that applies snapshots published by the config watcher.
    pub fn start_reload_task(
        self: &Arc<Self>,
        mut snapshots: watch::Receiver<Arc<GatewayConfig>>,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let config = snapshots.borrow_and_update().clone();
                if let Err(error) = gateway.apply_config(&config) {
                    tracing::warn!(%error, "rejected reloaded configuration");
                }
            }
        })
    }

    /// Runs one request through the pipeline. Never fails: errors become
    /// HTTP responses, and a telemetry event is emitted either way.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let started = std::time::Instant::now();
        let snapshot = self.snapshot.load_full();
        let mut event = RequestEvent::started(&request.method, &request.path);

        let resolved = snapshot.resolve(&request.method, &request.path);
        let response = match &resolved {
            Some((pattern, policy)) => {
                event.matched_pattern = pattern.clone();
                self.run_policy(&request, policy, &mut event).await
            }
            None => match self.forward(&request).await {
                Ok(response) => response,
                Err(error) => self.error_response(&request, None, &error, &mut event),
            },
        };

        event.status = response.status.as_u16();
        event.latency_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        if let Some((_, policy)) = &resolved {
            if let Some(threshold) = policy.monitoring_threshold {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > threshold {
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path,
                        elapsed_s = elapsed,
                        threshold_s = threshold,
                        "slow request"
                    );
                }
            }
        }

        self.events.emit(event);
        response
    }

    /// Full pipeline for a resolved policy. Always yields a response.
    async fn run_policy(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
        event: &mut RequestEvent,
    ) -> GatewayResponse {
        // 1. Authentication, then authorization.
        let principal = match self.authenticate(request, policy).await {
            Ok(principal) => principal,
            Err(error) => return self.error_response(request, Some(policy), &error, event),
        };

        // 2. Rate limiting, keyed by pattern plus principal when present.
        if let Some(rate_limit) = &policy.rate_limit {
            let throttle_key = throttle_key(&policy.pattern, principal.as_ref());
            match self.throttler.acquire(&throttle_key, &rate_limit.policy).await {
                Ok(Admission::Admitted) => {}
                Ok(Admission::Delayed(delay)) => {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Ok(Admission::RetryAfter(retry_after)) => {
                    event.throttled = true;
                    let error = GatewayError::QuotaExceeded { retry_after };
                    return self.error_response(request, Some(policy), &error, event);
                }
                Err(error) => {
                    event.throttled = matches!(error, GatewayError::BucketFull);
                    return self.error_response(request, Some(policy), &error, event);
                }
            }
        }

        // 3-9. Cache around the deadline-wrapped execution chain.
        let retried = Arc::new(AtomicU32::new(0));
        let result = self.execute_cached(request, policy, event, &retried).await;
        event.retried = retried.load(Ordering::Relaxed);

        if policy.circuit_breaker.is_some() {
            if let Ok(state) = self.breaker.state(&policy.pattern).await {
                event.set_circuit_state(state);
            }
        }

        match result {
            Ok(response) => response,
            Err(error) => self.error_response(request, Some(policy), &error, event),
        }
    }

    async fn authenticate(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
    ) -> Result<Option<Principal>, GatewayError> {
        let Some(auth) = &policy.auth else { return Ok(None) };
        let principal = auth.handler.authenticate(&request.headers).await?;
        if let Some(rbac) = &auth.rbac {
            rbac.authorize(&principal, &request.path)?;
        }
        Ok(Some(principal))
    }

    /// Steps 3-9: cache lookup, single-flight production, cache store.
    async fn execute_cached(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
        event: &mut RequestEvent,
        retried: &Arc<AtomicU32>,
    ) -> Result<GatewayResponse, GatewayError> {
        let cacheable_method = matches!(request.method, Method::GET | Method::HEAD);

        let Some(cache_policy) = policy.cache.as_ref().filter(|_| cacheable_method) else {
            return self.execute_with_deadline(request, policy, event, retried).await;
        };

        let digest = cache_policy.digest(request);
        if let Some(entry) = self.cache.lookup(&digest).await? {
            event.cache_hit = true;
            tracing::debug!(path = %request.path, "cache hit");
            return Ok(entry.into_response());
        }

        // Cold key: produce under single-flight. The deadline wraps the whole
        // wait, so a loser blocked on the winner cannot overrun its budget,
        // and a cancelled winner never reaches the cache store step.
        let producer = || self.execute_chain(request, policy, Arc::clone(retried));
        let produce = self.cache.get_or_produce_response(&digest, cache_policy.ttl, producer);

        match &policy.timeout {
            Some(timeout) => match tokio::time::timeout(timeout.duration, produce).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    event.timed_out = true;
                    Err(GatewayError::TimedOut { seconds: timeout.duration.as_secs_f64() })
                }
            },
            None => produce.await,
        }
    }

    /// Deadline envelope for the uncached path.
    async fn execute_with_deadline(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
        event: &mut RequestEvent,
        retried: &Arc<AtomicU32>,
    ) -> Result<GatewayResponse, GatewayError> {
        let chain = self.execute_chain(request, policy, Arc::clone(retried));
        match &policy.timeout {
            Some(timeout) => match tokio::time::timeout(timeout.duration, chain).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    event.timed_out = true;
                    Err(GatewayError::TimedOut { seconds: timeout.duration.as_secs_f64() })
                }
            },
            None => chain.await,
        }
    }

    /// Steps 6-8: retry around breaker around forwarding.
    async fn execute_chain(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
        retried: Arc<AtomicU32>,
    ) -> Result<GatewayResponse, GatewayError> {
        match &policy.retry {
            Some(retry_policy) => {
                retry(retry_policy, GatewayError::is_retryable, |attempt| {
                    retried.store(attempt.saturating_sub(1), Ordering::Relaxed);
                    self.execute_breaker(request, policy)
                })
                .await
            }
            None => self.execute_breaker(request, policy).await,
        }
    }

    /// Step 7: the circuit breaker gate.
    async fn execute_breaker(
        &self,
        request: &GatewayRequest,
        policy: &Arc<CompiledPolicy>,
    ) -> Result<GatewayResponse, GatewayError> {
        let Some(breaker_config) = &policy.circuit_breaker else {
            return self.forward(request).await;
        };

        let verdict = self.breaker.try_acquire(&policy.pattern, breaker_config).await?;
        if !verdict.allowed {
            return Err(GatewayError::CircuitOpen);
        }

        let result = self.forward(request).await;
        // Transport failures trip the breaker; any response, even a 5xx the
        // backend chose to send, shows the circuit is alive.
        self.breaker.record(&policy.pattern, breaker_config, result.is_ok()).await?;
        result
    }

    /// Step 8: dispatch to the wrapped app or a load-balanced backend.
    async fn forward(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        match &self.mode {
            Mode::Plugin(Some(app)) => app.handle(request.clone()).await,
            Mode::Plugin(None) => Ok(GatewayResponse::error(
                request,
                StatusCode::NOT_FOUND,
                "no downstream application or servers configured",
            )),
            Mode::Standalone { balancer, forwarder } => {
                let backend = balancer.next_healthy().ok_or(GatewayError::NoHealthyBackend)?;
                match forwarder.forward(backend.url(), request, None).await {
                    Ok(response) => {
                        balancer.record_success(&backend);
                        Ok(response)
                    }
                    Err(error) => {
                        balancer.record_failure(&backend);
                        Err(GatewayError::Upstream(error))
                    }
                }
            }
        }
    }

    /// Runs the policy prefix for a WebSocket upgrade and plans the rest.
    ///
    /// Auth and rate limiting apply at connect time; caching and retry are
    /// skipped. On rejection the host sends the returned response instead of
    /// upgrading; a telemetry event is emitted for the refused connect.
    ///
    /// # Errors
    ///
    /// The rejection response the host should return.
    pub async fn plan_websocket(
        &self,
        request: &GatewayRequest,
    ) -> Result<WsPlan, GatewayResponse> {
        let snapshot = self.snapshot.load_full();
        let mut event = RequestEvent::started(&request.method, &request.path);

        if let Some((pattern, policy)) = snapshot.resolve(&request.method, &request.path) {
            event.matched_pattern = pattern;

            let principal = match self.authenticate(request, &policy).await {
                Ok(principal) => principal,
                Err(error) => {
                    let response = self.error_response(request, Some(&policy), &error, &mut event);
                    return Err(self.reject_ws(event, response));
                }
            };

            if let Some(rate_limit) = &policy.rate_limit {
                let key = throttle_key(&policy.pattern, principal.as_ref());
                match self.throttler.acquire(&key, &rate_limit.policy).await {
                    Ok(Admission::Admitted | Admission::Delayed(_)) => {}
                    Ok(Admission::RetryAfter(retry_after)) => {
                        event.throttled = true;
                        let error = GatewayError::QuotaExceeded { retry_after };
                        let response =
                            self.error_response(request, Some(&policy), &error, &mut event);
                        return Err(self.reject_ws(event, response));
                    }
                    Err(error) => {
                        event.throttled = matches!(error, GatewayError::BucketFull);
                        let response =
                            self.error_response(request, Some(&policy), &error, &mut event);
                        return Err(self.reject_ws(event, response));
                    }
                }
            }
        }

        match &self.mode {
            Mode::Standalone { balancer, .. } => match balancer.next_healthy() {
                Some(backend) => Ok(WsPlan::Forward {
                    target_url: backend_ws_url(backend.url(), &request.path, &request.query),
                }),
                None => {
                    let response = self.error_response(
                        request,
                        None,
                        &GatewayError::NoHealthyBackend,
                        &mut event,
                    );
                    Err(self.reject_ws(event, response))
                }
            },
            Mode::Plugin(_) => Ok(WsPlan::PassThrough),
        }
    }

    fn reject_ws(&self, mut event: RequestEvent, response: GatewayResponse) -> GatewayResponse {
        event.status = response.status.as_u16();
        self.events.emit(event);
        response
    }

    /// Converts an error into its HTTP response, honouring per-feature
    /// status and message overrides.
    fn error_response(
        &self,
        request: &GatewayRequest,
        policy: Option<&Arc<CompiledPolicy>>,
        error: &GatewayError,
        event: &mut RequestEvent,
    ) -> GatewayResponse {
        event.error_kind = Some(error.kind());

        let (status, message) = match error {
            GatewayError::QuotaExceeded { .. } | GatewayError::BucketFull => {
                let (status, message) = policy
                    .and_then(|p| p.rate_limit.as_ref())
                    .map_or((StatusCode::TOO_MANY_REQUESTS, None), |rl| {
                        (rl.error_status, rl.error_message.clone())
                    });
                (status, message.unwrap_or_else(|| "Rate limit exceeded".to_string()))
            }
            GatewayError::TimedOut { .. } => {
                let (status, message) = policy
                    .and_then(|p| p.timeout.as_ref())
                    .map_or((StatusCode::GATEWAY_TIMEOUT, None), |t| {
                        (t.error_status, t.error_message.clone())
                    });
                (status, message.unwrap_or_else(|| "Request timeout".to_string()))
            }
            other => (other.status_code(), other.to_string()),
        };

        if status.is_server_error() {
            tracing::warn!(path = %request.path, %error, "request failed");
        }
        GatewayResponse::error(request, status, &message)
    }
}

/// Throttle bucket key: matched pattern, plus the principal when known so
/// authenticated users get individual buckets.
fn throttle_key(pattern: &str, principal: Option<&Principal>) -> String {
    match principal {
        Some(principal) => format!("{pattern}:{}", principal.id),
        None => pattern.to_string(),
    }
}
