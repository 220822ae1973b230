//! Rate-limited, caching client for external services.
//!
//! Every operation that calls an external API goes through a
//! [`RateLimitedClient`] rather than managing its own concurrency, pacing,
//! caching and retries. One client is shared by all chunk workers of an
//! operation invocation.

mod cache;
mod rate_limit;
mod retry;

pub use cache::{request_key, TtlCache};
pub use rate_limit::TokenBucket;
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig, RetryState};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

/// Failure of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Timeouts, overload and other conditions worth retrying.
    #[error("transient error: {0}")]
    Transient(String),
    /// Errors a retry cannot fix.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl CallError {
    /// Returns true if the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// An external service endpoint, or a fallback standing in for one.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Performs one call.
    async fn call(&self, endpoint: &str, request: &Value) -> Result<Value, CallError>;
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum outbound calls in flight.
    pub max_concurrency: usize,
    /// Sustained request rate; zero disables rate limiting.
    pub requests_per_second: f64,
    /// Requests allowed back to back before pacing starts.
    pub burst: usize,
    /// How long a successful response stays cached; zero disables caching.
    pub cache_ttl: Duration,
    /// Maximum cached responses.
    pub cache_capacity: usize,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            requests_per_second: 10.0,
            burst: 10,
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, requests_per_second: f64, burst: usize) -> Self {
        self.requests_per_second = requests_per_second;
        self.burst = burst;
        self
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Counters describing client activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Calls sent to the upstream, retries included.
    pub outbound_calls: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Requests the cache could not answer.
    pub cache_misses: u64,
    /// Requests that joined an identical call already in flight.
    pub deduplicated: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Fallback invocations.
    pub fallbacks: u64,
    /// Requests that ended in an error.
    pub failures: u64,
}

impl ClientStats {
    /// Fraction of lookups answered from the cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// The counters as a statistics value for the execution context.
    #[must_use]
    pub fn to_statistics(&self) -> Value {
        serde_json::json!({
            "outbound_calls": self.outbound_calls,
            "cache_hits": self.cache_hits,
            "cache_misses": self.cache_misses,
            "cache_hit_rate": (self.hit_rate() * 10_000.0).round() / 10_000.0,
            "deduplicated": self.deduplicated,
            "retries": self.retries,
            "fallbacks": self.fallbacks,
            "failures": self.failures,
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    outbound_calls: AtomicU64,
    deduplicated: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

type CallResult = Result<Value, CallError>;

/// Concurrency-bounded, rate-limited, caching, retrying client.
pub struct RateLimitedClient {
    upstream: Arc<dyn Upstream>,
    fallback: Option<Arc<dyn Upstream>>,
    config: ClientConfig,
    permits: Semaphore,
    limiter: TokenBucket,
    cache: TtlCache,
    in_flight: DashMap<String, Arc<OnceCell<CallResult>>>,
    counters: Counters,
}

impl fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("config", &self.config)
            .field("has_fallback", &self.fallback.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    /// Creates a client for `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn Upstream>, config: ClientConfig) -> Self {
        Self {
            upstream,
            fallback: None,
            permits: Semaphore::new(config.max_concurrency.max(1)),
            limiter: TokenBucket::new(config.requests_per_second, config.burst),
            cache: TtlCache::new(config.cache_ttl, config.cache_capacity),
            in_flight: DashMap::new(),
            counters: Counters::default(),
            config,
        }
    }

    /// Sets the fallback used once retries of a transient failure are
    /// exhausted. Permanent errors are returned as they are.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn Upstream>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// The client settings.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends a request, answering from the cache when possible.
    ///
    /// Identical requests issued while one is in flight wait for and share
    /// its result.
    pub async fn call(&self, endpoint: &str, request: &Value) -> CallResult {
        let key = request_key(endpoint, request);
        if let Some(value) = self.cache.get(&key) {
            debug!(endpoint, key = %key, "Cache hit");
            return Ok(value);
        }

        let cell = Arc::clone(
            self.in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let mut leader = false;
        let result = cell
            .get_or_init(|| {
                leader = true;
                self.fetch(endpoint, request, &key)
            })
            .await
            .clone();

        if leader {
            self.in_flight.remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        } else {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn fetch(&self, endpoint: &str, request: &Value, key: &str) -> CallResult {
        let mut state = RetryState::new();
        let error = loop {
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| CallError::Permanent("client is shut down".to_string()))?;
                self.limiter.acquire().await;
                self.counters.outbound_calls.fetch_add(1, Ordering::Relaxed);
                self.upstream.call(endpoint, request).await
            };

            match outcome {
                Ok(value) => {
                    self.cache.insert(key, value.clone());
                    return Ok(value);
                }
                Err(err) if err.is_transient() => match state.next_delay(&self.config.retry) {
                    Some(delay) => {
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            endpoint,
                            attempt = state.failures,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "Retrying after transient error"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break err,
                },
                Err(err) => break err,
            }
        };

        if let Some(fallback) = self.fallback.as_ref().filter(|_| error.is_transient()) {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint, error = %error, "Upstream failed; using fallback");
            let result = fallback.call(endpoint, request).await;
            if result.is_err() {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
            return result;
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(endpoint, attempts = state.failures, error = %error, "Upstream call failed");
        Err(error)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            outbound_calls: self.counters.outbound_calls.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Drops every cached response.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    /// Fails the first `transient_failures` calls, then echoes the request.
    #[derive(Default)]
    struct ScriptedUpstream {
        calls: AtomicUsize,
        transient_failures: usize,
        permanent: bool,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn call(&self, endpoint: &str, request: &Value) -> CallResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.permanent {
                return Err(CallError::Permanent("bad request".to_string()));
            }
            if n < self.transient_failures {
                return Err(CallError::Transient("503".to_string()));
            }
            Ok(json!({"endpoint": endpoint, "echo": request}))
        }
    }

    struct StaticFallback;

    #[async_trait]
    impl Upstream for StaticFallback {
        async fn call(&self, _endpoint: &str, _request: &Value) -> CallResult {
            Ok(json!({"fallback": true}))
        }
    }

    fn unlimited() -> ClientConfig {
        ClientConfig::new()
            .with_rate_limit(0.0, 1)
            .with_retry(
                RetryConfig::new()
                    .with_max_attempts(3)
                    .with_base_delay_ms(100)
                    .with_jitter(JitterStrategy::None),
            )
    }

    #[tokio::test]
    async fn test_repeat_request_hits_cache() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let client = RateLimitedClient::new(upstream.clone(), unlimited());
        let request = json!({"id": "P12345"});

        let first = client.call("uniprot", &request).await.unwrap();
        let second = client.call("uniprot", &request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        let stats = client.stats();
        assert_eq!((stats.cache_misses, stats.cache_hits), (1, 1));
        assert_eq!(stats.outbound_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let client = RateLimitedClient::new(
            upstream.clone(),
            unlimited().with_cache_ttl(Duration::from_secs(10)),
        );
        let request = json!({"id": "P1"});

        client.call("map", &request).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        client.call("map", &request).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let upstream = Arc::new(ScriptedUpstream {
            transient_failures: 2,
            ..ScriptedUpstream::default()
        });
        let client = RateLimitedClient::new(upstream.clone(), unlimited());
        let start = Instant::now();

        let value = client.call("map", &json!({"id": 1})).await.unwrap();

        assert_eq!(value["echo"]["id"], 1);
        assert_eq!(client.stats().retries, 2);
        assert_eq!(client.stats().outbound_calls, 3);
        // 100ms then 200ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let upstream = Arc::new(ScriptedUpstream {
            permanent: true,
            ..ScriptedUpstream::default()
        });
        let client = RateLimitedClient::new(upstream.clone(), unlimited());

        let err = client.call("map", &json!({})).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(client.stats().outbound_calls, 1);
        assert_eq!(client.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_retries_exhausted() {
        let upstream = Arc::new(ScriptedUpstream {
            transient_failures: usize::MAX,
            ..ScriptedUpstream::default()
        });
        let client =
            RateLimitedClient::new(upstream.clone(), unlimited()).with_fallback(Arc::new(StaticFallback));

        let value = client.call("map", &json!({"id": 1})).await.unwrap();

        assert_eq!(value, json!({"fallback": true}));
        let stats = client.stats();
        assert_eq!(stats.outbound_calls, 3);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_fallback() {
        let upstream = Arc::new(ScriptedUpstream {
            permanent: true,
            ..ScriptedUpstream::default()
        });
        let client =
            RateLimitedClient::new(upstream.clone(), unlimited()).with_fallback(Arc::new(StaticFallback));

        let err = client.call("map", &json!({"id": 1})).await.unwrap_err();

        assert_eq!(err, CallError::Permanent("bad request".to_string()));
        let stats = client.stats();
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.outbound_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_without_fallback_returns_last_error() {
        let upstream = Arc::new(ScriptedUpstream {
            transient_failures: usize::MAX,
            ..ScriptedUpstream::default()
        });
        let client = RateLimitedClient::new(upstream.clone(), unlimited());

        let err = client.call("map", &json!({})).await.unwrap_err();
        assert_eq!(err, CallError::Transient("503".to_string()));
        assert_eq!(client.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_share_one_call() {
        let upstream = Arc::new(ScriptedUpstream {
            delay: Duration::from_millis(100),
            ..ScriptedUpstream::default()
        });
        let client = RateLimitedClient::new(upstream.clone(), unlimited());
        let request = json!({"id": "shared"});

        let results = join_all((0..5).map(|_| client.call("map", &request))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.stats().deduplicated, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let upstream = Arc::new(ScriptedUpstream {
            delay: Duration::from_millis(50),
            ..ScriptedUpstream::default()
        });
        let client =
            RateLimitedClient::new(upstream.clone(), unlimited().with_max_concurrency(2));
        let requests: Vec<Value> = (0..10).map(|i| json!({"id": i})).collect();

        join_all(requests.iter().map(|r| client.call("map", r))).await;

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 10);
        assert!(upstream.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_distinct_requests() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let client = RateLimitedClient::new(upstream, unlimited().with_rate_limit(10.0, 1));
        let start = Instant::now();

        for i in 0..5 {
            client.call("map", &json!({"id": i})).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_stats_to_statistics() {
        let stats = ClientStats {
            outbound_calls: 3,
            cache_hits: 1,
            cache_misses: 3,
            ..ClientStats::default()
        };
        let value = stats.to_statistics();
        assert_eq!(value["cache_hit_rate"], json!(0.25));
        assert_eq!(value["outbound_calls"], json!(3));
    }
}
