mod circuit;
pub(crate) mod ratelimit;

use crate::cache::{self, CacheHierarchy, FillAttempt, TtlClass};
use crate::config::{Config, Secrets};
use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::registry::{self, AuthMode, EndpointSpec};
use crate::server::metrics::Metrics;
use crate::utils::cancel::CancelToken;
use circuit::{CircuitBreaker, CircuitDecision};
use ratelimit::TokenBucket;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Marker stored in the cache for endpoints that answered 403/404. Upstream
/// blocking is a normal outcome here, not an error.
const RESTRICTED_KEY: &str = "__source_restricted__";

/// How long to poll the cancellation token while sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("circuit open for {endpoint}, retry in {retry_in:?}")]
    CircuitOpen {
        endpoint: String,
        retry_in: Duration,
    },
    #[error("upstream {endpoint} returned status {status}")]
    UpstreamError { endpoint: String, status: u16 },
    #[error("deadline expired while fetching from {endpoint}")]
    Timeout { endpoint: String },
    #[error("network error reaching {endpoint}: {message}")]
    Network { endpoint: String, message: String },
    #[error("rate limit for {endpoint} not satisfiable within the deadline")]
    RateLimited { endpoint: String },
    #[error("authentication to {endpoint} failed")]
    AuthFailed { endpoint: String },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::CircuitOpen { .. } => "circuit_open",
            FetchError::UpstreamError { .. } => "upstream_error",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Network { .. } => "network",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::AuthFailed { .. } => "auth_failed",
            FetchError::Malformed { .. } => "malformed",
            FetchError::UnknownEndpoint(_) => "unknown_endpoint",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<FetchError> for ErrorKind {
    fn from(err: FetchError) -> ErrorKind {
        match err {
            FetchError::CircuitOpen { endpoint, .. } => ErrorKind::CircuitOpen(endpoint),
            FetchError::UpstreamError { endpoint, status } => {
                ErrorKind::UpstreamError { endpoint, status }
            }
            FetchError::Timeout { endpoint } => {
                ErrorKind::Timeout(format!("fetch from {endpoint}"))
            }
            FetchError::Network { endpoint, .. } => ErrorKind::UpstreamError {
                endpoint,
                status: 0,
            },
            FetchError::RateLimited { .. } => ErrorKind::RateLimited {
                retry_after_secs: 60,
            },
            FetchError::AuthFailed { endpoint } => {
                ErrorKind::Internal(format!("missing credentials for {endpoint}"))
            }
            FetchError::Malformed { endpoint, message } => {
                ErrorKind::Internal(format!("malformed response from {endpoint}: {message}"))
            }
            FetchError::UnknownEndpoint(id) => ErrorKind::NotFound(format!("endpoint {id}")),
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug)]
pub struct Payload {
    pub endpoint: String,
    pub value: serde_json::Value,
    pub restricted: bool,
    pub from_cache: bool,
}

pub struct FetchHints {
    pub deadline: Instant,
    pub correlation_id: String,
    pub cancel: CancelToken,
}

impl FetchHints {
    pub fn new(deadline: Instant, correlation_id: &str, cancel: CancelToken) -> Self {
        FetchHints {
            deadline,
            correlation_id: correlation_id.to_string(),
            cancel,
        }
    }
}

/// The single entry point for all upstream calls: caching, rate limiting,
/// circuit breaking and retries live here, nowhere else.
pub struct Federator {
    cache: Arc<CacheHierarchy>,
    config: Config,
    secrets: Secrets,
    metrics: Metrics,
    breakers: Mutex<HashMap<&'static str, Arc<Mutex<CircuitBreaker>>>>,
    buckets: Mutex<HashMap<&'static str, Arc<Mutex<TokenBucket>>>>,
    #[cfg(test)]
    url_overrides: Mutex<HashMap<String, String>>,
}

impl Federator {
    pub fn new(
        cache: Arc<CacheHierarchy>,
        config: Config,
        secrets: Secrets,
        metrics: Metrics,
    ) -> Self {
        Federator {
            cache,
            config,
            secrets,
            metrics,
            breakers: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            #[cfg(test)]
            url_overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetch(
        &self,
        endpoint_id: &str,
        params: &[(String, String)],
        hints: &FetchHints,
    ) -> Result<Payload, FetchError> {
        let start = Instant::now();
        let result = self.fetch_inner(endpoint_id, params, hints);
        self.metrics.record_request("federation", "fetch", start);
        if let Err(err) = &result {
            self.metrics.record_error("federation", err.label());
        }
        result
    }

    fn fetch_inner(
        &self,
        endpoint_id: &str,
        params: &[(String, String)],
        hints: &FetchHints,
    ) -> Result<Payload, FetchError> {
        let spec = registry::lookup(endpoint_id)
            .map_err(|_| FetchError::UnknownEndpoint(endpoint_id.to_string()))?;

        if hints.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let fingerprint = cache::fingerprint(endpoint_id, params);
        match self.cache.get_or_lead(&fingerprint, hints.deadline) {
            FillAttempt::Cached(entry) => Ok(payload(spec, entry.value, true)),
            FillAttempt::TimedOut => Err(FetchError::Timeout {
                endpoint: spec.id.to_string(),
            }),
            FillAttempt::Lead(guard) => {
                let (value, restricted) = self.fetch_origin(spec, params, hints)?;
                // A restricted marker is short-lived: blocks do get lifted.
                let ttl_class = if restricted {
                    TtlClass::Short
                } else {
                    spec.ttl_class
                };
                let entry = guard.complete(value, ttl_class, spec.id);
                Ok(payload(spec, entry.value, false))
            }
        }
    }

    fn fetch_origin(
        &self,
        spec: &'static EndpointSpec,
        params: &[(String, String)],
        hints: &FetchHints,
    ) -> Result<(serde_json::Value, bool), FetchError> {
        self.wait_for_rate_limit(spec, hints)?;

        let breaker = self.breaker(spec.id);
        let mut attempt = 0u32;

        loop {
            if hints.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let now = Instant::now();
            let Some(remaining) = hints.deadline.checked_duration_since(now) else {
                return Err(FetchError::Timeout {
                    endpoint: spec.id.to_string(),
                });
            };

            let decision = breaker.lock().unwrap().check(now);
            let is_probe = match decision {
                CircuitDecision::Allow => false,
                CircuitDecision::AllowProbe => {
                    self.metrics.record_circuit_transition(spec.id, "half-open");
                    true
                }
                CircuitDecision::FastFail { retry_in } => {
                    return Err(FetchError::CircuitOpen {
                        endpoint: spec.id.to_string(),
                        retry_in,
                    });
                }
            };

            if hints.cancel.is_cancelled() {
                if is_probe {
                    breaker.lock().unwrap().release_probe();
                }
                return Err(FetchError::Cancelled);
            }

            let timeout =
                remaining.min(Duration::from_secs(self.config.federation.request_timeout_secs));
            let error = match self.send(spec, params, hints, timeout) {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match status {
                        200..=299 => {
                            breaker.lock().unwrap().on_success();
                            self.metrics.record_upstream(spec.id, "ok");
                            let text =
                                response.text().map_err(|err| FetchError::Malformed {
                                    endpoint: spec.id.to_string(),
                                    message: err.to_string(),
                                })?;
                            // Bodies are stored opaquely; a non-JSON answer
                            // still reaches the workers, just wrapped.
                            let value = match serde_json::from_str(&text) {
                                Ok(value) => value,
                                Err(_) => {
                                    use base64::Engine as _;
                                    serde_json::json!({
                                        "raw_base64": base64::engine::general_purpose::STANDARD
                                            .encode(&text),
                                    })
                                }
                            };
                            return Ok((value, false));
                        }
                        403 | 404 => {
                            // Upstream blocking is routine for these APIs and
                            // must not poison the breaker.
                            breaker.lock().unwrap().on_success();
                            self.metrics.record_upstream(spec.id, "restricted");
                            debug!(
                                "[{}] endpoint {} restricted (status {})",
                                hints.correlation_id, spec.id, status
                            );
                            return Ok((restricted_marker(status), true));
                        }
                        401 => {
                            breaker.lock().unwrap().on_success();
                            self.metrics.record_upstream(spec.id, "auth_failed");
                            return Err(FetchError::AuthFailed {
                                endpoint: spec.id.to_string(),
                            });
                        }
                        429 => {
                            breaker.lock().unwrap().on_success();
                            self.metrics.record_upstream(spec.id, "rate_limited");
                            return Err(FetchError::RateLimited {
                                endpoint: spec.id.to_string(),
                            });
                        }
                        500..=599 => {
                            breaker.lock().unwrap().on_failure(now);
                            self.metrics.record_upstream(spec.id, "upstream_error");
                            FetchError::UpstreamError {
                                endpoint: spec.id.to_string(),
                                status,
                            }
                        }
                        _ => {
                            breaker.lock().unwrap().on_success();
                            self.metrics.record_upstream(spec.id, "upstream_error");
                            return Err(FetchError::UpstreamError {
                                endpoint: spec.id.to_string(),
                                status,
                            });
                        }
                    }
                }
                Err(err) if err.is_timeout() => {
                    breaker.lock().unwrap().on_failure(now);
                    self.metrics.record_upstream(spec.id, "timeout");
                    FetchError::Timeout {
                        endpoint: spec.id.to_string(),
                    }
                }
                Err(err) => {
                    breaker.lock().unwrap().on_failure(now);
                    self.metrics.record_upstream(spec.id, "network");
                    FetchError::Network {
                        endpoint: spec.id.to_string(),
                        message: err.to_string(),
                    }
                }
            };

            if breaker.lock().unwrap().is_open() {
                self.metrics.record_circuit_transition(spec.id, "open");
            }

            // Transient errors retry with backoff, but never across a
            // circuit-open boundary (the next iteration re-checks it) and
            // never past the deadline.
            attempt += 1;
            if attempt > self.config.federation.max_retries {
                return Err(error);
            }
            let delay = crate::utils::backoff_delay(
                Duration::from_millis(self.config.federation.retry_base_ms),
                attempt - 1,
                Duration::from_secs(10),
            );
            if Instant::now() + delay >= hints.deadline {
                return Err(error);
            }
            debug!(
                "[{}] retrying {} after {:?} (attempt {}): {}",
                hints.correlation_id, spec.id, delay, attempt, error
            );
            self.sleep_cancellable(delay, &hints.cancel)?;
        }
    }

    fn send(
        &self,
        spec: &'static EndpointSpec,
        params: &[(String, String)],
        hints: &FetchHints,
        timeout: Duration,
    ) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let (url, query) = self.build_url(spec, params);

        let mut request = crate::utils::http::prepare(Method::GET, &url)
            .timeout(timeout)
            .header(CORRELATION_HEADER, &hints.correlation_id)
            .query(&query);

        match spec.auth {
            AuthMode::Open => {}
            AuthMode::ApiKey => {
                if let (Some(header), Some(env)) = (spec.key_header, spec.key_env) {
                    if let Some(key) = self.secrets.get(env) {
                        request = request.header(header, key);
                    }
                }
            }
            AuthMode::Bearer => {
                if let Some(env) = spec.key_env {
                    if let Some(key) = self.secrets.get(env) {
                        request = request.header(AUTHORIZATION, format!("Bearer {key}"));
                    }
                }
            }
        }

        request.send()
    }

    /// Substitutes `{name}` template segments from the parameters; whatever
    /// is left over becomes the query string.
    fn build_url(
        &self,
        spec: &'static EndpointSpec,
        params: &[(String, String)],
    ) -> (String, Vec<(String, String)>) {
        let mut url = self.base_url(spec);
        let mut query = Vec::new();

        for (key, value) in params {
            let placeholder = format!("{{{key}}}");
            if url.contains(&placeholder) {
                url = url.replace(&placeholder, value);
            } else {
                query.push((key.clone(), value.clone()));
            }
        }

        (url, query)
    }

    #[cfg(not(test))]
    fn base_url(&self, spec: &'static EndpointSpec) -> String {
        spec.base_url.to_string()
    }

    #[cfg(test)]
    fn base_url(&self, spec: &'static EndpointSpec) -> String {
        self.url_overrides
            .lock()
            .unwrap()
            .get(spec.id)
            .cloned()
            .unwrap_or_else(|| spec.base_url.to_string())
    }

    #[cfg(test)]
    pub fn override_base_url(&self, endpoint_id: &str, url: &str) {
        self.url_overrides
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), url.to_string());
    }

    fn wait_for_rate_limit(
        &self,
        spec: &'static EndpointSpec,
        hints: &FetchHints,
    ) -> Result<(), FetchError> {
        let bucket = self.bucket(spec);
        let mut waited = false;

        loop {
            let wait = match bucket.lock().unwrap().try_acquire(Instant::now()) {
                Ok(()) => break,
                Err(wait) => wait,
            };

            if !waited {
                self.metrics.record_rate_limited_wait();
                waited = true;
            }
            if Instant::now() + wait >= hints.deadline {
                return Err(FetchError::RateLimited {
                    endpoint: spec.id.to_string(),
                });
            }
            self.sleep_cancellable(wait, &hints.cancel)?;
        }

        Ok(())
    }

    fn sleep_cancellable(&self, total: Duration, cancel: &CancelToken) -> Result<(), FetchError> {
        let wake_at = Instant::now() + total;
        while let Some(remaining) = wake_at.checked_duration_since(Instant::now()) {
            if remaining.is_zero() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
        Ok(())
    }

    fn breaker(&self, endpoint_id: &'static str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap()
            .entry(endpoint_id)
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(&self.config.federation))))
            .clone()
    }

    fn bucket(&self, spec: &'static EndpointSpec) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .lock()
            .unwrap()
            .entry(spec.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(
                    spec.rate_class.per_minute(),
                    Instant::now(),
                )))
            })
            .clone()
    }

    /// Current breaker state per endpoint, for the readiness probe.
    pub fn circuit_summary(&self) -> Vec<(String, &'static str)> {
        self.breakers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, breaker)| (id.to_string(), breaker.lock().unwrap().state_label()))
            .collect()
    }
}

fn payload(spec: &'static EndpointSpec, value: serde_json::Value, from_cache: bool) -> Payload {
    let restricted = value.get(RESTRICTED_KEY).is_some();
    Payload {
        endpoint: spec.id.to_string(),
        value,
        restricted,
        from_cache,
    }
}

fn restricted_marker(status: u16) -> serde_json::Value {
    serde_json::json!({ RESTRICTED_KEY: status })
}

#[cfg(test)]
mod tests {
    use super::{FetchError, FetchHints, Federator};
    use crate::cache::CacheHierarchy;
    use crate::config::{Config, Secrets};
    use crate::db::Database;
    use crate::server::metrics::Metrics;
    use crate::utils::cancel::CancelToken;
    use crate::utils::stub::stub_upstream;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn federator() -> Federator {
        let db = Database::temp().unwrap();
        let config = Config::default();
        let cache = Arc::new(CacheHierarchy::temp(db, config.clone()).unwrap());
        Federator::new(cache, config, Secrets::default(), Metrics::shared())
    }

    fn hints() -> FetchHints {
        FetchHints::new(
            Instant::now() + Duration::from_secs(10),
            "corr-test",
            CancelToken::new(),
        )
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fetch_is_idempotent_within_ttl() {
        let federator = federator();
        let (url, hits) = stub_upstream(200, r#"[{"valor": 250000}]"#);
        federator.override_base_url("contracts", &url);

        let query = params(&[("ano", "2024"), ("uf", "MG")]);
        let first = federator.fetch("contracts", &query, &hints()).unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.value[0]["valor"], 250000);

        let second = federator.fetch("contracts", &query, &hints()).unwrap();
        assert!(second.from_cache);

        // Two fetches within a fresh TTL window: one upstream call.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restricted_upstream_does_not_open_breaker() {
        let federator = federator();
        let (url, hits) = stub_upstream(403, r#"{"message": "blocked"}"#);
        federator.override_base_url("public-servants", &url);

        for i in 0..8 {
            let query = params(&[("pagina", &i.to_string())]);
            let payload = federator
                .fetch("public-servants", &query, &hints())
                .unwrap();
            assert!(payload.restricted);
        }

        assert_eq!(hits.load(Ordering::SeqCst), 8);
        // No breaker ever opened for this endpoint.
        assert!(federator
            .circuit_summary()
            .iter()
            .all(|(_, state)| *state == "closed"));
    }

    #[test]
    fn test_flapping_upstream_opens_breaker_and_fast_fails() {
        let federator = federator();
        let (url, hits) = stub_upstream(500, r#"{"error": "boom"}"#);
        federator.override_base_url("agreements", &url);

        // max_retries=3 means 4 attempts; the breaker (threshold 5) opens
        // during the second fetch.
        for i in 0..2 {
            let query = params(&[("pagina", &i.to_string())]);
            let err = federator.fetch("agreements", &query, &hints()).unwrap_err();
            match (i, err) {
                (0, FetchError::UpstreamError { status, .. }) => assert_eq!(status, 500),
                (1, FetchError::CircuitOpen { .. }) => {}
                (i, other) => panic!("fetch {i}: unexpected error {other}"),
            }
        }
        let upstream_calls = hits.load(Ordering::SeqCst);
        assert_eq!(upstream_calls, 5);

        // While open, calls fast-fail without reaching the upstream.
        let start = Instant::now();
        let err = federator
            .fetch("agreements", &params(&[("pagina", "9")]), &hints())
            .unwrap_err();
        assert!(matches!(err, FetchError::CircuitOpen { .. }));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), upstream_calls);
    }

    #[test]
    fn test_cancellation_surfaces_cleanly() {
        let federator = federator();
        let (url, _hits) = stub_upstream(200, "{}");
        federator.override_base_url("expenses", &url);

        let cancel = CancelToken::new();
        cancel.cancel();
        let hints = FetchHints::new(
            Instant::now() + Duration::from_secs(10),
            "corr-test",
            cancel,
        );

        let err = federator
            .fetch("expenses", &params(&[("ano", "2024")]), &hints)
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn test_unknown_endpoint() {
        let federator = federator();
        let err = federator.fetch("nope", &[], &hints()).unwrap_err();
        assert!(matches!(err, FetchError::UnknownEndpoint(_)));
    }

    #[test]
    fn test_url_templates_consume_params() {
        let federator = federator();
        let spec = crate::registry::lookup("company-registry").unwrap();
        let (url, query) = federator.build_url(
            spec,
            &params(&[("cnpj", "19131243000197"), ("detalhe", "1")]),
        );

        assert!(url.ends_with("/19131243000197"));
        assert_eq!(query, params(&[("detalhe", "1")]));
    }
}
