//! Request orchestrator
//!
//! Runs a named remote operation at most once per distinct key at a time:
//! cache lookup, then coalescing onto an in-flight call, then a connectivity
//! probe and a sequential retry loop. The work runs in a spawned task so a
//! caller that gives up (timeout race) does not cancel it; a late success
//! still lands in the cache for the next request.

use super::cache::{TtlCache, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use super::inflight::{Claim, InFlightGuard, InFlightTracker, SharedOutcome};
use super::outcome::{RequestOutcome, ResponseEnvelope};
use crate::config::ClientSettings;
use crate::error::RequestError;
use crate::retry::{RetryPolicy, RetryState, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};
use async_trait::async_trait;
use futures::future::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sentinel mixed into the in-flight key of non-cacheable operations.
const NO_CACHE_SENTINEL: &str = "no-cache";

/// "Is the backend reachable?" Checked once per orchestrated call, before
/// any retry budget is spent.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self, base_url: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Cache successful results for the given TTL
    Cache(Duration),
    /// Side-effecting or volatile operation; never cached
    NoCache,
}

impl CachePolicy {
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CachePolicy::Cache(ttl) => Some(*ttl),
            CachePolicy::NoCache => None,
        }
    }
}

struct CacheState {
    entries: TtlCache<Value>,
    /// Bumped on every reconfigure; results started under an older
    /// generation are not cached and never coalesce with newer calls.
    generation: u64,
}

struct Inner {
    cache: Mutex<CacheState>,
    in_flight: InFlightTracker,
    settings: RwLock<ClientSettings>,
    probe: Arc<dyn ConnectivityProbe>,
    base_delay: Duration,
    max_delay: Duration,
}

enum Dispatch {
    Cached(Value),
    Pending(SharedOutcome),
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    pub fn new(settings: ClientSettings, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self::with_cache_size(settings, probe, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_cache_size(
        settings: ClientSettings,
        probe: Arc<dyn ConnectivityProbe>,
        max_entries: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(CacheState {
                    entries: TtlCache::new(max_entries, DEFAULT_TTL),
                    generation: 0,
                }),
                in_flight: InFlightTracker::new(),
                settings: RwLock::new(settings.normalized()),
                probe,
                base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
                max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            }),
        }
    }

    /// Override backoff timing. Only valid before the orchestrator is shared.
    pub fn with_backoff(self, base: Duration, cap: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.base_delay = base;
                inner.max_delay = cap;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("with_backoff called on a shared orchestrator; keeping existing delays");
                Self { inner: shared }
            }
        }
    }

    pub fn settings(&self) -> ClientSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings().max_retries)
            .with_delays(self.inner.base_delay, self.inner.max_delay)
    }

    /// Swap settings and drop every cached response, atomically with respect
    /// to later `execute` calls.
    pub fn reconfigure(&self, settings: ClientSettings) {
        let settings = settings.normalized();
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.clear();
        cache.generation += 1;
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings;
        info!("Client settings changed; response cache cleared");
    }

    /// Drop cached responses without touching settings.
    pub fn clear_cache(&self) {
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.clear();
    }

    pub fn cache_len(&self) -> usize {
        let cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Run `request_fn` under the cache / coalescing / retry rules and return
    /// a uniform outcome. `key_inputs` identifies the request; identical
    /// `(operation, key_inputs)` pairs share one attempt sequence.
    pub async fn execute<F, Fut>(
        &self,
        operation: &str,
        key_inputs: &Value,
        policy: CachePolicy,
        request_fn: F,
    ) -> RequestOutcome<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        match self.dispatch(operation, key_inputs, policy, request_fn) {
            Dispatch::Cached(data) => RequestOutcome::success(data),
            Dispatch::Pending(pending) => pending.await,
        }
    }

    /// Like [`execute`](Self::execute), but the caller stops waiting after the
    /// configured `requestTimeout`. The underlying call keeps running.
    pub async fn execute_with_timeout<F, Fut>(
        &self,
        operation: &str,
        key_inputs: &Value,
        policy: CachePolicy,
        request_fn: F,
    ) -> RequestOutcome<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        let after = self.settings().timeout();
        match self.dispatch(operation, key_inputs, policy, request_fn) {
            Dispatch::Cached(data) => RequestOutcome::success(data),
            Dispatch::Pending(pending) => match tokio::time::timeout(after, pending).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("{} timed out after {:?}; leaving call to finish in background", operation, after);
                    RequestOutcome::failure(RequestError::Timeout { after })
                }
            },
        }
    }

    fn dispatch<F, Fut>(
        &self,
        operation: &str,
        key_inputs: &Value,
        policy: CachePolicy,
        request_fn: F,
    ) -> Dispatch
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        let cache_key = cache_key(operation, key_inputs);
        let retry = self.retry_policy();

        // The cache lookup and the in-flight registration share one critical
        // section. The owner writes the cache before its guard leaves the
        // tracker, so a caller holding this lock sees one or the other.
        let mut cache = self.inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        if policy.ttl().is_some() {
            if let Some(hit) = cache.entries.get(&cache_key) {
                debug!("cache hit for {}", operation);
                return Dispatch::Cached(hit);
            }
        }
        let generation = cache.generation;

        let in_flight_key = match policy {
            CachePolicy::Cache(_) => format!("{}:{}", generation, cache_key),
            CachePolicy::NoCache => format!("{}:{}:{}", generation, NO_CACHE_SENTINEL, cache_key),
        };

        let inner = Arc::clone(&self.inner);
        let op = operation.to_string();
        let claim = self.inner.in_flight.join_or_register(&in_flight_key, move |guard| {
            let task = tokio::spawn(run_owned(inner, guard, op, cache_key, generation, policy, retry, request_fn));
            async move {
                task.await.unwrap_or_else(|err| {
                    RequestOutcome::failure(RequestError::Transient {
                        status: None,
                        message: format!("request task failed: {}", err),
                    })
                })
            }
            .boxed()
        });
        drop(cache);

        if let Claim::Joined(_) = &claim {
            debug!("joining in-flight {} call", operation);
        }
        Dispatch::Pending(claim.into_future())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_owned<F, Fut>(
    inner: Arc<Inner>,
    guard: InFlightGuard,
    operation: String,
    cache_key: String,
    generation: u64,
    policy: CachePolicy,
    retry: RetryPolicy,
    request_fn: F,
) -> RequestOutcome<Value>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
{
    let base_url = inner
        .settings
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .backend_url
        .clone();

    let outcome = if inner.probe.is_reachable(&base_url).await {
        attempt_with_retries(&operation, &retry, &request_fn).await
    } else {
        warn!("{}: backend at {} is unreachable", operation, base_url);
        RequestOutcome::failure(RequestError::Connectivity { url: base_url })
    };

    if let (RequestOutcome::Success { data }, Some(ttl)) = (&outcome, policy.ttl()) {
        let mut cache = inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.generation == generation {
            cache.entries.set_with_ttl(cache_key, data.clone(), ttl);
        } else {
            debug!("{}: settings changed mid-flight; result not cached", operation);
        }
    }

    // Released only after the cache lock above is gone and the value is in
    // place; `dispatch` checks both under the cache lock.
    drop(guard);
    outcome
}

async fn attempt_with_retries<F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    request_fn: &F,
) -> RequestOutcome<Value>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Value, RequestError>>,
{
    let mut state = RetryState::new(policy);
    loop {
        let attempt = state.begin_attempt();
        match request_fn().await.and_then(ResponseEnvelope::normalize) {
            Ok(data) => return RequestOutcome::success(data),
            Err(err) => {
                let again = policy.should_retry(attempt, &err);
                if again {
                    let delay = policy.delay_for(attempt);
                    debug!(
                        "{} attempt {}/{} failed ({}); retrying in {:?}",
                        operation, attempt, policy.max_attempts, err, delay
                    );
                    state.last_error = Some(err);
                    tokio::time::sleep(delay).await;
                } else {
                    state.last_error = Some(err);
                    break;
                }
            }
        }
    }
    let error = state.into_error(policy);
    warn!("{} failed: {}", operation, error);
    RequestOutcome::failure(error)
}

/// Stable serialization of the key inputs: JSON with object keys sorted at
/// every level, prefixed by the operation name.
pub fn cache_key(operation: &str, key_inputs: &Value) -> String {
    let mut out = String::with_capacity(64);
    out.push_str(operation);
    out.push(':');
    write_canonical(key_inputs, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedProbe(AtomicBool);

    impl FixedProbe {
        fn up() -> Arc<Self> {
            Arc::new(Self(AtomicBool::new(true)))
        }
        fn down() -> Arc<Self> {
            Arc::new(Self(AtomicBool::new(false)))
        }
    }

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn is_reachable(&self, _base_url: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn orchestrator(max_retries: u32, probe: Arc<dyn ConnectivityProbe>) -> RequestOrchestrator {
        let settings = ClientSettings {
            max_retries,
            ..ClientSettings::default()
        };
        RequestOrchestrator::new(settings, probe)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(250))
    }

    /// Request function that fails with `status` for the first `failures`
    /// calls, then succeeds with `payload`.
    fn scripted(
        calls: Arc<AtomicUsize>,
        failures: usize,
        status: u16,
        payload: Value,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, RequestError>>
           + Send
           + Sync
           + 'static {
        move || {
            let calls = Arc::clone(&calls);
            let payload = payload.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(RequestError::from_status(status, "scripted failure"))
                } else {
                    Ok(payload)
                }
            }
            .boxed()
        }
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = json!({"prompt": "p", "language": "js", "context": {"b": 1, "a": [1, 2]}});
        let b = json!({"context": {"a": [1, 2], "b": 1}, "language": "js", "prompt": "p"});
        assert_eq!(cache_key("generate", &a), cache_key("generate", &b));
        assert_ne!(cache_key("generate", &a), cache_key("fix-bug", &a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_cached_and_reused() {
        let orch = orchestrator(3, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let inputs = json!({"prompt": "x"});
        let policy = CachePolicy::Cache(Duration::from_secs(60));

        let first = orch
            .execute("generate", &inputs, policy, scripted(calls.clone(), 0, 500, json!({"code": "1"})))
            .await;
        let second = orch
            .execute("generate", &inputs, policy, scripted(calls.clone(), 0, 500, json!({"code": "2"})))
            .await;

        assert_eq!(first, RequestOutcome::success(json!({"code": "1"})));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_coalesce() {
        let orch = orchestrator(3, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let inputs = json!({"prompt": "same"});
        let policy = CachePolicy::Cache(Duration::from_secs(60));

        let slow = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({"code": "shared"}))
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            orch.execute("generate", &inputs, policy, slow.clone()),
            orch.execute("generate", &inputs, policy, slow),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert!(a.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_makes_one_attempt() {
        let orch = orchestrator(5, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = orch
            .execute("generate", &json!({}), CachePolicy::NoCache, scripted(calls.clone(), 10, 404, json!(null)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome.error(),
            Some(RequestError::Client { status: 404, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_exhausts_budget() {
        for status in [429u16, 503] {
            let orch = orchestrator(4, FixedProbe::up());
            let calls = Arc::new(AtomicUsize::new(0));
            let started = tokio::time::Instant::now();
            let outcome = orch
                .execute("chat", &json!({"s": status}), CachePolicy::NoCache, scripted(calls.clone(), 10, status, json!(null)))
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), 4);
            match outcome.error() {
                Some(RequestError::RetriesExhausted { attempts, .. }) => assert_eq!(*attempts, 4),
                other => panic!("unexpected: {other:?}"),
            }
            // 100 + 200 + 250 (capped)
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(550), "{elapsed:?}");
            assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let orch = orchestrator(3, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = orch
            .execute("generate", &json!({}), CachePolicy::NoCache, scripted(calls.clone(), 2, 502, json!({"code": "ok"})))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome, RequestOutcome::success(json!({"code": "ok"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_skips_attempts() {
        let orch = orchestrator(3, FixedProbe::down());
        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = orch
            .execute("generate", &json!({}), CachePolicy::Cache(Duration::from_secs(5)), scripted(calls.clone(), 0, 500, json!({})))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(outcome.error(), Some(RequestError::Connectivity { .. })));
        assert_eq!(orch.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let orch = orchestrator(1, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let inputs = json!({"prompt": "p"});
        let policy = CachePolicy::Cache(Duration::from_secs(60));
        let first = orch
            .execute("generate", &inputs, policy, scripted(calls.clone(), 1, 500, json!({"code": "x"})))
            .await;
        assert!(!first.is_success());
        let second = orch
            .execute("generate", &inputs, policy, scripted(calls.clone(), 1, 500, json!({"code": "x"})))
            .await;
        assert!(second.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_envelope_failure_is_not_retried() {
        let orch = orchestrator(3, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = orch
            .execute(
                "completions",
                &json!({}),
                CachePolicy::NoCache,
                scripted(calls.clone(), 0, 500, json!({"success": false, "error": "nope"})),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.error(),
            Some(&RequestError::Backend("nope".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_cancel_call() {
        let settings = ClientSettings {
            request_timeout: 5_000,
            ..ClientSettings::default()
        };
        let orch = RequestOrchestrator::new(settings, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let inputs = json!({"prompt": "slow"});
        let policy = CachePolicy::Cache(Duration::from_secs(900));
        let slow = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(8)).await;
                    Ok(json!({"code": "late"}))
                }
                .boxed()
            }
        };

        let outcome = orch
            .execute_with_timeout("generate", &inputs, policy, slow.clone())
            .await;
        assert!(matches!(outcome.error(), Some(RequestError::Timeout { .. })));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let cached = orch.execute("generate", &inputs, policy, slow).await;
        assert_eq!(cached, RequestOutcome::success(json!({"code": "late"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_clears_cache() {
        let orch = orchestrator(3, FixedProbe::up());
        let calls = Arc::new(AtomicUsize::new(0));
        let inputs = json!({"prompt": "p"});
        let policy = CachePolicy::Cache(Duration::from_secs(60));
        orch.execute("generate", &inputs, policy, scripted(calls.clone(), 0, 500, json!(1)))
            .await;
        assert_eq!(orch.cache_len(), 1);

        orch.reconfigure(ClientSettings {
            backend_url: "http://other-host:9000/".to_string(),
            ..ClientSettings::default()
        });
        assert_eq!(orch.cache_len(), 0);
        assert_eq!(orch.settings().backend_url, "http://other-host:9000");

        orch.execute("generate", &inputs, policy, scripted(calls.clone(), 0, 500, json!(2)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_from_previous_configuration_is_not_cached() {
        let orch = orchestrator(3, FixedProbe::up());
        let inputs = json!({"prompt": "p"});
        let policy = CachePolicy::Cache(Duration::from_secs(60));
        let slow = || {
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("old backend"))
            }
            .boxed()
        };
        let pending = orch.execute("generate", &inputs, policy, slow);
        let reconfigure = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            orch.reconfigure(ClientSettings::default());
        };
        let (outcome, _) = tokio::join!(pending, reconfigure);
        assert!(outcome.is_success());
        assert_eq!(orch.cache_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_attempt_under_load() {
        for round in 0..300 {
            let orch = orchestrator(3, FixedProbe::up());
            let calls = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..8 {
                let orch = orch.clone();
                let calls = Arc::clone(&calls);
                handles.push(tokio::spawn(async move {
                    orch.execute(
                        "generate",
                        &json!({"p": 1}),
                        CachePolicy::Cache(Duration::from_secs(60)),
                        move || {
                            let calls = Arc::clone(&calls);
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                Ok(json!({"code": "x"}))
                            }
                        },
                    )
                    .await
                }));
            }
            for handle in handles {
                assert!(handle.await.unwrap().is_success());
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1, "round {round}");
        }
    }
}
