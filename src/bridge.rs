//! Request orchestration.
//!
//! [`Bridge`] is the single entry point for host code. An `ask` is answered
//! from the cache when possible, otherwise admitted through the queue and
//! dispatched; every other action bypasses both. Dispatch prefers the
//! persistent worker and degrades to a one-shot process when the worker path
//! is broken.
//!
//! # Example
//!
//! ```ignore
//! use askbridge::{AskRequest, Bridge, DetailMode, Settings};
//!
//! let bridge = Bridge::new(&Settings::load()?);
//! let answer = bridge
//!     .ask(AskRequest::new("When does registration open?").with_mode(DetailMode::Brief))
//!     .await?;
//! bridge.shutdown();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheKey, ResponseCache};
use crate::config::Settings;
use crate::metrics::{BridgeStats, LatencySummary, LatencyTracker, StatsSnapshot};
use crate::queue::AdmissionQueue;
use crate::worker::{
    AskRequest, BridgeRequest, BridgeResult, FallbackSpawner, WorkerInfo, WorkerSupervisor,
};

/// Something that can carry one request payload to a worker and back.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value>;
}

#[async_trait]
impl RequestExecutor for WorkerSupervisor {
    async fn execute(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        self.call(payload, timeout).await
    }
}

#[async_trait]
impl RequestExecutor for FallbackSpawner {
    async fn execute(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        self.call(payload, timeout).await
    }
}

/// Queue occupancy at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub active: usize,
}

/// Point-in-time view of the whole bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub persistent: bool,
    pub worker: Option<WorkerInfo>,
    pub queue: QueueHealth,
    pub cache_entries: usize,
    pub stats: StatsSnapshot,
    pub latency: BTreeMap<String, LatencySummary>,
}

/// Orchestrates cache, queue, persistent worker, and fallback.
pub struct Bridge {
    supervisor: Option<WorkerSupervisor>,
    persistent: Option<Arc<dyn RequestExecutor>>,
    fallback: Arc<dyn RequestExecutor>,
    queue: AdmissionQueue,
    cache: ResponseCache,
    stats: Arc<BridgeStats>,
    latency: Arc<LatencyTracker>,
    request_timeout: Duration,
}

impl Bridge {
    /// Build a bridge that talks to real worker processes.
    ///
    /// No process is started until the first call needs one.
    pub fn new(settings: &Settings) -> Self {
        let stats = Arc::new(BridgeStats::new());
        let latency = Arc::new(LatencyTracker::new(settings.metrics.latency_samples));

        let supervisor = settings
            .worker
            .persistent
            .then(|| WorkerSupervisor::new(&settings.worker, stats.clone(), latency.clone()));
        let persistent = supervisor
            .clone()
            .map(|s| Arc::new(s) as Arc<dyn RequestExecutor>);
        let fallback = Arc::new(FallbackSpawner::new(
            &settings.worker,
            stats.clone(),
            latency.clone(),
        ));

        Self::assemble(settings, stats, latency, supervisor, persistent, fallback)
    }

    /// Build a bridge over caller-supplied executors.
    ///
    /// `persistent` of `None` means every call goes straight to `fallback`.
    pub fn with_executors(
        settings: &Settings,
        persistent: Option<Arc<dyn RequestExecutor>>,
        fallback: Arc<dyn RequestExecutor>,
    ) -> Self {
        let stats = Arc::new(BridgeStats::new());
        let latency = Arc::new(LatencyTracker::new(settings.metrics.latency_samples));
        Self::assemble(settings, stats, latency, None, persistent, fallback)
    }

    fn assemble(
        settings: &Settings,
        stats: Arc<BridgeStats>,
        latency: Arc<LatencyTracker>,
        supervisor: Option<WorkerSupervisor>,
        persistent: Option<Arc<dyn RequestExecutor>>,
        fallback: Arc<dyn RequestExecutor>,
    ) -> Self {
        Self {
            supervisor,
            persistent,
            fallback,
            queue: AdmissionQueue::new(&settings.queue, stats.clone(), latency.clone()),
            cache: ResponseCache::new(settings.cache.ttl(), settings.cache.max_items),
            stats,
            latency,
            request_timeout: settings.worker.request_timeout(),
        }
    }

    /// Handle one request.
    ///
    /// `timeout` bounds the worker call (default: the configured request
    /// timeout); time spent waiting in the queue is bounded separately.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`](crate::worker::BridgeError) whose message is
    /// safe to show to the person who asked.
    pub async fn call(&self, request: BridgeRequest, timeout: Option<Duration>) -> BridgeResult<Value> {
        let request = request.validate()?;
        let action = request.action();
        let timeout = timeout.unwrap_or(self.request_timeout);
        BridgeStats::incr(&self.stats.requests);

        let started = Instant::now();
        let result = match &request {
            BridgeRequest::Ask(ask) => self.handle_ask(ask, &request, timeout, started).await,
            BridgeRequest::Reload => {
                let result = self.dispatch(&request.to_payload()?, timeout).await;
                if result.is_ok() {
                    let cleared = self.cache.clear();
                    tracing::info!(cleared, "worker reloaded, response cache cleared");
                }
                result
            }
            BridgeRequest::Status | BridgeRequest::TrainRewrite(_) => {
                self.dispatch(&request.to_payload()?, timeout).await
            }
        };

        if let Err(e) = &result {
            tracing::debug!(
                action = action.as_str(),
                kind = e.kind().as_str(),
                error = %e,
                "request failed"
            );
        }
        result
    }

    async fn handle_ask(
        &self,
        ask: &AskRequest,
        request: &BridgeRequest,
        timeout: Duration,
        started: Instant,
    ) -> BridgeResult<Value> {
        let key = CacheKey::ask(ask);
        if let Some(hit) = self.cache.get(&key) {
            BridgeStats::incr(&self.stats.cache_hits);
            self.latency.record("bridge.ask.cache_hit", started.elapsed());
            tracing::debug!("answered from cache");
            return Ok(hit);
        }
        if self.cache.is_enabled() {
            BridgeStats::incr(&self.stats.cache_misses);
        }

        let payload = request.to_payload()?;
        let result = self
            .queue
            .run(async { self.dispatch(&payload, timeout).await })
            .await;
        self.latency.record("bridge.ask", started.elapsed());

        if let Ok(value) = &result {
            if is_cacheable(value) {
                self.cache.set(key, value);
            }
        }
        result
    }

    /// Send a payload down the persistent path, falling back when it breaks.
    async fn dispatch(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        let started = Instant::now();
        let action = payload.get("action").and_then(Value::as_str).unwrap_or("unknown");

        if let Some(supervisor) = &self.supervisor {
            if supervisor.check_code_change().await {
                let cleared = self.cache.clear();
                tracing::info!(cleared, "response cache cleared after worker code change");
            }
        }

        let result = match &self.persistent {
            None => self.fallback.execute(payload, timeout).await,
            Some(persistent) => match persistent.execute(payload, timeout).await {
                Err(e) if e.is_worker_failure() => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        Err(e)
                    } else {
                        tracing::warn!(
                            error = %e,
                            remaining_ms = remaining.as_millis() as u64,
                            "persistent worker failed, using one-shot fallback"
                        );
                        match self.fallback.execute(payload, remaining).await {
                            Ok(value) => Ok(value),
                            Err(fallback_err) => {
                                tracing::debug!(error = %fallback_err, "fallback failed too");
                                Err(e)
                            }
                        }
                    }
                }
                other => other,
            },
        };

        if action != "ask" {
            self.latency
                .record(&format!("bridge.{action}"), started.elapsed());
        }
        result
    }

    /// Ask a question.
    pub async fn ask(&self, request: AskRequest) -> BridgeResult<Value> {
        self.call(BridgeRequest::Ask(request), None).await
    }

    /// Query the worker's own status report.
    pub async fn status(&self) -> BridgeResult<Value> {
        self.call(BridgeRequest::Status, None).await
    }

    /// Ask the worker to reload its knowledge, dropping cached answers.
    pub async fn reload(&self) -> BridgeResult<Value> {
        self.call(BridgeRequest::Reload, None).await
    }

    /// Snapshot of worker, queue, cache, counters, and latencies.
    pub fn health(&self) -> BridgeHealth {
        BridgeHealth {
            persistent: self.persistent.is_some(),
            worker: self.supervisor.as_ref().and_then(WorkerSupervisor::worker_info),
            queue: QueueHealth {
                depth: self.queue.depth(),
                active: self.queue.active(),
            },
            cache_entries: self.cache.len(),
            stats: self.stats.snapshot(),
            latency: self.latency.summaries(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Latency rollup for one operation.
    pub fn latency(&self, operation: &str) -> Option<LatencySummary> {
        self.latency.summary(operation)
    }

    /// Kill the persistent worker, if any, without waiting for it.
    pub fn shutdown(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Only non-empty answers are worth caching.
fn is_cacheable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
