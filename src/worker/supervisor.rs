//! Lifecycle management for the persistent worker.
//!
//! The supervisor owns at most one live [`WorkerClient`]. Concurrent callers
//! that find no live worker are coalesced onto a single start attempt; the
//! attempt runs as its own task, so it completes even if every caller that
//! asked for it gives up.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use super::client::{RequestIdGenerator, WorkerClient, WorkerInfo};
use super::command::{LaunchSpec, SourceSnapshot};
use super::error::{BridgeError, BridgeResult};
use crate::config::WorkerSettings;
use crate::metrics::{BridgeStats, LatencyTracker};

type StartFuture = Shared<BoxFuture<'static, BridgeResult<Arc<WorkerClient>>>>;

#[derive(Default)]
struct SupervisorState {
    current: Option<Arc<WorkerClient>>,
    /// Start attempt in progress, shared by every waiting caller.
    starting: Option<StartFuture>,
    /// Source mtimes captured when the current worker was started.
    snapshot: Option<SourceSnapshot>,
    /// Info about the most recent worker once it is gone.
    retired: Option<WorkerInfo>,
    has_started: bool,
    shut_down: bool,
}

struct Inner {
    spec: LaunchSpec,
    grace: Duration,
    watch_paths: Vec<PathBuf>,
    ids: Arc<RequestIdGenerator>,
    stats: Arc<BridgeStats>,
    latency: Arc<LatencyTracker>,
    state: StdMutex<SupervisorState>,
}

/// Starts, tracks, and restarts the persistent worker.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl WorkerSupervisor {
    pub fn new(
        settings: &WorkerSettings,
        stats: Arc<BridgeStats>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec: LaunchSpec::persistent(settings),
                grace: settings.startup_grace(),
                watch_paths: settings.watch_paths(),
                ids: Arc::new(RequestIdGenerator::new()),
                stats,
                latency,
                state: StdMutex::new(SupervisorState::default()),
            }),
        }
    }

    /// Get the live worker, starting one if needed.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if no candidate could be started, or if the
    /// supervisor has been shut down.
    pub async fn client(&self) -> BridgeResult<Arc<WorkerClient>> {
        let start = {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                return Err(BridgeError::Unavailable("worker bridge is shut down".into()));
            }
            if let Some(client) = state.current.clone() {
                if client.is_alive() {
                    return Ok(client);
                }
                state.retired = Some(client.info());
                state.current = None;
            }
            if let Some(start) = state.starting.clone() {
                tracing::debug!("joining worker start already in progress");
                start
            } else {
                let start = Self::begin_start(self.inner.clone());
                state.starting = Some(start.clone());
                start
            }
        };
        start.await
    }

    fn begin_start(inner: Arc<Inner>) -> StartFuture {
        let task = tokio::spawn(Self::start(inner));
        async move {
            task.await.unwrap_or_else(|e| {
                Err(BridgeError::Unavailable(format!("worker start task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Try each candidate in order and install the first that stays up.
    async fn start(inner: Arc<Inner>) -> BridgeResult<Arc<WorkerClient>> {
        let started = Instant::now();
        let snapshot = SourceSnapshot::capture(&inner.watch_paths).await;

        let mut failures = Vec::new();
        for program in &inner.spec.candidates {
            match WorkerClient::spawn(&inner.spec, program, inner.ids.clone(), inner.grace).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    inner
                        .latency
                        .record("worker.start", started.elapsed());
                    return Self::install(&inner, client, snapshot);
                }
                Err(e) => {
                    tracing::warn!(candidate = %program, error = %e, "worker candidate failed");
                    failures.push(e.to_string());
                }
            }
        }

        BridgeStats::incr(&inner.stats.worker_failures);
        let mut state = lock(&inner.state);
        state.starting = None;
        let message = match failures.pop() {
            Some(last) => format!("AI worker is unavailable: {last}"),
            None => "AI worker is unavailable: no worker candidates configured".to_string(),
        };
        Err(BridgeError::Unavailable(message))
    }

    fn install(
        inner: &Arc<Inner>,
        client: Arc<WorkerClient>,
        snapshot: SourceSnapshot,
    ) -> BridgeResult<Arc<WorkerClient>> {
        let mut state = lock(&inner.state);
        state.starting = None;
        if state.shut_down {
            client.stop();
            return Err(BridgeError::Unavailable("worker bridge is shut down".into()));
        }

        BridgeStats::incr(&inner.stats.worker_starts);
        if state.has_started {
            BridgeStats::incr(&inner.stats.worker_restarts);
            tracing::info!(pid = client.pid(), "worker restarted");
        }
        state.has_started = true;
        state.current = Some(client.clone());
        state.snapshot = Some(snapshot);

        Self::spawn_exit_monitor(Arc::downgrade(inner), &client);
        Ok(client)
    }

    /// Count the exit and forget the client as soon as its process ends.
    fn spawn_exit_monitor(inner: Weak<Inner>, client: &Arc<WorkerClient>) {
        let mut exit = client.exit_receiver();
        let watched = Arc::downgrade(client);
        tokio::spawn(async move {
            let _ = exit.wait_for(Option::is_some).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            BridgeStats::incr(&inner.stats.worker_exits);
            let mut state = lock(&inner.state);
            let is_current = state
                .current
                .as_ref()
                .is_some_and(|current| Arc::as_ptr(current) == watched.as_ptr());
            if is_current {
                state.retired = state.current.take().map(|client| client.info());
            }
        });
    }

    /// Send one call to the persistent worker, starting it if needed.
    pub async fn call(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        let client = self.client().await?;
        BridgeStats::incr(&self.inner.stats.worker_requests);
        let started = Instant::now();
        let result = client.call(payload, timeout).await;
        self.inner.latency.record("worker.call", started.elapsed());
        result
    }

    /// Restart the worker if its source files changed since it started.
    ///
    /// Returns true when a running worker was stopped because of a change;
    /// its in-flight calls are rejected.
    pub async fn check_code_change(&self) -> bool {
        if self.inner.watch_paths.is_empty() {
            return false;
        }
        let baseline = lock(&self.inner.state).snapshot.clone();
        let Some(baseline) = baseline else {
            return false;
        };
        let current = SourceSnapshot::capture(&self.inner.watch_paths).await;
        let changed = current.changed_paths(&baseline);
        if changed.is_empty() {
            return false;
        }

        let stale = {
            let mut state = lock(&self.inner.state);
            // Another caller already handled this change.
            if state.snapshot.as_ref() != Some(&baseline) {
                return false;
            }
            state.snapshot = None;
            state.current.take()
        };

        // With no worker running, the next start picks up the new source.
        let Some(client) = stale else {
            tracing::debug!(?changed, "worker source changed while no worker was running");
            return false;
        };
        BridgeStats::incr(&self.inner.stats.code_reloads);
        tracing::info!(?changed, "worker source changed, restarting worker");
        lock(&self.inner.state).retired = Some(client.info());
        client.stop();
        true
    }

    /// Kill the worker without waiting for it to exit.
    pub fn shutdown(&self) {
        let current = {
            let mut state = lock(&self.inner.state);
            state.shut_down = true;
            state.current.take()
        };
        if let Some(client) = current {
            tracing::info!(pid = client.pid(), "stopping worker");
            client.stop();
        }
    }

    /// Info about the live worker, or the last one if none is running.
    pub fn worker_info(&self) -> Option<WorkerInfo> {
        let state = lock(&self.inner.state);
        match &state.current {
            Some(client) => Some(client.info()),
            None => state.retired.clone().map(|mut info| {
                info.running = false;
                info.pending_calls = 0;
                info
            }),
        }
    }

    /// Whether a worker process is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.state)
            .current
            .as_ref()
            .is_some_and(|client| client.is_alive())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
