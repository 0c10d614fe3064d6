//! Async client for one running worker process.
//!
//! A [`WorkerClient`] owns exactly one child process and the table of calls
//! in flight on it. It is never reused across restarts: when the process
//! exits, every pending call is rejected and the supervisor builds a fresh
//! client for the next start.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::codec::{encode_request, LineDecoder};
use super::command::LaunchSpec;
use super::error::{BridgeError, BridgeResult, WORKER_CALL};
use super::normalize::{normalize_error_text, normalize_spawn_error};
use super::protocol::ResponseEnvelope;

/// Lines of worker stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to let the stdout reader drain after the process exits.
const READER_DRAIN: Duration = Duration::from_millis(50);

// ============================================================================
// Request IDs
// ============================================================================

/// Generates request IDs that are unique for the life of the process.
///
/// IDs are `<tag>-<counter>`, where the tag is drawn once from a random UUID
/// so IDs never repeat across host restarts either.
#[derive(Debug)]
pub struct RequestIdGenerator {
    tag: String,
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            tag: uuid[..8].to_string(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.tag, n)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pending calls
// ============================================================================

struct PendingCall {
    created_at: Instant,
    tx: oneshot::Sender<BridgeResult<Value>>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<String, PendingCall>,
    /// Set once the worker has exited; no call may register afterwards.
    closed: Option<String>,
}

/// Calls in flight on one worker, keyed by request ID.
///
/// Each call reaches exactly one terminal outcome: whichever of response,
/// timeout, or worker exit removes it from the table first wins, and the
/// others find nothing to act on.
#[derive(Default)]
pub struct PendingCalls {
    state: StdMutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call before its request line is written.
    pub fn register(&self, id: &str) -> BridgeResult<oneshot::Receiver<BridgeResult<Value>>> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.closed {
            return Err(BridgeError::WorkerExited(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(
            id.to_string(),
            PendingCall {
                created_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Deliver a decoded response. Returns false if no call was waiting.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let Some(call) = lock(&self.state).calls.remove(&response.id) else {
            return false;
        };
        tracing::trace!(
            target: "askbridge::worker",
            id = %response.id,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "response matched"
        );
        call.tx.send(response.into_outcome()).is_ok()
    }

    /// Forget a call. Returns true if it was still pending.
    pub fn cancel(&self, id: &str) -> bool {
        lock(&self.state).calls.remove(id).is_some()
    }

    /// Reject every pending call and refuse new ones.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = lock(&self.state);
            state.closed = Some(reason.to_string());
            state.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call
                .tx
                .send(Err(BridgeError::WorkerExited(reason.to_string())));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.state).calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the call from the table if the caller stops waiting early.
struct PendingSlot<'a> {
    pending: &'a PendingCalls,
    id: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}

// ============================================================================
// Worker client
// ============================================================================

/// Why and how a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub reason: String,
}

#[derive(Debug, Default)]
struct Diagnostics {
    stderr_tail: VecDeque<String>,
    last_error: Option<String>,
    last_exit_code: Option<i32>,
}

/// Health view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub running: bool,
    pub pid: Option<u32>,
    pub executable: String,
    pub uptime_ms: u64,
    pub pending_calls: usize,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
}

/// Client for one running worker process.
///
/// Requests are written as NDJSON envelopes on the worker's stdin; a
/// background task decodes its stdout and routes each response to the
/// waiting caller by request ID. Dropping the client kills the process.
pub struct WorkerClient {
    /// Writer for sending requests to worker stdin.
    stdin: Mutex<BufWriter<ChildStdin>>,

    /// Calls awaiting a response.
    pending: Arc<PendingCalls>,

    /// Shared request ID source.
    ids: Arc<RequestIdGenerator>,

    /// Candidate executable this worker was started from.
    executable: String,

    pid: Option<u32>,
    started_at: Instant,

    /// `Some` once the process has exited.
    exit: watch::Receiver<Option<WorkerExit>>,

    /// Signals the wait task to kill the process.
    kill: StdMutex<Option<oneshot::Sender<()>>>,

    diagnostics: Arc<StdMutex<Diagnostics>>,

    _wait_task: JoinHandle<()>,
}

impl WorkerClient {
    /// Spawn `program` and treat it as started if it is still alive after
    /// `grace`.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the process cannot be spawned or exits
    /// inside the grace window.
    pub async fn spawn(
        spec: &LaunchSpec,
        program: &str,
        ids: Arc<RequestIdGenerator>,
        grace: Duration,
    ) -> BridgeResult<Self> {
        let mut child = spec
            .command(program)
            .spawn()
            .map_err(|e| BridgeError::Unavailable(normalize_spawn_error(program, &e)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Io("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Io("worker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Io("worker stderr not captured".to_string()))?;

        let pending = Arc::new(PendingCalls::new());
        let diagnostics = Arc::new(StdMutex::new(Diagnostics::default()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        let reader_task = Self::spawn_reader_task(stdout, pending.clone());
        let stderr_task = Self::spawn_stderr_task(stderr, pid, diagnostics.clone());
        let wait_task = Self::spawn_wait_task(
            child,
            kill_rx,
            [reader_task, stderr_task],
            pending.clone(),
            diagnostics.clone(),
            exit_tx,
        );

        let client = Self {
            stdin: Mutex::new(BufWriter::new(stdin)),
            pending,
            ids,
            executable: program.to_string(),
            pid,
            started_at: Instant::now(),
            exit: exit_rx,
            kill: StdMutex::new(Some(kill_tx)),
            diagnostics,
            _wait_task: wait_task,
        };

        // No readiness handshake: silence through the grace window counts as
        // a successful start.
        let mut exit = client.exit.clone();
        if let Ok(result) = tokio::time::timeout(grace, exit.wait_for(Option::is_some)).await {
            let reason = match result {
                Ok(exit) => exit
                    .as_ref()
                    .map(|e| e.reason.clone())
                    .unwrap_or_default(),
                Err(_) => "exit status lost".to_string(),
            };
            return Err(BridgeError::Unavailable(format!(
                "`{program}` exited during startup: {reason}"
            )));
        }

        tracing::info!(target: "askbridge::worker", pid, executable = program, "worker started");
        Ok(client)
    }

    /// Spawn the background task that reads responses from the worker.
    fn spawn_reader_task(stdout: ChildStdout, pending: Arc<PendingCalls>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut decoder = LineDecoder::new();
            let mut chunk = vec![0u8; 8192];

            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for response in decoder.push(&chunk[..n]) {
                            let id = response.id.clone();
                            if !pending.resolve(response) {
                                tracing::debug!(
                                    target: "askbridge::worker",
                                    %id,
                                    "dropping response with no waiting call"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "askbridge::worker", error = %e, "worker stdout read failed");
                        break;
                    }
                }
            }
        })
    }

    /// Forward stderr to tracing and keep a short tail for diagnostics.
    fn spawn_stderr_task(
        stderr: ChildStderr,
        pid: Option<u32>,
        diagnostics: Arc<StdMutex<Diagnostics>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "askbridge::worker", pid, "{line}");
                let mut diag = lock(&diagnostics);
                if diag.stderr_tail.len() == STDERR_TAIL_LINES {
                    diag.stderr_tail.pop_front();
                }
                diag.stderr_tail.push_back(line);
            }
        })
    }

    /// Own the child until it exits, then reject whatever is still pending.
    fn spawn_wait_task(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        pipe_tasks: [JoinHandle<()>; 2],
        pending: Arc<PendingCalls>,
        diagnostics: Arc<StdMutex<Diagnostics>>,
        exit_tx: watch::Sender<Option<WorkerExit>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stopped = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    stopped = true;
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // A grandchild can inherit the pipes and keep them open; stop
            // reading once the drain window is over.
            let drain_until = tokio::time::Instant::now() + READER_DRAIN;
            for mut task in pipe_tasks {
                if tokio::time::timeout_at(drain_until, &mut task).await.is_err() {
                    task.abort();
                }
            }

            let code = status.as_ref().ok().and_then(|s| s.code());
            let reason = {
                let mut diag = lock(&diagnostics);
                diag.last_exit_code = code;
                let reason = if stopped {
                    "worker was stopped".to_string()
                } else {
                    let tail: Vec<&str> = diag.stderr_tail.iter().map(String::as_str).collect();
                    let detail = normalize_error_text(&tail.join("\n"));
                    match code {
                        Some(code) => format!("exited with code {code} ({detail})"),
                        None => format!("terminated by signal ({detail})"),
                    }
                };
                if !stopped {
                    diag.last_error = Some(reason.clone());
                }
                reason
            };

            // Publish the exit before rejecting calls, so a rejected caller
            // never finds this worker still looking alive.
            let _ = exit_tx.send(Some(WorkerExit {
                code,
                reason: reason.clone(),
            }));
            let rejected = pending.close(&reason);
            if stopped {
                tracing::info!(target: "askbridge::worker", rejected, "worker stopped");
            } else {
                tracing::warn!(target: "askbridge::worker", ?code, rejected, %reason, "worker exited");
            }
        })
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no response arrives within `timeout` (the worker keeps
    ///   running)
    /// - `WorkerExited` if the worker dies first
    /// - `Io` if the request cannot be written, or the worker stops reading
    ///   its input before the deadline (the worker is then stopped)
    /// - `Application` if the worker answers `ok: false`
    ///
    /// The whole call, writing included, is bounded by `timeout`.
    pub async fn call(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.ids.next_id();
        let line = encode_request(&id, payload)?;

        let rx = self.pending.register(&id)?;
        let _slot = PendingSlot {
            pending: &self.pending,
            id: &id,
        };

        let Ok(mut stdin) = tokio::time::timeout_at(deadline, self.stdin.lock()).await else {
            tracing::debug!(target: "askbridge::worker", %id, "timed out waiting to write to worker");
            return Err(BridgeError::timeout(WORKER_CALL, timeout));
        };
        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        match tokio::time::timeout_at(deadline, written).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::Io(e.to_string())),
            Err(_) => {
                // A half-written line leaves the pipe unusable for every
                // later call, so this worker has to go.
                drop(stdin);
                tracing::warn!(
                    target: "askbridge::worker",
                    pid = self.pid,
                    "worker stopped reading its input, stopping it"
                );
                self.stop();
                return Err(BridgeError::Io(format!(
                    "worker did not accept the request within {}ms",
                    timeout.as_millis()
                )));
            }
        }
        drop(stdin);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::debug!(target: "askbridge::worker", %id, "worker call timed out");
                Err(BridgeError::timeout(WORKER_CALL, timeout))
            }
        }
    }

    /// Ask the process to terminate without waiting for it.
    ///
    /// Pending calls are rejected once the exit is observed.
    pub fn stop(&self) {
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }

    /// Wait until the process has exited.
    pub async fn wait_exit(&self) -> Option<WorkerExit> {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        result.ok().and_then(|exit| exit.clone())
    }

    /// Receiver that flips to `Some` when the process exits.
    pub(crate) fn exit_receiver(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit.clone()
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn info(&self) -> WorkerInfo {
        let diag = lock(&self.diagnostics);
        WorkerInfo {
            running: self.is_alive(),
            pid: self.pid,
            executable: self.executable.clone(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            pending_calls: self.pending.len(),
            last_error: diag.last_error.clone(),
            last_exit_code: diag.last_exit_code,
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
