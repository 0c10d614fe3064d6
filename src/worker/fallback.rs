//! One-shot worker processes.
//!
//! When the persistent worker is disabled or broken, each call spawns a fresh
//! process, writes the bare payload (no envelope) to its stdin, closes stdin,
//! and reads one JSON document from stdout.

use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::command::LaunchSpec;
use super::error::{BridgeError, BridgeResult, FALLBACK_CALL};
use super::normalize::{normalize_error_text, normalize_spawn_error};
use super::protocol::error_text;
use crate::config::WorkerSettings;
use crate::metrics::{BridgeStats, LatencyTracker};

/// Runs calls in short-lived worker processes.
#[derive(Clone)]
pub struct FallbackSpawner {
    spec: LaunchSpec,
    stats: Arc<BridgeStats>,
    latency: Arc<LatencyTracker>,
}

impl FallbackSpawner {
    pub fn new(
        settings: &WorkerSettings,
        stats: Arc<BridgeStats>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            spec: LaunchSpec::oneshot(settings),
            stats,
            latency,
        }
    }

    /// Run one call in a fresh process.
    ///
    /// # Errors
    ///
    /// - `Unavailable` if no candidate can be spawned
    /// - `Timeout` if the process does not finish within `timeout` (it is killed)
    /// - `Application` if the process reports `ok: false` or exits non-zero
    /// - `Protocol` if stdout is not JSON
    pub async fn call(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        BridgeStats::incr(&self.stats.fallback_requests);
        let started = Instant::now();
        let result = self.run(payload, timeout).await;
        self.latency.record("fallback.call", started.elapsed());
        if let Err(e) = &result {
            BridgeStats::incr(&self.stats.fallback_failures);
            tracing::debug!(kind = e.kind().as_str(), error = %e, "fallback call failed");
        }
        result
    }

    async fn run(&self, payload: &Value, timeout: Duration) -> BridgeResult<Value> {
        let input = serde_json::to_vec(payload)
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;

        let candidates = &self.spec.candidates;
        for (index, program) in candidates.iter().enumerate() {
            let mut child = match self.spec.command(program).spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == IoErrorKind::NotFound && index + 1 < candidates.len() => {
                    tracing::debug!(candidate = %program, "fallback candidate not found, trying next");
                    continue;
                }
                Err(e) => return Err(BridgeError::Unavailable(normalize_spawn_error(program, &e))),
            };

            // Feed stdin while collecting output: a child may fill its stdout
            // pipe before reading all of its input. A worker that exits
            // without reading surfaces through its exit status.
            let stdin = child.stdin.take();
            let feed = async {
                if let Some(mut stdin) = stdin {
                    if let Err(e) = stdin.write_all(&input).await {
                        tracing::debug!(error = %e, "fallback stdin write failed");
                    }
                }
            };
            let finished = async {
                let ((), output) = tokio::join!(feed, child.wait_with_output());
                output
            };

            // The child is killed on drop if the timeout fires.
            let output = match tokio::time::timeout(timeout, finished).await {
                Ok(output) => output.map_err(|e| BridgeError::Io(e.to_string()))?,
                Err(_) => return Err(BridgeError::timeout(FALLBACK_CALL, timeout)),
            };

            return interpret_output(output.status.success(), &output.stdout, &output.stderr);
        }

        Err(BridgeError::Unavailable(
            "AI worker is unavailable: no worker candidates configured".to_string(),
        ))
    }
}

/// Turn a finished one-shot process into a call outcome.
pub(crate) fn interpret_output(success: bool, stdout: &[u8], stderr: &[u8]) -> BridgeResult<Value> {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let parsed: Option<Value> = serde_json::from_str(stdout.trim()).ok();

    if !success {
        let structured = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .map(error_text)
            .filter(|text| !text.trim().is_empty());
        let raw = structured.unwrap_or_else(|| stderr.into_owned());
        return Err(BridgeError::Application(normalize_error_text(&raw)));
    }

    let Some(value) = parsed else {
        let detail = stdout.trim();
        let detail = if detail.is_empty() {
            "worker printed nothing".to_string()
        } else {
            normalize_error_text(detail)
        };
        return Err(BridgeError::Protocol(detail));
    };

    match value.get("ok").and_then(Value::as_bool) {
        Some(false) => {
            let raw = value.get("error").map(error_text).unwrap_or_default();
            Err(BridgeError::Application(normalize_error_text(&raw)))
        }
        Some(true) if value.get("result").is_some() => {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        }
        _ => Ok(value),
    }
}
