//! Counters and latency tracking.
//!
//! [`BridgeStats`] holds process-lifetime counters; [`LatencyTracker`] keeps a
//! bounded ring buffer of recent durations per operation and derives rollup
//! summaries from a sorted copy, leaving the buffer itself untouched.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

macro_rules! bridge_stats {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        /// Monotonic bridge counters.
        #[derive(Debug, Default)]
        pub struct BridgeStats {
            $($(#[$doc])* pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`BridgeStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }

        impl BridgeStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

bridge_stats! {
    /// Requests accepted by the bridge.
    requests,
    cache_hits,
    cache_misses,
    /// Calls dispatched to the persistent worker.
    worker_requests,
    worker_starts,
    /// Starts that replaced a worker which had exited or been stopped.
    worker_restarts,
    /// Start attempts in which no candidate came up.
    worker_failures,
    worker_exits,
    /// Calls served by a one-shot process.
    fallback_requests,
    fallback_failures,
    queue_enqueued,
    queue_dequeued,
    queue_dropped,
    queue_timed_out,
    queue_completed,
    queue_failed,
    queue_max_depth,
    /// Worker restarts triggered by a change to its source files.
    code_reloads,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the max-depth watermark.
    pub fn observe_depth(&self, depth: usize) {
        self.queue_max_depth
            .fetch_max(depth as u64, Ordering::Relaxed);
    }
}

/// Rollup of one latency series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub last_ms: u64,
}

/// Ring-buffered latency samples per named operation.
#[derive(Debug)]
pub struct LatencyTracker {
    limit: usize,
    series: DashMap<String, VecDeque<u64>>,
}

impl LatencyTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            series: DashMap::new(),
        }
    }

    /// Append a sample, dropping the oldest once the buffer is full.
    pub fn record(&self, operation: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut samples = self.series.entry(operation.to_string()).or_default();
        if samples.len() == self.limit {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    /// Summary for one operation, if it has samples.
    pub fn summary(&self, operation: &str) -> Option<LatencySummary> {
        let samples = self.series.get(operation)?;
        summarize(&samples)
    }

    /// Summaries for every operation, keyed by name.
    pub fn summaries(&self) -> BTreeMap<String, LatencySummary> {
        self.series
            .iter()
            .filter_map(|entry| summarize(entry.value()).map(|s| (entry.key().clone(), s)))
            .collect()
    }
}

fn summarize(samples: &VecDeque<u64>) -> Option<LatencySummary> {
    let last_ms = *samples.back()?;
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let total: u64 = sorted.iter().sum();
    Some(LatencySummary {
        count: sorted.len(),
        avg_ms: total as f64 / sorted.len() as f64,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
        last_ms,
    })
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
