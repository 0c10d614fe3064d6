//! Admission control for expensive requests.
//!
//! At most `max_concurrent` jobs run at once. Further jobs wait in FIFO order
//! up to `max_pending` deep; anything beyond that is refused immediately, and
//! a job that waits longer than `max_wait` is dropped with a timeout.
//!
//! A slot is handed directly from a finishing job to the next waiter, so a
//! late arrival can never overtake a job that is already queued.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::QueueSettings;
use crate::metrics::{BridgeStats, LatencyTracker};
use crate::worker::{BridgeError, BridgeResult, QUEUE_WAIT};

struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    waiting: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Shared {
    max_concurrent: usize,
    max_pending: usize,
    max_wait: Duration,
    state: Mutex<QueueState>,
    stats: Arc<BridgeStats>,
    latency: Arc<LatencyTracker>,
}

/// Bounded FIFO admission queue.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

/// Holds one execution slot; releasing it admits the next waiter.
struct SlotGuard {
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pass the slot to the oldest live waiter, or free it.
    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiting.pop_front() {
            if waiter.grant.send(()).is_ok() {
                // The slot moves to the waiter; `active` is unchanged.
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// A place in line. Dropping it while still queued gives the place up, and
/// hands on a slot that was granted but never claimed.
struct QueuedTicket {
    shared: Arc<Shared>,
    ticket: u64,
    grant: oneshot::Receiver<()>,
    queued: bool,
}

impl QueuedTicket {
    /// Leave the line. Returns true if a slot was granted first.
    fn leave(&mut self) -> bool {
        self.queued = false;
        let removed = {
            let mut state = self.shared.lock();
            let before = state.waiting.len();
            state.waiting.retain(|w| w.ticket != self.ticket);
            state.waiting.len() != before
        };
        !removed && self.grant.try_recv().is_ok()
    }
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        if self.queued && self.leave() {
            self.shared.release();
        }
    }
}

enum Admission {
    Run,
    Wait(u64, oneshot::Receiver<()>),
}

impl AdmissionQueue {
    pub fn new(
        settings: &QueueSettings,
        stats: Arc<BridgeStats>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent: settings.max_concurrent.max(1),
                max_pending: settings.max_pending,
                max_wait: settings.max_wait(),
                state: Mutex::new(QueueState::default()),
                stats,
                latency,
            }),
        }
    }

    /// Run `job` once a slot is available.
    ///
    /// # Errors
    ///
    /// - `QueueFull` if `max_pending` jobs are already waiting
    /// - `Timeout` (queue wait) if no slot frees up within `max_wait`
    /// - whatever error `job` itself returns
    pub async fn run<T, F>(&self, job: F) -> BridgeResult<T>
    where
        F: Future<Output = BridgeResult<T>>,
    {
        let queued_at = Instant::now();
        let guard = self.admit().await?;
        let stats = &self.shared.stats;
        BridgeStats::incr(&stats.queue_dequeued);
        self.shared.latency.record("queue.wait", queued_at.elapsed());

        let started = Instant::now();
        let result = job.await;
        drop(guard);
        self.shared.latency.record("queue.run", started.elapsed());

        match &result {
            Ok(_) => BridgeStats::incr(&stats.queue_completed),
            Err(_) => BridgeStats::incr(&stats.queue_failed),
        }
        result
    }

    async fn admit(&self) -> BridgeResult<SlotGuard> {
        let stats = &self.shared.stats;
        let admission = {
            let mut state = self.shared.lock();
            if state.active < self.shared.max_concurrent && state.waiting.is_empty() {
                state.active += 1;
                Admission::Run
            } else if state.waiting.len() >= self.shared.max_pending {
                let depth = state.waiting.len();
                drop(state);
                BridgeStats::incr(&stats.queue_dropped);
                tracing::warn!(depth, "admission queue full, refusing request");
                return Err(BridgeError::QueueFull { depth });
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                let (grant, rx) = oneshot::channel();
                state.waiting.push_back(Waiter { ticket, grant });
                let depth = state.waiting.len();
                drop(state);
                stats.observe_depth(depth);
                Admission::Wait(ticket, rx)
            }
        };

        BridgeStats::incr(&stats.queue_enqueued);
        let (ticket, grant) = match admission {
            Admission::Run => return Ok(self.guard()),
            Admission::Wait(ticket, grant) => (ticket, grant),
        };
        let mut queued = QueuedTicket {
            shared: self.shared.clone(),
            ticket,
            grant,
            queued: true,
        };

        match tokio::time::timeout(self.shared.max_wait, &mut queued.grant).await {
            Ok(Ok(())) => {
                queued.queued = false;
                Ok(self.guard())
            }
            // Senders are only dropped when granting fails, which requires
            // the receiver to be gone; treat it like a timeout regardless.
            Ok(Err(_)) | Err(_) => {
                if queued.leave() {
                    // Granted just as the wait expired: the slot is ours.
                    return Ok(self.guard());
                }
                BridgeStats::incr(&stats.queue_timed_out);
                tracing::warn!(
                    waited_ms = self.shared.max_wait.as_millis() as u64,
                    "request dropped after waiting in admission queue"
                );
                Err(BridgeError::timeout(QUEUE_WAIT, self.shared.max_wait))
            }
        }
    }

    fn guard(&self) -> SlotGuard {
        SlotGuard {
            shared: self.shared.clone(),
        }
    }

    /// Jobs waiting for a slot.
    pub fn depth(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    fn queue(max_concurrent: usize, max_pending: usize, max_wait_ms: u64) -> AdmissionQueue {
        let settings = QueueSettings {
            max_concurrent,
            max_pending,
            max_wait_ms,
        };
        AdmissionQueue::new(
            &settings,
            Arc::new(BridgeStats::new()),
            Arc::new(LatencyTracker::new(16)),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_runs_immediately_when_idle() {
        let q = queue(2, 5, 1000);
        let value = q.run(async { Ok::<_, BridgeError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(q.active(), 0);
        assert_eq!(q.depth(), 0);
        let snapshot = q.shared.stats.snapshot();
        assert_eq!(snapshot.queue_enqueued, 1);
        assert_eq!(snapshot.queue_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_job_releases_slot() {
        let q = queue(1, 5, 1000);
        let err = q
            .run(async { Err::<(), _>(BridgeError::Application("boom".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Application("boom".into()));
        assert_eq!(q.active(), 0);
        assert_eq!(q.shared.stats.snapshot().queue_failed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_refuses_immediately() {
        let q = queue(1, 1, 10_000);
        let gate = Arc::new(Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.run(async move {
                g1.notified().await;
                Ok::<_, BridgeError>(())
            })
            .await
        });
        settle().await;

        let q2 = q.clone();
        let waiting = tokio::spawn(async move { q2.run(async { Ok::<_, BridgeError>(()) }).await });
        settle().await;
        assert_eq!(q.depth(), 1);

        let refused = q.run(async { Ok::<_, BridgeError>(()) }).await.unwrap_err();
        assert_eq!(refused, BridgeError::QueueFull { depth: 1 });
        assert!(refused.is_admission());

        gate.notify_one();
        running.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
        assert_eq!(q.shared.stats.snapshot().queue_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_removes_job() {
        let q = queue(1, 5, 100);
        let gate = Arc::new(Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.run(async move {
                g1.notified().await;
                Ok::<_, BridgeError>(())
            })
            .await
        });
        settle().await;

        let err = q.run(async { Ok::<_, BridgeError>(()) }).await.unwrap_err();
        assert_eq!(err, BridgeError::timeout(QUEUE_WAIT, Duration::from_millis(100)));
        assert_eq!(q.depth(), 0);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(q.active(), 0);
        assert_eq!(q.shared.stats.snapshot().queue_timed_out, 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(1, 10, 10_000);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let q0 = q.clone();
        let g0 = gate.clone();
        let first = tokio::spawn(async move {
            q0.run(async move {
                g0.notified().await;
                Ok::<_, BridgeError>(())
            })
            .await
        });
        settle().await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let q = q.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                q.run(async move {
                    order.lock().unwrap().push(i);
                    Ok::<_, BridgeError>(())
                })
                .await
            }));
            settle().await;
        }
        assert_eq!(q.depth(), 4);

        gate.notify_one();
        first.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(q.shared.stats.snapshot().queue_max_depth, 4);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let q = queue(2, 10, 10_000);
        let peak = Arc::new(Mutex::new((0usize, 0usize)));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let q = q.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                q.run(async move {
                    {
                        let mut p = peak.lock().unwrap();
                        p.0 += 1;
                        p.1 = p.1.max(p.0);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    peak.lock().unwrap().0 -= 1;
                    Ok::<_, BridgeError>(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.lock().unwrap().1, 2);
        assert_eq!(q.active(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_frees_slot() {
        let q = queue(1, 5, 10_000);
        let q1 = q.clone();
        let job = tokio::spawn(async move {
            q1.run(async {
                std::future::pending::<()>().await;
                Ok::<_, BridgeError>(())
            })
            .await
        });
        settle().await;
        assert_eq!(q.active(), 1);
        job.abort();
        let _ = job.await;
        assert_eq!(q.active(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_gives_up_its_place() {
        let q = queue(1, 1, 10_000);
        let gate = Arc::new(Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.run(async move {
                g1.notified().await;
                Ok::<_, BridgeError>(())
            })
            .await
        });
        settle().await;

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.run(async { Ok::<_, BridgeError>(()) }).await });
        settle().await;
        assert_eq!(q.depth(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(q.depth(), 0);

        let q3 = q.clone();
        let next = tokio::spawn(async move { q3.run(async { Ok::<_, BridgeError>(9) }).await });
        settle().await;
        assert_eq!(q.depth(), 1);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(next.await.unwrap().unwrap(), 9);
        assert_eq!(q.active(), 0);
        assert_eq!(q.shared.stats.snapshot().queue_dropped, 0);
    }

    #[tokio::test]
    async fn test_unclaimed_grant_is_passed_on() {
        let q = queue(1, 5, 10_000);
        let (grant, rx) = oneshot::channel();
        {
            let mut state = q.shared.lock();
            state.active = 1;
            state.waiting.push_back(Waiter { ticket: 0, grant });
        }
        let ticket = QueuedTicket {
            shared: q.shared.clone(),
            ticket: 0,
            grant: rx,
            queued: true,
        };

        // The slot moves to the ticket, which is dropped before claiming it.
        q.shared.release();
        assert_eq!(q.active(), 1);
        assert_eq!(q.depth(), 0);
        drop(ticket);
        assert_eq!(q.active(), 0);
    }
}
