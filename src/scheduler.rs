//! Bounded worker pool with pacing and adaptive backoff
//!
//! Work items are pulled from a shared FIFO queue by `worker_count`
//! parallel workers. Submission order is preserved into the queue;
//! completion order across workers is not guaranteed.
//!
//! Each worker paces itself (sleep `per_worker_delay` since its own last
//! completed task), giving an aggregate soft throughput of
//! `worker_count / per_worker_delay`. Each worker also keeps a rolling
//! window of its last `error_window_size` outcomes; when the windowed
//! error rate breaches `error_threshold_pct` the worker sleeps
//! `backoff_duration` before accepting its next item. Backoff is
//! cooperative and per-worker - there is no global stop-the-world.

use crate::config::Config;
use crate::types::WorkItem;
use futures::future::join_all;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Final resolution of one work item, as seen by the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Fetched and persisted successfully
    Succeeded,
    /// Cached record was fresh - no fetch performed
    Skipped,
    /// Failed after exhausting retries
    Failed,
}

impl TaskOutcome {
    fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed)
    }
}

/// Ephemeral counters for one scheduler run - never persisted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items handed to the task handler
    pub issued: usize,
    /// Items that resolved without failure (including skips)
    pub succeeded: usize,
    /// Items that resolved as failed
    pub failed: usize,
}

impl RunStats {
    /// Failed items as a percentage of issued items
    pub fn error_rate_pct(&self) -> f64 {
        if self.issued == 0 {
            0.0
        } else {
            self.failed as f64 * 100.0 / self.issued as f64
        }
    }
}

/// Scheduler pacing and backoff configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Number of parallel workers
    pub worker_count: usize,
    /// Pacing delay per worker, measured from its own last completion
    pub per_worker_delay: Duration,
    /// Number of recent outcomes in each worker's rolling window
    pub error_window_size: usize,
    /// Windowed error percentage above which a worker backs off
    pub error_threshold_pct: f64,
    /// How long a breaching worker sleeps before its next item
    pub backoff_duration: Duration,
    /// Grace period granted to in-flight tasks after cancellation
    pub cancel_grace: Duration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            per_worker_delay: config.per_worker_delay,
            error_window_size: config.error_window_size,
            error_threshold_pct: config.error_threshold_pct,
            backoff_duration: config.backoff_duration,
            cancel_grace: config.cancel_grace,
        }
    }
}

/// Rolling window of task outcomes for one worker
///
/// The rate is normalized by the window capacity, so a part-filled window
/// cannot breach the threshold on its first failure.
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, ok: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    fn error_rate_pct(&self) -> f64 {
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 * 100.0 / self.capacity as f64
    }
}

#[derive(Default)]
struct StatsInner {
    issued: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Bounded worker pool executing work items under a pacing/backoff policy
pub struct Scheduler {
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler; `cancel` stops new dispatch when triggered
    pub fn new(config: SchedulerConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Drain `items` through the worker pool
    ///
    /// The handler is invoked once per item and must resolve every item to a
    /// [`TaskOutcome`] (performing its own retries internally). Returns once
    /// the queue is drained or, after cancellation, once in-flight tasks
    /// finish or the grace period elapses.
    pub async fn run<F, Fut>(&self, items: Vec<WorkItem>, handler: F) -> RunStats
    where
        F: Fn(WorkItem) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let stats = Arc::new(StatsInner::default());

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                handler.clone(),
                self.config.clone(),
                self.cancel.clone(),
                Arc::clone(&stats),
            )));
        }

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = join_all(handles);
        tokio::pin!(drained);

        tokio::select! {
            _ = &mut drained => {}
            _ = self.cancel.cancelled() => {
                tracing::info!(
                    grace_ms = self.config.cancel_grace.as_millis(),
                    "cancellation requested, granting grace period to in-flight tasks"
                );
                if timeout(self.config.cancel_grace, &mut drained).await.is_err() {
                    tracing::warn!("grace period elapsed, abandoning in-flight tasks");
                    for handle in abort_handles {
                        handle.abort();
                    }
                }
            }
        }

        RunStats {
            issued: stats.issued.load(Ordering::SeqCst),
            succeeded: stats.succeeded.load(Ordering::SeqCst),
            failed: stats.failed.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop<F, Fut>(
    worker_id: usize,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    handler: F,
    config: SchedulerConfig,
    cancel: CancellationToken,
    stats: Arc<StatsInner>,
) where
    F: Fn(WorkItem) -> Fut,
    Fut: Future<Output = TaskOutcome>,
{
    let mut window = OutcomeWindow::new(config.error_window_size);
    let mut last_completed: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(worker_id, "cancellation observed, stopping dispatch");
            break;
        }

        // Cooperative backoff before accepting the next item
        let error_rate = window.error_rate_pct();
        if error_rate > config.error_threshold_pct {
            tracing::warn!(
                worker_id,
                error_rate_pct = error_rate,
                backoff_ms = config.backoff_duration.as_millis(),
                "rolling error rate above threshold, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(config.backoff_duration) => {}
            }
        }

        let item = {
            let mut queue = queue.lock().await;
            queue.pop_front()
        };
        let Some(item) = item else {
            break;
        };

        // Pace against this worker's own last completed task
        if let Some(done_at) = last_completed {
            let since = done_at.elapsed();
            if since < config.per_worker_delay {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Return the unstarted item so the checkpoint keeps it pending
                        queue.lock().await.push_front(item);
                        break;
                    }
                    _ = sleep(config.per_worker_delay - since) => {}
                }
            }
        }

        stats.issued.fetch_add(1, Ordering::SeqCst);
        let outcome = handler(item).await;
        last_completed = Some(Instant::now());

        window.record(!outcome.is_failure());
        if outcome.is_failure() {
            stats.failed.fetch_add(1, Ordering::SeqCst);
        } else {
            stats.succeeded.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeriesKind;

    fn test_config(worker_count: usize) -> SchedulerConfig {
        SchedulerConfig {
            worker_count,
            per_worker_delay: Duration::ZERO,
            error_window_size: 20,
            error_threshold_pct: 100.0,
            backoff_duration: Duration::ZERO,
            cancel_grace: Duration::from_secs(1),
        }
    }

    fn items(count: usize) -> Vec<WorkItem> {
        (0..count)
            .map(|i| WorkItem::new(format!("SYM{i}"), SeriesKind::Continuous))
            .collect()
    }

    #[tokio::test]
    async fn drains_queue_and_counts_outcomes() {
        let scheduler = Scheduler::new(test_config(2), CancellationToken::new());
        let stats = scheduler
            .run(items(10), |item| async move {
                if item.subject.as_str().ends_with('3') {
                    TaskOutcome::Failed
                } else {
                    TaskOutcome::Succeeded
                }
            })
            .await;

        assert_eq!(stats.issued, 10);
        assert_eq!(stats.succeeded, 9);
        assert_eq!(stats.failed, 1);
        assert!((stats.error_rate_pct() - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn single_worker_preserves_submission_order() {
        let scheduler = Scheduler::new(test_config(1), CancellationToken::new());
        let processed = Arc::new(Mutex::new(Vec::new()));
        let processed_clone = Arc::clone(&processed);

        scheduler
            .run(items(5), move |item| {
                let processed = Arc::clone(&processed_clone);
                async move {
                    processed.lock().await.push(item.subject.to_string());
                    TaskOutcome::Succeeded
                }
            })
            .await;

        let order = processed.lock().await.clone();
        assert_eq!(order, vec!["SYM0", "SYM1", "SYM2", "SYM3", "SYM4"]);
    }

    #[tokio::test]
    async fn error_rate_breach_triggers_backoff_before_next_item() {
        // Two failures in a window of two breach the 50% threshold, so the
        // worker must sleep backoff_duration before accepting item three.
        let config = SchedulerConfig {
            worker_count: 1,
            per_worker_delay: Duration::ZERO,
            error_window_size: 2,
            error_threshold_pct: 50.0,
            backoff_duration: Duration::from_millis(200),
            cancel_grace: Duration::from_secs(1),
        };
        let scheduler = Scheduler::new(config, CancellationToken::new());

        let starts = Arc::new(Mutex::new(Vec::new()));
        let starts_clone = Arc::clone(&starts);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        scheduler
            .run(items(3), move |_item| {
                let starts = Arc::clone(&starts_clone);
                let counter = Arc::clone(&counter_clone);
                async move {
                    starts.lock().await.push(Instant::now());
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        TaskOutcome::Failed
                    } else {
                        TaskOutcome::Succeeded
                    }
                }
            })
            .await;

        let starts = starts.lock().await;
        assert_eq!(starts.len(), 3);

        let gap_1_to_2 = starts[1].duration_since(starts[0]);
        let gap_2_to_3 = starts[2].duration_since(starts[1]);

        // One failure in a window of two is exactly 50% and must not breach
        assert!(
            gap_1_to_2 < Duration::from_millis(150),
            "no backoff expected after one failure, waited {gap_1_to_2:?}"
        );
        assert!(
            gap_2_to_3 >= Duration::from_millis(200),
            "backoff expected after two failures, waited {gap_2_to_3:?}"
        );
    }

    #[tokio::test]
    async fn worker_paces_between_tasks() {
        let config = SchedulerConfig {
            per_worker_delay: Duration::from_millis(100),
            ..test_config(1)
        };
        let scheduler = Scheduler::new(config, CancellationToken::new());

        let start = Instant::now();
        let stats = scheduler
            .run(items(3), |_item| async { TaskOutcome::Succeeded })
            .await;
        let elapsed = start.elapsed();

        assert_eq!(stats.issued, 3);
        // Two pacing gaps between three tasks
        assert!(
            elapsed >= Duration::from_millis(200),
            "pacing gaps missing, elapsed {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn workers_run_in_parallel() {
        let scheduler = Scheduler::new(test_config(4), CancellationToken::new());

        let start = Instant::now();
        scheduler
            .run(items(4), |_item| async {
                sleep(Duration::from_millis(200)).await;
                TaskOutcome::Succeeded
            })
            .await;
        let elapsed = start.elapsed();

        // Serial execution would take 800ms
        assert!(
            elapsed < Duration::from_millis(600),
            "items did not overlap, elapsed {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_respects_grace() {
        let config = SchedulerConfig {
            cancel_grace: Duration::from_millis(100),
            ..test_config(1)
        };
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(config, cancel.clone());

        let cancel_trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel_trigger.cancel();
        });

        let start = Instant::now();
        let stats = scheduler
            .run(items(10), |_item| async {
                sleep(Duration::from_secs(10)).await;
                TaskOutcome::Succeeded
            })
            .await;
        let elapsed = start.elapsed();

        // Only the first item was ever dispatched; the rest stayed queued
        assert_eq!(stats.issued, 1);
        assert!(
            elapsed < Duration::from_secs(2),
            "run did not stop after grace period, elapsed {elapsed:?}"
        );
    }

    #[test]
    fn part_filled_window_cannot_breach() {
        let mut window = OutcomeWindow::new(4);
        window.record(false);
        assert!((window.error_rate_pct() - 25.0).abs() < f64::EPSILON);
        window.record(false);
        window.record(false);
        window.record(false);
        assert!((window.error_rate_pct() - 100.0).abs() < f64::EPSILON);
        // Rolling: a success evicts the oldest failure
        window.record(true);
        assert!((window.error_rate_pct() - 75.0).abs() < f64::EPSILON);
    }
}
