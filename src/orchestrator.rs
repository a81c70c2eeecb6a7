//! Fetch orchestrator
//!
//! Composes the staleness policy, cache store, merge engine, checkpoint
//! ledger, and scheduler into one resumable run. Per `(subject, kind)`:
//! decide action → invoke the provider → merge or replace → persist →
//! checkpoint. Per-subject failures are isolated and reported in the run
//! summary; only checkpoint write failures abort the whole run.

use crate::cache::CacheStore;
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{Error, FetchError, Result};
use crate::merge;
use crate::provider::SeriesProvider;
use crate::retry::fetch_with_retry;
use crate::scheduler::{Scheduler, SchedulerConfig, TaskOutcome};
use crate::staleness::StalenessPolicy;
use crate::types::{
    Event, FetchAction, RunSummary, SeriesKind, SeriesRecord, Subject, SubjectStatus, WorkItem,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrates resumable fetch runs over a subject universe
///
/// The cache store and checkpoint ledger are explicit instances scoped to
/// this orchestrator's configuration - never hidden process-wide state.
pub struct FetchOrchestrator {
    config: Arc<Config>,
    cache: Arc<CacheStore>,
    checkpoint: Arc<Checkpoint>,
    policy: Arc<StalenessPolicy>,
    provider: Arc<dyn SeriesProvider>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl FetchOrchestrator {
    /// Create an orchestrator: validates the configuration, opens the cache
    /// directory and the checkpoint database
    pub async fn new(config: Config, provider: Arc<dyn SeriesProvider>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(&config.cache_dir));
        let checkpoint = Arc::new(Checkpoint::open(&config.checkpoint_path).await?);
        let policy = Arc::new(StalenessPolicy::from_config(&config));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            provider = provider.name(),
            cache_dir = %config.cache_dir.display(),
            "orchestrator initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            cache,
            checkpoint,
            policy,
            provider,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to run progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The cache store backing this orchestrator, for operational reporting
    pub fn cache(&self) -> Arc<CacheStore> {
        Arc::clone(&self.cache)
    }

    /// The checkpoint ledger backing this orchestrator
    pub fn checkpoint(&self) -> Arc<Checkpoint> {
        Arc::clone(&self.checkpoint)
    }

    /// Signal run-level cancellation
    ///
    /// Stops new work item dispatch; in-flight tasks get the configured
    /// grace period to finish before being abandoned. The checkpoint
    /// reflects every resolved item when `run` returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute one run over the given work items
    ///
    /// With `resume = true` and an open checkpoint run, subjects already
    /// marked DONE are skipped, PENDING subjects are re-enqueued, and FAILED
    /// subjects are re-enqueued once more unless configured off.
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<RunSummary> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let started = std::time::Instant::now();
        let total = items.len();
        let (run_id, to_enqueue, resumed_complete) = self.prepare_run(items).await?;

        tracing::info!(
            %run_id,
            enqueued = to_enqueue.len(),
            resumed_complete,
            workers = self.config.worker_count,
            "run started"
        );
        let _ = self.event_tx.send(Event::RunStarted {
            run_id: run_id.clone(),
            enqueued: to_enqueue.len(),
        });

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            config: Arc::clone(&self.config),
            cache: Arc::clone(&self.cache),
            checkpoint: Arc::clone(&self.checkpoint),
            policy: Arc::clone(&self.policy),
            provider: Arc::clone(&self.provider),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
            counters: Counters::default(),
            errors: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        });

        let scheduler = Scheduler::new(
            SchedulerConfig::from(self.config.as_ref()),
            self.cancel.clone(),
        );
        let handler_ctx = Arc::clone(&ctx);
        let stats = scheduler
            .run(to_enqueue, move |item| {
                let ctx = Arc::clone(&handler_ctx);
                async move { process_item(ctx, item).await }
            })
            .await;

        // A failed checkpoint write is fatal: an unpersisted status risks
        // silently skipping a subject on resume.
        if let Some(fatal) = ctx.fatal.lock().await.take() {
            return Err(fatal);
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            tracing::warn!(%run_id, "run cancelled before draining the queue");
            let _ = self.event_tx.send(Event::Cancelled {
                run_id: run_id.clone(),
            });
        } else {
            self.checkpoint.complete_run(&run_id).await?;
        }

        let elapsed = started.elapsed();
        let effective_rate = if elapsed.as_secs_f64() > 0.0 {
            stats.issued as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let summary = RunSummary {
            run_id: run_id.clone(),
            total,
            resumed_complete,
            succeeded: ctx.counters.succeeded.load(Ordering::SeqCst),
            skipped: ctx.counters.skipped.load(Ordering::SeqCst),
            failed: ctx.counters.failed.load(Ordering::SeqCst),
            stale_served: ctx.counters.stale_served.load(Ordering::SeqCst),
            errors: ctx.errors.lock().await.clone(),
            elapsed,
            effective_rate,
        };

        tracing::info!(
            %run_id,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            stale_served = summary.stale_served,
            elapsed_secs = elapsed.as_secs_f64(),
            effective_rate,
            "run complete"
        );
        let _ = self.event_tx.send(Event::RunCompleted {
            run_id,
            summary: summary.clone(),
        });

        Ok(summary)
    }

    /// Resolve the run to execute: resume the latest open run when
    /// configured, otherwise begin a fresh one
    async fn prepare_run(&self, items: Vec<WorkItem>) -> Result<(String, Vec<WorkItem>, usize)> {
        if self.config.resume {
            if let Some(run_id) = self.checkpoint.latest_open_run().await? {
                let statuses = self.checkpoint.statuses(&run_id).await?;
                // Seed ledger rows for items added since the interrupted run
                self.checkpoint.ensure_pending(&run_id, &items).await?;

                let mut to_enqueue = Vec::new();
                let mut resumed_complete = 0;
                for item in items {
                    match statuses.get(&(item.subject.clone(), item.kind)) {
                        Some(SubjectStatus::Done) => resumed_complete += 1,
                        Some(SubjectStatus::Failed) => {
                            if self.config.retry_failed_on_resume {
                                to_enqueue.push(WorkItem {
                                    attempt_count: item.attempt_count + 1,
                                    ..item
                                });
                            }
                        }
                        _ => to_enqueue.push(item),
                    }
                }

                tracing::info!(
                    %run_id,
                    resumed_complete,
                    enqueued = to_enqueue.len(),
                    "resuming open run"
                );
                return Ok((run_id, to_enqueue, resumed_complete));
            }
        }

        let run_id = format!(
            "run-{}-{:04x}",
            Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u16>()
        );
        self.checkpoint.begin_run(&run_id, &items).await?;
        Ok((run_id, items, 0))
    }
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    stale_served: AtomicUsize,
}

/// Shared state for the tasks of one run
struct RunContext {
    run_id: String,
    config: Arc<Config>,
    cache: Arc<CacheStore>,
    checkpoint: Arc<Checkpoint>,
    policy: Arc<StalenessPolicy>,
    provider: Arc<dyn SeriesProvider>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
    counters: Counters,
    errors: Mutex<Vec<(Subject, String)>>,
    fatal: Mutex<Option<Error>>,
}

/// Resolve one work item: decide → fetch → merge/replace → persist → checkpoint
async fn process_item(ctx: Arc<RunContext>, item: WorkItem) -> TaskOutcome {
    let now = Utc::now();
    let existing = ctx.cache.get(&item.subject, item.kind).await;
    let action = decide_action(&ctx.config, &ctx.policy, item.kind, existing.as_ref(), now);

    if action == FetchAction::Skip {
        tracing::debug!(subject = %item.subject, kind = %item.kind, "cached record fresh, skipping fetch");
        if !mark_or_abort(&ctx, &item, SubjectStatus::Done).await {
            return TaskOutcome::Failed;
        }
        ctx.counters.skipped.fetch_add(1, Ordering::SeqCst);
        let _ = ctx.event_tx.send(Event::SubjectCompleted {
            subject: item.subject.clone(),
            kind: item.kind,
            action,
        });
        return TaskOutcome::Skipped;
    }

    match fetch_and_persist(&ctx, &item, action, existing.as_ref(), now).await {
        Ok(()) => {
            if !mark_or_abort(&ctx, &item, SubjectStatus::Done).await {
                return TaskOutcome::Failed;
            }
            ctx.counters.succeeded.fetch_add(1, Ordering::SeqCst);
            let _ = ctx.event_tx.send(Event::SubjectCompleted {
                subject: item.subject.clone(),
                kind: item.kind,
                action,
            });
            TaskOutcome::Succeeded
        }
        Err(e) => {
            if !mark_or_abort(&ctx, &item, SubjectStatus::Failed).await {
                return TaskOutcome::Failed;
            }
            // The cache is left untouched on failure; a previously cached
            // record is served as a degraded result.
            let stale_served = existing.is_some();
            if stale_served {
                ctx.counters.stale_served.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    subject = %item.subject,
                    kind = %item.kind,
                    error = %e,
                    "fetch failed, serving cached record as degraded result"
                );
            } else {
                ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(subject = %item.subject, kind = %item.kind, error = %e, "fetch failed");
            }
            ctx.errors
                .lock()
                .await
                .push((item.subject.clone(), e.to_string()));
            let _ = ctx.event_tx.send(Event::SubjectFailed {
                subject: item.subject.clone(),
                kind: item.kind,
                stale_served,
                error: e.to_string(),
            });
            TaskOutcome::Failed
        }
    }
}

/// Pick the action for one item from the staleness policy and the cache
fn decide_action(
    config: &Config,
    policy: &StalenessPolicy,
    kind: SeriesKind,
    existing: Option<&SeriesRecord>,
    now: DateTime<Utc>,
) -> FetchAction {
    match kind {
        SeriesKind::Periodic => {
            let last = existing.map(|record| record.fetched_at);
            if existing.is_some() && !policy.needs_refresh(kind, last, now) {
                FetchAction::Skip
            } else {
                FetchAction::FullFetch
            }
        }
        SeriesKind::Continuous => {
            let has_points = existing
                .and_then(|record| record.points())
                .is_some_and(|points| !points.is_empty());
            if config.incremental_continuous && has_points {
                FetchAction::Incremental
            } else {
                FetchAction::FullFetch
            }
        }
    }
}

/// Fetch with retries, merge or replace, and persist the refreshed record
async fn fetch_and_persist(
    ctx: &RunContext,
    item: &WorkItem,
    action: FetchAction,
    existing: Option<&SeriesRecord>,
    now: DateTime<Utc>,
) -> Result<()> {
    let record = match item.kind {
        SeriesKind::Periodic => {
            let snapshot = fetch_with_retry(&ctx.config.retry, || {
                ctx.provider.fetch_periodic(&item.subject)
            })
            .await?;
            SeriesRecord::periodic(item.subject.clone(), snapshot, now)
        }
        SeriesKind::Continuous => {
            let window = if action == FetchAction::Incremental {
                ctx.config.short_window_size
            } else {
                ctx.config.window_size
            };
            let fetched = fetch_with_retry(&ctx.config.retry, || {
                ctx.provider.fetch_continuous(&item.subject, window)
            })
            .await?;

            let existing_points = if action == FetchAction::Incremental {
                existing
                    .and_then(|record| record.points())
                    .unwrap_or_default()
            } else {
                &[]
            };
            if fetched.is_empty() && existing_points.is_empty() {
                return Err(FetchError::EmptySeries {
                    subject: item.subject.to_string(),
                }
                .into());
            }

            let merged = merge::merge_points(existing_points, &fetched, ctx.config.window_size);
            SeriesRecord::continuous(item.subject.clone(), merged, ctx.config.window_size, now)
        }
    };

    ctx.cache.put(&record).await?;
    Ok(())
}

/// Record the resolution in the checkpoint ledger
///
/// On a write failure the fatal error is stored, the run is cancelled, and
/// `false` is returned so the caller stops treating the item as resolved.
async fn mark_or_abort(ctx: &RunContext, item: &WorkItem, status: SubjectStatus) -> bool {
    match ctx
        .checkpoint
        .mark(&ctx.run_id, &item.subject, item.kind, status)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                subject = %item.subject,
                error = %e,
                "checkpoint write failed, aborting run"
            );
            let mut fatal = ctx.fatal.lock().await;
            if fatal.is_none() {
                *fatal = Some(e);
            }
            ctx.cancel.cancel();
            false
        }
    }
}
