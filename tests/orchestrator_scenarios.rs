//! End-to-end orchestrator scenarios against a scripted provider:
//! action selection, incremental merge, degraded serving, resume safety,
//! and cancellation.

use async_trait::async_trait;
use chrono::NaiveDate;
use marketfeed::{
    Checkpoint, Config, FetchError, FetchOrchestrator, PricePoint, RetryConfig, SeriesKind,
    SeriesProvider, SeriesRecord, Snapshot, Subject, SubjectStatus, WorkItem,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Day numbering used throughout: day 1 is 2023-01-01.
fn day_to_date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).expect("valid date") + chrono::Days::new(day as u64 - 1)
}

fn bar(day: u32, close: f64) -> PricePoint {
    PricePoint {
        date: day_to_date(day),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000,
        adj_close: close,
    }
}

/// Scripted provider: serves the trailing `window` days of a fixed 255-day
/// series with close = 1000 + day, fails configured subjects, optionally
/// sleeps per fetch to make cancellation timing observable.
struct MockProvider {
    continuous_calls: AtomicUsize,
    periodic_calls: AtomicUsize,
    fail: HashSet<String>,
    serve_empty: bool,
    task_delay: Duration,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            continuous_calls: AtomicUsize::new(0),
            periodic_calls: AtomicUsize::new(0),
            fail: HashSet::new(),
            serve_empty: false,
            task_delay: Duration::ZERO,
        }
    }

    fn failing(subjects: &[&str]) -> Self {
        Self {
            fail: subjects.iter().map(|s| s.to_string()).collect(),
            ..Self::new()
        }
    }

    fn total_calls(&self) -> usize {
        self.continuous_calls.load(Ordering::SeqCst) + self.periodic_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeriesProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_continuous(
        &self,
        subject: &Subject,
        window: usize,
    ) -> Result<Vec<PricePoint>, FetchError> {
        self.continuous_calls.fetch_add(1, Ordering::SeqCst);
        if !self.task_delay.is_zero() {
            tokio::time::sleep(self.task_delay).await;
        }
        if self.fail.contains(subject.as_str()) {
            return Err(FetchError::Timeout);
        }
        if self.serve_empty {
            return Ok(Vec::new());
        }
        let last_day = 255u32;
        let first_day = last_day.saturating_sub(window as u32) + 1;
        Ok((first_day..=last_day)
            .map(|day| bar(day, 1000.0 + day as f64))
            .collect())
    }

    async fn fetch_periodic(&self, subject: &Subject) -> Result<Snapshot, FetchError> {
        self.periodic_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.contains(subject.as_str()) {
            return Err(FetchError::Timeout);
        }
        Ok(Snapshot {
            as_of: day_to_date(90),
            figures: BTreeMap::from([("revenue".to_string(), 1.0e9)]),
        })
    }
}

fn test_config(dir: &Path) -> Config {
    Config {
        worker_count: 2,
        per_worker_delay: Duration::ZERO,
        retry: RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        cache_dir: dir.join("cache"),
        checkpoint_path: dir.join("checkpoint.db"),
        cancel_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

fn universe() -> Vec<WorkItem> {
    vec![
        WorkItem::new("SPY", SeriesKind::Continuous),
        WorkItem::new("AAPL", SeriesKind::Continuous),
        WorkItem::new("AAPL", SeriesKind::Periodic),
    ]
}

#[tokio::test]
async fn full_run_populates_cache_and_archives_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(MockProvider::new());
    let orchestrator = FetchOrchestrator::new(test_config(dir.path()), provider.clone())
        .await
        .expect("orchestrator");

    let summary = orchestrator.run(universe()).await.expect("run");

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert!(summary.all_succeeded());
    assert_eq!(provider.continuous_calls.load(Ordering::SeqCst), 2);
    assert_eq!(provider.periodic_calls.load(Ordering::SeqCst), 1);

    let cache = orchestrator.cache();
    let spy = cache
        .get(&Subject::new("SPY"), SeriesKind::Continuous)
        .await
        .expect("SPY cached");
    assert_eq!(spy.points().expect("points").len(), 250);

    // Drained run is archived, so nothing is open for resume
    let checkpoint = orchestrator.checkpoint();
    assert_eq!(checkpoint.latest_open_run().await.expect("query"), None);
}

#[tokio::test]
async fn fresh_periodic_record_is_skipped_on_second_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(MockProvider::new());
    let items = vec![WorkItem::new("AAPL", SeriesKind::Periodic)];

    let orchestrator = FetchOrchestrator::new(test_config(dir.path()), provider.clone())
        .await
        .expect("orchestrator");
    orchestrator.run(items.clone()).await.expect("first run");
    assert_eq!(provider.periodic_calls.load(Ordering::SeqCst), 1);

    let second = FetchOrchestrator::new(test_config(dir.path()), provider.clone())
        .await
        .expect("orchestrator");
    let summary = second.run(items).await.expect("second run");

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(
        provider.periodic_calls.load(Ordering::SeqCst),
        1,
        "fresh periodic record must not be refetched"
    );
}

#[tokio::test]
async fn continuous_is_refetched_every_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(MockProvider::new());
    let items = vec![WorkItem::new("SPY", SeriesKind::Continuous)];

    for _ in 0..2 {
        let orchestrator = FetchOrchestrator::new(test_config(dir.path()), provider.clone())
            .await
            .expect("orchestrator");
        let summary = orchestrator.run(items.clone()).await.expect("run");
        assert_eq!(summary.succeeded, 1);
    }
    assert_eq!(provider.continuous_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn incremental_fetch_merges_into_cached_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.incremental_continuous = true;
    config.short_window_size = 8;

    // Seed the cache with days 1-250, close = day
    let cache = marketfeed::CacheStore::new(&config.cache_dir);
    let seeded = SeriesRecord::continuous(
        Subject::new("SPY"),
        (1..=250).map(|day| bar(day, day as f64)).collect(),
        250,
        chrono::Utc::now(),
    );
    cache.put(&seeded).await.expect("seed cache");

    let provider = Arc::new(MockProvider::new());
    let orchestrator = FetchOrchestrator::new(config, provider.clone())
        .await
        .expect("orchestrator");
    let summary = orchestrator
        .run(vec![WorkItem::new("SPY", SeriesKind::Continuous)])
        .await
        .expect("run");

    assert_eq!(summary.succeeded, 1);

    let merged = orchestrator
        .cache()
        .get(&Subject::new("SPY"), SeriesKind::Continuous)
        .await
        .expect("merged record");
    let points = merged.points().expect("points");

    // Increment held days 248-255: the window rolls forward to days 6-255,
    // and the increment values win on the overlapping days.
    assert_eq!(points.len(), 250);
    assert_eq!(points[0].date, day_to_date(6));
    assert_eq!(points[249].date, day_to_date(255));
    let day_247 = points.iter().find(|p| p.date == day_to_date(247)).expect("day 247");
    assert_eq!(day_247.close, 247.0);
    let day_248 = points.iter().find(|p| p.date == day_to_date(248)).expect("day 248");
    assert_eq!(day_248.close, 1248.0);
}

#[tokio::test]
async fn failure_with_cached_record_serves_stale() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let cache = marketfeed::CacheStore::new(&config.cache_dir);
    let seeded = SeriesRecord::continuous(
        Subject::new("SPY"),
        (1..=250).map(|day| bar(day, day as f64)).collect(),
        250,
        chrono::Utc::now(),
    );
    cache.put(&seeded).await.expect("seed cache");

    let provider = Arc::new(MockProvider::failing(&["SPY"]));
    let orchestrator = FetchOrchestrator::new(config, provider)
        .await
        .expect("orchestrator");
    let summary = orchestrator
        .run(vec![WorkItem::new("SPY", SeriesKind::Continuous)])
        .await
        .expect("run");

    assert_eq!(summary.stale_served, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.errors.len(), 1);

    // The cache is left untouched on failure
    let record = orchestrator
        .cache()
        .get(&Subject::new("SPY"), SeriesKind::Continuous)
        .await
        .expect("cached record retained");
    assert_eq!(record.points().expect("points")[0].close, 1.0);
}

#[tokio::test]
async fn failure_without_cache_is_reported_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(MockProvider::failing(&["SPY"]));
    let orchestrator = FetchOrchestrator::new(test_config(dir.path()), provider)
        .await
        .expect("orchestrator");

    let summary = orchestrator
        .run(vec![
            WorkItem::new("SPY", SeriesKind::Continuous),
            WorkItem::new("AAPL", SeriesKind::Continuous),
        ])
        .await
        .expect("run");

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stale_served, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].0, Subject::new("SPY"));
}

#[tokio::test]
async fn empty_fetch_with_no_prior_record_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(MockProvider {
        serve_empty: true,
        ..MockProvider::new()
    });
    let orchestrator = FetchOrchestrator::new(test_config(dir.path()), provider)
        .await
        .expect("orchestrator");

    let summary = orchestrator
        .run(vec![WorkItem::new("SPY", SeriesKind::Continuous)])
        .await
        .expect("run");

    assert_eq!(summary.failed, 1);
    assert!(summary.errors[0].1.contains("empty series"));
}

#[tokio::test]
async fn corrupt_cached_record_forces_full_fetch_and_overwrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    // Incremental mode would normally merge; corruption must force FULL_FETCH
    config.incremental_continuous = true;

    let record_path = config.cache_dir.join("continuous").join("SPY.json");
    tokio::fs::create_dir_all(record_path.parent().expect("parent"))
        .await
        .expect("mkdir");
    tokio::fs::write(&record_path, b"{definitely not json")
        .await
        .expect("write corrupt record");

    let provider = Arc::new(MockProvider::new());
    let orchestrator = FetchOrchestrator::new(config, provider.clone())
        .await
        .expect("orchestrator");
    let summary = orchestrator
        .run(vec![WorkItem::new("SPY", SeriesKind::Continuous)])
        .await
        .expect("run");

    assert_eq!(summary.succeeded, 1);
    // A full 250-day window was requested, not the short incremental window
    let record = orchestrator
        .cache()
        .get(&Subject::new("SPY"), SeriesKind::Continuous)
        .await
        .expect("record overwritten");
    assert_eq!(record.points().expect("points").len(), 250);
}

#[tokio::test]
async fn resume_issues_fetches_only_for_unfinished_subjects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.resume = true;

    let items: Vec<WorkItem> = (0..5)
        .map(|i| WorkItem::new(format!("SYM{i}"), SeriesKind::Continuous))
        .collect();

    // Simulate an interrupted run with 2 of 5 subjects already DONE
    {
        let checkpoint = Checkpoint::open(&config.checkpoint_path)
            .await
            .expect("checkpoint");
        checkpoint.begin_run("run-interrupted", &items).await.expect("begin");
        for symbol in ["SYM0", "SYM1"] {
            checkpoint
                .mark(
                    "run-interrupted",
                    &Subject::new(symbol),
                    SeriesKind::Continuous,
                    SubjectStatus::Done,
                )
                .await
                .expect("mark done");
        }
    }

    let provider = Arc::new(MockProvider::new());
    let orchestrator = FetchOrchestrator::new(config, provider.clone())
        .await
        .expect("orchestrator");
    let summary = orchestrator.run(items).await.expect("run");

    assert_eq!(
        provider.continuous_calls.load(Ordering::SeqCst),
        3,
        "exactly the three unfinished subjects must be fetched"
    );
    assert_eq!(summary.resumed_complete, 2);
    assert_eq!(summary.succeeded, 3);

    // The resumed run drained, so it is archived
    let checkpoint = orchestrator.checkpoint();
    assert_eq!(checkpoint.latest_open_run().await.expect("query"), None);
}

async fn seed_interrupted_ledger(path: &Path, items: &[WorkItem]) {
    let checkpoint = Checkpoint::open(path).await.expect("checkpoint");
    checkpoint
        .begin_run("run-interrupted", items)
        .await
        .expect("begin");
    checkpoint
        .mark(
            "run-interrupted",
            &Subject::new("DONE"),
            SeriesKind::Continuous,
            SubjectStatus::Done,
        )
        .await
        .expect("mark done");
    checkpoint
        .mark(
            "run-interrupted",
            &Subject::new("FAILED"),
            SeriesKind::Continuous,
            SubjectStatus::Failed,
        )
        .await
        .expect("mark failed");
}

#[tokio::test]
async fn failed_subjects_retried_on_resume_unless_excluded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let items = vec![
        WorkItem::new("DONE", SeriesKind::Continuous),
        WorkItem::new("FAILED", SeriesKind::Continuous),
    ];

    // Default: FAILED subjects get one more chance
    {
        let mut config = test_config(&dir.path().join("retry"));
        config.resume = true;
        seed_interrupted_ledger(&config.checkpoint_path, &items).await;

        let provider = Arc::new(MockProvider::new());
        let orchestrator = FetchOrchestrator::new(config, provider.clone())
            .await
            .expect("orchestrator");
        let summary = orchestrator.run(items.clone()).await.expect("run");

        assert_eq!(provider.continuous_calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.succeeded, 1);
    }

    // Explicitly excluded: FAILED subjects stay failed, nothing is fetched
    {
        let mut config = test_config(&dir.path().join("no-retry"));
        config.resume = true;
        config.retry_failed_on_resume = false;
        seed_interrupted_ledger(&config.checkpoint_path, &items).await;

        let provider = Arc::new(MockProvider::new());
        let orchestrator = FetchOrchestrator::new(config, provider.clone())
            .await
            .expect("orchestrator");
        orchestrator.run(items.clone()).await.expect("run");

        assert_eq!(provider.total_calls(), 0);
    }
}

#[tokio::test]
async fn cancellation_preserves_checkpoint_for_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.worker_count = 1;

    let items: Vec<WorkItem> = (0..5)
        .map(|i| WorkItem::new(format!("SYM{i}"), SeriesKind::Continuous))
        .collect();

    let provider = Arc::new(MockProvider {
        task_delay: Duration::from_millis(300),
        ..MockProvider::new()
    });
    let orchestrator = Arc::new(
        FetchOrchestrator::new(config.clone(), provider.clone())
            .await
            .expect("orchestrator"),
    );

    // Cancel mid-run, while the second item is in flight
    let canceller = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        canceller.cancel();
    });

    let summary = orchestrator.run(items.clone()).await.expect("run");
    let first_run_calls = provider.continuous_calls.load(Ordering::SeqCst);

    assert!(
        first_run_calls < 5,
        "cancellation must stop dispatch, but {first_run_calls} items were issued"
    );
    assert_eq!(summary.succeeded, first_run_calls, "in-flight work finishes in grace period");

    // The interrupted run stays open and a resumed run finishes the rest
    let mut resume_config = config;
    resume_config.resume = true;
    let resumed = FetchOrchestrator::new(resume_config, provider.clone())
        .await
        .expect("orchestrator");
    let resumed_summary = resumed.run(items).await.expect("resumed run");

    assert_eq!(resumed_summary.resumed_complete, first_run_calls);
    assert_eq!(
        provider.continuous_calls.load(Ordering::SeqCst),
        5,
        "every subject is fetched exactly once across both runs"
    );
    assert_eq!(resumed_summary.succeeded, 5 - first_run_calls);
}
