//! # marketfeed
//!
//! Incremental market-data acquisition and caching library.
//!
//! marketfeed maintains two classes of externally-sourced time series per
//! subject (ticker): a **continuous** series (daily price history, always
//! refreshed) and a **periodic** series (fundamentals snapshots on a slow
//! external cadence, cached for extended periods). Thousands of
//! rate-limited fetches are orchestrated through a bounded worker pool
//! with per-worker pacing and adaptive backoff, and every run is
//! crash-safe and resumable via a durable checkpoint ledger.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - no CLI or transport, purely a Rust crate for embedding
//! - **Explicit collaborators** - the upstream source is a [`SeriesProvider`]
//!   trait object; cache and checkpoint are injected instances, never
//!   hidden process-wide state
//! - **Sensible defaults** - a default [`Config`] works out of the box
//! - **Event-driven** - consumers subscribe to run events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use marketfeed::{
//!     Config, FetchError, FetchOrchestrator, PricePoint, SeriesKind, SeriesProvider,
//!     Snapshot, Subject, WorkItem,
//! };
//!
//! struct MyVendor;
//!
//! #[async_trait::async_trait]
//! impl SeriesProvider for MyVendor {
//!     fn name(&self) -> &str {
//!         "my-vendor"
//!     }
//!
//!     async fn fetch_continuous(
//!         &self,
//!         _subject: &Subject,
//!         _window: usize,
//!     ) -> Result<Vec<PricePoint>, FetchError> {
//!         // Call your upstream API here
//!         Ok(Vec::new())
//!     }
//!
//!     async fn fetch_periodic(&self, subject: &Subject) -> Result<Snapshot, FetchError> {
//!         Err(FetchError::SubjectUnknown {
//!             subject: subject.to_string(),
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         worker_count: 3,
//!         resume: true,
//!         ..Default::default()
//!     };
//!     let orchestrator = FetchOrchestrator::new(config, Arc::new(MyVendor)).await?;
//!
//!     let items = vec![
//!         WorkItem::new("SPY", SeriesKind::Continuous),
//!         WorkItem::new("AAPL", SeriesKind::Continuous),
//!         WorkItem::new("AAPL", SeriesKind::Periodic),
//!     ];
//!     let summary = orchestrator.run(items).await?;
//!     println!(
//!         "{} succeeded, {} skipped, {} failed",
//!         summary.succeeded, summary.skipped, summary.failed
//!     );
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Durable series cache
pub mod cache;
/// Recurring event calendar
pub mod calendar;
/// Progress checkpoint ledger
pub mod checkpoint;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Series merge engine
pub mod merge;
/// Fetch orchestration
pub mod orchestrator;
/// Fetch collaborator seam
pub mod provider;
/// Retry logic with exponential backoff
pub mod retry;
/// Bounded worker pool with pacing and adaptive backoff
pub mod scheduler;
/// Staleness policy
pub mod staleness;
/// Core types
pub mod types;

// Re-export commonly used types
pub use cache::{AuditEntry, CacheStats, CacheStore, KindStats};
pub use calendar::{CalendarWindow, EventCalendar};
pub use checkpoint::Checkpoint;
pub use config::{Config, RetryConfig};
pub use error::{CacheError, CheckpointError, Error, FetchError, Result};
pub use merge::merge_points;
pub use orchestrator::FetchOrchestrator;
pub use provider::SeriesProvider;
pub use retry::{IsRetryable, fetch_with_retry};
pub use scheduler::{RunStats, Scheduler, SchedulerConfig, TaskOutcome};
pub use staleness::StalenessPolicy;
pub use types::{
    Event, FetchAction, PricePoint, RunSummary, SeriesData, SeriesKind, SeriesRecord, Snapshot,
    Subject, SubjectStatus, WorkItem,
};

/// Helper to run the orchestrator with graceful signal handling.
///
/// Starts the run and waits for a termination signal concurrently. When a
/// signal arrives the run is cancelled: dispatch stops, in-flight tasks get
/// the configured grace period, and the checkpoint is left consistent for a
/// later `resume = true` run.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(
    orchestrator: &FetchOrchestrator,
    items: Vec<WorkItem>,
) -> Result<RunSummary> {
    let run = orchestrator.run(items);
    tokio::pin!(run);

    tokio::select! {
        summary = &mut run => return summary,
        _ = wait_for_signal() => {
            tracing::info!("termination signal received, cancelling run");
            orchestrator.cancel();
        }
    }

    run.await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
