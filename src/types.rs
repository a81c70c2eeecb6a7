//! Core types for marketfeed

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Stable identifier for a unit of work (a ticker symbol)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    /// Create a new Subject
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get the inner symbol
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(symbol: &str) -> Self {
        Self(symbol.to_string())
    }
}

impl From<String> for Subject {
    fn from(symbol: String) -> Self {
        Self(symbol)
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which class of series a record holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// Daily price history - changes every run, never trusted from cache
    Continuous,
    /// Fundamentals snapshot - slow external cadence, eligible for extended caching
    Periodic,
}

impl SeriesKind {
    /// Stable string code used in cache paths and the checkpoint ledger
    pub fn code(&self) -> &'static str {
        match self {
            SeriesKind::Continuous => "continuous",
            SeriesKind::Periodic => "periodic",
        }
    }

    /// Parse a stable string code back into a SeriesKind
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "continuous" => Some(SeriesKind::Continuous),
            "periodic" => Some(SeriesKind::Periodic),
            _ => None,
        }
    }
}

impl std::fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Daily OHLCV bar - the value bundle of a continuous series
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Trading date
    pub date: NaiveDate,
    /// Opening price
    pub open: f64,
    /// Intraday high
    pub high: f64,
    /// Intraday low
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Share volume
    pub volume: u64,
    /// Split/dividend adjusted close
    pub adj_close: f64,
}

/// Point-in-time fundamentals bundle - the value bundle of a periodic series
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// As-of date reported by the upstream
    pub as_of: NaiveDate,
    /// Fundamental figures keyed by metric name (revenue, eps, net_margin, ...)
    pub figures: BTreeMap<String, f64>,
}

/// Payload of a series record
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum SeriesData {
    /// Ordered daily bars, bounded by the record's window size
    Continuous(Vec<PricePoint>),
    /// A single snapshot
    Periodic(Snapshot),
}

impl SeriesData {
    /// The series kind this payload belongs to
    pub fn kind(&self) -> SeriesKind {
        match self {
            SeriesData::Continuous(_) => SeriesKind::Continuous,
            SeriesData::Periodic(_) => SeriesKind::Periodic,
        }
    }
}

/// One cached series for a subject
///
/// Created on first successful fetch, mutated in place on every
/// subsequent refresh (merge or replace), never deleted by this
/// subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesRecord {
    /// Subject this record belongs to
    pub subject: Subject,
    /// Series payload (bars or snapshot)
    pub data: SeriesData,
    /// When the record was last refreshed from upstream
    pub fetched_at: DateTime<Utc>,
    /// Maximum number of points retained (1 for periodic records)
    pub window_size: usize,
}

impl SeriesRecord {
    /// Build a continuous record from ordered bars
    pub fn continuous(
        subject: Subject,
        points: Vec<PricePoint>,
        window_size: usize,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject,
            data: SeriesData::Continuous(points),
            fetched_at,
            window_size,
        }
    }

    /// Build a periodic record from a single snapshot
    pub fn periodic(subject: Subject, snapshot: Snapshot, fetched_at: DateTime<Utc>) -> Self {
        Self {
            subject,
            data: SeriesData::Periodic(snapshot),
            fetched_at,
            window_size: 1,
        }
    }

    /// The kind of series this record holds
    pub fn kind(&self) -> SeriesKind {
        self.data.kind()
    }

    /// Continuous points, if this is a continuous record
    pub fn points(&self) -> Option<&[PricePoint]> {
        match &self.data {
            SeriesData::Continuous(points) => Some(points),
            SeriesData::Periodic(_) => None,
        }
    }

    /// Check the record invariants: strictly increasing unique dates,
    /// bounded length for continuous records
    pub fn is_well_formed(&self) -> bool {
        match &self.data {
            SeriesData::Continuous(points) => {
                if points.is_empty() || points.len() > self.window_size {
                    return false;
                }
                points.windows(2).all(|pair| pair[0].date < pair[1].date)
            }
            SeriesData::Periodic(_) => self.window_size == 1,
        }
    }
}

/// Action chosen for one work item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchAction {
    /// Fetch the full window (or snapshot) and replace the cached record
    FullFetch,
    /// Fetch a short recent window and merge it into the cached record
    Incremental,
    /// Cached record is fresh - no fetch needed
    Skip,
}

impl std::fmt::Display for FetchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchAction::FullFetch => write!(f, "full_fetch"),
            FetchAction::Incremental => write!(f, "incremental"),
            FetchAction::Skip => write!(f, "skip"),
        }
    }
}

/// One scheduled fetch task for a subject/kind
///
/// The action is decided in-task from the staleness policy and the cache,
/// immediately before the fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Subject to refresh
    pub subject: Subject,
    /// Which series of the subject to refresh
    pub kind: SeriesKind,
    /// Fetch attempts already spent on this item
    pub attempt_count: u32,
}

impl WorkItem {
    /// Create a fresh work item with no attempts spent
    pub fn new(subject: impl Into<Subject>, kind: SeriesKind) -> Self {
        Self {
            subject: subject.into(),
            kind,
            attempt_count: 0,
        }
    }
}

/// Per-subject status in the checkpoint ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    /// Queued and not yet resolved
    Pending,
    /// Resolved successfully (fetched or skipped as fresh)
    Done,
    /// Failed after exhausting retries
    Failed,
}

impl SubjectStatus {
    /// Convert integer status code to SubjectStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => SubjectStatus::Pending,
            1 => SubjectStatus::Done,
            2 => SubjectStatus::Failed,
            _ => SubjectStatus::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert SubjectStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            SubjectStatus::Pending => 0,
            SubjectStatus::Done => 1,
            SubjectStatus::Failed => 2,
        }
    }
}

/// Events emitted over the orchestrator's broadcast channel
#[derive(Clone, Debug)]
pub enum Event {
    /// A run has started dispatching work items
    RunStarted {
        /// Identifier of the run
        run_id: String,
        /// Number of items enqueued (after resume filtering)
        enqueued: usize,
    },
    /// A subject resolved successfully
    SubjectCompleted {
        /// The resolved subject
        subject: Subject,
        /// Which series was refreshed
        kind: SeriesKind,
        /// The action that was taken
        action: FetchAction,
    },
    /// A subject failed after exhausting retries
    SubjectFailed {
        /// The failed subject
        subject: Subject,
        /// Which series failed
        kind: SeriesKind,
        /// Whether a previously cached record was served as a degraded result
        stale_served: bool,
        /// Final error message
        error: String,
    },
    /// The run finished (all items resolved or the run was cancelled)
    RunCompleted {
        /// Identifier of the run
        run_id: String,
        /// Final counters for the run
        summary: RunSummary,
    },
    /// The run was cancelled before draining the queue
    Cancelled {
        /// Identifier of the cancelled run
        run_id: String,
    },
}

/// Final report for one orchestrator run
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Identifier of the run
    pub run_id: String,
    /// Items passed to the run, including those already complete on resume
    pub total: usize,
    /// Subjects marked DONE in a previous run and skipped on resume
    pub resumed_complete: usize,
    /// Subjects fetched and persisted successfully
    pub succeeded: usize,
    /// Subjects skipped because their cached record was fresh
    pub skipped: usize,
    /// Subjects that failed with no cached record to fall back on
    pub failed: usize,
    /// Subjects that failed but had a cached record served as a degraded result
    pub stale_served: usize,
    /// Per-subject final errors
    pub errors: Vec<(Subject, String)>,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
    /// Resolved items per second over the run
    pub effective_rate: f64,
}

impl RunSummary {
    /// True when no subject failed (stale-served subjects count as failures)
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.stale_served == 0
    }
}
