//! Durable series cache
//!
//! JSON-file key-value store partitioned by series kind:
//! `{root}/{kind}/{SUBJECT}.json`. Writes are atomic (write to .tmp, rename
//! into place). A corrupt or unreadable record is logged and treated as a
//! cache miss, forcing a full refetch that overwrites it on next success.
//!
//! Each kind directory carries an `index.json` metadata sidecar mapping
//! subject to last refresh time and point count, so full-scan staleness
//! audits never deserialize record bodies.

use crate::error::CacheError;
use crate::staleness::StalenessPolicy;
use crate::types::{SeriesData, SeriesKind, SeriesRecord, Subject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const INDEX_FILE: &str = "index.json";

/// Metadata index entry for one cached record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    /// When the record was last refreshed from upstream
    pub last_refresh_at: DateTime<Utc>,
    /// Number of points in the record (1 for periodic records)
    pub points: usize,
}

type KindIndex = BTreeMap<String, IndexEntry>;

/// Record count and approximate size for one series kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Number of cached records
    pub records: usize,
    /// Total size of record files in bytes
    pub bytes: u64,
}

/// Cache-wide statistics for operational reporting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Continuous record stats
    pub continuous: KindStats,
    /// Periodic record stats
    pub periodic: KindStats,
}

/// One row of a staleness audit
#[derive(Clone, Debug)]
pub struct AuditEntry {
    /// Audited subject
    pub subject: Subject,
    /// Series kind of the audited record
    pub kind: SeriesKind,
    /// Last refresh time from the metadata index
    pub last_refresh_at: DateTime<Utc>,
    /// Whether the staleness policy would refresh the record now
    pub stale: bool,
}

/// Durable key-value store for series records
///
/// The store is an explicit instance scoped to a cache directory - never a
/// process-wide singleton. The orchestrator guarantees at most one in-flight
/// write per `(subject, kind)`; the store only serializes updates to the
/// shared per-kind index.
pub struct CacheStore {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl CacheStore {
    /// Create a store rooted at `root`; directories are created lazily on write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_lock: Mutex::new(()),
        }
    }

    /// Root directory of the cache
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: SeriesKind) -> PathBuf {
        self.root.join(kind.code())
    }

    fn record_path(&self, subject: &Subject, kind: SeriesKind) -> PathBuf {
        self.kind_dir(kind).join(format!("{}.json", subject.as_str()))
    }

    fn index_path(&self, kind: SeriesKind) -> PathBuf {
        self.kind_dir(kind).join(INDEX_FILE)
    }

    /// Load a cached record
    ///
    /// Returns `None` on absence, on a corrupt record, or on an invariant
    /// violation. Corruption is logged and never raised to the caller.
    pub async fn get(&self, subject: &Subject, kind: SeriesKind) -> Option<SeriesRecord> {
        let path = self.record_path(subject, kind);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    subject = %subject,
                    kind = %kind,
                    error = %e,
                    "failed to read cached record, treating as cache miss"
                );
                return None;
            }
        };

        let record: SeriesRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    subject = %subject,
                    kind = %kind,
                    error = %e,
                    "corrupt cached record, treating as cache miss"
                );
                return None;
            }
        };

        if record.kind() != kind || record.subject != *subject || !record.is_well_formed() {
            tracing::warn!(
                subject = %subject,
                kind = %kind,
                "cached record violates invariants, treating as cache miss"
            );
            return None;
        }

        Some(record)
    }

    /// Persist a record atomically and update the metadata index
    pub async fn put(&self, record: &SeriesRecord) -> Result<(), CacheError> {
        let kind = record.kind();
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::CreateDirFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;

        let json =
            serde_json::to_vec_pretty(record).map_err(|e| CacheError::Serialization {
                subject: record.subject.to_string(),
                reason: e.to_string(),
            })?;

        let path = self.record_path(&record.subject, kind);
        write_atomic(&path, &json).await?;

        let points = match &record.data {
            SeriesData::Continuous(points) => points.len(),
            SeriesData::Periodic(_) => 1,
        };
        self.update_index(kind, &record.subject, record.fetched_at, points)
            .await
    }

    async fn update_index(
        &self,
        kind: SeriesKind,
        subject: &Subject,
        last_refresh_at: DateTime<Utc>,
        points: usize,
    ) -> Result<(), CacheError> {
        let _guard = self.index_lock.lock().await;
        let path = self.index_path(kind);
        let mut index = self.load_index(kind).await;
        index.insert(
            subject.to_string(),
            IndexEntry {
                last_refresh_at,
                points,
            },
        );
        let json = serde_json::to_vec_pretty(&index).map_err(|e| CacheError::Serialization {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json).await
    }

    async fn load_index(&self, kind: SeriesKind) -> KindIndex {
        let path = self.index_path(kind);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "corrupt cache index, rebuilding");
                    KindIndex::new()
                }
            },
            Err(_) => KindIndex::new(),
        }
    }

    /// Record count and approximate byte size per kind
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            continuous: self.kind_stats(SeriesKind::Continuous).await,
            periodic: self.kind_stats(SeriesKind::Periodic).await,
        }
    }

    async fn kind_stats(&self, kind: SeriesKind) -> KindStats {
        let mut stats = KindStats::default();
        let Ok(mut entries) = fs::read_dir(self.kind_dir(kind)).await else {
            return stats;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") || name == INDEX_FILE {
                continue;
            }
            stats.records += 1;
            if let Ok(meta) = entry.metadata().await {
                stats.bytes += meta.len();
            }
        }
        stats
    }

    /// Full-scan staleness audit driven by the metadata index alone
    pub async fn audit(&self, policy: &StalenessPolicy, now: DateTime<Utc>) -> Vec<AuditEntry> {
        let mut entries = Vec::new();
        for kind in [SeriesKind::Continuous, SeriesKind::Periodic] {
            for (subject, meta) in self.load_index(kind).await {
                entries.push(AuditEntry {
                    subject: Subject::new(subject),
                    kind,
                    last_refresh_at: meta.last_refresh_at,
                    stale: policy.needs_refresh(kind, Some(meta.last_refresh_at), now),
                });
            }
        }
        entries
    }
}

/// Write bytes to `path` via a temp file and an atomic rename
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| CacheError::WriteFailed {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
    if let Err(e) = fs::rename(&tmp, path).await {
        // Clean up the temp file on rename failure
        let _ = fs::remove_file(&tmp).await;
        return Err(CacheError::RenameFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }
    Ok(())
}
