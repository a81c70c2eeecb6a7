//! Progress checkpoint ledger
//!
//! SQLite-backed per-subject completion ledger enabling resumable runs.
//! A run row is created at run start, one subject row per work item is
//! updated exactly once per resolution, and the run is archived (stamped
//! with a completion time) when it drains.
//!
//! Durability rules: every update is committed before the orchestrator
//! relies on it, and any write failure is fatal for the run - an
//! unpersisted checkpoint risks silently skipping a subject on resume.

use crate::error::{CheckpointError, Result};
use crate::types::{SeriesKind, Subject, SubjectStatus, WorkItem};
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::Path;

/// Durable checkpoint ledger
///
/// All writes go through the connection pool, which serializes them;
/// interleaved updates from different workers can never corrupt the ledger.
pub struct Checkpoint {
    pool: SqlitePool,
}

/// Subject row loaded from the ledger
#[derive(Debug, Clone, FromRow)]
struct SubjectRow {
    subject: String,
    kind: String,
    status: i64,
}

impl Checkpoint {
    /// Open (or create) the checkpoint database and run migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CheckpointError::ConnectionFailed(format!(
                    "failed to create checkpoint directory: {e}"
                ))
            })?;
        }

        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                CheckpointError::ConnectionFailed(format!("failed to parse checkpoint path: {e}"))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            CheckpointError::ConnectionFailed(format!("failed to connect to checkpoint: {e}"))
        })?;

        let checkpoint = Self { pool };
        checkpoint.run_migrations().await?;
        Ok(checkpoint)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CheckpointError::MigrationFailed(format!("failed to create schema_version table: {e}"))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    CheckpointError::MigrationFailed(format!("failed to query schema version: {e}"))
                })?;

        if current_version.unwrap_or(0) < 1 {
            self.migrate_v1().await?;
        }

        Ok(())
    }

    /// Migration v1: runs and per-subject status rows
    async fn migrate_v1(&self) -> Result<()> {
        tracing::info!("Applying checkpoint migration v1");

        let mut tx = self.pool.begin().await.map_err(|e| {
            CheckpointError::MigrationFailed(format!("failed to begin transaction: {e}"))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE runs (
                run_id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            CheckpointError::MigrationFailed(format!("failed to create runs table: {e}"))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE run_subjects (
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                kind TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, subject, kind)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            CheckpointError::MigrationFailed(format!("failed to create run_subjects table: {e}"))
        })?;

        sqlx::query("CREATE INDEX idx_run_subjects_status ON run_subjects (run_id, status)")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                CheckpointError::MigrationFailed(format!("failed to create status index: {e}"))
            })?;

        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                CheckpointError::MigrationFailed(format!("failed to record migration: {e}"))
            })?;

        tx.commit().await.map_err(|e| {
            CheckpointError::MigrationFailed(format!("failed to commit migration v1: {e}"))
        })?;

        tracing::info!("Checkpoint migration v1 complete");
        Ok(())
    }

    /// Create a run and seed a PENDING row per work item
    pub async fn begin_run(&self, run_id: &str, items: &[WorkItem]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            CheckpointError::QueryFailed(format!("failed to begin transaction: {e}"))
        })?;

        sqlx::query("INSERT INTO runs (run_id, started_at) VALUES (?, ?)")
            .bind(run_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointError::QueryFailed(format!("failed to insert run: {e}")))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO run_subjects (run_id, subject, kind, status, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(item.subject.as_str())
            .bind(item.kind.code())
            .bind(SubjectStatus::Pending.to_i32())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                CheckpointError::QueryFailed(format!("failed to seed subject row: {e}"))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| CheckpointError::QueryFailed(format!("failed to commit run: {e}")))?;

        Ok(())
    }

    /// Add PENDING rows for items missing from an existing run (resume with
    /// an extended universe)
    pub async fn ensure_pending(&self, run_id: &str, items: &[WorkItem]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for item in items {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO run_subjects (run_id, subject, kind, status, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(item.subject.as_str())
            .bind(item.kind.code())
            .bind(SubjectStatus::Pending.to_i32())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                CheckpointError::QueryFailed(format!("failed to seed subject row: {e}"))
            })?;
        }
        Ok(())
    }

    /// The most recent run that has not been archived, if any
    pub async fn latest_open_run(&self) -> Result<Option<String>> {
        let run_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT run_id FROM runs
            WHERE completed_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::QueryFailed(format!("failed to query open runs: {e}")))?;

        Ok(run_id)
    }

    /// Load every subject status for a run
    pub async fn statuses(
        &self,
        run_id: &str,
    ) -> Result<HashMap<(Subject, SeriesKind), SubjectStatus>> {
        let rows: Vec<SubjectRow> =
            sqlx::query_as("SELECT subject, kind, status FROM run_subjects WHERE run_id = ?")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    CheckpointError::QueryFailed(format!("failed to load subject rows: {e}"))
                })?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(kind) = SeriesKind::from_code(&row.kind) else {
                tracing::warn!(subject = %row.subject, kind = %row.kind, "unknown kind in ledger, skipping row");
                continue;
            };
            statuses.insert(
                (Subject::new(row.subject), kind),
                SubjectStatus::from_i32(row.status as i32),
            );
        }
        Ok(statuses)
    }

    /// Record the resolution of one work item
    ///
    /// Called exactly once per resolution (success, skip, or exhausted
    /// failure). The write is durable once this returns.
    pub async fn mark(
        &self,
        run_id: &str,
        subject: &Subject,
        kind: SeriesKind,
        status: SubjectStatus,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO run_subjects (run_id, subject, kind, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id, subject, kind)
            DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(subject.as_str())
        .bind(kind.code())
        .bind(status.to_i32())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::QueryFailed(format!("failed to mark subject: {e}")))?;

        Ok(())
    }

    /// Archive a drained run
    pub async fn complete_run(&self, run_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE runs SET completed_at = ? WHERE run_id = ?")
            .bind(now)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::QueryFailed(format!("failed to complete run: {e}")))?;
        Ok(())
    }

    /// Drop all open runs and their subject rows (start fresh)
    pub async fn clear_open(&self) -> Result<()> {
        sqlx::query(
            "DELETE FROM run_subjects WHERE run_id IN (SELECT run_id FROM runs WHERE completed_at IS NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::QueryFailed(format!("failed to clear subject rows: {e}")))?;

        sqlx::query("DELETE FROM runs WHERE completed_at IS NULL")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::QueryFailed(format!("failed to clear open runs: {e}")))?;

        Ok(())
    }
}
