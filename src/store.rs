//! The durable log: single-writer SQLite persistence for tracked records.
//!
//! All persistent state flows through [`Store`]. The pool is capped at one
//! connection so every write serialises through a single writer lane; WAL
//! journaling makes writes crash-safe and a 5 s busy timeout absorbs brief
//! contention. The cleaner reclaims pages through incremental auto-vacuum.

use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{Result, StoreError};
use crate::model::{ClusterState, TrackedRecord, Transition};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ALL_COLUMNS: &str = "\
    id, resource_uid, resource_kind, resource_name, resource_namespace, \
    annotation_value, cluster_state, detection_source, created_at, deleted_at, \
    last_reconciled, notified_created, notified_deleted, created_sent_at, \
    deleted_sent_at, notification_attempts, last_attempt_at, terminal_failed, \
    terminal_failed_code, resource_version, labels_json, annotations_json";

/// Persistent store for tracked records. Cheap to clone; all clones share
/// the single-connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and prepare its schema.
    /// Failure here is fatal to the process.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.display().to_string(),
                source,
            })?;

        let store = Self { pool };
        store.prepare().await?;

        tracing::info!(path = %path.display(), "database initialised");
        Ok(store)
    }

    /// In-memory store for tests and local experiments. The single
    /// connection keeps the database alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("connecting in-memory sqlite")?;

        let store = Self { pool };
        store.prepare().await?;
        Ok(store)
    }

    /// Create the table and indexes if absent, then apply the idempotent
    /// column migrations so databases written by older builds keep working.
    async fn prepare(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked_records (
                id                    TEXT PRIMARY KEY,
                resource_uid          TEXT NOT NULL,
                resource_kind         TEXT NOT NULL,
                resource_name         TEXT NOT NULL,
                resource_namespace    TEXT NOT NULL DEFAULT '',
                annotation_value      TEXT NOT NULL DEFAULT '',
                cluster_state         TEXT NOT NULL DEFAULT 'exists',
                detection_source      TEXT NOT NULL DEFAULT 'watch',
                created_at            TEXT NOT NULL,
                deleted_at            TEXT,
                last_reconciled       TEXT,
                notified_created      INTEGER NOT NULL DEFAULT 0,
                notified_deleted      INTEGER NOT NULL DEFAULT 0,
                created_sent_at       TEXT,
                deleted_sent_at       TEXT,
                notification_attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at       TEXT,
                terminal_failed       INTEGER NOT NULL DEFAULT 0,
                terminal_failed_code  INTEGER NOT NULL DEFAULT 0,
                resource_version      TEXT NOT NULL DEFAULT '',
                labels_json           TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Migrate)?;

        self.migrate().await?;

        let indexes = [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_uid
                 ON tracked_records (resource_uid)",
            "CREATE INDEX IF NOT EXISTS idx_resource_kind
                 ON tracked_records (resource_kind)",
            "CREATE INDEX IF NOT EXISTS idx_resource_namespace
                 ON tracked_records (resource_namespace)",
            "CREATE INDEX IF NOT EXISTS idx_pending
                 ON tracked_records (cluster_state, notified_created, notified_deleted)",
            "CREATE INDEX IF NOT EXISTS idx_reconciliation
                 ON tracked_records (resource_kind, last_reconciled)",
            "CREATE INDEX IF NOT EXISTS idx_cleanup
                 ON tracked_records (deleted_at, notified_deleted, cluster_state)",
        ];
        for statement in indexes {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Migrate)?;
        }

        Ok(())
    }

    /// Add columns introduced after the first release. Checking
    /// `PRAGMA table_info` keeps the step idempotent, and the defaults keep
    /// old rows readable.
    async fn migrate(&self) -> Result<()> {
        let columns = sqlx::query("PRAGMA table_info(tracked_records)")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Migrate)?;

        let has_annotations = columns.iter().any(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name == "annotations_json")
                .unwrap_or(false)
        });

        if !has_annotations {
            sqlx::query(
                "ALTER TABLE tracked_records
                     ADD COLUMN annotations_json TEXT NOT NULL DEFAULT ''",
            )
            .execute(&self.pool)
            .await
            .map_err(StoreError::Migrate)?;
            tracing::info!("migrated schema: added annotations_json column");
        }

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persist a new record. A record with the same `resource_uid` already
    /// present makes this a no-op; returns whether a row was written.
    pub async fn insert(&self, record: &TrackedRecord) -> Result<bool> {
        let query = format!(
            "INSERT INTO tracked_records ({ALL_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(resource_uid) DO NOTHING"
        );

        let result = sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.resource_uid)
            .bind(&record.resource_kind)
            .bind(&record.resource_name)
            .bind(&record.resource_namespace)
            .bind(&record.annotation_value)
            .bind(record.cluster_state.as_str())
            .bind(record.detection_source.as_str())
            .bind(record.created_at)
            .bind(record.deleted_at)
            .bind(record.last_reconciled)
            .bind(record.notified_created)
            .bind(record.notified_deleted)
            .bind(record.created_sent_at)
            .bind(record.deleted_sent_at)
            .bind(record.notification_attempts)
            .bind(record.last_attempt_at)
            .bind(record.terminal_failed)
            .bind(record.terminal_failed_code)
            .bind(&record.resource_version)
            .bind(&record.labels_json)
            .bind(&record.annotations_json)
            .execute(&self.pool)
            .await
            .context("failed to insert tracked record")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_by_uid(&self, uid: &str) -> Result<Option<TrackedRecord>> {
        let query = format!("SELECT {ALL_COLUMNS} FROM tracked_records WHERE resource_uid = ?");
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch record by uid")?;

        row.map(RecordRow::into_record).transpose()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<TrackedRecord>> {
        let query = format!("SELECT {ALL_COLUMNS} FROM tracked_records WHERE id = ?");
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch record by id")?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Set the cluster state for the record with `uid`, recording the
    /// deletion timestamp when transitioning to deleted. Idempotent.
    pub async fn set_state(
        &self,
        uid: &str,
        state: ClusterState,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_records SET cluster_state = ?, deleted_at = ?
             WHERE resource_uid = ?",
        )
        .bind(state.as_str())
        .bind(deleted_at)
        .bind(uid)
        .execute(&self.pool)
        .await
        .context("failed to update cluster state")?;

        Ok(())
    }

    /// Mark one transition as delivered, with its success timestamp.
    pub async fn mark_delivered(
        &self,
        id: &str,
        transition: Transition,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = match transition {
            Transition::Created => {
                "UPDATE tracked_records
                     SET notified_created = 1, created_sent_at = ? WHERE id = ?"
            }
            Transition::Deleted => {
                "UPDATE tracked_records
                     SET notified_deleted = 1, deleted_sent_at = ? WHERE id = ?"
            }
        };

        sqlx::query(query)
            .bind(sent_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark transition delivered")?;

        Ok(())
    }

    /// Quarantine a record after a non-retriable delivery failure.
    pub async fn mark_terminal(&self, id: &str, status: u16) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_records SET terminal_failed = 1, terminal_failed_code = ?
             WHERE id = ?",
        )
        .bind(i64::from(status))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark record terminally failed")?;

        Ok(())
    }

    /// Bump the attempt counter and stamp the attempt time.
    pub async fn bump_attempt(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_records
             SET notification_attempts = notification_attempts + 1, last_attempt_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to bump notification attempts")?;

        Ok(())
    }

    pub async fn set_last_reconciled(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tracked_records SET last_reconciled = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to update last_reconciled")?;

        Ok(())
    }

    /// Records owing a transition, oldest first. A record is pending when
    /// its creation is unannounced, or it is deleted with the deletion
    /// unannounced; terminally failed records are invisible here.
    pub async fn fetch_pending(&self, limit: u32) -> Result<Vec<TrackedRecord>> {
        let query = format!(
            "SELECT {ALL_COLUMNS} FROM tracked_records
             WHERE (notified_created = 0
                    OR (cluster_state = 'deleted' AND notified_deleted = 0))
               AND terminal_failed = 0
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        );

        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch pending records")?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// All records still in the `exists` state for one kind. The
    /// reconciler diffs this against the live cluster inventory.
    pub async fn fetch_active_by_kind(&self, kind: &str) -> Result<Vec<TrackedRecord>> {
        let query = format!(
            "SELECT {ALL_COLUMNS} FROM tracked_records
             WHERE cluster_state = 'exists' AND resource_kind = ?"
        );

        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(kind)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch active records")?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Records safe to remove: deleted, deletion delivered, not
    /// quarantined, and deleted longer ago than the retention period.
    pub async fn fetch_cleanup_eligible(
        &self,
        retention: chrono::Duration,
    ) -> Result<Vec<TrackedRecord>> {
        let cutoff = Utc::now() - retention;
        let query = format!(
            "SELECT {ALL_COLUMNS} FROM tracked_records
             WHERE cluster_state = 'deleted'
               AND notified_deleted = 1
               AND terminal_failed = 0
               AND deleted_at IS NOT NULL
               AND deleted_at < ?"
        );

        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch cleanup-eligible records")?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Counts of records in the `exists` and `deleted` states.
    pub async fn count_by_state(&self) -> Result<(i64, i64)> {
        let rows = sqlx::query(
            "SELECT cluster_state, COUNT(*) AS n FROM tracked_records GROUP BY cluster_state",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count records by state")?;

        let mut exists = 0;
        let mut deleted = 0;
        for row in rows {
            let state: String = row.try_get("cluster_state")?;
            let count: i64 = row.try_get("n")?;
            match ClusterState::from_str(&state) {
                Ok(ClusterState::Exists) => exists = count,
                Ok(ClusterState::Deleted) => deleted = count,
                Err(error) => tracing::warn!(%error, "unknown cluster state in database"),
            }
        }

        Ok((exists, deleted))
    }

    /// Permanently remove one record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tracked_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete record")?;

        Ok(())
    }

    /// Reclaim free pages left behind by deletions.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await
            .context("incremental vacuum failed")?;

        Ok(())
    }

    /// Approximate on-disk footprint: page_count * page_size.
    pub async fn size_bytes(&self) -> Result<i64> {
        let page_count: i64 = sqlx::query("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .context("reading page_count")?
            .try_get(0)?;
        let page_size: i64 = sqlx::query("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .context("reading page_size")?
            .try_get(0)?;

        Ok(page_count * page_size)
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    resource_uid: String,
    resource_kind: String,
    resource_name: String,
    resource_namespace: String,
    annotation_value: String,
    cluster_state: String,
    detection_source: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    last_reconciled: Option<DateTime<Utc>>,
    notified_created: bool,
    notified_deleted: bool,
    created_sent_at: Option<DateTime<Utc>>,
    deleted_sent_at: Option<DateTime<Utc>>,
    notification_attempts: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    terminal_failed: bool,
    terminal_failed_code: i64,
    resource_version: String,
    labels_json: String,
    annotations_json: String,
}

impl RecordRow {
    fn into_record(self) -> Result<TrackedRecord> {
        let cluster_state = self
            .cluster_state
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid cluster state in database: {e}"))?;
        let detection_source = self
            .detection_source
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid detection source in database: {e}"))?;

        Ok(TrackedRecord {
            id: self.id,
            resource_uid: self.resource_uid,
            resource_kind: self.resource_kind,
            resource_name: self.resource_name,
            resource_namespace: self.resource_namespace,
            annotation_value: self.annotation_value,
            cluster_state,
            detection_source,
            created_at: self.created_at,
            deleted_at: self.deleted_at,
            last_reconciled: self.last_reconciled,
            notified_created: self.notified_created,
            notified_deleted: self.notified_deleted,
            created_sent_at: self.created_sent_at,
            deleted_sent_at: self.deleted_sent_at,
            notification_attempts: self.notification_attempts,
            last_attempt_at: self.last_attempt_at,
            terminal_failed: self.terminal_failed,
            terminal_failed_code: self.terminal_failed_code,
            resource_version: self.resource_version,
            labels_json: self.labels_json,
            annotations_json: self.annotations_json,
        })
    }
}
