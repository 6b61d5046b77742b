//! Execution history: one row per task run, persisted to SQLite via `sqlx`.
//!
//! Grounded on the teacher's `meridian-db` crate (pool construction and a
//! repository-style async API over a connection pool), adapted from
//! Postgres to SQLite since this is a single-node, file-resident store
//! rather than a server-shared database.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

use crate::error::HistoryError;
use crate::models::{BackendResult, BackendResultStatus, Execution, ExecutionStatus};

type Result<T> = std::result::Result<T, HistoryError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id              TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL,
    task_name       TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    completed_at    TEXT,
    status          TEXT NOT NULL,
    archive_size    INTEGER,
    archive_hash    TEXT,
    error_message   TEXT,
    duration_ms     INTEGER
);

CREATE TABLE IF NOT EXISTS backend_uploads (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id    TEXT NOT NULL,
    backend_id      TEXT NOT NULL,
    backend_name    TEXT NOT NULL,
    status          TEXT NOT NULL,
    uploaded_at     TEXT NOT NULL,
    size            INTEGER NOT NULL,
    remote_path     TEXT NOT NULL,
    error_message   TEXT,
    FOREIGN KEY (execution_id) REFERENCES executions(id)
);

CREATE INDEX IF NOT EXISTS idx_executions_task_id ON executions(task_id);
CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at);
CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
CREATE INDEX IF NOT EXISTS idx_backend_uploads_execution_id ON backend_uploads(execution_id);
"#;

/// Aggregate statistics over a set of executions, scoped to one task.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TaskStats {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub last_status: Option<ExecutionStatus>,
    pub avg_duration_ms: Option<f64>,
    pub last_archive_size: Option<u64>,
}

/// Aggregate statistics across every execution the store holds.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub running: i64,
    pub last_24h: i64,
}

/// Async, pool-backed store for past and in-flight [`Execution`] records.
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if needed) the SQLite database at `path` and run the
    /// idempotent schema migration.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database, for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| HistoryError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Insert a new (presumably `running`) execution record.
    pub async fn create(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions
                (id, task_id, task_name, started_at, completed_at, status,
                 archive_size, archive_hash, error_message, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(&execution.task_name)
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .bind(execution.status.as_str())
        .bind(execution.archive_size.map(|v| v as i64))
        .bind(&execution.archive_hash)
        .bind(&execution.error_message)
        .bind(execution.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite the mutable fields of an existing execution (status,
    /// completion, timing, error) in place.
    pub async fn update(&self, execution: &Execution) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET
                completed_at = ?, status = ?, archive_size = ?,
                archive_hash = ?, error_message = ?, duration_ms = ?
             WHERE id = ?",
        )
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .bind(execution.status.as_str())
        .bind(execution.archive_size.map(|v| v as i64))
        .bind(&execution.archive_hash)
        .bind(&execution.error_message)
        .bind(execution.duration_ms)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HistoryError::NotFound(execution.id.to_string()));
        }
        Ok(())
    }

    /// Append a single per-backend result row for an execution.
    pub async fn add_backend_upload(&self, execution_id: Uuid, result: &BackendResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO backend_uploads
                (execution_id, backend_id, backend_name, status, uploaded_at,
                 size, remote_path, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution_id.to_string())
        .bind(result.backend_id.to_string())
        .bind(&result.backend_name)
        .bind(result.status.as_str())
        .bind(result.uploaded_at.to_rfc3339())
        .bind(result.size as i64)
        .bind(&result.remote_path)
        .bind(&result.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        let mut execution = row_to_execution(&row)?;
        execution.backend_results = self.backend_results_for(id).await?;
        Ok(execution)
    }

    async fn backend_results_for(&self, execution_id: Uuid) -> Result<Vec<BackendResult>> {
        let rows = sqlx::query(
            "SELECT * FROM backend_uploads WHERE execution_id = ? ORDER BY id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_backend_result).collect()
    }

    /// Most recent executions, optionally filtered to one task and/or one
    /// status, newest first (ties broken by id descending).
    pub async fn list(
        &self,
        task_id: Option<Uuid>,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        let mut sql = "SELECT * FROM executions WHERE 1 = 1".to_string();
        if task_id.is_some() {
            sql.push_str(" AND task_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(id) = task_id {
            query = query.bind(id.to_string());
        }
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        query = query.bind(limit).bind(offset);
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut execution = row_to_execution(row)?;
            execution.backend_results = self.backend_results_for(execution.id).await?;
            out.push(execution);
        }
        Ok(out)
    }

    /// Count of executions matching an optional `since` cutoff and/or an
    /// optional status.
    pub async fn get_execution_count(
        &self,
        since: Option<DateTime<Utc>>,
        status: Option<ExecutionStatus>,
    ) -> Result<i64> {
        let mut sql = "SELECT COUNT(*) AS n FROM executions WHERE 1 = 1".to_string();
        if since.is_some() {
            sql.push_str(" AND started_at >= ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        let mut query = sqlx::query(&sql);
        if let Some(t) = since {
            query = query.bind(t.to_rfc3339());
        }
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Per-task tallies: total/success/failure counts, the most recent
    /// status, mean run duration, and the size of the last archive.
    pub async fn get_task_stats(&self, task_id: Uuid) -> Result<TaskStats> {
        let executions = self.list(Some(task_id), None, i64::MAX, 0).await?;
        let mut stats = TaskStats::default();
        let mut duration_sum = 0i64;
        let mut duration_count = 0i64;
        for (idx, execution) in executions.iter().enumerate() {
            stats.total += 1;
            match execution.status {
                ExecutionStatus::Success => stats.success += 1,
                ExecutionStatus::Failed | ExecutionStatus::Cancelled => stats.failure += 1,
                ExecutionStatus::Running => {}
            }
            if let Some(ms) = execution.duration_ms {
                duration_sum += ms;
                duration_count += 1;
            }
            if idx == 0 {
                stats.last_status = Some(execution.status);
                stats.last_archive_size = execution.archive_size;
            }
        }
        if duration_count > 0 {
            stats.avg_duration_ms = Some(duration_sum as f64 / duration_count as f64);
        }
        Ok(stats)
    }

    /// Tallies across every execution: total/success/failed/running counts
    /// plus how many started within the last 24 hours.
    pub async fn get_execution_stats(&self) -> Result<ExecutionStats> {
        let mut stats = ExecutionStats::default();
        stats.total = self.get_execution_count(None, None).await?;
        stats.success = self
            .get_execution_count(None, Some(ExecutionStatus::Success))
            .await?;
        stats.failed = self
            .get_execution_count(None, Some(ExecutionStatus::Failed))
            .await?;
        stats.running = self
            .get_execution_count(None, Some(ExecutionStatus::Running))
            .await?;
        stats.last_24h = self
            .get_execution_count(Some(Utc::now() - chrono::Duration::hours(24)), None)
            .await?;
        Ok(stats)
    }

    /// Release the underlying connection pool. Part of the shutdown
    /// contract; idempotent with further use of this store undefined.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Delete every execution and backend-upload row, atomically.
    pub async fn clear_history(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backend_uploads").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM executions").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let id: String = row.try_get("id")?;
    let task_id: String = row.try_get("task_id")?;
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let status: String = row.try_get("status")?;

    Ok(Execution {
        id: Uuid::parse_str(&id).map_err(|e| HistoryError::Migration(e.to_string()))?,
        task_id: Uuid::parse_str(&task_id).map_err(|e| HistoryError::Migration(e.to_string()))?,
        task_name: row.try_get("task_name")?,
        started_at: parse_rfc3339(&started_at)?,
        completed_at: completed_at.map(|s| parse_rfc3339(&s)).transpose()?,
        status: ExecutionStatus::from_str(&status)
            .ok_or_else(|| HistoryError::Migration(format!("unknown status {status}")))?,
        archive_size: row.try_get::<Option<i64>, _>("archive_size")?.map(|v| v as u64),
        archive_hash: row.try_get("archive_hash")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
        backend_results: Vec::new(),
    })
}

fn row_to_backend_result(row: &sqlx::sqlite::SqliteRow) -> Result<BackendResult> {
    let backend_id: String = row.try_get("backend_id")?;
    let status: String = row.try_get("status")?;
    let uploaded_at: String = row.try_get("uploaded_at")?;

    Ok(BackendResult {
        backend_id: Uuid::parse_str(&backend_id).map_err(|e| HistoryError::Migration(e.to_string()))?,
        backend_name: row.try_get("backend_name")?,
        status: BackendResultStatus::from_str(&status)
            .ok_or_else(|| HistoryError::Migration(format!("unknown status {status}")))?,
        uploaded_at: parse_rfc3339(&uploaded_at)?,
        size: row.try_get::<i64, _>("size")? as u64,
        remote_path: row.try_get("remote_path")?,
        error_message: row.try_get("error_message")?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::Migration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution() -> Execution {
        Execution::new_running(Uuid::new_v4(), "daily-db")
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = HistoryStore::connect_in_memory().await.unwrap();
        let execution = sample_execution();
        store.create(&execution).await.unwrap();

        let fetched = store.get(execution.id).await.unwrap();
        assert_eq!(fetched.id, execution.id);
        assert_eq!(fetched.status, ExecutionStatus::Running);
        assert!(fetched.backend_results.is_empty());
    }

    #[tokio::test]
    async fn update_transitions_to_terminal_status() {
        let store = HistoryStore::connect_in_memory().await.unwrap();
        let mut execution = sample_execution();
        store.create(&execution).await.unwrap();

        execution.finish(ExecutionStatus::Success, None);
        store.update(&execution).await.unwrap();

        let fetched = store.get(execution.id).await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Success);
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn backend_uploads_are_ordered_and_attached() {
        let store = HistoryStore::connect_in_memory().await.unwrap();
        let execution = sample_execution();
        store.create(&execution).await.unwrap();

        for name in ["s3-primary", "gcs-backup"] {
            store
                .add_backend_upload(
                    execution.id,
                    &BackendResult {
                        backend_id: Uuid::new_v4(),
                        backend_name: name.to_string(),
                        status: BackendResultStatus::Success,
                        uploaded_at: Utc::now(),
                        size: 1024,
                        remote_path: format!("daily-db/{name}.tar.gz"),
                        error_message: None,
                    },
                )
                .await
                .unwrap();
        }

        let fetched = store.get(execution.id).await.unwrap();
        assert_eq!(fetched.backend_results.len(), 2);
        assert_eq!(fetched.backend_results[0].backend_name, "s3-primary");
    }

    #[tokio::test]
    async fn stats_tally_by_status() {
        let store = HistoryStore::connect_in_memory().await.unwrap();
        let task_id = Uuid::new_v4();

        let mut success = Execution::new_running(task_id, "t");
        store.create(&success).await.unwrap();
        success.finish(ExecutionStatus::Success, None);
        store.update(&success).await.unwrap();

        let mut failed = Execution::new_running(task_id, "t");
        store.create(&failed).await.unwrap();
        failed.finish(ExecutionStatus::Failed, Some("boom".to_string()));
        store.update(&failed).await.unwrap();

        let stats = store.get_task_stats(task_id).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.last_status, Some(ExecutionStatus::Failed));

        let overall = store.get_execution_stats().await.unwrap();
        assert_eq!(overall.total, 2);
        assert_eq!(overall.success, 1);
        assert_eq!(overall.failed, 1);
        assert_eq!(overall.last_24h, 2);
    }

    #[tokio::test]
    async fn clear_history_removes_everything() {
        let store = HistoryStore::connect_in_memory().await.unwrap();
        let execution = sample_execution();
        store.create(&execution).await.unwrap();
        store
            .add_backend_upload(
                execution.id,
                &BackendResult {
                    backend_id: Uuid::new_v4(),
                    backend_name: "local".to_string(),
                    status: BackendResultStatus::Success,
                    uploaded_at: Utc::now(),
                    size: 1,
                    remote_path: "x".to_string(),
                    error_message: None,
                },
            )
            .await
            .unwrap();

        store.clear_history().await.unwrap();
        assert_eq!(store.get_execution_count(None, None).await.unwrap(), 0);
    }
}
