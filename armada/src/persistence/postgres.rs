use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::job::{Jid, JobRecord, JobState, JobUpdate};
use crate::reconciler::JobStore;
use crate::soft_delete::{DeleteStatus, DeleteTask, DeleteTaskId, DeleteTaskStore, DeleteUpdate};
use crate::task::TaskId;

/// Tables used by [`PostgresJobStore`] and [`PostgresDeleteTaskStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS armada_jobs (
    jid            TEXT PRIMARY KEY,
    task_id        UUID,
    status         TEXT NOT NULL,
    start_time     TIMESTAMPTZ NOT NULL,
    end_time       TIMESTAMPTZ,
    duration_secs  DOUBLE PRECISION,
    success_count  INTEGER NOT NULL DEFAULT 0,
    failed_count   INTEGER NOT NULL DEFAULT 0,
    result         JSONB
);
CREATE INDEX IF NOT EXISTS armada_jobs_running_idx
    ON armada_jobs (start_time) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS armada_delete_tasks (
    id           UUID PRIMARY KEY,
    target_id    TEXT NOT NULL,
    status       TEXT NOT NULL,
    retry_count  INTEGER NOT NULL DEFAULT 0,
    max_retries  INTEGER NOT NULL,
    force        BOOLEAN NOT NULL DEFAULT FALSE,
    last_error   TEXT,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS armada_delete_tasks_target_idx
    ON armada_delete_tasks (target_id, created_at);
"#;

/// Creates the armada tables when missing.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// PostgreSQL-backed job table.
///
/// Conditional updates are a single `UPDATE ... WHERE status = $expected`,
/// so concurrent reconcilers on separate hosts never both win.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_job(row: &PgRow) -> anyhow::Result<JobRecord> {
        let status: String = row.try_get("status")?;
        let task_id: Option<Uuid> = row.try_get("task_id")?;
        Ok(JobRecord {
            jid: Jid::new(row.try_get::<String, _>("jid")?),
            task_id: task_id.map(TaskId),
            status: status.parse()?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            duration_secs: row.try_get("duration_secs")?,
            success_count: to_u32(row.try_get("success_count")?),
            failed_count: to_u32(row.try_get("failed_count")?),
            result: row.try_get("result")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO armada_jobs (
                jid, task_id, status, start_time, end_time, duration_secs,
                success_count, failed_count, result
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (jid) DO NOTHING
            "#,
        )
        .bind(record.jid.as_str())
        .bind(record.task_id.map(|id| id.0))
        .bind(record.status.as_str())
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.duration_secs)
        .bind(to_i32(record.success_count))
        .bind(to_i32(record.failed_count))
        .bind(&record.result)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get(&self, jid: &Jid) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM armada_jobs WHERE jid = $1")
            .bind(jid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_running(&self, limit: usize) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM armada_jobs
            WHERE status = 'running'
            ORDER BY start_time ASC, jid ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update_if(
        &self,
        jid: &Jid,
        expected: JobState,
        update: &JobUpdate,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE armada_jobs
            SET status = $1,
                end_time = COALESCE($2, end_time),
                duration_secs = COALESCE($3, duration_secs),
                success_count = COALESCE($4, success_count),
                failed_count = COALESCE($5, failed_count),
                result = COALESCE($6, result)
            WHERE jid = $7
              AND status = $8
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.end_time)
        .bind(update.duration_secs)
        .bind(update.success_count.map(to_i32))
        .bind(update.failed_count.map(to_i32))
        .bind(&update.result)
        .bind(jid.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let won = res.rows_affected() == 1;
        if !won {
            debug!(jid = %jid, expected = %expected, to = %update.status, "job update lost");
        }
        Ok(won)
    }
}

/// PostgreSQL-backed delete-task table.
#[derive(Debug, Clone)]
pub struct PostgresDeleteTaskStore {
    pool: PgPool,
}

impl PostgresDeleteTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &PgRow) -> anyhow::Result<DeleteTask> {
        let status: String = row.try_get("status")?;
        Ok(DeleteTask {
            id: DeleteTaskId(row.try_get("id")?),
            target_id: row.try_get("target_id")?,
            status: status.parse()?,
            retry_count: to_u32(row.try_get("retry_count")?),
            max_retries: to_u32(row.try_get("max_retries")?),
            force: row.try_get("force")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    const ACTIVE_FILTER: &'static str = r#"
        (status IN ('pending', 'deleting')
         OR (status = 'failed' AND retry_count <= max_retries))
    "#;
}

#[async_trait]
impl DeleteTaskStore for PostgresDeleteTaskStore {
    async fn insert_unless_active(&self, task: DeleteTask) -> anyhow::Result<DeleteTask> {
        let mut tx = self.pool.begin().await?;

        // Serialises concurrent requests for the same target.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&task.target_id)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(&format!(
            "SELECT * FROM armada_delete_tasks WHERE target_id = $1 AND {} \
             ORDER BY created_at ASC LIMIT 1",
            Self::ACTIVE_FILTER
        ))
        .bind(&task.target_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            let existing = Self::row_to_task(&row)?;
            tx.commit().await?;
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO armada_delete_tasks (
                id, target_id, status, retry_count, max_retries, force,
                last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id.0)
        .bind(&task.target_id)
        .bind(task.status.as_str())
        .bind(to_i32(task.retry_count))
        .bind(to_i32(task.max_retries))
        .bind(task.force)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get(&self, id: DeleteTaskId) -> anyhow::Result<Option<DeleteTask>> {
        let row = sqlx::query("SELECT * FROM armada_delete_tasks WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_active(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM armada_delete_tasks WHERE target_id = $1 AND {} \
             ORDER BY created_at ASC LIMIT 1",
            Self::ACTIVE_FILTER
        ))
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn latest_for_target(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM armada_delete_tasks
            WHERE target_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list(&self, status: Option<DeleteStatus>) -> anyhow::Result<Vec<DeleteTask>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM armada_delete_tasks
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_if(
        &self,
        id: DeleteTaskId,
        expected: DeleteStatus,
        update: &DeleteUpdate,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE armada_delete_tasks
            SET status = $1,
                retry_count = $2,
                last_error = $3,
                updated_at = $4
            WHERE id = $5
              AND status = $6
            "#,
        )
        .bind(update.status.as_str())
        .bind(to_i32(update.retry_count))
        .bind(&update.last_error)
        .bind(update.updated_at)
        .bind(id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
