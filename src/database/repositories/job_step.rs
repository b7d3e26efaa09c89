//! Job step repository.
//!
//! Step writes are guarded by both the step row status and the owning job's
//! status; a worker that lost its lease cannot scribble on step history.

use async_trait::async_trait;

use crate::action::SerializedError;
use crate::database::models::{
    FailedAttempt, FailedAttemptHistory, JobStepDbModel, JobStepStatus, Pagination, StepRow,
};
use crate::database::repositories::NotificationOutbox;
use crate::database::retry::with_busy_retry;
use crate::database::time::now_ms;
use crate::database::{DbPool, WritePool, WriteTxn};
use crate::notifier::Notification;
use crate::Result;

/// Job step repository trait.
#[async_trait]
pub trait JobStepRepository: Send + Sync {
    /// Create a fresh ACTIVE step row, reset a crashed ACTIVE row, or return
    /// a terminal row unchanged. Returns `None` (writing nothing) when the
    /// owning job is not ACTIVE or its lease has expired.
    async fn create_or_recover_job_step(
        &self,
        job_id: &str,
        name: &str,
        timeout_ms: i64,
        retries_limit: i64,
    ) -> Result<Option<StepRow>>;

    /// Transition ACTIVE → COMPLETED while the owning job is ACTIVE.
    async fn complete_job_step(&self, step_id: &str, client_id: &str, output: &str)
        -> Result<bool>;

    /// Transition ACTIVE → FAILED while the owning job is ACTIVE.
    async fn fail_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: &SerializedError,
    ) -> Result<bool>;

    /// Transition ACTIVE → CANCELLED while the owning job is ACTIVE or
    /// CANCELLED.
    async fn cancel_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: Option<&SerializedError>,
    ) -> Result<bool>;

    /// Record a failed attempt scheduled for retry: increments the retry
    /// counter, appends to the failure history, and extends the lease by
    /// `timeout_ms + delay_ms`.
    async fn delay_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: &SerializedError,
        delay_ms: i64,
    ) -> Result<bool>;

    /// List a job's steps; outputs are omitted for bandwidth.
    async fn get_job_steps(
        &self,
        job_id: &str,
        pagination: &Pagination,
        search: Option<&str>,
    ) -> Result<(Vec<JobStepDbModel>, u64)>;

    async fn get_job_step_by_id(&self, step_id: &str) -> Result<Option<JobStepDbModel>>;
    async fn get_job_step_status(&self, step_id: &str) -> Result<Option<JobStepStatus>>;
}

/// SQLx implementation of [`JobStepRepository`].
pub struct SqlxJobStepRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxJobStepRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    fn step_row(model: &JobStepDbModel, is_new: bool) -> Option<StepRow> {
        Some(StepRow {
            id: model.id.clone(),
            status: model.get_status()?,
            retries_limit: model.retries_limit,
            retries_count: model.retries_count,
            timeout_ms: model.timeout_ms,
            error: model.error.clone(),
            output: model.output.clone(),
            is_new,
        })
    }
}

#[async_trait]
impl JobStepRepository for SqlxJobStepRepository {
    async fn create_or_recover_job_step(
        &self,
        job_id: &str,
        name: &str,
        timeout_ms: i64,
        retries_limit: i64,
    ) -> Result<Option<StepRow>> {
        with_busy_retry("create_or_recover_job_step", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            // Steps exist only under an active, unexpired lease.
            let job: Option<(String, Option<i64>)> =
                sqlx::query_as("SELECT status, expires_at FROM jobs WHERE id = ?")
                    .bind(job_id)
                    .fetch_optional(tx.conn())
                    .await?;
            let alive = matches!(
                job,
                Some((ref status, Some(expires_at))) if status == "ACTIVE" && expires_at > now
            );
            if !alive {
                tx.rollback().await?;
                return Ok(None);
            }

            let existing = sqlx::query_as::<_, JobStepDbModel>(
                "SELECT * FROM job_steps WHERE job_id = ? AND name = ?",
            )
            .bind(job_id)
            .bind(name)
            .fetch_optional(tx.conn())
            .await?;

            let row = match existing {
                Some(step) if step.get_status() != Some(JobStepStatus::Active) => {
                    // Terminal row from a previous run; hand it back untouched.
                    tx.rollback().await?;
                    return Ok(Self::step_row(&step, false));
                }
                Some(step) => {
                    // In-flight before a crash; reset it for re-execution.
                    let reset = sqlx::query_as::<_, JobStepDbModel>(
                        r#"
                        UPDATE job_steps
                        SET status = 'ACTIVE',
                            retries_count = 0,
                            delayed_ms = NULL,
                            history_failed_attempts = '{}',
                            started_at = ?,
                            expires_at = ? + ?,
                            timeout_ms = ?,
                            retries_limit = ?,
                            updated_at = ?
                        WHERE id = ?
                        RETURNING *
                        "#,
                    )
                    .bind(now)
                    .bind(now)
                    .bind(timeout_ms)
                    .bind(timeout_ms)
                    .bind(retries_limit)
                    .bind(now)
                    .bind(&step.id)
                    .fetch_one(tx.conn())
                    .await?;
                    tx.commit().await?;
                    return Ok(Self::step_row(&reset, false));
                }
                None => {
                    let inserted = sqlx::query_as::<_, JobStepDbModel>(
                        r#"
                        INSERT INTO job_steps (
                            id, job_id, name, status, output, error, started_at, finished_at,
                            timeout_ms, expires_at, retries_limit, retries_count, delayed_ms,
                            history_failed_attempts, created_at, updated_at
                        )
                        VALUES (?, ?, ?, 'ACTIVE', NULL, NULL, ?, NULL, ?, ?, ?, 0, NULL, '{}', ?, ?)
                        RETURNING *
                        "#,
                    )
                    .bind(uuid::Uuid::new_v4().to_string())
                    .bind(job_id)
                    .bind(name)
                    .bind(now)
                    .bind(timeout_ms)
                    .bind(now + timeout_ms)
                    .bind(retries_limit)
                    .bind(now)
                    .bind(now)
                    .fetch_one(tx.conn())
                    .await?;
                    inserted
                }
            };

            tx.commit().await?;
            Ok(Self::step_row(&row, true))
        })
        .await
    }

    async fn complete_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        output: &str,
    ) -> Result<bool> {
        with_busy_retry("complete_job_step", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let job_id: Option<String> = sqlx::query_scalar(
                r#"
                UPDATE job_steps
                SET status = 'COMPLETED', output = ?, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE'
                  AND EXISTS (
                      SELECT 1 FROM jobs
                      WHERE jobs.id = job_steps.job_id AND jobs.status = 'ACTIVE'
                  )
                RETURNING job_id
                "#,
            )
            .bind(output)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .fetch_optional(tx.conn())
            .await?;

            let Some(job_id) = job_id else {
                tx.rollback().await?;
                return Ok(false);
            };

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::StepStatusChanged {
                    job_id,
                    step_id: step_id.to_string(),
                    status: JobStepStatus::Completed,
                    error: None,
                    client_id: client_id.to_string(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn fail_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: &SerializedError,
    ) -> Result<bool> {
        let error_json = error.to_json();
        let error_json = &error_json;
        with_busy_retry("fail_job_step", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let job_id: Option<String> = sqlx::query_scalar(
                r#"
                UPDATE job_steps
                SET status = 'FAILED', error = ?, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE'
                  AND EXISTS (
                      SELECT 1 FROM jobs
                      WHERE jobs.id = job_steps.job_id AND jobs.status = 'ACTIVE'
                  )
                RETURNING job_id
                "#,
            )
            .bind(error_json)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .fetch_optional(tx.conn())
            .await?;

            let Some(job_id) = job_id else {
                tx.rollback().await?;
                return Ok(false);
            };

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::StepStatusChanged {
                    job_id,
                    step_id: step_id.to_string(),
                    status: JobStepStatus::Failed,
                    error: Some(error.clone()),
                    client_id: client_id.to_string(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn cancel_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: Option<&SerializedError>,
    ) -> Result<bool> {
        let error_json = error.map(SerializedError::to_json);
        let error_json = &error_json;
        with_busy_retry("cancel_job_step", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            // A cancelled job may still be finalising its steps.
            let job_id: Option<String> = sqlx::query_scalar(
                r#"
                UPDATE job_steps
                SET status = 'CANCELLED', error = COALESCE(?, error), finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE'
                  AND EXISTS (
                      SELECT 1 FROM jobs
                      WHERE jobs.id = job_steps.job_id
                        AND jobs.status IN ('ACTIVE', 'CANCELLED')
                  )
                RETURNING job_id
                "#,
            )
            .bind(error_json.as_deref())
            .bind(now)
            .bind(now)
            .bind(step_id)
            .fetch_optional(tx.conn())
            .await?;

            let Some(job_id) = job_id else {
                tx.rollback().await?;
                return Ok(false);
            };

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::StepStatusChanged {
                    job_id,
                    step_id: step_id.to_string(),
                    status: JobStepStatus::Cancelled,
                    error: error.cloned(),
                    client_id: client_id.to_string(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn delay_job_step(
        &self,
        step_id: &str,
        client_id: &str,
        error: &SerializedError,
        delay_ms: i64,
    ) -> Result<bool> {
        with_busy_retry("delay_job_step", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let step = sqlx::query_as::<_, JobStepDbModel>(
                r#"
                SELECT job_steps.*
                FROM job_steps
                JOIN jobs ON jobs.id = job_steps.job_id
                WHERE job_steps.id = ? AND job_steps.status = 'ACTIVE'
                  AND jobs.status = 'ACTIVE'
                "#,
            )
            .bind(step_id)
            .fetch_optional(tx.conn())
            .await?;

            let Some(step) = step else {
                tx.rollback().await?;
                return Ok(false);
            };

            // History slots are epoch-ms keys, bumped past the last slot so
            // the ordering stays strictly monotone per step.
            let mut history: FailedAttemptHistory = step.get_history();
            let last_slot = history
                .keys()
                .filter_map(|k| k.parse::<i64>().ok())
                .max()
                .unwrap_or(0);
            let slot = now.max(last_slot + 1);
            history.insert(
                slot.to_string(),
                FailedAttempt {
                    failed_at: now,
                    error: error.clone(),
                    delayed_ms: delay_ms,
                },
            );
            let history_json = serde_json::to_string(&history)?;

            sqlx::query(
                r#"
                UPDATE job_steps
                SET retries_count = retries_count + 1,
                    delayed_ms = ?,
                    history_failed_attempts = ?,
                    expires_at = expires_at + timeout_ms + ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(delay_ms)
            .bind(&history_json)
            .bind(delay_ms)
            .bind(now)
            .bind(step_id)
            .execute(tx.conn())
            .await?;

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::StepDelayed {
                    job_id: step.job_id.clone(),
                    step_id: step_id.to_string(),
                    delayed_ms: delay_ms,
                    error: error.clone(),
                    client_id: client_id.to_string(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn get_job_steps(
        &self,
        job_id: &str,
        pagination: &Pagination,
        search: Option<&str>,
    ) -> Result<(Vec<JobStepDbModel>, u64)> {
        let pattern = search.map(|s| format!("%{s}%"));

        let (count_sql, page_sql) = if pattern.is_some() {
            (
                "SELECT COUNT(*) FROM job_steps WHERE job_id = ? AND name LIKE ?",
                // Outputs can be large; the listing never carries them.
                "SELECT id, job_id, name, status, NULL AS output, error, started_at, \
                 finished_at, timeout_ms, expires_at, retries_limit, retries_count, \
                 delayed_ms, history_failed_attempts, created_at, updated_at \
                 FROM job_steps WHERE job_id = ? AND name LIKE ? \
                 ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            )
        } else {
            (
                "SELECT COUNT(*) FROM job_steps WHERE job_id = ?",
                "SELECT id, job_id, name, status, NULL AS output, error, started_at, \
                 finished_at, timeout_ms, expires_at, retries_limit, retries_count, \
                 delayed_ms, history_failed_attempts, created_at, updated_at \
                 FROM job_steps WHERE job_id = ? \
                 ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            )
        };

        let mut count_query = sqlx::query_scalar::<_, i64>(count_sql).bind(job_id);
        let mut page_query = sqlx::query_as::<_, JobStepDbModel>(page_sql).bind(job_id);
        if let Some(pattern) = &pattern {
            count_query = count_query.bind(pattern);
            page_query = page_query.bind(pattern);
        }

        let total = count_query.fetch_one(&self.pool).await?;
        let steps = page_query
            .bind(pagination.limit)
            .bind(pagination.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((steps, total.max(0) as u64))
    }

    async fn get_job_step_by_id(&self, step_id: &str) -> Result<Option<JobStepDbModel>> {
        let step = sqlx::query_as::<_, JobStepDbModel>("SELECT * FROM job_steps WHERE id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(step)
    }

    async fn get_job_step_status(&self, step_id: &str) -> Result<Option<JobStepStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_steps WHERE id = ?")
                .bind(step_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.as_deref().and_then(JobStepStatus::parse))
    }
}
