//! Job repository.
//!
//! All mutations are CAS-guarded on the status column or run inside a
//! `BEGIN IMMEDIATE` transaction on the serialized write pool; booleans come
//! from `rows_affected`. Every observable mutation enqueues its notification
//! in the same transaction.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::action::SerializedError;
use crate::database::models::{
    ActionSummary, JobCounts, JobDbModel, JobFilters, JobSort, JobStatus, Pagination,
};
use crate::database::repositories::NotificationOutbox;
use crate::database::retry::with_busy_retry;
use crate::database::time::now_ms;
use crate::database::{DbPool, WritePool, WriteTxn};
use crate::notifier::Notification;
use crate::Result;

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a CREATED job and announce it.
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;

    /// Transition ACTIVE → COMPLETED. Requires ownership and an unexpired
    /// lease. Returns false when the guard does not match.
    async fn complete_job(&self, id: &str, client_id: &str, output: &str) -> Result<bool>;

    /// Transition ACTIVE → FAILED. Requires ownership; a timed-out job may
    /// still record its failure.
    async fn fail_job(&self, id: &str, client_id: &str, error: &SerializedError) -> Result<bool>;

    /// Transition CREATED or ACTIVE → CANCELLED.
    async fn cancel_job(&self, id: &str) -> Result<bool>;

    /// Re-enqueue a terminal job as a fresh CREATED sibling. Returns the new
    /// job id, or `None` when the source is not terminal or a non-terminal
    /// sibling with the same identity already exists.
    async fn retry_job(&self, id: &str) -> Result<Option<String>>;

    /// Delete a non-ACTIVE job (steps cascade).
    async fn delete_job(&self, id: &str) -> Result<bool>;

    /// Bulk delete matching jobs, always excluding ACTIVE rows.
    async fn delete_jobs(&self, filters: &JobFilters) -> Result<u64>;

    /// Atomically claim up to `batch` CREATED jobs under per-group admission.
    /// `action_names`, when given, restricts admission to those actions.
    async fn fetch_and_admit(
        &self,
        batch: u32,
        client_id: &str,
        action_names: Option<&[String]>,
    ) -> Result<Vec<JobDbModel>>;

    /// Reset ACTIVE jobs owned by suspect clients back to CREATED. Steps of
    /// jobs whose checksum is not in `known_checksums` are deleted.
    async fn recover_jobs(&self, suspects: &[String], known_checksums: &[String]) -> Result<u64>;

    async fn get_job_by_id(&self, id: &str) -> Result<Option<JobDbModel>>;
    async fn get_job_status(&self, id: &str) -> Result<Option<JobStatus>>;

    /// List jobs with filters, pagination and sort; returns `(rows, total)`.
    async fn get_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
        sort: &JobSort,
    ) -> Result<(Vec<JobDbModel>, u64)>;

    /// Per-action aggregates: count-by-status and latest creation instant.
    async fn get_actions(&self) -> Result<Vec<ActionSummary>>;

    /// Distinct client ids holding ACTIVE leases, excluding the caller's.
    async fn distinct_active_client_ids(&self, exclude: &str) -> Result<Vec<String>>;
}

/// SQLx implementation of [`JobRepository`].
pub struct SqlxJobRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxJobRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    /// Append filter conditions to a WHERE clause under construction.
    fn push_filter_sql(sql: &mut String, filters: &JobFilters) {
        if filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filters.action_name.is_some() {
            sql.push_str(" AND action_name = ?");
        }
        if filters.group_key.is_some() {
            sql.push_str(" AND group_key = ?");
        }
        if filters.client_id.is_some() {
            sql.push_str(" AND client_id = ?");
        }
        if filters.from_ms.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filters.to_ms.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        if filters.search.is_some() {
            sql.push_str(" AND (id LIKE ? OR input LIKE ?)");
        }
    }

    fn bind_filters<'q, O>(
        mut query: sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
        filters: &'q JobFilters,
        search_pattern: &'q Option<String>,
    ) -> sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
        if let Some(status) = &filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(action_name) = &filters.action_name {
            query = query.bind(action_name);
        }
        if let Some(group_key) = &filters.group_key {
            query = query.bind(group_key);
        }
        if let Some(client_id) = &filters.client_id {
            query = query.bind(client_id);
        }
        if let Some(from_ms) = filters.from_ms {
            query = query.bind(from_ms);
        }
        if let Some(to_ms) = filters.to_ms {
            query = query.bind(to_ms);
        }
        if let Some(pattern) = search_pattern {
            query = query.bind(pattern).bind(pattern);
        }
        query
    }

    fn search_pattern(filters: &JobFilters) -> Option<String> {
        filters.search.as_ref().map(|s| format!("%{s}%"))
    }

    /// Effective group limit: the `concurrency_limit` of the most recently
    /// created job in the pair whose lease has not expired. Rows without a
    /// lease deadline (CREATED/terminal) count as non-expired.
    async fn effective_group_limit(
        conn: &mut sqlx::SqliteConnection,
        action_name: &str,
        group_key: &str,
        now: i64,
    ) -> Result<Option<i64>> {
        let limit: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT concurrency_limit
            FROM jobs
            WHERE action_name = ? AND group_key = ?
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(action_name)
        .bind(group_key)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(limit)
    }

    async fn active_count(
        conn: &mut sqlx::SqliteConnection,
        action_name: &str,
        group_key: &str,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE action_name = ? AND group_key = ? AND status = 'ACTIVE'",
        )
        .bind(action_name)
        .bind(group_key)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        with_busy_retry("create_job", || async move {
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, action_name, group_key, status, checksum, input, output, error,
                    timeout_ms, expires_at, started_at, finished_at, client_id,
                    concurrency_limit, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.action_name)
            .bind(&job.group_key)
            .bind(&job.status)
            .bind(&job.checksum)
            .bind(&job.input)
            .bind(&job.output)
            .bind(&job.error)
            .bind(job.timeout_ms)
            .bind(job.expires_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(&job.client_id)
            .bind(job.concurrency_limit)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(tx.conn())
            .await?;

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::JobAvailable {
                    job_id: job.id.clone(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn complete_job(&self, id: &str, client_id: &str, output: &str) -> Result<bool> {
        with_busy_retry("complete_job", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let res = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'COMPLETED', output = ?, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND client_id = ? AND expires_at > ?
                "#,
            )
            .bind(output)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(client_id)
            .bind(now)
            .execute(tx.conn())
            .await?;

            if res.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::JobStatusChanged {
                    job_id: id.to_string(),
                    status: JobStatus::Completed,
                    client_id: Some(client_id.to_string()),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn fail_job(&self, id: &str, client_id: &str, error: &SerializedError) -> Result<bool> {
        let error_json = error.to_json();
        let error_json = &error_json;
        with_busy_retry("fail_job", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let res = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'FAILED', error = ?, finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND client_id = ?
                "#,
            )
            .bind(error_json)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(client_id)
            .execute(tx.conn())
            .await?;

            if res.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::JobStatusChanged {
                    job_id: id.to_string(),
                    status: JobStatus::Failed,
                    client_id: Some(client_id.to_string()),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn cancel_job(&self, id: &str) -> Result<bool> {
        with_busy_retry("cancel_job", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let owner: Option<Option<String>> = sqlx::query_scalar(
                r#"
                UPDATE jobs
                SET status = 'CANCELLED', finished_at = ?, updated_at = ?
                WHERE id = ? AND status IN ('CREATED', 'ACTIVE')
                RETURNING client_id
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(tx.conn())
            .await?;

            let Some(client_id) = owner else {
                tx.rollback().await?;
                return Ok(false);
            };

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::JobStatusChanged {
                    job_id: id.to_string(),
                    status: JobStatus::Cancelled,
                    client_id,
                },
            )
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn retry_job(&self, id: &str) -> Result<Option<String>> {
        with_busy_retry("retry_job", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let source = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(tx.conn())
                .await?;

            let Some(source) = source else {
                tx.rollback().await?;
                return Ok(None);
            };
            if !source.is_terminal() {
                tx.rollback().await?;
                return Ok(None);
            }

            // A concurrent retry may already have produced a live sibling for
            // the same identity tuple.
            let siblings: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM jobs
                WHERE action_name = ? AND group_key = ? AND checksum = ? AND input = ?
                  AND status IN ('CREATED', 'ACTIVE')
                "#,
            )
            .bind(&source.action_name)
            .bind(&source.group_key)
            .bind(&source.checksum)
            .bind(&source.input)
            .fetch_one(tx.conn())
            .await?;

            if siblings > 0 {
                tx.rollback().await?;
                return Ok(None);
            }

            let limit = Self::effective_group_limit(
                tx.conn(),
                &source.action_name,
                &source.group_key,
                now,
            )
            .await?
            .unwrap_or(source.concurrency_limit);

            let replacement = JobDbModel::new(
                source.action_name.clone(),
                source.group_key.clone(),
                source.input.clone(),
                source.timeout_ms,
                source.checksum.clone(),
                limit,
            );

            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, action_name, group_key, status, checksum, input, output, error,
                    timeout_ms, expires_at, started_at, finished_at, client_id,
                    concurrency_limit, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, NULL, NULL, NULL, NULL, ?, ?, ?)
                "#,
            )
            .bind(&replacement.id)
            .bind(&replacement.action_name)
            .bind(&replacement.group_key)
            .bind(&replacement.status)
            .bind(&replacement.checksum)
            .bind(&replacement.input)
            .bind(replacement.timeout_ms)
            .bind(replacement.concurrency_limit)
            .bind(replacement.created_at)
            .bind(replacement.updated_at)
            .execute(tx.conn())
            .await?;

            NotificationOutbox::enqueue(
                tx.conn(),
                &Notification::JobAvailable {
                    job_id: replacement.id.clone(),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(Some(replacement.id))
        })
        .await
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        with_busy_retry("delete_job", || async move {
            let res = sqlx::query("DELETE FROM jobs WHERE id = ? AND status != 'ACTIVE'")
                .bind(id)
                .execute(&self.write_pool)
                .await?;
            Ok(res.rows_affected() > 0)
        })
        .await
    }

    async fn delete_jobs(&self, filters: &JobFilters) -> Result<u64> {
        if filters.status == Some(JobStatus::Active) {
            return Ok(0);
        }

        let mut sql = String::from("DELETE FROM jobs WHERE status != 'ACTIVE'");
        Self::push_filter_sql(&mut sql, filters);
        let search_pattern = Self::search_pattern(filters);
        let search_pattern = search_pattern.as_deref();
        let sql = &sql;

        with_busy_retry("delete_jobs", || {
            async move {
                let mut query = sqlx::query(sql);
                if let Some(status) = &filters.status {
                    query = query.bind(status.as_str());
                }
                if let Some(action_name) = &filters.action_name {
                    query = query.bind(action_name);
                }
                if let Some(group_key) = &filters.group_key {
                    query = query.bind(group_key);
                }
                if let Some(client_id) = &filters.client_id {
                    query = query.bind(client_id);
                }
                if let Some(from_ms) = filters.from_ms {
                    query = query.bind(from_ms);
                }
                if let Some(to_ms) = filters.to_ms {
                    query = query.bind(to_ms);
                }
                if let Some(pattern) = search_pattern {
                    query = query.bind(pattern).bind(pattern);
                }

                let res = query.execute(&self.write_pool).await?;
                Ok(res.rows_affected())
            }
        })
        .await
    }

    async fn fetch_and_admit(
        &self,
        batch: u32,
        client_id: &str,
        action_names: Option<&[String]>,
    ) -> Result<Vec<JobDbModel>> {
        if batch == 0 {
            return Ok(Vec::new());
        }

        with_busy_retry("fetch_and_admit", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            // Pairs with CREATED work, optionally restricted to the actions
            // this worker can run.
            let pairs: Vec<(String, String)> = match action_names {
                Some(names) if !names.is_empty() => {
                    let placeholders =
                        names.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                    let sql = format!(
                        "SELECT DISTINCT action_name, group_key FROM jobs \
                         WHERE status = 'CREATED' AND action_name IN ({placeholders})"
                    );
                    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
                    for name in names {
                        query = query.bind(name);
                    }
                    query.fetch_all(tx.conn()).await?
                }
                Some(_) => Vec::new(),
                None => {
                    sqlx::query_as::<_, (String, String)>(
                        "SELECT DISTINCT action_name, group_key FROM jobs WHERE status = 'CREATED'",
                    )
                    .fetch_all(tx.conn())
                    .await?
                }
            };

            // Rank CREATED jobs per eligible pair and take each pair's
            // headroom, then order the union globally and cap to the batch.
            let mut candidates: Vec<(i64, String)> = Vec::new();
            for (action_name, group_key) in &pairs {
                let limit =
                    Self::effective_group_limit(tx.conn(), action_name, group_key, now)
                        .await?
                        .unwrap_or(0);
                let active = Self::active_count(tx.conn(), action_name, group_key).await?;
                let headroom = limit - active;
                if headroom <= 0 {
                    continue;
                }

                let rows: Vec<(i64, String)> = sqlx::query_as(
                    r#"
                    SELECT created_at, id
                    FROM jobs
                    WHERE action_name = ? AND group_key = ? AND status = 'CREATED'
                    ORDER BY created_at ASC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(action_name)
                .bind(group_key)
                .bind(headroom)
                .fetch_all(tx.conn())
                .await?;
                candidates.extend(rows);
            }

            candidates.sort();
            candidates.truncate(batch as usize);

            // Re-verify each selected job against its own stored limit before
            // writing; earlier admissions in this batch are visible to the
            // count, so a pair can never overshoot within one claim either.
            let mut claimed = Vec::new();
            for (_, job_id) in &candidates {
                let row: Option<(String, String, i64)> = sqlx::query_as(
                    "SELECT action_name, group_key, concurrency_limit FROM jobs WHERE id = ?",
                )
                .bind(job_id)
                .fetch_optional(tx.conn())
                .await?;
                let Some((action_name, group_key, own_limit)) = row else {
                    continue;
                };

                let active = Self::active_count(tx.conn(), &action_name, &group_key).await?;
                if active >= own_limit {
                    continue;
                }

                let admitted = sqlx::query_as::<_, JobDbModel>(
                    r#"
                    UPDATE jobs
                    SET status = 'ACTIVE',
                        started_at = ?,
                        expires_at = ? + timeout_ms,
                        client_id = ?,
                        updated_at = ?
                    WHERE id = ? AND status = 'CREATED'
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(client_id)
                .bind(now)
                .bind(job_id)
                .fetch_optional(tx.conn())
                .await?;

                if let Some(job) = admitted {
                    NotificationOutbox::enqueue(
                        tx.conn(),
                        &Notification::JobStatusChanged {
                            job_id: job.id.clone(),
                            status: JobStatus::Active,
                            client_id: Some(client_id.to_string()),
                        },
                    )
                    .await?;
                    claimed.push(job);
                }
            }

            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }

    async fn recover_jobs(&self, suspects: &[String], known_checksums: &[String]) -> Result<u64> {
        if suspects.is_empty() {
            return Ok(0);
        }

        let known: HashSet<&str> = known_checksums.iter().map(String::as_str).collect();
        let known = &known;

        with_busy_retry("recover_jobs", || async move {
            let now = now_ms();
            let mut tx = WriteTxn::begin(&self.write_pool).await?;

            let placeholders = suspects.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT id, checksum FROM jobs \
                 WHERE status = 'ACTIVE' AND client_id IN ({placeholders})"
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for suspect in suspects {
                query = query.bind(suspect);
            }
            let orphans = query.fetch_all(tx.conn()).await?;

            if orphans.is_empty() {
                tx.rollback().await?;
                return Ok(0);
            }

            for (job_id, checksum) in &orphans {
                // The action code changed under this job; its step history is
                // no longer trustworthy.
                if !known.contains(checksum.as_str()) {
                    sqlx::query("DELETE FROM job_steps WHERE job_id = ?")
                        .bind(job_id)
                        .execute(tx.conn())
                        .await?;
                }

                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'CREATED',
                        started_at = NULL,
                        expires_at = NULL,
                        finished_at = NULL,
                        output = NULL,
                        error = NULL,
                        client_id = NULL,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(job_id)
                .execute(tx.conn())
                .await?;

                NotificationOutbox::enqueue(
                    tx.conn(),
                    &Notification::JobAvailable {
                        job_id: job_id.clone(),
                    },
                )
                .await?;
            }

            tx.commit().await?;
            Ok(orphans.len() as u64)
        })
        .await
    }

    async fn get_job_by_id(&self, id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_job_status(&self, id: &str) -> Result<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref().and_then(JobStatus::parse))
    }

    async fn get_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
        sort: &JobSort,
    ) -> Result<(Vec<JobDbModel>, u64)> {
        let search_pattern = Self::search_pattern(filters);

        let mut count_sql = String::from("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
        Self::push_filter_sql(&mut count_sql, filters);
        let total: i64 =
            Self::bind_filters(sqlx::query_as(&count_sql), filters, &search_pattern)
                .fetch_one(&self.pool)
                .await
                .map(|(count,): (i64,)| count)?;

        let mut page_sql = String::from("SELECT * FROM jobs WHERE 1 = 1");
        Self::push_filter_sql(&mut page_sql, filters);
        page_sql.push_str(&format!(
            " ORDER BY {} {}, id {} LIMIT ? OFFSET ?",
            sort.field.column(),
            sort.direction.keyword(),
            sort.direction.keyword(),
        ));

        let jobs = Self::bind_filters(
            sqlx::query_as::<_, JobDbModel>(&page_sql),
            filters,
            &search_pattern,
        )
        .bind(pagination.limit)
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((jobs, total.max(0) as u64))
    }

    async fn get_actions(&self) -> Result<Vec<ActionSummary>> {
        let rows: Vec<(String, i64, i64, i64, i64, i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT action_name,
                   SUM(status = 'CREATED'),
                   SUM(status = 'ACTIVE'),
                   SUM(status = 'COMPLETED'),
                   SUM(status = 'FAILED'),
                   SUM(status = 'CANCELLED'),
                   MAX(created_at)
            FROM jobs
            GROUP BY action_name
            ORDER BY action_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(action_name, created, active, completed, failed, cancelled, last)| {
                    ActionSummary {
                        action_name,
                        counts: JobCounts {
                            created: created.max(0) as u64,
                            active: active.max(0) as u64,
                            completed: completed.max(0) as u64,
                            failed: failed.max(0) as u64,
                            cancelled: cancelled.max(0) as u64,
                        },
                        last_created_at: last,
                    }
                },
            )
            .collect())
    }

    async fn distinct_active_client_ids(&self, exclude: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT client_id
            FROM jobs
            WHERE status = 'ACTIVE' AND client_id IS NOT NULL AND client_id != ?
            "#,
        )
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
