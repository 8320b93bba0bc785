use crate::error::{CoreError, CoreResult};
use crate::model::{DlqJob, Job, JobEvent, JobStatus, NewJob, Schedule};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

/// Transactional persistence for jobs, events, DLQ rows and schedules.
///
/// All multi-statement operations run inside a single `sqlx` transaction so a
/// crashed connection leaves no partial state (spec §4.1 "Failure").
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub async fn insert_job(&self, req: NewJob) -> CoreResult<Job> {
        let def_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM job_definitions WHERE key = $1 AND version = $2)",
        )
        .bind(&req.definition_key)
        .bind(req.definition_version)
        .fetch_one(&self.pool)
        .await?;

        if !def_exists {
            return Err(CoreError::UnknownDefinition {
                key: req.definition_key,
                version: req.definition_version,
            });
        }

        if let Some(idem_key) = &req.idempotency_key {
            if let Some(existing) = self
                .find_non_terminal_by_idempotency(idem_key, &req.definition_key, req.definition_version)
                .await?
            {
                return Ok(existing);
            }
        }

        let inserted = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                definition_key, definition_version, params, status,
                priority, attempts, max_attempts, scheduled_at, queued_at,
                idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, now(), $8)
            ON CONFLICT (idempotency_key, definition_key, definition_version)
                WHERE idempotency_key IS NOT NULL
                  AND status IN ('queued', 'running', 'cancelling')
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&req.definition_key)
        .bind(req.definition_version)
        .bind(&req.params)
        .bind(JobStatus::Queued.as_str())
        .bind(req.priority)
        .bind(req.max_attempts)
        .bind(req.scheduled_at)
        .bind(&req.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = inserted {
            debug!(job_id = %job.id, definition_key = %job.definition_key, "inserted job");
            return Ok(job);
        }

        // We lost the insert race (ON CONFLICT DO NOTHING). The winner is
        // visible now; every concurrent caller converges on it.
        if let Some(idem_key) = &req.idempotency_key {
            if let Some(existing) = self
                .find_non_terminal_by_idempotency(idem_key, &req.definition_key, req.definition_version)
                .await?
            {
                debug!(job_id = %existing.id, definition_key = %existing.definition_key, "converged on existing idempotent job");
                return Ok(existing);
            }
        }

        Err(CoreError::TransientStore(sqlx::Error::RowNotFound))
    }

    async fn find_non_terminal_by_idempotency(
        &self,
        idempotency_key: &str,
        definition_key: &str,
        definition_version: i32,
    ) -> CoreResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE idempotency_key = $1
              AND definition_key = $2
              AND definition_version = $3
              AND status IN ('queued', 'running', 'cancelling')
            "#,
        )
        .bind(idempotency_key)
        .bind(definition_key)
        .bind(definition_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Claim / lease
    // ------------------------------------------------------------------

    pub async fn claim_one(&self, worker_id: &str, lease_seconds: i64) -> CoreResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'queued'
              AND (scheduled_at IS NULL OR scheduled_at <= now())
              AND cancel_requested_at IS NULL
            ORDER BY priority DESC, queued_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let leased = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running',
                worker_id = $2,
                started_at = now(),
                heartbeat_at = now(),
                lease_expires_at = now() + ($3 * interval '1 second')
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job_id = %leased.id, worker_id, definition_key = %leased.definition_key, "claimed job");
        Ok(Some(leased))
    }

    pub async fn heartbeat(&self, job_id: Uuid, lease_seconds: i64) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = now(),
                lease_expires_at = now() + ($2 * interval '1 second')
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .bind(lease_seconds as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `false` if the update affected no rows (lease already lost to
    /// a reclaimer — spec §7 `LeaseLost`).
    pub async fn heartbeat_checked(&self, job_id: Uuid, lease_seconds: i64) -> CoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = now(),
                lease_expires_at = now() + ($2 * interval '1 second')
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .bind(lease_seconds as f64)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn is_cancel_requested(&self, job_id: Uuid) -> CoreResult<bool> {
        let requested: Option<bool> = sqlx::query_scalar(
            "SELECT cancel_requested_at IS NOT NULL FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(requested.unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Terminal / intermediate transitions
    // ------------------------------------------------------------------

    pub async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_summary: Option<&str>,
    ) -> CoreResult<()> {
        if status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = $2, finished_at = now(), error_summary = $3,
                    worker_id = NULL, lease_expires_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(status.as_str())
            .bind(error_summary)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = $2, error_summary = COALESCE($3, error_summary)
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(status.as_str())
            .bind(error_summary)
            .execute(&self.pool)
            .await?;
        }
        debug!(job_id = %job_id, status = status.as_str(), "set job status");
        Ok(())
    }

    pub async fn increment_attempts(&self, job_id: Uuid) -> CoreResult<i32> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE jobs SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }

    pub async fn schedule_retry(&self, job_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                scheduled_at = $2,
                queued_at = now(),
                worker_id = NULL,
                started_at = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        debug!(job_id = %job_id, scheduled_at = %at, "scheduled retry");
        Ok(())
    }

    pub async fn request_cancel(&self, job_id: Uuid) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(status) = current else {
            return Err(CoreError::InvalidTransition("job not found".to_string()));
        };

        match JobStatus::from_str(&status) {
            Some(JobStatus::Queued) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET cancel_requested_at = now(),
                        status = 'cancelled',
                        finished_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO job_events (job_id, event_type, payload) VALUES ($1, 'cancelled', $2)",
                )
                .bind(job_id)
                .bind(serde_json::json!({ "reason": "cancelled_while_queued" }))
                .execute(&mut *tx)
                .await?;
            }
            Some(JobStatus::Running) => {
                sqlx::query(
                    "UPDATE jobs SET cancel_requested_at = now(), status = 'cancelling' WHERE id = $1",
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            }
            Some(JobStatus::Cancelling) => {
                // Already cancelling; idempotent no-op, just (re)stamp the flag.
                sqlx::query("UPDATE jobs SET cancel_requested_at = now() WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
            }
            _ => {
                return Err(CoreError::InvalidTransition(format!(
                    "cannot cancel job in status {status}"
                )));
            }
        }

        tx.commit().await?;
        debug!(job_id = %job_id, from_status = %status, "requested cancel");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Orphan reclaim
    // ------------------------------------------------------------------

    pub async fn reclaim_orphans(&self) -> CoreResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                worker_id = NULL,
                started_at = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL,
                queued_at = now()
            WHERE status IN ('running', 'cancelling')
              AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        let reclaimed = res.rows_affected();
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed orphaned jobs");
        }
        Ok(reclaimed)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub async fn append_event(
        &self,
        job_id: Uuid,
        event_type: &str,
        payload: Option<Value>,
    ) -> CoreResult<()> {
        sqlx::query("INSERT INTO job_events (job_id, event_type, payload) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(event_type)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_events(&self, job_id: Uuid) -> CoreResult<Vec<JobEvent>> {
        let rows = sqlx::query_as::<_, JobEvent>(
            "SELECT * FROM job_events WHERE job_id = $1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // DLQ
    // ------------------------------------------------------------------

    pub async fn move_to_dlq(&self, job_id: Uuid, error_summary: &str) -> CoreResult<DlqJob> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::InvalidTransition("job not found".to_string()))?;

        let dlq_row = sqlx::query_as::<_, DlqJob>(
            r#"
            INSERT INTO jobs_dlq (
                original_job_id, definition_key, definition_version, params,
                priority, attempts, max_attempts, idempotency_key,
                error_summary, queued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.definition_key)
        .bind(job.definition_version)
        .bind(&job.params)
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.idempotency_key)
        .bind(error_summary)
        .bind(job.queued_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM job_events WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(job_id = %job_id, dlq_id = %dlq_row.id, definition_key = %dlq_row.definition_key, "moved job to dlq");
        Ok(dlq_row)
    }

    pub async fn get_dlq(&self, dlq_id: Uuid) -> CoreResult<Option<DlqJob>> {
        let row = sqlx::query_as::<_, DlqJob>("SELECT * FROM jobs_dlq WHERE id = $1")
            .bind(dlq_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_dlq(&self, limit: i64) -> CoreResult<Vec<DlqJob>> {
        let limit = limit.clamp(1, 500);
        let rows = sqlx::query_as::<_, DlqJob>(
            "SELECT * FROM jobs_dlq ORDER BY moved_to_dlq_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn retry_dlq(
        &self,
        dlq_id: Uuid,
        max_attempts_override: Option<i32>,
    ) -> CoreResult<Uuid> {
        let dlq_row = self
            .get_dlq(dlq_id)
            .await?
            .ok_or_else(|| CoreError::InvalidTransition("dlq row not found".to_string()))?;

        let max_attempts = max_attempts_override.unwrap_or(dlq_row.max_attempts);

        let new_job = self
            .insert_job(NewJob {
                definition_key: dlq_row.definition_key,
                definition_version: dlq_row.definition_version,
                params: dlq_row.params,
                priority: dlq_row.priority,
                max_attempts,
                scheduled_at: None,
                idempotency_key: dlq_row.idempotency_key,
            })
            .await?;

        Ok(new_job.id)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_job(&self, job_id: Uuid) -> CoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_jobs(&self, status: Option<&str>, limit: i64) -> CoreResult<Vec<Job>> {
        let limit = limit.clamp(1, 500);
        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE status = $1 ORDER BY priority DESC, queued_at ASC LIMIT $2",
                )
                .bind(st)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs ORDER BY priority DESC, queued_at ASC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn running_count_for_definition(
        &self,
        definition_key: &str,
        definition_version: i32,
    ) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE definition_key = $1 AND definition_version = $2 AND status = 'running'",
        )
        .bind(definition_key)
        .bind(definition_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    pub async fn upsert_definition(
        &self,
        key: &str,
        version: i32,
        default_max_attempts: i32,
        timeout_seconds: i32,
        concurrency_limit: i32,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_definitions (key, version, default_max_attempts, timeout_seconds, concurrency_limit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key, version) DO UPDATE
            SET default_max_attempts = EXCLUDED.default_max_attempts,
                timeout_seconds = EXCLUDED.timeout_seconds,
                concurrency_limit = EXCLUDED.concurrency_limit
            "#,
        )
        .bind(key)
        .bind(version)
        .bind(default_max_attempts)
        .bind(timeout_seconds)
        .bind(concurrency_limit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_definition(
        &self,
        key: &str,
        version: i32,
    ) -> CoreResult<Option<crate::model::JobDefinition>> {
        let row = sqlx::query_as::<_, crate::model::JobDefinition>(
            "SELECT * FROM job_definitions WHERE key = $1 AND version = $2",
        )
        .bind(key)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    pub async fn list_enabled_schedules(&self) -> CoreResult<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE enabled = true")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn mark_schedule_enqueued(&self, schedule_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE schedules SET last_enqueued_at = $2 WHERE id = $1")
            .bind(schedule_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Leader election
    // ------------------------------------------------------------------

    /// Session-scoped advisory lock. Must be released on the same
    /// connection; callers hold a dedicated `PgConnection` for the
    /// lifetime of leadership (see `scheduler.rs`).
    pub async fn try_advisory_lock(
        conn: &mut sqlx::PgConnection,
        key: i64,
    ) -> CoreResult<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn)
            .await?;
        Ok(acquired)
    }

    pub async fn advisory_unlock(conn: &mut sqlx::PgConnection, key: i64) -> CoreResult<()> {
        let _: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(conn)
            .await?;
        Ok(())
    }
}
