use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, JobState, JobStats, NewJob};
use crate::jobs::outcome::{AttemptReport, Transition};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Longest `last_output` kept per job; the tail is what survives.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct JobsRepo {
    pool: SqlitePool,
}

impl JobsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Insert a validated job as `pending`. An existing id is left untouched
    /// and reported as `DuplicateId`.
    pub async fn enqueue(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        let inserted = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, priority, timeout,
                run_at, created_at, updated_at
            )
            VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout)
        .bind(job.run_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        inserted.ok_or_else(|| QueueError::DuplicateId(job.id.clone()))
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Jobs in `state`, newest first.
    pub async fn list_by_state(&self, state: JobState, limit: Option<i64>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE state = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn list_jobs(&self, limit: Option<i64>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Rows currently held by `worker_id`.
    pub async fn list_processing_for(&self, worker_id: &str) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE state = 'processing'
              AND worker_id = $1
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'processing' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0)
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(JobStats {
            pending: row.0,
            processing: row.1,
            completed: row.2,
            failed: row.3,
            dead: row.4,
        })
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    /// Claim exactly one eligible job for `worker_id`.
    ///
    /// Eligible: fresh `pending` rows whose `run_at` has passed, and `failed`
    /// rows whose `next_retry_at` has passed, ranked together by priority
    /// then due time. Selection and ownership happen in a single UPDATE;
    /// SQLite runs it under the database write lock, so two claimers (in
    /// this process or another) can never both win the same row.
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'processing',
                worker_id = $1,
                command_pgid = NULL,
                next_retry_at = NULL,
                updated_at = $2
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE (state = 'pending' AND (run_at IS NULL OR run_at <= $2))
                   OR (state = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= $2)
                ORDER BY priority DESC,
                         COALESCE(next_retry_at, run_at, created_at) ASC,
                         created_at ASC
                LIMIT 1
            )
              AND state IN ('pending', 'failed')
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Apply the outcome of an attempt. Guarded on the row still being
    /// `processing` under `worker_id`; a miss is a `Conflict`.
    pub async fn record_result(
        &self,
        id: &str,
        worker_id: &str,
        transition: &Transition,
        report: &AttemptReport,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let (attempts, next_retry_at) = match *transition {
            Transition::Complete => (None, None),
            Transition::Retry {
                attempts,
                next_retry_at,
            } => (Some(attempts), Some(next_retry_at)),
            Transition::Dead { attempts } => (Some(attempts), None),
        };

        let output = tail(&report.output, MAX_OUTPUT_BYTES);

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = $3,
                attempts = COALESCE($4, attempts),
                next_retry_at = $5,
                worker_id = NULL,
                command_pgid = NULL,
                last_output = $6,
                last_error = $7,
                duration_ms = $8,
                updated_at = $9
            WHERE id = $1
              AND state = 'processing'
              AND worker_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(transition.state().as_str())
        .bind(attempts)
        .bind(next_retry_at)
        .bind(output)
        .bind(report.error())
        .bind(report.duration_ms)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| {
            QueueError::Conflict(format!("job '{id}' is not processing under worker '{worker_id}'"))
        })
    }

    /// Remember the process group of the command running for a held job.
    /// Leaves `updated_at` at the claim time.
    pub async fn set_command_pgid(&self, id: &str, worker_id: &str, pgid: i64) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET command_pgid = $3
            WHERE id = $1
              AND state = 'processing'
              AND worker_id = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(pgid)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(QueueError::Conflict(format!(
                "job '{id}' is not processing under worker '{worker_id}'"
            )));
        }
        Ok(())
    }

    /// `dead -> pending` with a fresh retry budget.
    pub async fn reset_for_retry_from_dlq(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                worker_id = NULL,
                command_pgid = NULL,
                next_retry_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND state = 'dead'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| QueueError::NotFound(format!("no dead job with id '{id}'")))
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::tail;

    #[test]
    fn tail_keeps_the_end_on_a_char_boundary() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        // 'é' is two bytes; cutting inside it moves forward
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("aéb", 2), "b");
    }
}
