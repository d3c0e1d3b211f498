//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - Efficient, multi-process job claiming with SKIP LOCKED
//! - Idempotent inserts for caller-supplied job ids
//! - Transactional bulk enqueue and failure bookkeeping

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use super::due_at;
use super::retention::{KeepJobs, RetentionPolicy};
use super::store::*;
use crate::job::{JobRecord, JobState, NewJob};
use crate::reliability::BackoffSpec;

const SCHEMA: &str = include_str!("../../migrations/001_job_queue.sql");

const JOB_COLUMNS: &str = "queue_name, id, seq, name, data, priority, attempts, backoff, state, \
     attempts_made, result, failed_reason, error_history, repeat, created_at, available_at, \
     processed_at, finished_at";

/// PostgreSQL implementation of JobStore
///
/// Uses a connection pool for efficient database access. Any number of worker
/// processes may share the same tables.
///
/// # Example
///
/// ```ignore
/// use atcdrill_jobs::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresJobStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and create a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to PostgreSQL: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to apply job queue schema: {}", e);
                StoreError::Database(e.to_string())
            })?;
        debug!("job queue schema ready");
        Ok(())
    }

    async fn insert_job(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        job: NewJob,
    ) -> Result<JobRecord, StoreError> {
        let backoff = to_json(&job.backoff)?;
        let repeat = job.repeat.as_ref().map(to_json).transpose()?;
        let available_at = due_at(Utc::now(), job.delay);

        let insert = format!(
            r#"
            WITH s AS (SELECT nextval('job_queue_job_seq') AS seq)
            INSERT INTO job_queue_jobs
                (queue_name, id, seq, name, data, priority, attempts, backoff, state,
                 repeat, available_at)
            SELECT $1, COALESCE($2, s.seq::text), s.seq, $3, $4, $5, $6, $7, $8, $9, $10
            FROM s
            ON CONFLICT (queue_name, id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );

        loop {
            let inserted = sqlx::query(&insert)
                .bind(queue)
                .bind(&job.job_id)
                .bind(&job.name)
                .bind(&job.data)
                .bind(job.priority)
                .bind(job.attempts as i32)
                .bind(&backoff)
                .bind(job.initial_state().as_str())
                .bind(&repeat)
                .bind(available_at)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| {
                    error!("Failed to insert job: {}", e);
                    StoreError::Database(e.to_string())
                })?;

            if let Some(row) = inserted {
                return row_to_record(&row);
            }

            let Some(job_id) = &job.job_id else {
                // A caller-supplied id took this sequence number; draw the next one
                debug!(queue, "generated job id already taken, retrying");
                continue;
            };

            // The caller-supplied id already exists
            let row = sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM job_queue_jobs WHERE queue_name = $1 AND id = $2"
            ))
            .bind(queue)
            .bind(job_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to load existing job: {}", e);
                StoreError::Database(e.to_string())
            })?;
            return row_to_record(&row);
        }
    }

    /// Move delayed jobs whose time has come to waiting
    async fn promote_due(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE job_queue_jobs
            SET state = 'waiting'
            WHERE queue_name = $1 AND state = 'delayed' AND available_at <= NOW()
            "#,
        )
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to promote delayed jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    /// Apply retention to finished jobs in `state`
    async fn prune(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        state: JobState,
        keep: &KeepJobs,
    ) -> Result<(), StoreError> {
        if let Some(cutoff) = keep.cutoff(Utc::now()) {
            sqlx::query(
                r#"
                DELETE FROM job_queue_jobs
                WHERE queue_name = $1 AND state = $2 AND finished_at < $3
                "#,
            )
            .bind(queue)
            .bind(state.as_str())
            .bind(cutoff)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to prune jobs by age: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        if let Some(count) = keep.count {
            sqlx::query(
                r#"
                DELETE FROM job_queue_jobs
                WHERE queue_name = $1 AND id IN (
                    SELECT id FROM job_queue_jobs
                    WHERE queue_name = $1 AND state = $2
                    ORDER BY finished_at DESC, seq DESC
                    OFFSET $3
                )
                "#,
            )
            .bind(queue)
            .bind(state.as_str())
            .bind(count as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to prune jobs by count: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::Database(e.to_string())
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_name = %job.name))]
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<JobRecord, StoreError> {
        let mut tx = self.begin().await?;
        let record = Self::insert_job(&mut tx, queue, job).await?;
        commit(tx).await?;

        debug!(queue, job_id = %record.id, "added job");
        Ok(record)
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut tx = self.begin().await?;
        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs {
            records.push(Self::insert_job(&mut tx, queue, job).await?);
        }
        commit(tx).await?;

        debug!(queue, count = records.len(), "added jobs in bulk");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        max_jobs: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        // Due delayed jobs are claimable directly; waiting jobs are always due
        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT queue_name, id
                FROM job_queue_jobs
                WHERE queue_name = $1
                  AND state IN ('waiting', 'delayed')
                  AND available_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM job_queue_queues q WHERE q.name = $1 AND q.paused
                  )
                ORDER BY priority, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue_jobs j
            SET state = 'active',
                claimed_by = $3,
                processed_at = NOW()
            FROM claimable c
            WHERE j.queue_name = c.queue_name AND j.id = c.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        ))
        .bind(queue)
        .bind(max_jobs as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = rows
            .iter()
            .map(|row| Ok((row.get::<i64, _>("seq"), row_to_record(row)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        // RETURNING does not preserve the CTE order
        claimed.sort_by_key(|(seq, record)| (record.priority, *seq));

        if !claimed.is_empty() {
            debug!(queue, worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed.into_iter().map(|(_, record)| record).collect())
    }

    #[instrument(skip(self, result, retention))]
    async fn complete_job(
        &self,
        queue: &str,
        job_id: &str,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE job_queue_jobs
            SET state = 'completed',
                result = $3,
                claimed_by = NULL,
                finished_at = NOW()
            WHERE queue_name = $1 AND id = $2
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .bind(&result)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to complete job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if updated.rows_affected() == 0 {
            return Err(not_found(queue, job_id));
        }

        Self::prune(&mut tx, queue, JobState::Completed, &retention.completed).await?;
        commit(tx).await
    }

    #[instrument(skip(self, error, retention))]
    async fn fail_job(
        &self,
        queue: &str,
        job_id: &str,
        error: &str,
        retryable: bool,
        retention: &RetentionPolicy,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT attempts, attempts_made, backoff
            FROM job_queue_jobs
            WHERE queue_name = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to load job for failure: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or_else(|| not_found(queue, job_id))?;

        let attempts = row.get::<i32, _>("attempts").max(0) as u32;
        let attempts_made = row.get::<i32, _>("attempts_made").max(0) as u32 + 1;
        let backoff: BackoffSpec = from_json(row.get("backoff"))?;

        let outcome = failure_outcome(attempts_made, attempts, &backoff, retryable);
        let now = Utc::now();
        let (state, available_at, finished_at): (JobState, Option<DateTime<Utc>>, _) =
            match outcome {
                FailureOutcome::WillRetry { delay, .. } if delay.is_zero() => {
                    (JobState::Waiting, Some(now), None)
                }
                FailureOutcome::WillRetry { delay, .. } => {
                    (JobState::Delayed, Some(due_at(now, delay)), None)
                }
                FailureOutcome::Failed { .. } => (JobState::Failed, None, Some(now)),
            };

        sqlx::query(
            r#"
            UPDATE job_queue_jobs
            SET state = $3,
                attempts_made = $4,
                failed_reason = $5,
                error_history = error_history || to_jsonb($5::text),
                available_at = COALESCE($6, available_at),
                finished_at = $7,
                claimed_by = NULL
            WHERE queue_name = $1 AND id = $2
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .bind(state.as_str())
        .bind(attempts_made as i32)
        .bind(error)
        .bind(available_at)
        .bind(finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to record job failure: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if !outcome.will_retry() {
            Self::prune(&mut tx, queue, JobState::Failed, &retention.failed).await?;
        }

        commit(tx).await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.promote_due(queue).await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue_jobs WHERE queue_name = $1 AND id = $2"
        ))
        .bind(queue)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(row_to_record).transpose()
    }

    #[instrument(skip(self))]
    async fn remove_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM job_queue_jobs
            WHERE queue_name = $1 AND id = $2 AND state <> 'active'
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to remove job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn retry_job(&self, queue: &str, job_id: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE job_queue_jobs
            SET state = 'waiting',
                attempts_made = 0,
                failed_reason = NULL,
                processed_at = NULL,
                finished_at = NULL,
                available_at = NOW()
            WHERE queue_name = $1 AND id = $2 AND state = 'failed'
            "#,
        )
        .bind(queue)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to retry job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        pagination: Pagination,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.promote_due(queue).await?;

        let order = match state {
            JobState::Waiting => "priority, seq",
            JobState::Delayed => "available_at, seq",
            JobState::Active => "processed_at, seq",
            JobState::Completed | JobState::Failed => "finished_at DESC, seq DESC",
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM job_queue_jobs
            WHERE queue_name = $1 AND state = $2
            ORDER BY {order}
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(queue)
        .bind(state.as_str())
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn job_counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        self.promote_due(queue).await?;
        let paused = self.is_paused(queue).await?;

        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count
            FROM job_queue_jobs
            WHERE queue_name = $1
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.get("state");
            let count = row.get::<i64, _>("count").max(0) as u64;
            match parse_state(&state)? {
                JobState::Waiting if paused => counts.paused = count,
                JobState::Waiting => counts.waiting = count,
                JobState::Active => counts.active = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
                JobState::Delayed => counts.delayed = count,
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn pause_queue(&self, queue: &str) -> Result<(), StoreError> {
        set_paused(&self.pool, queue, true).await
    }

    #[instrument(skip(self))]
    async fn resume_queue(&self, queue: &str) -> Result<(), StoreError> {
        set_paused(&self.pool, queue, false).await
    }

    #[instrument(skip(self))]
    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM job_queue_queues WHERE name = $1")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to read queue pause state: {}", e);
                    StoreError::Database(e.to_string())
                })?;
        Ok(paused.unwrap_or(false))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

async fn set_paused(pool: &PgPool, queue: &str, paused: bool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_queue_queues (name, paused)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET paused = EXCLUDED.paused
        "#,
    )
    .bind(queue)
    .bind(paused)
    .execute(pool)
    .await
    .map_err(|e| {
        error!("Failed to update queue pause state: {}", e);
        StoreError::Database(e.to_string())
    })?;

    debug!(queue, paused, "queue pause state updated");
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.commit().await.map_err(|e| {
        error!("Failed to commit transaction: {}", e);
        StoreError::Database(e.to_string())
    })
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|column| format!("{}.{}", alias, column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_record(row: &PgRow) -> Result<JobRecord, StoreError> {
    let state: String = row.get("state");
    let repeat: Option<serde_json::Value> = row.get("repeat");

    Ok(JobRecord {
        id: row.get("id"),
        queue_name: row.get("queue_name"),
        name: row.get("name"),
        data: row.get("data"),
        priority: row.get("priority"),
        attempts: row.get::<i32, _>("attempts").max(0) as u32,
        backoff: from_json(row.get("backoff"))?,
        state: parse_state(&state)?,
        attempts_made: row.get::<i32, _>("attempts_made").max(0) as u32,
        result: row.get("result"),
        failed_reason: row.get("failed_reason"),
        error_history: from_json(row.get("error_history"))?,
        repeat: repeat.map(from_json).transpose()?,
        created_at: row.get("created_at"),
        available_at: row.get("available_at"),
        processed_at: row.get("processed_at"),
        finished_at: row.get("finished_at"),
    })
}

fn parse_state(s: &str) -> Result<JobState, StoreError> {
    s.parse()
        .map_err(|e: crate::job::UnknownJobState| StoreError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn not_found(queue: &str, job_id: &str) -> StoreError {
    StoreError::JobNotFound {
        queue: queue.to_string(),
        job_id: job_id.to_string(),
    }
}
