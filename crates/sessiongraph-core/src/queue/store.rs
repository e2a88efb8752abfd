//! SQLite-backed job queue with leases
//!
//! Claiming a job is one conditional UPDATE: it succeeds only if the job is
//! pending and due, or running with an expired lease. No other lock exists,
//! so workers in separate processes coordinate through the database alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::{format_timestamp, parse_optional_timestamp, parse_timestamp};

use super::job::{Job, JobStatus, JobType, NewJob};

/// Candidates examined per dequeue attempt
const DEQUEUE_CANDIDATES: i64 = 16;

/// Queue bounds and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending plus running jobs
    pub max_queue_size: usize,
    /// Retries allowed after the first failure
    pub max_retries: u32,
    /// Delay before a failed job becomes claimable again
    pub retry_delay_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_retries: 3,
            retry_delay_seconds: 60,
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was created, possibly evicting a less urgent one
    Created { job_id: String, evicted: Option<String> },
    /// An active job for the same target already exists
    Duplicate { job_id: String },
}

impl Enqueued {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Created { job_id, .. } | Self::Duplicate { job_id } => job_id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// Job counts by status, plus active jobs per type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_by_type: BTreeMap<String, u64>,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn active(&self) -> u64 {
        self.pending + self.running
    }
}

/// Persistent priority queue for daemon jobs
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a job unless an active job for the same target exists
    ///
    /// When the queue is full, the new job is accepted only if it is strictly
    /// more urgent than the least urgent pending job, which is then failed
    /// as evicted. Otherwise `QueueFull` is returned.
    pub async fn enqueue(&self, job: NewJob) -> Result<Enqueued> {
        let now = format_timestamp(Utc::now());
        // take the write lock up front; a deferred transaction that reads
        // first cannot upgrade once another connection has committed
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM analysis_queue
            WHERE job_type = ?
              AND session_file IS ? AND segment_end IS ? AND node_id IS ?
              AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(&job.session_file)
        .bind(&job.segment_end)
        .bind(&job.node_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((job_id,)) = existing {
            debug!(job_id = %job_id, job_type = %job.job_type, "Duplicate job not enqueued");
            return Ok(Enqueued::Duplicate { job_id });
        }

        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM analysis_queue WHERE status IN ('pending', 'running')",
        )
        .fetch_one(&mut *tx)
        .await?;

        let mut evicted = None;
        if active as usize >= self.config.max_queue_size {
            let victim: Option<(String, i64)> = sqlx::query_as(
                r#"
                SELECT id, priority FROM analysis_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, queued_at DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            match victim {
                Some((victim_id, priority)) if priority > job.priority => {
                    sqlx::query(
                        r#"
                        UPDATE analysis_queue
                        SET status = 'failed', error = 'evicted', completed_at = ?
                        WHERE id = ? AND status = 'pending'
                        "#,
                    )
                    .bind(&now)
                    .bind(&victim_id)
                    .execute(&mut *tx)
                    .await?;
                    evicted = Some(victim_id);
                }
                _ => {
                    warn!(
                        job_type = %job.job_type,
                        active = active,
                        "Queue full, job rejected"
                    );
                    return Err(Error::QueueFull(active as usize));
                }
            }
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO analysis_queue (
                id, job_type, priority, status, session_file, segment_start, segment_end,
                node_id, context, retry_count, max_retries, queued_at
            ) VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(&job.session_file)
        .bind(&job.segment_start)
        .bind(&job.segment_end)
        .bind(&job.node_id)
        .bind(serde_json::to_string(&job.context)?)
        .bind(job.max_retries.unwrap_or(self.config.max_retries) as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(victim) = &evicted {
            info!(job_id = %job_id, evicted = %victim, "Evicted less urgent job to make room");
        }
        debug!(
            job_id = %job_id,
            job_type = %job.job_type,
            priority = job.priority,
            "Job enqueued"
        );
        Ok(Enqueued::Created { job_id, evicted })
    }

    /// Claim a specific job for `worker_id` until `now + lease`
    ///
    /// Fails with `LeaseConflict` if the job is not claimable, which includes
    /// a job another worker holds a live lease on.
    pub async fn try_claim(&self, job_id: &str, worker_id: &str, lease: Duration) -> Result<Job> {
        let now = Utc::now();
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE analysis_queue
            SET status = 'running',
                worker_id = ?,
                locked_until = ?,
                started_at = ?
            WHERE id = ?
              AND (
                (status = 'pending' AND (run_after IS NULL OR run_after <= ?))
                OR (status = 'running' AND locked_until < ?)
              )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(format_timestamp(now + lease))
        .bind(format_timestamp(now))
        .bind(job_id)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let job = row.into_job()?;
                debug!(job_id = %job_id, worker_id = %worker_id, "Job claimed");
                Ok(job)
            }
            None if self.get(job_id).await?.is_none() => Err(Error::JobNotFound(job_id.to_string())),
            None => Err(Error::LeaseConflict(job_id.to_string())),
        }
    }

    /// Claim the most urgent claimable job of one of `job_types`
    ///
    /// Lost races are skipped silently in favour of the next candidate.
    pub async fn dequeue(&self, worker_id: &str, lease: Duration, job_types: &[JobType]) -> Result<Option<Job>> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let now = format_timestamp(Utc::now());
        let placeholders = vec!["?"; job_types.len()].join(", ");
        let sql = format!(
            r#"
            SELECT id FROM analysis_queue
            WHERE job_type IN ({placeholders})
              AND (
                (status = 'pending' AND (run_after IS NULL OR run_after <= ?))
                OR (status = 'running' AND locked_until < ?)
              )
            ORDER BY priority ASC, queued_at ASC
            LIMIT ?
            "#
        );

        let mut query = sqlx::query_as::<_, (String,)>(&sql);
        for job_type in job_types {
            query = query.bind(job_type.as_str());
        }
        let candidates = query
            .bind(&now)
            .bind(&now)
            .bind(DEQUEUE_CANDIDATES)
            .fetch_all(&self.pool)
            .await?;

        for (job_id,) in candidates {
            match self.try_claim(&job_id, worker_id, lease).await {
                Ok(job) => return Ok(Some(job)),
                Err(Error::LeaseConflict(_)) | Err(Error::JobNotFound(_)) => {
                    debug!(job_id = %job_id, worker_id = %worker_id, "Lost claim race, trying next job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Mark a job completed; the caller must still hold the lease
    pub async fn complete(&self, job_id: &str, worker_id: &str, result_node_id: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue
            SET status = 'completed', completed_at = ?, result_node_id = ?,
                locked_until = NULL, error = NULL
            WHERE id = ? AND status = 'running' AND worker_id = ?
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(result_node_id)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseConflict(job_id.to_string()));
        }
        info!(job_id = %job_id, worker_id = %worker_id, "Job completed");
        Ok(())
    }

    /// Record a failure and either schedule a retry or give up
    ///
    /// A job is retried while `retry_count < max_retries`, incrementing the
    /// count; after that it is failed with the count left as is. Returns the
    /// resulting status.
    pub async fn fail(&self, job_id: &str, worker_id: &str, error: &str) -> Result<JobStatus> {
        let now = Utc::now();
        let run_after = now + Duration::seconds(self.config.retry_delay_seconds as i64);

        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE analysis_queue
            SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                run_after = CASE WHEN retry_count < max_retries THEN ? ELSE run_after END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ? END,
                worker_id = CASE WHEN retry_count < max_retries THEN NULL ELSE worker_id END,
                locked_until = NULL,
                error = ?
            WHERE id = ? AND status = 'running' AND worker_id = ?
            RETURNING status, retry_count
            "#,
        )
        .bind(format_timestamp(run_after))
        .bind(format_timestamp(now))
        .bind(error)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, retry_count)) = row else {
            return Err(Error::LeaseConflict(job_id.to_string()));
        };
        let status = JobStatus::parse(&status).unwrap_or(JobStatus::Failed);

        match status {
            JobStatus::Failed => warn!(
                job_id = %job_id,
                retry_count = retry_count,
                error = %error,
                "Job failed, retries exhausted"
            ),
            _ => info!(
                job_id = %job_id,
                retry_count = retry_count,
                error = %error,
                "Job failed, will retry"
            ),
        }
        Ok(status)
    }

    /// Fail a job without consuming or honouring its retry budget
    pub async fn fail_permanently(&self, job_id: &str, worker_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue
            SET status = 'failed', completed_at = ?, locked_until = NULL, error = ?
            WHERE id = ? AND status = 'running' AND worker_id = ?
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(error)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseConflict(job_id.to_string()));
        }
        warn!(job_id = %job_id, error = %error, "Job failed permanently");
        Ok(())
    }

    /// Return a running job to pending without counting a failure
    pub async fn release(&self, job_id: &str, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue
            SET status = 'pending', worker_id = NULL, locked_until = NULL, started_at = NULL
            WHERE id = ? AND status = 'running' AND worker_id = ?
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseConflict(job_id.to_string()));
        }
        debug!(job_id = %job_id, "Job released");
        Ok(())
    }

    /// Push the lease of a running job out to `now + lease`
    pub async fn extend_lease(&self, job_id: &str, worker_id: &str, lease: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue SET locked_until = ?
            WHERE id = ? AND status = 'running' AND worker_id = ?
            "#,
        )
        .bind(format_timestamp(Utc::now() + lease))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseConflict(job_id.to_string()));
        }
        Ok(())
    }

    /// Put failed jobs back in the queue with a fresh retry budget
    ///
    /// With `job_id` set only that job is retried; otherwise every failed job
    /// except evicted and cancelled ones.
    pub async fn retry_failed(&self, job_id: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue
            SET status = 'pending', retry_count = 0, error = NULL, worker_id = NULL,
                locked_until = NULL, run_after = NULL, started_at = NULL, completed_at = NULL
            WHERE status = 'failed'
              AND (? IS NULL AND COALESCE(error, '') NOT IN ('evicted', 'cancelled') OR id = ?)
            "#,
        )
        .bind(job_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        let retried = result.rows_affected();
        if let Some(id) = job_id {
            if retried == 0 {
                return Err(Error::JobNotFound(id.to_string()));
            }
        }
        info!(retried = retried, "Failed jobs requeued");
        Ok(retried)
    }

    /// Cancel a pending job; it is kept as failed with error `cancelled`
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_queue
            SET status = 'failed', error = 'cancelled', completed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(job_id).await? {
                None => Err(Error::JobNotFound(job_id.to_string())),
                Some(job) => Err(Error::Validation(format!(
                    "job '{job_id}' is {} and cannot be cancelled",
                    job.status.as_str()
                ))),
            };
        }
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    /// Delete completed jobs finished before `older_than`; failed jobs are kept
    pub async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM analysis_queue WHERE status = 'completed' AND completed_at < ?",
        )
        .bind(format_timestamp(older_than))
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        info!(purged = purged, "Completed jobs purged");
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM analysis_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in by_status {
            let count = count as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Running) => stats.running = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => {}
            }
        }

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT job_type, COUNT(*) FROM analysis_queue
            WHERE status IN ('pending', 'running')
            GROUP BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        stats.active_by_type = by_type.into_iter().map(|(t, c)| (t, c as u64)).collect();

        let (oldest,): (Option<String>,) =
            sqlx::query_as("SELECT MIN(queued_at) FROM analysis_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        stats.oldest_pending = parse_optional_timestamp(oldest.as_deref());

        Ok(stats)
    }

    /// Jobs in queue order, optionally restricted to one status
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM analysis_queue
            WHERE ? IS NULL OR status = ?
            ORDER BY priority ASC, queued_at ASC
            LIMIT ?
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM analysis_queue WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRow::into_job).transpose()
    }
}

/// Database row for analysis_queue table
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    priority: i64,
    status: String,
    session_file: Option<String>,
    segment_start: Option<String>,
    segment_end: Option<String>,
    node_id: Option<String>,
    context: String,
    retry_count: i64,
    max_retries: i64,
    worker_id: Option<String>,
    locked_until: Option<String>,
    queued_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    run_after: Option<String>,
    result_node_id: Option<String>,
    error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let job_type = JobType::parse(&self.job_type)
            .ok_or_else(|| Error::Validation(format!("unknown job type '{}'", self.job_type)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| Error::Validation(format!("unknown job status '{}'", self.status)))?;

        Ok(Job {
            id: self.id,
            job_type,
            priority: self.priority,
            status,
            session_file: self.session_file,
            segment_start: self.segment_start,
            segment_end: self.segment_end,
            node_id: self.node_id,
            context: serde_json::from_str(&self.context)?,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            worker_id: self.worker_id,
            locked_until: parse_optional_timestamp(self.locked_until.as_deref()),
            queued_at: parse_timestamp(&self.queued_at),
            started_at: parse_optional_timestamp(self.started_at.as_deref()),
            completed_at: parse_optional_timestamp(self.completed_at.as_deref()),
            run_after: parse_optional_timestamp(self.run_after.as_deref()),
            result_node_id: self.result_node_id,
            error: self.error,
        })
    }
}
