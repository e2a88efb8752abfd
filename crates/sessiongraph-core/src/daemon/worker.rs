//! Worker loops
//!
//! A worker takes a global permit, dequeues the most urgent job whose type
//! still has capacity, and runs it while periodically extending its lease.
//! No queue transaction is open while a job runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::error::Error;
use crate::queue::{Job, JobStatus, JobType};

use super::processor::JobProcessor;

/// Shared concurrency bounds: one global semaphore for every in-flight job
/// and one per maintenance job type
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits {
    global: Arc<Semaphore>,
    per_type: HashMap<JobType, Arc<Semaphore>>,
}

/// Capacity held for one job type; analysis jobs hold nothing
#[derive(Debug)]
pub struct TypePermit(#[allow(dead_code)] Option<OwnedSemaphorePermit>);

impl ConcurrencyLimits {
    pub fn new(max_concurrent_jobs: usize, max_per_maintenance_type: usize) -> Self {
        let per_type = JobType::ALL
            .into_iter()
            .filter(|t| !t.is_analysis())
            .map(|t| (t, Arc::new(Semaphore::new(max_per_maintenance_type.max(1)))))
            .collect();
        Self {
            global: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            per_type,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.max_concurrent_jobs, config.max_per_maintenance_type)
    }

    /// Job types a worker may dequeue right now
    pub fn open_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| {
                self.per_type
                    .get(t)
                    .is_none_or(|s| s.available_permits() > 0)
            })
            .collect()
    }

    pub fn try_acquire(&self, job_type: JobType) -> Option<TypePermit> {
        match self.per_type.get(&job_type) {
            None => Some(TypePermit(None)),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|p| TypePermit(Some(p))),
        }
    }

    async fn acquire_global(&self) -> Option<OwnedSemaphorePermit> {
        self.global.clone().acquire_owned().await.ok()
    }
}

/// How a job run ended, from the worker's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with a retryable error; the queue decides whether it runs again
    Failed(JobStatus),
    /// Failed with an error retrying cannot fix
    FailedPermanently,
    /// Shutdown interrupted the job and it went back to pending
    Released,
    /// Another worker took the job over after the lease lapsed
    LeaseLost,
}

pub struct Worker {
    id: String,
    processor: JobProcessor,
    limits: ConcurrencyLimits,
    lease: chrono::Duration,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: impl Into<String>, processor: JobProcessor, limits: ConcurrencyLimits) -> Self {
        let config = &processor.config().daemon;
        let lease = chrono::Duration::minutes(config.lease_minutes.max(1));
        let poll_interval = Duration::from_secs(config.poll_interval_seconds.max(1));
        Self {
            id: id.into(),
            processor,
            limits,
            lease,
            poll_interval,
        }
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process jobs until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let global = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.limits.acquire_global() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            match self.run_next(&cancel).await {
                Some(outcome) => {
                    drop(global);
                    debug!(worker_id = %self.id, outcome = ?outcome, "Job finished");
                }
                None => {
                    drop(global);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim and run one job, `None` when nothing was claimable
    pub async fn run_next(&self, cancel: &CancellationToken) -> Option<JobOutcome> {
        let types = self.limits.open_types();
        if types.is_empty() {
            return None;
        }

        let job = match self.processor.queue().dequeue(&self.id, self.lease, &types).await {
            Ok(job) => job?,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Dequeue failed");
                return None;
            }
        };

        let Some(_type_permit) = self.limits.try_acquire(job.job_type) else {
            // another worker filled this type between the check and the claim
            if let Err(e) = self.processor.queue().release(&job.id, &self.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to release job");
            }
            return None;
        };

        Some(self.run_job(job, cancel).await)
    }

    /// Run a claimed job to completion, keeping its lease alive
    pub async fn run_job(&self, job: Job, cancel: &CancellationToken) -> JobOutcome {
        let queue = self.processor.queue();
        let started = Instant::now();
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            target = %job.target(),
            attempt = job.retry_count + 1,
            "Job started"
        );

        let refresh = (self.lease / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_millis(100));
        let mut heartbeat = interval(refresh);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let process = self.processor.process(&job);
        tokio::pin!(process);

        let result = loop {
            tokio::select! {
                result = &mut process => break Some(result),
                _ = heartbeat.tick() => {
                    match queue.extend_lease(&job.id, &self.id, self.lease).await {
                        Ok(()) => debug!(job_id = %job.id, "Lease extended"),
                        Err(Error::LeaseConflict(_)) => {
                            warn!(job_id = %job.id, worker_id = %self.id, "Lease lost, abandoning job");
                            return JobOutcome::LeaseLost;
                        }
                        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to extend lease"),
                    }
                }
                _ = cancel.cancelled() => break None,
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, recorded) = match result {
            None => {
                info!(job_id = %job.id, "Shutdown, releasing job");
                (JobOutcome::Released, queue.release(&job.id, &self.id).await)
            }
            Some(Ok(node_id)) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    node_id = node_id.as_deref().unwrap_or("-"),
                    elapsed_ms = elapsed_ms,
                    "Job completed"
                );
                (
                    JobOutcome::Completed,
                    queue.complete(&job.id, &self.id, node_id.as_deref()).await,
                )
            }
            Some(Err(e)) if e.is_retryable() => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    code = e.code(),
                    error = %e,
                    elapsed_ms = elapsed_ms,
                    "Job failed"
                );
                match queue.fail(&job.id, &self.id, &e.to_string()).await {
                    Ok(status) => (JobOutcome::Failed(status), Ok(())),
                    Err(err) => (JobOutcome::Failed(JobStatus::Running), Err(err)),
                }
            }
            Some(Err(e)) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    code = e.code(),
                    error = %e,
                    "Job failed permanently"
                );
                (
                    JobOutcome::FailedPermanently,
                    queue.fail_permanently(&job.id, &self.id, &e.to_string()).await,
                )
            }
        };

        if let Err(e) = recorded {
            error!(job_id = %job.id, error = %e, "Failed to record job result");
        }
        outcome
    }
}

/// Identifier for worker `n` of this process
pub fn worker_id(n: usize) -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{host}-{}-w{n}", std::process::id())
}
