//! Background daemon
//!
//! The daemon runs three kinds of tasks against one database:
//!
//! - worker loops that claim queued jobs and run them through the
//!   [`JobProcessor`]
//! - a scheduler loop that turns cron firings into maintenance jobs
//! - an optional scanner that ingests session files from a directory
//!
//! Every task watches the same [`CancellationToken`]. Cancelling it stops
//! new work; jobs in flight are released back to the queue.

mod analyzer;
mod clustering;
mod effectiveness;
mod embedding;
mod ingest;
mod patterns;
mod processor;
mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::GraphStore;
use crate::queue::{Enqueued, JobQueue, NewJob};
use crate::scheduler::{plan_jobs, Scheduler};
use crate::storage::Database;

pub use analyzer::{
    AnalysisOutput, AnalysisRequest, CommandAnalyzer, RelationshipProposal, SessionAnalyzer,
};
pub use clustering::{build_clusters, choose_k, kmeans, normalize, run_clustering, KMeans};
pub use effectiveness::{measure, run_effectiveness, two_proportion_z, WindowCounts, Z_CRITICAL};
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider};
pub use ingest::{
    find_session_files, ingest_session, scan_sessions_dir, IngestOptions, IngestReport,
};
pub use patterns::{aggregate_insights, run_pattern_aggregation};
pub use processor::JobProcessor;
pub use worker::{worker_id, ConcurrencyLimits, JobOutcome, Worker};

/// Longest the scheduler sleeps between checks
const MAX_SCHEDULER_SLEEP: Duration = Duration::from_secs(60);

/// The assembled daemon, ready to start
pub struct Daemon {
    processor: JobProcessor,
}

impl Daemon {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        analyzer: Arc<dyn SessionAnalyzer>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let mut store = GraphStore::new(pool.clone()).with_access_boost(config.decay.access_boost);
        if let Some(embedder) = &embedder {
            store = store.with_embedding_index(embedder.model(), embedder.dimensions());
        }
        let queue = JobQueue::new(pool, config.daemon.queue.clone());
        let processor = JobProcessor::new(store, queue, analyzer, embedder, Arc::new(config));
        Self { processor }
    }

    /// Open the configured database and build the configured collaborators
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let database = Database::new(config.database.database_config()).await?;

        let analyzer = Arc::new(CommandAnalyzer::from_config(&config.analyzer)?);
        let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.enabled {
            Some(Arc::new(HttpEmbeddingProvider::from_config(&config.embedding)?))
        } else {
            None
        };

        Ok(Self::new(database.pool().clone(), config, analyzer, embedder))
    }

    pub fn store(&self) -> &GraphStore {
        self.processor.store()
    }

    pub fn queue(&self) -> &JobQueue {
        self.processor.queue()
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    /// Spawn every daemon task
    pub fn start(&self, cancel: CancellationToken) -> Result<DaemonHandle> {
        let config = self.processor.config();
        let scheduler = Scheduler::from_config(&config.daemon.schedule, Utc::now())?;
        let limits = ConcurrencyLimits::from_config(&config.daemon);

        let mut tasks = Vec::new();
        for n in 0..config.daemon.parallel_workers.max(1) {
            let worker = Worker::new(worker_id(n), self.processor.clone(), limits.clone());
            tasks.push(tokio::spawn(worker.run(cancel.clone())));
        }

        tasks.push(tokio::spawn(run_scheduler(
            self.processor.clone(),
            scheduler,
            cancel.clone(),
        )));

        if let Some(dir) = config.daemon.sessions_dir.clone() {
            let interval = Duration::from_secs(config.daemon.scan_interval_seconds.max(1));
            tasks.push(tokio::spawn(run_scanner(
                self.processor.clone(),
                dir,
                interval,
                cancel.clone(),
            )));
        }

        info!(
            workers = config.daemon.parallel_workers.max(1),
            max_concurrent_jobs = config.daemon.max_concurrent_jobs,
            analyzer_version = self.processor.analyzer_version(),
            scanning = config.daemon.sessions_dir.is_some(),
            "Daemon started"
        );
        Ok(DaemonHandle { cancel, tasks })
    }

    /// Run until `cancel` fires, then wait for every task to stop
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let handle = self.start(cancel.clone())?;
        cancel.cancelled().await;
        handle.shutdown().await;
        Ok(())
    }
}

/// Running daemon tasks
pub struct DaemonHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Daemon task panicked");
            }
        }
        info!("Daemon stopped");
    }
}

/// Enqueue planned jobs; returns how many were created
pub async fn enqueue_all(queue: &JobQueue, jobs: Vec<NewJob>) -> Result<usize> {
    let mut created = 0;
    for job in jobs {
        let job_type = job.job_type;
        match queue.enqueue(job).await {
            Ok(Enqueued::Created { .. }) => created += 1,
            Ok(Enqueued::Duplicate { .. }) => {}
            Err(Error::QueueFull(active)) => {
                warn!(job_type = %job_type, active_jobs = active, "Queue full, dropping scheduled jobs");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}

async fn run_scheduler(processor: JobProcessor, mut scheduler: Scheduler, cancel: CancellationToken) {
    let config = &processor.config().daemon.schedule;
    loop {
        let now = Utc::now();
        for job_type in scheduler.due(now) {
            let planned = plan_jobs(
                job_type,
                processor.store(),
                config,
                processor.analyzer_version(),
                now,
            )
            .await;
            match planned {
                Ok(jobs) => match enqueue_all(processor.queue(), jobs).await {
                    Ok(created) => info!(job_type = %job_type, created = created, "Scheduled jobs enqueued"),
                    Err(e) => warn!(job_type = %job_type, error = %e, "Failed to enqueue scheduled jobs"),
                },
                Err(e) => warn!(job_type = %job_type, error = %e, "Failed to plan scheduled jobs"),
            }
        }

        let wait = scheduler
            .next_wakeup()
            .and_then(|next| (next - Utc::now()).to_std().ok())
            .unwrap_or(MAX_SCHEDULER_SLEEP)
            .min(MAX_SCHEDULER_SLEEP);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }
}

async fn run_scanner(
    processor: JobProcessor,
    dir: std::path::PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match scan_sessions_dir(processor.store(), processor.queue(), &dir).await {
            Ok(reports) => {
                let enqueued: usize = reports.iter().map(|r| r.enqueued).sum();
                if enqueued > 0 {
                    info!(dir = %dir.display(), enqueued = enqueued, "Sessions scanned");
                }
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Session scan failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::queue::{JobStatus, JobType, QueueConfig};

    fn config(sessions_dir: Option<std::path::PathBuf>) -> Config {
        let mut config = Config::default();
        config.daemon.poll_interval_seconds = 1;
        config.daemon.scan_interval_seconds = 1;
        config.daemon.sessions_dir = sessions_dir;
        config
    }

    #[tokio::test]
    async fn test_daemon_ingests_and_analyses_sessions() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), "s1.jsonl", &session_jsonl(None));
        let db = Database::in_memory().await.unwrap();
        let daemon = Daemon::new(
            db.pool().clone(),
            config(Some(dir.path().to_path_buf())),
            Arc::new(StubAnalyzer::new("v1")),
            Some(Arc::new(StubEmbedder)),
        );

        let handle = daemon.start(CancellationToken::new()).unwrap();
        let mut analysed = 0u64;
        for _ in 0..100 {
            analysed = daemon.store().stats().await.unwrap().nodes;
            if analysed == 2 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        handle.shutdown().await;

        assert_eq!(analysed, 2);
        let failed = daemon.queue().list(Some(JobStatus::Failed), 10).await.unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_all_stops_when_full() {
        let db = Database::in_memory().await.unwrap();
        let queue = JobQueue::new(
            db.pool().clone(),
            QueueConfig {
                max_queue_size: 1,
                ..Default::default()
            },
        );
        let jobs = vec![
            NewJob::maintenance(JobType::Clustering),
            NewJob::maintenance(JobType::Clustering),
            NewJob::maintenance(JobType::Decay),
        ];
        assert_eq!(enqueue_all(&queue, jobs).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_store_uses_configured_access_boost() {
        let db = Database::in_memory().await.unwrap();
        let mut config = config(None);
        config.decay.access_boost = 0.3;
        let daemon = Daemon::new(db.pool().clone(), config, Arc::new(StubAnalyzer::new("v1")), None);

        let mut node = crate::graph::test_support::sample_node("webapp", crate::graph::Outcome::Success, Utc::now());
        node.relevance_score = 0.5;
        daemon.store().create_node(&node, None).await.unwrap();

        let read = daemon.store().get_node(&node.id).await.unwrap().unwrap();
        assert!((read.relevance_score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_schedule_fails_start() {
        let db = Database::in_memory().await.unwrap();
        let mut config = config(None);
        config.daemon.schedule.decay_cron = "not a cron".to_string();
        let daemon = Daemon::new(db.pool().clone(), config, Arc::new(StubAnalyzer::new("v1")), None);
        assert!(daemon.start(CancellationToken::new()).is_err());
    }
}
