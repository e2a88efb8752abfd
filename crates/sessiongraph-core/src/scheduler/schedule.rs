//! Cron-triggered maintenance jobs
//!
//! Each maintenance job type has its own cron schedule and fires
//! independently of the others and of worker availability. A fired type is
//! turned into concrete jobs by [`plan_jobs`]; if no worker is free they
//! simply wait in the queue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::queue::{JobType, NewJob};

use super::cron::CronSchedule;

/// Cron strings and per-run bounds for maintenance jobs
///
/// An empty cron string disables that job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub reanalysis_cron: String,
    pub connection_discovery_cron: String,
    pub clustering_cron: String,
    pub pattern_aggregation_cron: String,
    pub backfill_embeddings_cron: String,
    pub effectiveness_cron: String,
    pub decay_cron: String,

    /// Stale nodes re-analysed per reanalysis run
    pub reanalysis_limit: usize,
    /// Recent nodes examined per discovery run
    pub discovery_limit: usize,
    /// How far back "recent" reaches for discovery
    pub discovery_lookback_hours: i64,
    /// Minimum time between two discovery runs for one node
    pub cooldown_hours: i64,
    /// Embeddings filled per backfill run
    pub backfill_limit: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reanalysis_cron: "0 3 * * *".to_string(),
            connection_discovery_cron: "15 */4 * * *".to_string(),
            clustering_cron: "0 4 * * 0".to_string(),
            pattern_aggregation_cron: "30 4 * * *".to_string(),
            backfill_embeddings_cron: "*/30 * * * *".to_string(),
            effectiveness_cron: "0 5 * * 1".to_string(),
            decay_cron: "0 2 * * *".to_string(),
            reanalysis_limit: 50,
            discovery_limit: 100,
            discovery_lookback_hours: 24,
            cooldown_hours: 24,
            backfill_limit: 200,
        }
    }
}

impl ScheduleConfig {
    /// The cron string configured for a job type; `None` for types that are
    /// never scheduled
    pub fn cron_for(&self, job_type: JobType) -> Option<&str> {
        let cron = match job_type {
            JobType::Initial => return None,
            JobType::Reanalysis => &self.reanalysis_cron,
            JobType::ConnectionDiscovery => &self.connection_discovery_cron,
            JobType::Clustering => &self.clustering_cron,
            JobType::PatternAggregation => &self.pattern_aggregation_cron,
            JobType::BackfillEmbeddings => &self.backfill_embeddings_cron,
            JobType::Effectiveness => &self.effectiveness_cron,
            JobType::Decay => &self.decay_cron,
        };
        let cron = cron.trim();
        (!cron.is_empty()).then_some(cron)
    }

    /// Parse every enabled cron string
    pub fn schedules(&self) -> Result<Vec<(JobType, CronSchedule)>> {
        JobType::ALL
            .into_iter()
            .filter_map(|job_type| self.cron_for(job_type).map(|cron| (job_type, cron)))
            .map(|(job_type, cron)| Ok((job_type, CronSchedule::parse(cron)?)))
            .collect()
    }
}

/// One cron-driven job type and when it fires next
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub job_type: JobType,
    pub schedule: CronSchedule,
    pub next_run: Option<DateTime<Utc>>,
}

/// Tracks the next firing time of every scheduled job type
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new(schedules: impl IntoIterator<Item = (JobType, CronSchedule)>, now: DateTime<Utc>) -> Self {
        let tasks = schedules
            .into_iter()
            .map(|(job_type, schedule)| ScheduledTask {
                job_type,
                next_run: schedule.next_after(now),
                schedule,
            })
            .collect();
        Self { tasks }
    }

    pub fn from_config(config: &ScheduleConfig, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self::new(config.schedules()?, now))
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Job types whose firing time has come, advancing each past `now`
    ///
    /// A type that missed several firings while the daemon was busy fires once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<JobType> {
        let mut fired = Vec::new();
        for task in &mut self.tasks {
            if task.next_run.is_some_and(|next| next <= now) {
                fired.push(task.job_type);
                task.next_run = task.schedule.next_after(now);
            }
        }
        fired
    }

    /// Earliest upcoming firing time across all tasks
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.tasks.iter().filter_map(|t| t.next_run).min()
    }
}

/// Concrete jobs for a fired job type
///
/// Reanalysis targets nodes produced by an older analyzer version; connection
/// discovery targets recent nodes outside their cooldown. Every other type is
/// a single untargeted job.
pub async fn plan_jobs(
    job_type: JobType,
    store: &GraphStore,
    config: &ScheduleConfig,
    analyzer_version: &str,
    now: DateTime<Utc>,
) -> Result<Vec<NewJob>> {
    match job_type {
        JobType::Initial => Ok(Vec::new()),
        JobType::Reanalysis => Ok(store
            .list_stale_nodes(analyzer_version, config.reanalysis_limit)
            .await?
            .into_iter()
            .map(|node| {
                NewJob::reanalysis(node.id).with_context(json!({ "trigger": "analyzer_version" }))
            })
            .collect()),
        JobType::ConnectionDiscovery => {
            let since = now - Duration::hours(config.discovery_lookback_hours);
            let cooldown_start = now - Duration::hours(config.cooldown_hours);

            let mut jobs = Vec::new();
            for node in store.list_recent_nodes(since, config.discovery_limit).await? {
                let cooling_down = store
                    .last_discovery_run(&node.id)
                    .await?
                    .is_some_and(|last| last > cooldown_start);
                if !cooling_down {
                    jobs.push(NewJob::for_node(JobType::ConnectionDiscovery, node.id));
                }
            }
            Ok(jobs)
        }
        JobType::BackfillEmbeddings => Ok(vec![
            NewJob::maintenance(job_type).with_context(json!({ "limit": config.backfill_limit })),
        ]),
        JobType::Clustering | JobType::PatternAggregation | JobType::Effectiveness | JobType::Decay => {
            Ok(vec![NewJob::maintenance(job_type)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::sample_node;
    use crate::graph::Outcome;
    use crate::storage::Database;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, mi, 0).unwrap()
    }

    #[test]
    fn test_due_fires_types_independently() {
        let mut scheduler = Scheduler::new(
            [
                (JobType::Decay, CronSchedule::parse("0 * * * *").unwrap()),
                (JobType::BackfillEmbeddings, CronSchedule::parse("*/30 * * * *").unwrap()),
            ],
            at(9, 50),
        );
        assert_eq!(scheduler.next_wakeup(), Some(at(10, 0)));

        assert!(scheduler.due(at(9, 59)).is_empty());
        assert_eq!(
            scheduler.due(at(10, 0)),
            vec![JobType::Decay, JobType::BackfillEmbeddings]
        );
        assert_eq!(scheduler.due(at(10, 30)), vec![JobType::BackfillEmbeddings]);

        // a long stall fires once, not once per missed slot
        assert_eq!(
            scheduler.due(at(14, 5)),
            vec![JobType::Decay, JobType::BackfillEmbeddings]
        );
        assert_eq!(scheduler.next_wakeup(), Some(at(14, 30)));
    }

    #[test]
    fn test_config_schedules() {
        let mut config = ScheduleConfig::default();
        assert_eq!(config.schedules().unwrap().len(), 7);

        config.clustering_cron = String::new();
        assert_eq!(config.cron_for(JobType::Clustering), None);
        assert_eq!(config.cron_for(JobType::Initial), None);
        assert_eq!(config.schedules().unwrap().len(), 6);

        config.decay_cron = "every night".to_string();
        assert!(config.schedules().is_err());
    }

    #[tokio::test]
    async fn test_plan_jobs() {
        let db = Database::in_memory().await.unwrap();
        let store = GraphStore::new(db.pool().clone());
        let config = ScheduleConfig::default();
        let now = Utc::now();

        let stale = sample_node("webapp", Outcome::Success, now - Duration::hours(2));
        let cooled = sample_node("webapp", Outcome::Success, now - Duration::hours(1));
        for node in [&stale, &cooled] {
            store.create_node(node, None).await.unwrap();
        }
        store
            .record_discovery_run(&cooled.id, now - Duration::hours(1), 2)
            .await
            .unwrap();

        let reanalysis = plan_jobs(JobType::Reanalysis, &store, &config, "v2", now).await.unwrap();
        assert_eq!(reanalysis.len(), 2);
        assert!(plan_jobs(JobType::Reanalysis, &store, &config, "v1", now)
            .await
            .unwrap()
            .is_empty());

        let discovery = plan_jobs(JobType::ConnectionDiscovery, &store, &config, "v1", now)
            .await
            .unwrap();
        assert_eq!(discovery.len(), 1);
        assert_eq!(discovery[0].node_id.as_deref(), Some(stale.id.as_str()));

        let backfill = plan_jobs(JobType::BackfillEmbeddings, &store, &config, "v1", now)
            .await
            .unwrap();
        assert_eq!(backfill[0].context["limit"], 200);
        assert_eq!(plan_jobs(JobType::Decay, &store, &config, "v1", now).await.unwrap().len(), 1);
    }
}
