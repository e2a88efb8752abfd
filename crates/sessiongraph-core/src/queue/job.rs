//! Queue job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::Segment;

/// Priority of jobs an operator asked for explicitly
pub const PRIORITY_USER: i64 = 10;
/// Priority of initial analysis for a forked session
pub const PRIORITY_FORK: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Initial,
    Reanalysis,
    ConnectionDiscovery,
    Clustering,
    PatternAggregation,
    BackfillEmbeddings,
    Effectiveness,
    Decay,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        Self::Initial,
        Self::Reanalysis,
        Self::ConnectionDiscovery,
        Self::Clustering,
        Self::PatternAggregation,
        Self::BackfillEmbeddings,
        Self::Effectiveness,
        Self::Decay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Reanalysis => "reanalysis",
            Self::ConnectionDiscovery => "connection_discovery",
            Self::Clustering => "clustering",
            Self::PatternAggregation => "pattern_aggregation",
            Self::BackfillEmbeddings => "backfill_embeddings",
            Self::Effectiveness => "effectiveness",
            Self::Decay => "decay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Lower runs first
    pub fn default_priority(&self) -> i64 {
        match self {
            Self::Initial => 100,
            Self::Reanalysis => 200,
            Self::ConnectionDiscovery => 300,
            Self::BackfillEmbeddings => 350,
            Self::Clustering | Self::PatternAggregation => 400,
            Self::Effectiveness => 450,
            Self::Decay => 500,
        }
    }

    /// Jobs that call the external analyzer
    pub fn is_analysis(&self) -> bool {
        matches!(self, Self::Initial | Self::Reanalysis)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of daemon work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub priority: i64,
    pub status: JobStatus,
    pub session_file: Option<String>,
    pub segment_start: Option<String>,
    pub segment_end: Option<String>,
    pub node_id: Option<String>,
    pub context: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_after: Option<DateTime<Utc>>,
    pub result_node_id: Option<String>,
    pub error: Option<String>,
}

impl Job {
    /// Short description of what the job works on, for logs and listings
    pub fn target(&self) -> String {
        match (&self.session_file, &self.segment_end, &self.node_id) {
            (Some(file), Some(end), _) => format!("{file}#{end}"),
            (Some(file), None, _) => file.clone(),
            (None, _, Some(node)) => node.clone(),
            _ => "-".to_string(),
        }
    }
}

/// A job to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub priority: i64,
    pub session_file: Option<String>,
    pub segment_start: Option<String>,
    pub segment_end: Option<String>,
    pub node_id: Option<String>,
    pub context: Value,
    /// Falls back to the queue's configured default
    pub max_retries: Option<u32>,
}

impl NewJob {
    fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            priority: job_type.default_priority(),
            session_file: None,
            segment_start: None,
            segment_end: None,
            node_id: None,
            context: Value::Object(Default::default()),
            max_retries: None,
        }
    }

    /// Initial analysis of one session segment
    pub fn analysis(session_file: impl Into<String>, segment: &Segment) -> Self {
        Self {
            session_file: Some(session_file.into()),
            segment_start: Some(segment.start_entry_id.clone()),
            segment_end: Some(segment.end_entry_id.clone()),
            ..Self::new(JobType::Initial)
        }
    }

    /// Re-run analysis for an existing node
    pub fn reanalysis(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(JobType::Reanalysis)
        }
    }

    /// A job scoped to one node, such as connection discovery
    pub fn for_node(job_type: JobType, node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(job_type)
        }
    }

    /// A job without a target; at most one is active per type
    pub fn maintenance(job_type: JobType) -> Self {
        Self::new(job_type)
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trip_and_priorities() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::parse(job_type.as_str()), Some(job_type));
        }
        assert!(PRIORITY_USER < PRIORITY_FORK);
        assert!(PRIORITY_FORK < JobType::Initial.default_priority());
        assert!(JobType::Initial.default_priority() < JobType::Reanalysis.default_priority());
        assert!(JobType::Reanalysis.default_priority() < JobType::Decay.default_priority());
        assert_eq!(JobType::parse("vacuum"), None);
    }

    #[test]
    fn test_new_job_targets() {
        let job = NewJob::reanalysis("abc").with_priority(PRIORITY_USER);
        assert_eq!(job.job_type, JobType::Reanalysis);
        assert_eq!(job.priority, PRIORITY_USER);
        assert_eq!(job.node_id.as_deref(), Some("abc"));

        let decay = NewJob::maintenance(JobType::Decay);
        assert!(decay.node_id.is_none() && decay.session_file.is_none());
        assert_eq!(decay.priority, 500);
    }
}
