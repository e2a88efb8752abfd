//! End-to-end pipeline tests: ingest a session, run the workers, inspect the graph

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sessiongraph_core::config::Config;
use sessiongraph_core::daemon::{
    AnalysisOutput, AnalysisRequest, ConcurrencyLimits, Daemon, EmbeddingProvider, IngestOptions,
    JobOutcome, SessionAnalyzer, Worker, ingest_session,
};
use sessiongraph_core::graph::{
    Classification, EdgeType, NodeContent, NodeFilters, NodeType, Outcome,
};
use sessiongraph_core::queue::{JobStatus, JobType, NewJob};
use sessiongraph_core::storage::Database;
use sessiongraph_core::{Error, Result};
use tokio_util::sync::CancellationToken;

const SESSION: &str = r#"{"type":"session","id":"s1","timestamp":"2024-01-01T10:00:00Z","cwd":"/work/webapp"}
{"type":"message","id":"e1","parentId":null,"timestamp":"2024-01-01T10:00:01Z","message":{"role":"user","content":"fix the login bug"}}
{"type":"message","id":"e2","parentId":"e1","timestamp":"2024-01-01T10:01:00Z","message":{"role":"assistant","content":[{"type":"text","text":"looking at auth.ts"}]}}
{"type":"message","id":"e3","parentId":"e2","timestamp":"2024-01-01T10:02:00Z","message":{"role":"user","content":"perfect, thanks"}}
{"type":"message","id":"e4","parentId":"e3","timestamp":"2024-01-01T10:40:00Z","message":{"role":"user","content":"now add a test"}}
{"type":"message","id":"e5","parentId":"e4","timestamp":"2024-01-01T10:41:00Z","message":{"role":"assistant","content":[{"type":"text","text":"added"}]}}
"#;

struct FixedAnalyzer {
    fail: bool,
    calls: AtomicUsize,
}

impl FixedAnalyzer {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionAnalyzer for FixedAnalyzer {
    fn version(&self) -> &str {
        "v1"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Analyzer("model overloaded".to_string()));
        }
        Ok(AnalysisOutput {
            classification: Classification {
                node_type: NodeType::Debugging,
                project: request.project.clone(),
                is_new_project: false,
                had_clear_goal: true,
            },
            content: NodeContent {
                summary: format!("Login fix work up to {}", request.segment.end_entry_id),
                outcome: Outcome::Success,
                key_decisions: Vec::new(),
                files_touched: vec!["src/auth.ts".to_string()],
                tools_used: Vec::new(),
                errors_seen: Vec::new(),
            },
            lessons: Default::default(),
            observations: Default::default(),
            semantic: Default::default(),
            daemon_meta: Default::default(),
            relationships: Vec::new(),
            importance: Some(0.6),
            tokens_used: 250,
            cost: 0.002,
        })
    }
}

/// Letter-frequency vectors, enough to make similar summaries neighbours
struct LetterEmbedder;

#[async_trait]
impl EmbeddingProvider for LetterEmbedder {
    fn model(&self) -> &str {
        "letters"
    }

    fn dimensions(&self) -> usize {
        26
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 26];
                for c in text.to_ascii_lowercase().bytes().filter(u8::is_ascii_lowercase) {
                    v[(c - b'a') as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.daemon.queue.max_retries = 1;
    config.daemon.queue.retry_delay_seconds = 0;
    config
}

async fn drain(worker: &Worker) -> Vec<JobOutcome> {
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.run_next(&cancel).await {
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test]
async fn test_session_to_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(&path, SESSION).unwrap();

    let db = Database::in_memory().await.unwrap();
    let daemon = Daemon::new(
        db.pool().clone(),
        config(),
        Arc::new(FixedAnalyzer::new(false)),
        Some(Arc::new(LetterEmbedder)),
    );
    let worker = Worker::new("w1", daemon.processor().clone(), ConcurrencyLimits::new(2, 1));

    let report = ingest_session(daemon.store(), daemon.queue(), &path, &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(report.segments, 2);
    assert_eq!(report.enqueued, 2);

    let outcomes = drain(&worker).await;
    assert_eq!(outcomes, vec![JobOutcome::Completed, JobOutcome::Completed]);

    let nodes = daemon
        .store()
        .list_nodes(&NodeFilters::project("webapp"), 10)
        .await
        .unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.importance == 0.6));
    assert!(nodes.iter().all(|n| n.signals.is_some()));

    // the 38 minute pause is a resume boundary between the two nodes
    let first = nodes
        .iter()
        .find(|n| n.source.segment.end_entry_id == "e3")
        .unwrap();
    let second = nodes
        .iter()
        .find(|n| n.source.segment.end_entry_id == "e5")
        .unwrap();
    let edges = daemon.store().edges_for_node(&first.id).await.unwrap();
    assert!(edges.iter().any(|e| e.edge_type == EdgeType::Resume && e.target_node_id == second.id));

    // discovery links the two near-identical summaries
    daemon
        .queue()
        .enqueue(NewJob::for_node(JobType::ConnectionDiscovery, &first.id))
        .await
        .unwrap();
    assert_eq!(drain(&worker).await, vec![JobOutcome::Completed]);
    assert!(daemon
        .store()
        .has_edge_between(&first.id, &second.id, EdgeType::Semantic)
        .await
        .unwrap());

    // ingesting the unchanged file again is a no-op
    let again = ingest_session(daemon.store(), daemon.queue(), &path, &IngestOptions::default())
        .await
        .unwrap();
    assert!(again.unchanged);
}

#[tokio::test]
async fn test_failing_analyzer_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(&path, SESSION).unwrap();

    let db = Database::in_memory().await.unwrap();
    let analyzer = Arc::new(FixedAnalyzer::new(true));
    let daemon = Daemon::new(db.pool().clone(), config(), analyzer.clone(), None);
    let worker = Worker::new("w1", daemon.processor().clone(), ConcurrencyLimits::new(1, 1));

    ingest_session(daemon.store(), daemon.queue(), &path, &IngestOptions::default())
        .await
        .unwrap();
    let outcomes = drain(&worker).await;

    // two segments, each tried twice
    assert_eq!(outcomes.len(), 4);
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        outcomes.iter().filter(|o| **o == JobOutcome::Failed(JobStatus::Failed)).count(),
        2
    );

    let failed = daemon.queue().list(Some(JobStatus::Failed), 10).await.unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|j| j.retry_count == 1));
    assert!(failed[0].error.as_deref().unwrap().contains("model overloaded"));
    assert_eq!(daemon.store().stats().await.unwrap().nodes, 0);

    // operator retry puts them back in the queue
    assert_eq!(daemon.queue().retry_failed(None).await.unwrap(), 2);
    assert_eq!(daemon.queue().stats().await.unwrap().pending, 2);
}
