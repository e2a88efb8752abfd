//! Stub collaborators and session fixtures for daemon tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::{Classification, NodeContent, NodeType, Outcome};

use super::analyzer::{AnalysisOutput, AnalysisRequest, RelationshipProposal, SessionAnalyzer};
use super::embedding::EmbeddingProvider;

pub const STUB_DIMENSIONS: usize = 8;

/// Two segments split by a 27 minute pause, optionally forked from `parent`
pub fn session_jsonl(parent: Option<&str>) -> String {
    let header = match parent {
        Some(parent) => format!(
            r#"{{"type":"session","id":"s1","timestamp":"2024-01-01T10:00:00Z","cwd":"/work/webapp","parentSession":"{parent}"}}"#
        ),
        None => r#"{"type":"session","id":"s1","timestamp":"2024-01-01T10:00:00Z","cwd":"/work/webapp"}"#
            .to_string(),
    };
    let lines = [
        header.as_str(),
        r#"{"type":"message","id":"e1","parentId":null,"timestamp":"2024-01-01T10:00:01Z","message":{"role":"user","content":"fix the login bug"}}"#,
        r#"{"type":"message","id":"e2","parentId":"e1","timestamp":"2024-01-01T10:01:00Z","message":{"role":"assistant","content":[{"type":"text","text":"looking at auth.ts"}]}}"#,
        r#"{"type":"message","id":"e3","parentId":"e2","timestamp":"2024-01-01T10:02:00Z","message":{"role":"user","content":"that works"}}"#,
        r#"{"type":"message","id":"e4","parentId":"e3","timestamp":"2024-01-01T10:03:00Z","message":{"role":"assistant","content":[{"type":"text","text":"done"}]}}"#,
        r#"{"type":"message","id":"e5","parentId":"e4","timestamp":"2024-01-01T10:30:00Z","message":{"role":"user","content":"now add a test"}}"#,
        r#"{"type":"message","id":"e6","parentId":"e5","timestamp":"2024-01-01T10:31:00Z","message":{"role":"assistant","content":[{"type":"text","text":"added"}]}}"#,
    ];
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

pub fn write_session(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Analyzer returning a fixed coding analysis and recording what it saw
#[derive(Default)]
pub struct StubAnalyzer {
    version: String,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    proposals: Mutex<Vec<RelationshipProposal>>,
    last_previous_node: Mutex<Option<String>>,
}

impl StubAnalyzer {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn propose(&self, proposals: Vec<RelationshipProposal>) {
        *self.proposals.lock().unwrap() = proposals;
    }

    pub fn last_previous_node(&self) -> Option<String> {
        self.last_previous_node.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionAnalyzer for StubAnalyzer {
    fn version(&self) -> &str {
        &self.version
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_previous_node.lock().unwrap() = request.previous_node.as_ref().map(|n| n.id.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(AnalysisOutput {
            classification: Classification {
                node_type: NodeType::Coding,
                project: request.project.clone(),
                is_new_project: false,
                had_clear_goal: true,
            },
            content: NodeContent {
                summary: format!("Analyzed segment ending at {}", request.segment.end_entry_id),
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
            relationships: self.proposals.lock().unwrap().clone(),
            importance: None,
            tokens_used: 100,
            cost: 0.001,
        })
    }
}

/// Bag-of-bytes embedding: similar text gives similar vectors
pub struct StubEmbedder;

pub fn stub_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; STUB_DIMENSIONS];
    for byte in text.bytes() {
        vector[byte as usize % STUB_DIMENSIONS] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn model(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        STUB_DIMENSIONS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| stub_vector(t)).collect())
    }
}
