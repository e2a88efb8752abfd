//! Segment analyzer contract
//!
//! The analyzer is an external collaborator: it receives a segment with its
//! raw entries and returns the structured payload a node is built from. The
//! daemon only shapes the input and validates the output.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::boundary::Segment;
use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::graph::{
    Classification, DaemonMeta, Lessons, Node, NodeContent, NodeContentUpdate, Observations,
    RelationshipKind, Semantic,
};
use crate::session::SessionEntry;

/// Bytes of analyzer stderr kept in error messages
const STDERR_TAIL: usize = 2000;

/// Everything the analyzer sees about one segment
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub session_file: String,
    pub session_id: Option<String>,
    pub project: String,
    pub segment: Segment,
    /// Raw entries of the segment, metadata entries included
    pub entries: Vec<SessionEntry>,
    /// The node being re-analysed, or the previous node of the project
    pub previous_node: Option<Node>,
    pub parent_session: Option<String>,
}

/// A typed link the analyzer proposes from the analysed node to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipProposal {
    pub kind: RelationshipKind,
    pub target_node_id: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// Structured analysis of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub classification: Classification,
    pub content: NodeContent,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub observations: Observations,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub daemon_meta: DaemonMeta,
    #[serde(default)]
    pub relationships: Vec<RelationshipProposal>,
    /// Decay resistance in [0, 1]; the node default applies when unset
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

impl AnalysisOutput {
    /// Analysis results as an update for an existing node
    pub fn to_update(&self, analyzer_version: &str) -> NodeContentUpdate {
        NodeContentUpdate {
            classification: self.classification.clone(),
            content: self.content.clone(),
            lessons: self.lessons.clone(),
            observations: self.observations.clone(),
            semantic: self.semantic.clone(),
            daemon_meta: self.daemon_meta.clone(),
            analyzer_version: analyzer_version.to_string(),
            tokens_used: self.tokens_used,
            cost: self.cost,
            segment: None,
            duration_minutes: None,
        }
    }
}

/// Produces structured analysis for a segment
#[async_trait]
pub trait SessionAnalyzer: Send + Sync {
    /// Version recorded on every node this analyzer produces
    fn version(&self) -> &str;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput>;
}

/// Analyzer run as a subprocess
///
/// The request is written to stdin as JSON and the output is read from
/// stdout as JSON. The child is killed if the analysis future is dropped,
/// which is how timeouts and shutdown cancel it.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    version: String,
}

impl CommandAnalyzer {
    pub fn new(command: &[String], version: impl Into<String>) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::Configuration("analyzer.command is empty; set the analyzer program".to_string())
        })?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            version: version.into(),
        })
    }

    pub fn from_config(config: &AnalyzerConfig) -> Result<Self> {
        Self::new(&config.command, config.version.clone())
    }
}

#[async_trait]
impl SessionAnalyzer for CommandAnalyzer {
    fn version(&self) -> &str {
        &self.version
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput> {
        let input = serde_json::to_vec(request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Analyzer(format!("failed to start '{}': {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Analyzer("analyzer stdin unavailable".to_string()))?;
        // write concurrently so a child that streams output early cannot deadlock
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "Analyzer closed stdin early");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr.get(start..).unwrap_or(&stderr).trim();
            return Err(Error::Analyzer(format!(
                "'{}' exited with {}: {tail}",
                self.program, output.status
            )));
        }

        let parsed: AnalysisOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Analyzer(format!("malformed analyzer output: {e}")))?;

        debug!(
            session_file = %request.session_file,
            segment_end = %request.segment.end_entry_id,
            relationships = parsed.relationships.len(),
            "Analyzer finished"
        );
        Ok(parsed)
    }
}
