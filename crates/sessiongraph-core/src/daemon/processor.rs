//! Job execution
//!
//! One [`JobProcessor`] is shared by every worker. It owns no locks: the
//! queue lease is the only thing that keeps two workers off the same job.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::boundary::{extract_segments, segment_entries, Boundary, Segment};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{
    DecayReport, Edge, EdgeCreator, EdgeType, GraphStore, Node, NodeFilters, NodeMetadata,
    NodeSource, SearchOptions, SegmentSpan,
};
use crate::queue::{Job, JobQueue, JobType};
use crate::session::{parse_session_file, SessionEntry, SessionFile};
use crate::signals::SignalEngine;

use super::analyzer::{AnalysisOutput, AnalysisRequest, RelationshipProposal, SessionAnalyzer};
use super::clustering::run_clustering;
use super::effectiveness::run_effectiveness;
use super::embedding::EmbeddingProvider;
use super::patterns::run_pattern_aggregation;

/// Runs queued jobs against the graph
#[derive(Clone)]
pub struct JobProcessor {
    store: GraphStore,
    queue: JobQueue,
    analyzer: Arc<dyn SessionAnalyzer>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: Arc<Config>,
    analysis_timeout: StdDuration,
    host: String,
}

impl JobProcessor {
    pub fn new(
        store: GraphStore,
        queue: JobQueue,
        analyzer: Arc<dyn SessionAnalyzer>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: Arc<Config>,
    ) -> Self {
        let analysis_timeout = StdDuration::from_secs(config.daemon.analysis_timeout_minutes * 60);
        Self {
            store,
            queue,
            analyzer,
            embedder,
            config,
            analysis_timeout,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    pub fn with_analysis_timeout(mut self, timeout: StdDuration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn analyzer_version(&self) -> &str {
        self.analyzer.version()
    }

    /// Run one job, returning the node it produced or worked on
    pub async fn process(&self, job: &Job) -> Result<Option<String>> {
        match job.job_type {
            JobType::Initial => self.analyze_segment(job).await.map(Some),
            JobType::Reanalysis => self.reanalyze_node(job).await.map(Some),
            JobType::ConnectionDiscovery => {
                let node_id = required(job.node_id.as_deref(), job, "node_id")?;
                self.discover_connections(node_id).await?;
                Ok(Some(node_id.to_string()))
            }
            JobType::Clustering => {
                run_clustering(&self.store, &self.config.daemon.clustering).await?;
                Ok(None)
            }
            JobType::PatternAggregation => {
                run_pattern_aggregation(&self.store).await?;
                Ok(None)
            }
            JobType::BackfillEmbeddings => {
                let limit = job
                    .context
                    .get("limit")
                    .and_then(|l| l.as_u64())
                    .map(|l| l as usize)
                    .unwrap_or(self.config.daemon.schedule.backfill_limit);
                self.backfill_embeddings(limit).await?;
                Ok(None)
            }
            JobType::Effectiveness => {
                run_effectiveness(&self.store, &self.config.daemon.effectiveness, Utc::now()).await?;
                Ok(None)
            }
            JobType::Decay => {
                self.decay().await?;
                Ok(None)
            }
        }
    }

    // ---- analysis ----

    /// Create the node for a session segment
    ///
    /// A retry after a partial run finds the node already written and only
    /// redoes the idempotent steps (signals and structural edges).
    async fn analyze_segment(&self, job: &Job) -> Result<String> {
        let session_file = required(job.session_file.as_deref(), job, "session_file")?;
        let segment_end = required(job.segment_end.as_deref(), job, "segment_end")?;

        let session = load_session(session_file).await?;
        let segments = extract_segments(&session.entries);
        let index = segments
            .iter()
            .position(|s| {
                s.end_entry_id == segment_end
                    && job
                        .segment_start
                        .as_deref()
                        .is_none_or(|start| start == s.start_entry_id)
            })
            .ok_or_else(|| {
                Error::Validation(format!(
                    "segment ending at '{segment_end}' no longer exists in {session_file}"
                ))
            })?;
        let segment = &segments[index];
        let entries = segment_entries(&session.entries, segment);

        let (node, proposals) = if let Some(existing) =
            self.store.find_node_by_segment(session_file, segment_end).await?
        {
            debug!(node_id = %existing.id, "Segment already has a node");
            (existing, Vec::new())
        } else if let Some(grown) = self.grown_node(session_file, segment, entries).await? {
            let request = AnalysisRequest {
                session_file: session_file.to_string(),
                session_id: session.session_id().map(str::to_string),
                project: grown.classification.project.clone(),
                segment: segment.clone(),
                entries: entries.to_vec(),
                previous_node: Some(grown.clone()),
                parent_session: parent_session(&session),
            };
            self.write_version(&grown, &request, "session_grew").await?
        } else {
            let project = session.project();
            let previous_node = if project.is_empty() {
                None
            } else {
                self.store
                    .find_previous_project_node(&project, segment.start_timestamp)
                    .await?
            };

            let request = AnalysisRequest {
                session_file: session_file.to_string(),
                session_id: session.session_id().map(str::to_string),
                project,
                segment: segment.clone(),
                entries: entries.to_vec(),
                previous_node,
                parent_session: parent_session(&session),
            };
            let output = self.run_analyzer(&request).await?;
            let node = self.build_node(&request, &output);

            let embedding = self.embed_node(&node).await;
            self.store.create_node(&node, embedding.as_deref()).await?;
            (node, output.relationships)
        };

        SignalEngine::new(self.store.clone(), self.config.signals.clone())
            .evaluate(&node, entries)
            .await?;
        self.link_structural(&node, session_file, &session, &segments, index)
            .await?;
        self.resolve_relationships(&node.id, &proposals).await?;

        info!(
            node_id = %node.id,
            session_file = %session_file,
            segment = index,
            "Segment analysed"
        );
        Ok(node.id)
    }

    /// Write a new version of a node from a fresh analysis of its segment
    async fn reanalyze_node(&self, job: &Job) -> Result<String> {
        let node_id = required(job.node_id.as_deref(), job, "node_id")?;
        let current = self
            .store
            .load_latest(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let session_file = current.source.session_file.clone();
        let session = load_session(&session_file).await?;
        let segments = extract_segments(&session.entries);
        // the start survives the session growing; the end may not
        let segment = segments
            .iter()
            .find(|s| s.start_entry_id == current.source.segment.start_entry_id)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "segment of node '{node_id}' no longer exists in {session_file}"
                ))
            })?;
        let entries = segment_entries(&session.entries, segment);

        let request = AnalysisRequest {
            session_file: session_file.clone(),
            session_id: session.session_id().map(str::to_string),
            project: current.classification.project.clone(),
            segment: segment.clone(),
            entries: entries.to_vec(),
            previous_node: Some(current.clone()),
            parent_session: parent_session(&session),
        };
        let trigger = job
            .context
            .get("trigger")
            .and_then(|t| t.as_str())
            .unwrap_or("reanalysis");
        let (next, proposals) = self.write_version(&current, &request, trigger).await?;

        SignalEngine::new(self.store.clone(), self.config.signals.clone())
            .evaluate(&next, entries)
            .await?;
        self.resolve_relationships(&next.id, &proposals).await?;

        Ok(next.id)
    }

    /// The node of a segment that has gained entries since it was analysed
    ///
    /// It starts where `segment` starts and its recorded end lies inside
    /// `segment`, so the new span covers everything the node was built from.
    async fn grown_node(
        &self,
        session_file: &str,
        segment: &Segment,
        entries: &[SessionEntry],
    ) -> Result<Option<Node>> {
        let Some(node) = self
            .store
            .find_node_by_segment_start(session_file, &segment.start_entry_id)
            .await?
        else {
            return Ok(None);
        };
        let end = &node.source.segment.end_entry_id;
        Ok(entries.iter().any(|e| &e.id == end).then_some(node))
    }

    /// Analyse `request` and store the result as the next version of `current`
    async fn write_version(
        &self,
        current: &Node,
        request: &AnalysisRequest,
        trigger: &str,
    ) -> Result<(Node, Vec<RelationshipProposal>)> {
        let output = self.run_analyzer(request).await?;

        let mut update = output.to_update(self.analyzer.version());
        if update.classification.project.is_empty() {
            update.classification.project = current.classification.project.clone();
        }
        update.segment = Some(SegmentSpan {
            start_entry_id: request.segment.start_entry_id.clone(),
            end_entry_id: request.segment.end_entry_id.clone(),
            entry_count: request.segment.entry_count,
        });
        update.duration_minutes = Some(request.segment.duration_minutes());
        let next = self.store.create_version(&current.id, update, trigger).await?;

        if let Some(vector) = self.embed_node(&next).await {
            self.store
                .upsert_embedding(&next.id, &vector, &next.embedding_text())
                .await?;
        }
        Ok((next, output.relationships))
    }

    async fn run_analyzer(&self, request: &AnalysisRequest) -> Result<AnalysisOutput> {
        match tokio::time::timeout(self.analysis_timeout, self.analyzer.analyze(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    session_file = %request.session_file,
                    segment_end = %request.segment.end_entry_id,
                    timeout_secs = self.analysis_timeout.as_secs(),
                    "Analysis timed out"
                );
                Err(Error::AnalyzerTimeout(self.analysis_timeout.as_secs() / 60))
            }
        }
    }

    fn build_node(&self, request: &AnalysisRequest, output: &AnalysisOutput) -> Node {
        let segment = &request.segment;
        let mut classification = output.classification.clone();
        if classification.project.is_empty() {
            classification.project = request.project.clone();
        }

        let node = Node::new(
            NodeSource {
                session_file: request.session_file.clone(),
                session_id: request.session_id.clone(),
                segment: SegmentSpan {
                    start_entry_id: segment.start_entry_id.clone(),
                    end_entry_id: segment.end_entry_id.clone(),
                    entry_count: segment.entry_count,
                },
                host: Some(self.host.clone()),
                parent_session: request.parent_session.clone(),
            },
            classification,
            output.content.clone(),
            NodeMetadata {
                tokens_used: output.tokens_used,
                cost: output.cost,
                duration_minutes: segment.duration_minutes(),
                timestamp: segment.start_timestamp,
                analyzed_at: Utc::now(),
                analyzer_version: self.analyzer.version().to_string(),
            },
        )
        .with_lessons(output.lessons.clone())
        .with_observations(output.observations.clone())
        .with_semantic(output.semantic.clone())
        .with_daemon_meta(output.daemon_meta.clone());

        match output.importance {
            Some(importance) => node.with_importance(importance.clamp(0.0, 1.0)),
            None => node,
        }
    }

    /// Embedding for a node; failures are left for the backfill job
    async fn embed_node(&self, node: &Node) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[node.embedding_text()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Embedding failed, leaving it to backfill");
                None
            }
        }
    }

    /// Structural edges between this segment's node and its neighbours
    ///
    /// Segments may be analysed out of order, so both the incoming edge (from
    /// the previous segment) and the outgoing one (to the next segment) are
    /// attempted; whichever node is written second creates the edge.
    async fn link_structural(
        &self,
        node: &Node,
        session_file: &str,
        session: &SessionFile,
        segments: &[Segment],
        index: usize,
    ) -> Result<()> {
        if index > 0 {
            let previous = &segments[index - 1];
            if let Some(from) = self
                .store
                .find_node_by_segment(session_file, &previous.end_entry_id)
                .await?
            {
                for boundary in &segments[index].boundaries {
                    self.store
                        .create_edge(&structural_edge(&from.id, &node.id, boundary)?)
                        .await?;
                }
            }
        } else if let Some(parent) = parent_session(session) {
            if let Some(fork_point) = self.store.nodes_for_session(&parent).await?.last() {
                let edge = Edge::new(&fork_point.id, &node.id, EdgeType::Fork, EdgeCreator::Boundary)
                    .with_metadata(json!({ "parent_session": parent }));
                self.store.create_edge(&edge).await?;
            }
        }

        if let Some(next) = segments.get(index + 1) {
            if let Some(to) = self
                .store
                .find_node_by_segment(session_file, &next.end_entry_id)
                .await?
            {
                for boundary in &next.boundaries {
                    self.store
                        .create_edge(&structural_edge(&node.id, &to.id, boundary)?)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Turn analyzer relationship proposals into edges to known nodes
    async fn resolve_relationships(&self, node_id: &str, proposals: &[RelationshipProposal]) -> Result<usize> {
        let mut created = 0;
        for proposal in proposals {
            if proposal.target_node_id == node_id {
                continue;
            }
            if self.store.load_latest(&proposal.target_node_id).await?.is_none() {
                debug!(
                    node_id = %node_id,
                    target = %proposal.target_node_id,
                    kind = proposal.kind.as_str(),
                    "Dropping relationship to unknown node"
                );
                continue;
            }

            let edge = Edge::new(
                node_id,
                &proposal.target_node_id,
                proposal.kind.edge_type(),
                EdgeCreator::Daemon,
            )
            .with_confidence(proposal.confidence)
            .with_metadata(json!({
                "relationship": proposal.kind.as_str(),
                "reason": proposal.reason,
            }));
            self.store.create_edge(&edge).await?;
            created += 1;
        }
        Ok(created)
    }

    // ---- maintenance ----

    /// Link a node to its nearest neighbours with semantic edges
    pub async fn discover_connections(&self, node_id: &str) -> Result<usize> {
        let discovery = &self.config.daemon.discovery;
        let Some(vector) = self.store.get_embedding(node_id).await? else {
            debug!(node_id = %node_id, "No embedding, nothing to discover");
            self.store.record_discovery_run(node_id, Utc::now(), 0).await?;
            return Ok(0);
        };

        let options = SearchOptions {
            limit: discovery.neighbours + 1,
            filters: NodeFilters::default(),
            max_distance: Some(discovery.max_distance),
        };

        let mut created = 0;
        for hit in self.store.semantic_search(&vector, &options).await? {
            if hit.node.id == node_id
                || self
                    .store
                    .has_edge_between(node_id, &hit.node.id, EdgeType::Semantic)
                    .await?
            {
                continue;
            }
            let similarity = hit.similarity() as f64;
            let edge = Edge::new(node_id, &hit.node.id, EdgeType::Semantic, EdgeCreator::Daemon)
                .with_similarity(similarity)
                .with_confidence(similarity);
            self.store.create_edge(&edge).await?;
            created += 1;
        }

        self.store
            .record_discovery_run(node_id, Utc::now(), created)
            .await?;
        info!(node_id = %node_id, edges_created = created, "Connection discovery complete");
        Ok(created)
    }

    /// Embed nodes that have no vector yet
    pub async fn backfill_embeddings(&self, limit: usize) -> Result<usize> {
        let Some(embedder) = &self.embedder else {
            debug!("No embedding provider configured, skipping backfill");
            return Ok(0);
        };

        let nodes = self.store.nodes_missing_embeddings(limit).await?;
        let mut embedded = 0;
        for chunk in nodes.chunks(self.config.embedding.batch_size.max(1)) {
            let texts: Vec<String> = chunk.iter().map(Node::embedding_text).collect();
            let vectors = embedder.embed(&texts).await?;
            for ((node, text), vector) in chunk.iter().zip(&texts).zip(&vectors) {
                self.store.upsert_embedding(&node.id, vector, text).await?;
                embedded += 1;
            }
        }

        info!(embedded = embedded, "Embedding backfill complete");
        Ok(embedded)
    }

    /// Apply relevance decay and purge old completed jobs
    pub async fn decay(&self) -> Result<DecayReport> {
        let now = Utc::now();
        let report = self.store.apply_decay(&self.config.decay, now).await?;

        let cutoff = now - Duration::days(self.config.daemon.purge_completed_after_days);
        let purged = self.queue.purge_completed(cutoff).await?;

        info!(
            archived = report.archived,
            purged_jobs = purged,
            "Decay run complete"
        );
        Ok(report)
    }
}

fn required<'a>(value: Option<&'a str>, job: &Job, field: &str) -> Result<&'a str> {
    value.ok_or_else(|| {
        Error::Validation(format!(
            "{} job '{}' has no {field}",
            job.job_type.as_str(),
            job.id
        ))
    })
}

fn parent_session(session: &SessionFile) -> Option<String> {
    session.header.as_ref().and_then(|h| h.parent_session.clone())
}

fn structural_edge(from: &str, to: &str, boundary: &Boundary) -> Result<Edge> {
    Ok(Edge::new(from, to, boundary.edge_type(), EdgeCreator::Boundary).with_metadata(json!({
        "entry_id": boundary.entry_id,
        "previous_entry_id": boundary.previous_entry_id,
        "detail": serde_json::to_value(&boundary.metadata)?,
    })))
}

/// Parse a session file; a file that is gone will not come back on retry
async fn load_session(path: &str) -> Result<SessionFile> {
    match parse_session_file(path).await {
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Validation(
            format!("session file '{path}' no longer exists"),
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::test_support::*;
    use crate::graph::{NodeType, RelationshipKind};
    use crate::queue::{NewJob, QueueConfig};
    use crate::storage::Database;

    struct Fixture {
        dir: tempfile::TempDir,
        session: String,
        processor: JobProcessor,
        analyzer: Arc<StubAnalyzer>,
    }

    async fn fixture(embed: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let session = write_session(dir.path(), "s1.jsonl", &session_jsonl(None));
        let db = Database::in_memory().await.unwrap();
        let store = GraphStore::new(db.pool().clone()).with_embedding_index("stub", STUB_DIMENSIONS);
        let queue = JobQueue::new(db.pool().clone(), QueueConfig::default());
        let analyzer = Arc::new(StubAnalyzer::new("v1"));
        let embedder: Option<Arc<dyn EmbeddingProvider>> = if embed {
            Some(Arc::new(StubEmbedder))
        } else {
            None
        };
        let processor = JobProcessor::new(
            store,
            queue,
            analyzer.clone(),
            embedder,
            Arc::new(Config::default()),
        );
        Fixture {
            dir,
            session: session.to_string_lossy().into_owned(),
            processor,
            analyzer,
        }
    }

    async fn claim(processor: &JobProcessor, job: NewJob) -> Job {
        let id = processor.queue().enqueue(job).await.unwrap().job_id().to_string();
        processor
            .queue()
            .try_claim(&id, "w1", Duration::minutes(5))
            .await
            .unwrap()
    }

    /// Claim, process and complete one job
    async fn run(processor: &JobProcessor, job: NewJob) -> Result<Option<String>> {
        let job = claim(processor, job).await;
        let result = processor.process(&job).await?;
        processor
            .queue()
            .complete(&job.id, "w1", result.as_deref())
            .await
            .unwrap();
        Ok(result)
    }

    async fn segments_of(path: &str) -> Vec<Segment> {
        let parsed = parse_session_file(path).await.unwrap();
        extract_segments(&parsed.entries)
    }

    async fn analyze_all(fx: &Fixture) -> Vec<String> {
        let mut ids = Vec::new();
        for segment in segments_of(&fx.session).await {
            let id = run(&fx.processor, NewJob::analysis(&fx.session, &segment)).await.unwrap();
            ids.push(id.unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_initial_analysis_creates_linked_nodes() {
        let fx = fixture(true).await;
        let ids = analyze_all(&fx).await;
        assert_eq!(ids.len(), 2);

        let store = fx.processor.store();
        let first = store.load_latest(&ids[0]).await.unwrap().unwrap();
        assert_eq!(first.classification.project, "webapp");
        assert_eq!(first.metadata.analyzer_version, "v1");
        assert_eq!(first.source.segment.entry_count, 4);
        assert!(first.source.host.is_some());
        assert!(first.signals.is_some());
        assert!(store.get_embedding(&ids[0]).await.unwrap().is_some());

        // the resume boundary between the segments becomes a structural edge
        let edges = store.edges_for_node(&ids[1]).await.unwrap();
        assert!(edges.iter().any(|e| e.edge_type == EdgeType::Resume
            && e.source_node_id == ids[0]
            && e.created_by == EdgeCreator::Boundary));

        // the second analysis saw the first node as the project's previous node
        assert_eq!(fx.analyzer.last_previous_node().as_deref(), Some(ids[0].as_str()));
    }

    #[tokio::test]
    async fn test_out_of_order_segments_still_link() {
        let fx = fixture(false).await;
        let segments = segments_of(&fx.session).await;

        let second = run(&fx.processor, NewJob::analysis(&fx.session, &segments[1])).await.unwrap();
        let first = run(&fx.processor, NewJob::analysis(&fx.session, &segments[0])).await.unwrap();

        let edges = fx.processor.store().edges_for_node(first.as_deref().unwrap()).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(Some(edges[0].target_node_id.clone()), second);
    }

    #[tokio::test]
    async fn test_rerun_for_analysed_segment_reuses_node() {
        let fx = fixture(false).await;
        let ids = analyze_all(&fx).await;
        let calls = fx.analyzer.calls();

        let segment = segments_of(&fx.session).await.remove(0);
        let again = run(&fx.processor, NewJob::analysis(&fx.session, &segment)).await.unwrap();

        assert_eq!(again.as_deref(), Some(ids[0].as_str()));
        assert_eq!(fx.analyzer.calls(), calls);
        assert_eq!(fx.processor.store().edges_for_node(&ids[0]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_grown_segment_gets_new_version_not_new_node() {
        let fx = fixture(false).await;
        let ids = analyze_all(&fx).await;

        let mut text = session_jsonl(None);
        text.push_str(
            r#"{"type":"message","id":"e7","parentId":"e6","timestamp":"2024-01-01T10:32:00Z","message":{"role":"user","content":"thanks"}}"#,
        );
        text.push('\n');
        std::fs::write(&fx.session, text).unwrap();

        let grown = analyze_all(&fx).await;
        assert_eq!(grown, ids);

        let store = fx.processor.store();
        assert_eq!(store.nodes_for_session(&fx.session).await.unwrap().len(), 2);
        assert!(store.find_node_by_segment(&fx.session, "e6").await.unwrap().is_none());

        let last = store.load_latest(&ids[1]).await.unwrap().unwrap();
        assert_eq!(last.version, 2);
        assert_eq!(last.source.segment.start_entry_id, "e5");
        assert_eq!(last.source.segment.end_entry_id, "e7");
        assert_eq!(last.source.segment.entry_count, 3);
        assert_eq!(last.daemon_meta.reanalysis_trigger.as_deref(), Some("session_grew"));
        assert_eq!(last.previous_versions, vec![format!("{}-v1", ids[1])]);

        // the earlier span stays readable as version 1
        let v1 = store.get_node_version(&ids[1], 1).await.unwrap().unwrap();
        assert_eq!(v1.source.segment.end_entry_id, "e6");

        // reanalysis finds the segment by its start after the growth
        let again = run(&fx.processor, NewJob::reanalysis(&ids[1])).await.unwrap();
        assert_eq!(again.as_deref(), Some(ids[1].as_str()));
        assert_eq!(store.load_latest(&ids[1]).await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_fork_edge_from_parent_session() {
        let fx = fixture(false).await;
        let parent_ids = analyze_all(&fx).await;

        let child = write_session(fx.dir.path(), "child.jsonl", &session_jsonl(Some(&fx.session)))
            .to_string_lossy()
            .into_owned();
        let segment = segments_of(&child).await.remove(0);
        let child_id = run(&fx.processor, NewJob::analysis(&child, &segment))
            .await
            .unwrap()
            .unwrap();

        let child_node = fx.processor.store().load_latest(&child_id).await.unwrap().unwrap();
        assert_eq!(child_node.source.parent_session.as_deref(), Some(fx.session.as_str()));

        let edges = fx.processor.store().edges_for_node(&child_id).await.unwrap();
        assert!(edges.iter().any(|e| e.edge_type == EdgeType::Fork
            && e.source_node_id == parent_ids[1]
            && e.target_node_id == child_id));
    }

    #[tokio::test]
    async fn test_relationship_proposals_resolve_to_known_nodes() {
        let fx = fixture(false).await;
        let ids = analyze_all(&fx).await;

        fx.analyzer.propose(vec![
            RelationshipProposal {
                kind: RelationshipKind::Reinforces,
                target_node_id: ids[0].clone(),
                confidence: 0.9,
                reason: "same fix".to_string(),
            },
            RelationshipProposal {
                kind: RelationshipKind::LeadsTo,
                target_node_id: "ffffffffffffffff".to_string(),
                confidence: 0.9,
                reason: String::new(),
            },
            RelationshipProposal {
                kind: RelationshipKind::RelatesTo,
                target_node_id: ids[1].clone(),
                confidence: 0.9,
                reason: String::new(),
            },
        ]);

        let id = run(&fx.processor, NewJob::reanalysis(&ids[1])).await.unwrap();
        assert_eq!(id.as_deref(), Some(ids[1].as_str()));

        let edges = fx.processor.store().edges_for_node(&ids[1]).await.unwrap();
        let lesson = edges
            .iter()
            .find(|e| e.edge_type == EdgeType::LessonApplication)
            .unwrap();
        assert_eq!(lesson.target_node_id, ids[0]);
        assert_eq!(lesson.created_by, EdgeCreator::Daemon);
        assert_eq!(lesson.metadata["relationship"], "REINFORCES");
        assert!(!edges.iter().any(|e| e.target_node_id == "ffffffffffffffff"));
        assert!(!edges.iter().any(|e| e.edge_type == EdgeType::Semantic));
    }

    #[tokio::test]
    async fn test_reanalysis_writes_new_version() {
        let fx = fixture(true).await;
        let ids = analyze_all(&fx).await;

        run(
            &fx.processor,
            NewJob::reanalysis(&ids[0]).with_context(json!({ "trigger": "analyzer_version" })),
        )
        .await
        .unwrap();

        let versions = fx.processor.store().list_versions(&ids[0]).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].previous_versions, vec![format!("{}-v1", ids[0])]);
        assert_eq!(
            versions[1].daemon_meta.reanalysis_trigger.as_deref(),
            Some("analyzer_version")
        );
        assert_eq!(versions[1].classification.node_type, NodeType::Coding);
        assert!(fx.processor.store().embedding_is_current(&versions[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_session_and_node_are_not_retryable() {
        let fx = fixture(false).await;

        let err = run(&fx.processor, NewJob::reanalysis("0123456789abcdef")).await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
        assert!(!err.is_retryable());

        let segment = segments_of(&fx.session).await.remove(0);
        let err = run(&fx.processor, NewJob::analysis("/nonexistent/s.jsonl", &segment))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_analysis_timeout_is_retryable() {
        let fx = fixture(false).await;
        fx.analyzer.set_delay(StdDuration::from_secs(5));
        let processor = fx
            .processor
            .clone()
            .with_analysis_timeout(StdDuration::from_millis(50));

        let segment = segments_of(&fx.session).await.remove(0);
        let err = run(&processor, NewJob::analysis(&fx.session, &segment)).await.unwrap_err();
        assert!(matches!(err, Error::AnalyzerTimeout(_)));
        assert!(err.is_retryable());
        assert!(processor.store().find_node_by_segment(&fx.session, &segment.end_entry_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_backfill_and_discovery() {
        let fx = fixture(false).await;
        let ids = analyze_all(&fx).await;
        assert!(fx.processor.store().get_embedding(&ids[0]).await.unwrap().is_none());
        // no provider configured
        assert_eq!(fx.processor.backfill_embeddings(10).await.unwrap(), 0);

        let processor = JobProcessor {
            embedder: Some(Arc::new(StubEmbedder)),
            ..fx.processor.clone()
        };
        assert_eq!(processor.backfill_embeddings(10).await.unwrap(), 2);
        assert_eq!(processor.backfill_embeddings(10).await.unwrap(), 0);

        // stub summaries differ only in the entry id, so the nodes are close
        assert_eq!(processor.discover_connections(&ids[0]).await.unwrap(), 1);
        assert!(processor
            .store()
            .has_edge_between(&ids[1], &ids[0], EdgeType::Semantic)
            .await
            .unwrap());
        assert!(processor.store().last_discovery_run(&ids[0]).await.unwrap().is_some());
        assert_eq!(processor.discover_connections(&ids[0]).await.unwrap(), 0);
        assert_eq!(processor.discover_connections(&ids[1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_jobs_run() {
        let fx = fixture(true).await;
        analyze_all(&fx).await;

        for job_type in [
            JobType::Clustering,
            JobType::PatternAggregation,
            JobType::Effectiveness,
            JobType::Decay,
            JobType::BackfillEmbeddings,
        ] {
            let result = run(&fx.processor, NewJob::maintenance(job_type)).await.unwrap();
            assert_eq!(result, None, "{job_type}");
        }
    }
}
