//! Graph persistence
//!
//! Node versions, edges and the full-text and vector indices live in SQLite.
//! A node write and its index rows share one transaction, so readers either
//! see all of them or none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::{format_timestamp, parse_optional_timestamp, parse_timestamp};

use super::edge::{Edge, EdgeCreator, EdgeType};
use super::node::{ManualFlag, Node, NodeContentUpdate, NodeSignals, NodeType, Outcome};
use super::vector::{cosine_distance, decode_vector, encode_vector};

/// Relevance added to a node each time it is read
pub const DEFAULT_ACCESS_BOOST: f64 = 0.05;

/// Restricts a query to the latest version of each node
const LATEST: &str = "n.version = (SELECT MAX(m.version) FROM nodes m WHERE m.id = n.id)";

const NODE_COLUMNS: &str =
    "n.id, n.version, n.data, n.signals, n.relevance_score, n.importance, n.archived, n.last_accessed";

const EDGE_COLUMNS: &str = "id, source_node_id, target_node_id, edge_type, metadata, created_by, \
     confidence, similarity, created_at";

/// Metadata filters applied to node listings and search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilters {
    pub node_type: Option<NodeType>,
    pub project: Option<String>,
    pub outcome: Option<Outcome>,
    pub tag: Option<String>,
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_archived: bool,
}

impl NodeFilters {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    /// Whether a node passes every filter that is set
    pub fn matches(&self, node: &Node) -> bool {
        if node.archived && !self.include_archived {
            return false;
        }
        if let Some(node_type) = self.node_type {
            if node.classification.node_type != node_type {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if &node.classification.project != project {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if node.content.outcome != outcome {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !node.semantic.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if node.metadata.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Options for nearest-neighbour search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub filters: NodeFilters,
    /// Drop hits farther than this cosine distance
    pub max_distance: Option<f32>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            filters: NodeFilters::default(),
            max_distance: None,
        }
    }
}

/// One nearest-neighbour result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub node: Node,
    /// Cosine distance to the query
    pub distance: f32,
}

impl SearchHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// A node reachable from another through edges
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ConnectedNode {
    pub node_id: String,
    pub depth: i64,
}

/// Counts over the whole graph
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    /// Distinct node ids
    pub nodes: u64,
    /// Node rows across all versions
    pub versions: u64,
    pub edges: u64,
    pub embeddings: u64,
    pub archived: u64,
}

/// Store for nodes, edges and their indices
#[derive(Debug, Clone)]
pub struct GraphStore {
    pool: SqlitePool,
    embedding_model: String,
    embedding_dimensions: Option<usize>,
    access_boost: f64,
}

impl GraphStore {
    /// Create a new graph store with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            embedding_model: String::new(),
            embedding_dimensions: None,
            access_boost: DEFAULT_ACCESS_BOOST,
        }
    }

    /// Fix the embedding model and dimensionality the vector index accepts
    ///
    /// Without this, the dimensionality of the first stored vector is used.
    pub fn with_embedding_index(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_dimensions = Some(dimensions);
        self
    }

    pub fn with_access_boost(mut self, access_boost: f64) -> Self {
        self.access_boost = access_boost;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- nodes ----

    /// Insert a node version with its index rows and optional embedding
    ///
    /// Fails with `DuplicateId` if the id and version already exist; nothing
    /// is written in that case.
    pub async fn create_node(&self, node: &Node, embedding: Option<&[f32]>) -> Result<()> {
        node.validate()?;
        if let Some(vector) = embedding {
            self.check_dimensions(vector.len()).await?;
        }

        let mut tx = self.pool.begin().await?;
        insert_node_row(&mut tx, node).await?;
        replace_derived_rows(&mut tx, node).await?;
        if let Some(vector) = embedding {
            write_embedding(
                &mut tx,
                &node.id,
                &self.embedding_model,
                vector,
                &text_hash(&node.embedding_text()),
            )
            .await?;
        }
        tx.commit().await?;

        info!(
            node_id = %node.id,
            version = node.version,
            project = %node.classification.project,
            embedded = embedding.is_some(),
            "Node created"
        );
        Ok(())
    }

    /// Write the next version of a node; earlier versions are left untouched
    pub async fn create_version(
        &self,
        node_id: &str,
        update: NodeContentUpdate,
        trigger: &str,
    ) -> Result<Node> {
        let current = self
            .load_latest(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let next = current.next_version(update, trigger, Utc::now());
        next.validate()?;

        let mut tx = self.pool.begin().await?;
        insert_node_row(&mut tx, &next).await?;
        replace_derived_rows(&mut tx, &next).await?;
        tx.commit().await?;

        info!(
            node_id = %next.id,
            version = next.version,
            trigger = %trigger,
            "Node version created"
        );
        Ok(next)
    }

    /// Get the latest version of a node, recording the access
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let Some(mut node) = self.load_latest(id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE nodes
            SET last_accessed = ?,
                relevance_score = MIN(1.0, relevance_score + ?)
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(format_timestamp(now))
        .bind(self.access_boost)
        .bind(&node.id)
        .bind(node.version as i64)
        .execute(&self.pool)
        .await?;

        node.last_accessed = Some(now);
        node.relevance_score = (node.relevance_score + self.access_boost).min(1.0);
        Ok(Some(node))
    }

    /// Get a specific version of a node without recording an access
    pub async fn get_node_version(&self, id: &str, version: u32) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.id = ? AND n.version = ?"
        ))
        .bind(id)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRow::into_node).transpose()
    }

    /// All versions of a node, oldest first
    pub async fn list_versions(&self, id: &str) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.id = ? ORDER BY n.version ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Most recent non-archived node of a project strictly before `before`
    pub async fn find_previous_project_node(
        &self,
        project: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST}
              AND n.project = ?
              AND n.archived = 0
              AND n.timestamp < ?
            ORDER BY n.timestamp DESC
            LIMIT 1
            "#
        ))
        .bind(project)
        .bind(format_timestamp(before))
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRow::into_node).transpose()
    }

    /// The node analysing a given session segment, if one exists
    pub async fn find_node_by_segment(
        &self,
        session_file: &str,
        end_entry_id: &str,
    ) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST} AND n.session_file = ? AND n.segment_end = ?
            LIMIT 1
            "#
        ))
        .bind(session_file)
        .bind(end_entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRow::into_node).transpose()
    }

    /// The node whose segment starts at `start_entry_id`, whatever its end
    ///
    /// A segment keeps its start when the session file grows, so this finds
    /// the node of a segment that has since gained entries.
    pub async fn find_node_by_segment_start(
        &self,
        session_file: &str,
        start_entry_id: &str,
    ) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST} AND n.session_file = ? AND n.segment_start = ?
            LIMIT 1
            "#
        ))
        .bind(session_file)
        .bind(start_entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRow::into_node).transpose()
    }

    /// Latest node of every session, segment by segment, in session order
    pub async fn nodes_for_session(&self, session_file: &str) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST} AND n.session_file = ?
            ORDER BY n.timestamp ASC
            "#
        ))
        .bind(session_file)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Non-archived nodes analysed at or after `since`, newest first
    pub async fn list_recent_nodes(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST} AND n.archived = 0 AND n.analyzed_at >= ?
            ORDER BY n.analyzed_at DESC
            LIMIT ?
            "#
        ))
        .bind(format_timestamp(since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Non-archived nodes analysed by a different analyzer version, oldest first
    pub async fn list_stale_nodes(&self, analyzer_version: &str, limit: usize) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            WHERE {LATEST} AND n.archived = 0 AND n.analyzer_version != ?
            ORDER BY n.timestamp ASC
            LIMIT ?
            "#
        ))
        .bind(analyzer_version)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Latest versions matching the filters, newest first
    pub async fn list_nodes(&self, filters: &NodeFilters, limit: usize) -> Result<Vec<Node>> {
        let mut sql = format!("SELECT {NODE_COLUMNS} FROM nodes n WHERE {LATEST}");
        let mut binds: Vec<String> = Vec::new();

        if !filters.include_archived {
            sql.push_str(" AND n.archived = 0");
        }
        if let Some(node_type) = filters.node_type {
            sql.push_str(" AND n.node_type = ?");
            binds.push(node_type.as_str().to_string());
        }
        if let Some(project) = &filters.project {
            sql.push_str(" AND n.project = ?");
            binds.push(project.clone());
        }
        if let Some(outcome) = filters.outcome {
            sql.push_str(" AND n.outcome = ?");
            binds.push(outcome.as_str().to_string());
        }
        if let Some(tag) = &filters.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM node_tags t WHERE t.node_id = n.id AND t.tag = ?)");
            binds.push(tag.clone());
        }
        if let Some(since) = filters.since {
            sql.push_str(" AND n.timestamp >= ?");
            binds.push(format_timestamp(since));
        }
        sql.push_str(" ORDER BY n.timestamp DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, NodeRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Full-text search over summaries, decisions, lessons, tags and topics
    pub async fn search_text(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes_fts
            JOIN nodes n ON n.id = nodes_fts.node_id
            WHERE nodes_fts MATCH ? AND {LATEST} AND n.archived = 0
            ORDER BY rank
            LIMIT ?
            "#
        ))
        .bind(&match_expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(query = %query, hits = rows.len(), "Full-text search");
        rows.into_iter().map(NodeRow::into_node).collect()
    }

    // ---- vector index ----

    /// Nearest neighbours of `query` by cosine distance, post-filtered
    ///
    /// Equal distances keep index insertion order.
    pub async fn semantic_search(&self, query: &[f32], options: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.check_dimensions(query.len()).await?;

        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT node_id, embedding FROM node_embeddings
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .map(|(node_id, blob)| {
                let distance = cosine_distance(query, &decode_vector(&blob));
                (node_id, distance)
            })
            .filter(|(_, distance)| options.max_distance.is_none_or(|max| *distance <= max))
            .collect();

        // stable sort keeps rowid order among equal distances
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits = Vec::new();
        for (node_id, distance) in scored {
            if hits.len() >= options.limit {
                break;
            }
            if let Some(node) = self.load_latest(&node_id).await? {
                if options.filters.matches(&node) {
                    hits.push(SearchHit { node, distance });
                }
            }
        }

        debug!(hits = hits.len(), limit = options.limit, "Semantic search");
        Ok(hits)
    }

    /// Store or replace the embedding of a node
    pub async fn upsert_embedding(&self, node_id: &str, vector: &[f32], source_text: &str) -> Result<()> {
        self.check_dimensions(vector.len()).await?;

        let mut tx = self.pool.begin().await?;
        write_embedding(&mut tx, node_id, &self.embedding_model, vector, &text_hash(source_text)).await?;
        tx.commit().await?;

        debug!(node_id = %node_id, dimensions = vector.len(), "Embedding saved");
        Ok(())
    }

    pub async fn get_embedding(&self, node_id: &str) -> Result<Option<Vec<f32>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT embedding FROM node_embeddings WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(blob,)| decode_vector(&blob)))
    }

    /// Whether the stored embedding was computed from the node's current text
    pub async fn embedding_is_current(&self, node: &Node) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT text_hash FROM node_embeddings WHERE node_id = ?")
                .bind(&node.id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some_and(|(hash,)| hash == text_hash(&node.embedding_text())))
    }

    /// Embeddings of every non-archived node, in insertion order
    pub async fn active_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(&format!(
            r#"
            SELECT e.node_id, e.embedding FROM node_embeddings e
            JOIN nodes n ON n.id = e.node_id
            WHERE {LATEST} AND n.archived = 0
            ORDER BY e.rowid ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, blob)| (id, decode_vector(&blob)))
            .collect())
    }

    /// Non-archived nodes with no vector in the index, oldest first
    pub async fn nodes_missing_embeddings(&self, limit: usize) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM nodes n
            LEFT JOIN node_embeddings e ON e.node_id = n.id
            WHERE {LATEST} AND n.archived = 0 AND e.node_id IS NULL
            ORDER BY n.timestamp ASC
            LIMIT ?
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// Reject vectors whose dimensionality differs from the index
    async fn check_dimensions(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::Validation("embedding vector is empty".to_string()));
        }

        let expected = match self.embedding_dimensions {
            Some(dimensions) => Some(dimensions),
            None => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT dimensions FROM node_embeddings ORDER BY rowid LIMIT 1")
                        .fetch_optional(&self.pool)
                        .await?;
                row.map(|(d,)| d as usize)
            }
        };

        match expected {
            Some(expected) if expected != len => Err(Error::Configuration(format!(
                "embedding has {len} dimensions but the index expects {expected}"
            ))),
            _ => Ok(()),
        }
    }

    // ---- edges ----

    /// Insert an edge, returning the stored one
    ///
    /// An edge with the same source, target and type is never duplicated; the
    /// existing row is returned instead.
    pub async fn create_edge(&self, edge: &Edge) -> Result<Edge> {
        if edge.source_node_id.is_empty() || edge.target_node_id.is_empty() {
            return Err(Error::Validation("edge endpoints must be set".to_string()));
        }
        if edge.source_node_id == edge.target_node_id {
            return Err(Error::Validation(format!(
                "edge from '{}' to itself",
                edge.source_node_id
            )));
        }

        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO edges (
                id, source_node_id, target_node_id, edge_type, metadata,
                created_by, confidence, similarity, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_node_id, target_node_id, edge_type) DO NOTHING
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.source_node_id)
        .bind(&edge.target_node_id)
        .bind(edge.edge_type.as_str())
        .bind(serde_json::to_string(&edge.metadata)?)
        .bind(edge.created_by.as_str())
        .bind(edge.confidence)
        .bind(edge.similarity)
        .bind(format_timestamp(edge.created_at))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(
                edge_id = %edge.id,
                source = %edge.source_node_id,
                target = %edge.target_node_id,
                edge_type = edge.edge_type.as_str(),
                "Edge created"
            );
        }

        let row: EdgeRow = sqlx::query_as(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE source_node_id = ? AND target_node_id = ? AND edge_type = ?"
        ))
        .bind(&edge.source_node_id)
        .bind(&edge.target_node_id)
        .bind(edge.edge_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.into_edge()
    }

    /// Update an edge's confidence and similarity; unset values are kept
    pub async fn refine_edge(
        &self,
        edge_id: &str,
        confidence: Option<f64>,
        similarity: Option<f64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE edges
            SET confidence = COALESCE(?, confidence),
                similarity = COALESCE(?, similarity),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(confidence.map(|c| c.clamp(0.0, 1.0)))
        .bind(similarity)
        .bind(format_timestamp(Utc::now()))
        .bind(edge_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("edge '{edge_id}' not found")));
        }
        Ok(())
    }

    /// Edges touching a node in either direction, oldest first
    pub async fn edges_for_node(&self, node_id: &str) -> Result<Vec<Edge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EDGE_COLUMNS} FROM edges
            WHERE source_node_id = ? OR target_node_id = ?
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(node_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    /// Whether any edge of `edge_type` joins two nodes, in either direction
    pub async fn has_edge_between(&self, a: &str, b: &str, edge_type: EdgeType) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM edges
            WHERE edge_type = ?
              AND ((source_node_id = ? AND target_node_id = ?)
                OR (source_node_id = ? AND target_node_id = ?))
            "#,
        )
        .bind(edge_type.as_str())
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 > 0)
    }

    /// Nodes reachable from `node_id` within `max_depth` hops, ignoring direction
    pub async fn get_connected_nodes(&self, node_id: &str, max_depth: u32) -> Result<Vec<ConnectedNode>> {
        let rows: Vec<ConnectedNode> = sqlx::query_as(
            r#"
            WITH RECURSIVE reachable(node_id, depth, path) AS (
                -- Base case: start node
                SELECT ?, 0, ?

                UNION ALL

                -- Recursive case: follow edges both ways
                SELECT
                    CASE
                        WHEN e.source_node_id = prev.node_id THEN e.target_node_id
                        ELSE e.source_node_id
                    END,
                    prev.depth + 1,
                    prev.path || ',' || CASE
                        WHEN e.source_node_id = prev.node_id THEN e.target_node_id
                        ELSE e.source_node_id
                    END
                FROM reachable prev
                JOIN edges e ON (
                    e.source_node_id = prev.node_id OR e.target_node_id = prev.node_id
                )
                WHERE prev.depth < ?
                    AND prev.path NOT LIKE '%' || CASE
                        WHEN e.source_node_id = prev.node_id THEN e.target_node_id
                        ELSE e.source_node_id
                    END || '%'
            )
            SELECT node_id, MIN(depth) AS depth
            FROM reachable
            WHERE node_id != ?
            GROUP BY node_id
            ORDER BY depth, node_id
            "#,
        )
        .bind(node_id)
        .bind(node_id)
        .bind(max_depth as i64)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ---- signals ----

    /// Write computed friction and delight onto the latest version of a node
    ///
    /// Manual flags already stored are kept as they are.
    pub async fn set_signals(&self, node_id: &str, signals: &NodeSignals) -> Result<()> {
        let empty = serde_json::to_string(&NodeSignals::default())?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE nodes AS n
            SET signals = json_set(
                COALESCE(n.signals, ?),
                '$.friction', json(?),
                '$.delight', json(?)
            )
            WHERE n.id = ? AND {LATEST}
            "#
        ))
        .bind(&empty)
        .bind(serde_json::to_string(&signals.friction)?)
        .bind(serde_json::to_string(&signals.delight)?)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }

        debug!(
            node_id = %node_id,
            friction = signals.friction.score,
            delight = signals.delight.score,
            "Signals updated"
        );
        Ok(())
    }

    /// Append a manual flag to a node's signals and return the result
    pub async fn append_manual_flag(&self, node_id: &str, flag: &ManualFlag) -> Result<NodeSignals> {
        let empty = serde_json::to_string(&NodeSignals::default())?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE nodes AS n
            SET signals = json_insert(COALESCE(n.signals, ?), '$.manual_flags[#]', json(?))
            WHERE n.id = ? AND {LATEST}
            "#
        ))
        .bind(&empty)
        .bind(serde_json::to_string(flag)?)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }

        info!(node_id = %node_id, flag = flag.flag_type.as_str(), "Manual flag appended");

        let node = self
            .load_latest(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        Ok(node.signals.unwrap_or_default())
    }

    // ---- connection discovery bookkeeping ----

    pub async fn last_discovery_run(&self, node_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_run_at FROM connection_discovery_runs WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(ts,)| parse_timestamp(&ts)))
    }

    pub async fn record_discovery_run(&self, node_id: &str, at: DateTime<Utc>, edges_created: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connection_discovery_runs (node_id, last_run_at, edges_created)
            VALUES (?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                edges_created = excluded.edges_created
            "#,
        )
        .bind(node_id)
        .bind(format_timestamp(at))
        .bind(edges_created as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts of nodes, versions, edges, embeddings and archived nodes
    pub async fn stats(&self) -> Result<GraphStats> {
        let (nodes, archived): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COUNT(*), COALESCE(SUM(n.archived), 0) FROM nodes n WHERE {LATEST}"
        ))
        .fetch_one(&self.pool)
        .await?;
        let (versions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        let (edges,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        let (embeddings,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM node_embeddings")
            .fetch_one(&self.pool)
            .await?;

        Ok(GraphStats {
            nodes: nodes as u64,
            versions: versions as u64,
            edges: edges as u64,
            embeddings: embeddings as u64,
            archived: archived as u64,
        })
    }

    /// Latest version without recording an access
    pub(crate) async fn load_latest(&self, id: &str) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.id = ? AND {LATEST}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(NodeRow::into_node).transpose()
    }
}

/// Hash of the text an embedding was computed from
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Turn free text into an FTS5 expression of quoted prefix terms
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

async fn insert_node_row(tx: &mut Transaction<'_, Sqlite>, node: &Node) -> Result<()> {
    let data = serde_json::to_string(node)?;
    let signals = node.signals.as_ref().map(serde_json::to_string).transpose()?;
    let previous_versions = serde_json::to_string(&node.previous_versions)?;

    sqlx::query(
        r#"
        INSERT INTO nodes (
            id, version, session_file, session_id, segment_start, segment_end, host,
            node_type, project, is_new_project, had_clear_goal,
            summary, outcome, timestamp, analyzed_at, analyzer_version,
            tokens_used, cost, duration_minutes,
            data, signals, previous_versions, created_at,
            relevance_score, importance, archived, last_accessed
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?,
            ?, ?, ?, ?, ?,
            ?, ?, ?,
            ?, ?, ?, ?,
            ?, ?, ?, ?
        )
        "#,
    )
    .bind(&node.id)
    .bind(node.version as i64)
    .bind(&node.source.session_file)
    .bind(&node.source.session_id)
    .bind(&node.source.segment.start_entry_id)
    .bind(&node.source.segment.end_entry_id)
    .bind(&node.source.host)
    .bind(node.classification.node_type.as_str())
    .bind(&node.classification.project)
    .bind(node.classification.is_new_project)
    .bind(node.classification.had_clear_goal)
    .bind(&node.content.summary)
    .bind(node.content.outcome.as_str())
    .bind(format_timestamp(node.metadata.timestamp))
    .bind(format_timestamp(node.metadata.analyzed_at))
    .bind(&node.metadata.analyzer_version)
    .bind(node.metadata.tokens_used as i64)
    .bind(node.metadata.cost)
    .bind(node.metadata.duration_minutes)
    .bind(&data)
    .bind(&signals)
    .bind(&previous_versions)
    .bind(format_timestamp(Utc::now()))
    .bind(node.relevance_score)
    .bind(node.importance)
    .bind(node.archived)
    .bind(node.last_accessed.map(format_timestamp))
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::from_insert(e, &node.id, node.version))?;

    Ok(())
}

/// Replace the FTS and per-node derived rows with those of `node`
async fn replace_derived_rows(tx: &mut Transaction<'_, Sqlite>, node: &Node) -> Result<()> {
    for table in ["nodes_fts", "lessons", "node_tags", "node_topics", "model_quirks", "tool_errors"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE node_id = ?"))
            .bind(&node.id)
            .execute(&mut **tx)
            .await?;
    }

    let decisions = node
        .content
        .key_decisions
        .iter()
        .map(|d| format!("{} {}", d.what, d.why))
        .collect::<Vec<_>>()
        .join("\n");
    let lessons = node
        .lessons
        .iter()
        .map(|(_, l)| format!("{} {}", l.summary, l.details))
        .collect::<Vec<_>>()
        .join("\n");

    sqlx::query(
        "INSERT INTO nodes_fts (node_id, summary, decisions, lessons, tags, topics) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.id)
    .bind(&node.content.summary)
    .bind(&decisions)
    .bind(&lessons)
    .bind(node.semantic.tags.join(" "))
    .bind(node.semantic.topics.join(" "))
    .execute(&mut **tx)
    .await?;

    let now = format_timestamp(Utc::now());

    for (level, lesson) in node.lessons.iter() {
        sqlx::query(
            r#"
            INSERT INTO lessons (node_id, level, summary, details, confidence, tags, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(level.as_str())
        .bind(&lesson.summary)
        .bind(&lesson.details)
        .bind(lesson.confidence.as_str())
        .bind(serde_json::to_string(&lesson.tags)?)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }

    for tag in &node.semantic.tags {
        sqlx::query("INSERT OR IGNORE INTO node_tags (node_id, tag) VALUES (?, ?)")
            .bind(&node.id)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }

    for topic in &node.semantic.topics {
        sqlx::query("INSERT OR IGNORE INTO node_topics (node_id, topic) VALUES (?, ?)")
            .bind(&node.id)
            .bind(topic)
            .execute(&mut **tx)
            .await?;
    }

    for quirk in &node.observations.model_quirks {
        sqlx::query(
            r#"
            INSERT INTO model_quirks (node_id, model, observation, frequency, workaround, severity, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&quirk.model)
        .bind(&quirk.observation)
        .bind(&quirk.frequency)
        .bind(&quirk.workaround)
        .bind(quirk.severity.as_str())
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }

    for error in &node.observations.tool_use_errors {
        sqlx::query(
            r#"
            INSERT INTO tool_errors (node_id, tool, error_type, context, model, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&error.tool)
        .bind(&error.error_type)
        .bind(&error.context)
        .bind(&error.model)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn write_embedding(
    tx: &mut Transaction<'_, Sqlite>,
    node_id: &str,
    model: &str,
    vector: &[f32],
    text_hash: &str,
) -> Result<()> {
    let now = format_timestamp(Utc::now());
    sqlx::query(
        r#"
        INSERT INTO node_embeddings (node_id, embedding_model, dimensions, embedding, text_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(node_id) DO UPDATE SET
            embedding_model = excluded.embedding_model,
            dimensions = excluded.dimensions,
            embedding = excluded.embedding,
            text_hash = excluded.text_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(node_id)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(encode_vector(vector))
    .bind(text_hash)
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Database row for the nodes table
#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    version: i64,
    data: String,
    signals: Option<String>,
    relevance_score: f64,
    importance: f64,
    archived: bool,
    last_accessed: Option<String>,
}

impl NodeRow {
    /// Rebuild a node; the mutable columns override the stored document
    fn into_node(self) -> Result<Node> {
        let mut node: Node = serde_json::from_str(&self.data)?;
        node.id = self.id;
        node.version = self.version as u32;
        node.signals = self
            .signals
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        node.relevance_score = self.relevance_score;
        node.importance = self.importance;
        node.archived = self.archived;
        node.last_accessed = parse_optional_timestamp(self.last_accessed.as_deref());
        Ok(node)
    }
}

/// Database row for the edges table
#[derive(Debug, FromRow)]
struct EdgeRow {
    id: String,
    source_node_id: String,
    target_node_id: String,
    edge_type: String,
    metadata: String,
    created_by: String,
    confidence: Option<f64>,
    similarity: Option<f64>,
    created_at: String,
}

impl EdgeRow {
    fn into_edge(self) -> Result<Edge> {
        let edge_type = EdgeType::parse(&self.edge_type)
            .ok_or_else(|| Error::Validation(format!("unknown edge type '{}'", self.edge_type)))?;

        Ok(Edge {
            id: self.id,
            source_node_id: self.source_node_id,
            target_node_id: self.target_node_id,
            edge_type,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_timestamp(&self.created_at),
            created_by: EdgeCreator::parse(&self.created_by),
            confidence: self.confidence,
            similarity: self.similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::test_support::{sample_node, sample_update};
    use super::super::node::{
        version_ref, DelightSignals, FrictionSignals, ManualFlagType, Semantic,
    };
    use super::*;
    use crate::storage::Database;
    use chrono::{Duration, TimeZone};

    async fn setup_test_store() -> GraphStore {
        let db = Database::in_memory().await.expect("Failed to create database");
        GraphStore::new(db.pool().clone())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_node() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());

        store.create_node(&node, None).await.unwrap();

        let loaded = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, node.content);
        assert_eq!(loaded.version, 1);
        assert!(loaded.last_accessed.is_some());
        assert!(store.get_node("0000000000000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rolls_back() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());
        store.create_node(&node, None).await.unwrap();

        let mut clash = node.clone();
        clash.content.summary = "zebra migration".to_string();
        let err = store.create_node(&clash, Some(&[1.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId { version: 1, .. }));

        // neither the FTS row nor the vector row of the failed write survive
        assert!(store.search_text("zebra", 10).await.unwrap().is_empty());
        assert_eq!(store.search_text("authentication", 10).await.unwrap().len(), 1);
        assert!(store.get_embedding(&node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_node_rejected() {
        let store = setup_test_store().await;
        let mut node = sample_node("webapp", Outcome::Success, t0());
        node.relevance_score = -0.1;

        let err = store.create_node(&node, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.stats().await.unwrap().versions, 0);
    }

    #[tokio::test]
    async fn test_version_chain_integrity() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Partial, t0());
        store.create_node(&node, None).await.unwrap();

        store
            .create_version(&node.id, sample_update("second analysis", "v2"), "analyzer_upgrade")
            .await
            .unwrap();
        let v3 = store
            .create_version(&node.id, sample_update("third analysis", "v3"), "manual")
            .await
            .unwrap();

        assert_eq!(v3.version, 3);
        assert_eq!(
            v3.previous_versions,
            vec![version_ref(&node.id, 1), version_ref(&node.id, 2)]
        );

        let v1 = store.get_node_version(&node.id, 1).await.unwrap().unwrap();
        let v2 = store.get_node_version(&node.id, 2).await.unwrap().unwrap();
        assert_eq!(v1.content.summary, node.content.summary);
        assert_eq!(v2.content.summary, "second analysis");

        let latest = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(store.list_versions(&node.id).await.unwrap().len(), 3);

        // the text index follows the latest version only
        assert!(store.search_text("second", 10).await.unwrap().is_empty());
        assert_eq!(store.search_text("third", 10).await.unwrap().len(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.nodes, stats.versions), (1, 3));
    }

    #[tokio::test]
    async fn test_create_version_of_missing_node() {
        let store = setup_test_store().await;
        let err = store
            .create_version("0123456789abcdef", sample_update("x", "v2"), "manual")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_find_previous_project_node() {
        let store = setup_test_store().await;
        let older = sample_node("webapp", Outcome::Abandoned, t0());
        let newer = sample_node("webapp", Outcome::Success, t0() + Duration::minutes(30));
        let other = sample_node("cli-tool", Outcome::Abandoned, t0() + Duration::minutes(40));
        for node in [&older, &newer, &other] {
            store.create_node(node, None).await.unwrap();
        }

        let found = store
            .find_previous_project_node("webapp", t0() + Duration::minutes(35))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);

        // strictly before: a node at exactly `before` is excluded
        let found = store
            .find_previous_project_node("webapp", t0() + Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, older.id);

        assert!(store
            .find_previous_project_node("webapp", t0())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_previous_project_node("unknown", t0() + Duration::days(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_node_by_segment() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());
        store.create_node(&node, None).await.unwrap();

        let found = store
            .find_node_by_segment(&node.source.session_file, &node.source.segment.end_entry_id)
            .await
            .unwrap();
        assert_eq!(found.map(|n| n.id), Some(node.id.clone()));
        assert!(store
            .find_node_by_segment(&node.source.session_file, "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_semantic_search_filters_and_ties() {
        let store = setup_test_store().await.with_embedding_index("test-model", 3);

        let a = sample_node("webapp", Outcome::Success, t0());
        let b = sample_node("webapp", Outcome::Failed, t0() + Duration::minutes(1));
        let c = sample_node("cli-tool", Outcome::Success, t0() + Duration::minutes(2));
        store.create_node(&a, Some(&[1.0, 0.0, 0.0])).await.unwrap();
        store.create_node(&b, Some(&[1.0, 0.0, 0.0])).await.unwrap();
        store.create_node(&c, Some(&[0.0, 1.0, 0.0])).await.unwrap();

        let hits = store
            .semantic_search(&[1.0, 0.0, 0.0], &SearchOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.node.id.as_str()).collect();
        // a and b tie; insertion order decides
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);
        assert!(hits[0].distance.abs() < 1e-6);

        let options = SearchOptions {
            limit: 5,
            filters: NodeFilters {
                project: Some("webapp".to_string()),
                outcome: Some(Outcome::Failed),
                ..Default::default()
            },
            max_distance: None,
        };
        let hits = store.semantic_search(&[1.0, 0.0, 0.0], &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.id, b.id);

        let close = SearchOptions {
            max_distance: Some(0.5),
            ..Default::default()
        };
        assert_eq!(store.semantic_search(&[1.0, 0.0, 0.0], &close).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_configuration_error() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());
        store.create_node(&node, Some(&[0.1, 0.2, 0.3])).await.unwrap();

        let err = store
            .semantic_search(&[0.1, 0.2], &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let configured = store.clone().with_embedding_index("m", 4);
        let err = configured
            .upsert_embedding(&node.id, &[0.1, 0.2, 0.3], "text")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_embeddings_missing_and_current() {
        let store = setup_test_store().await;
        let a = sample_node("webapp", Outcome::Success, t0());
        let b = sample_node("webapp", Outcome::Success, t0() + Duration::minutes(1));
        store.create_node(&a, Some(&[1.0, 0.0])).await.unwrap();
        store.create_node(&b, None).await.unwrap();

        let missing = store.nodes_missing_embeddings(10).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, b.id);
        assert!(store.embedding_is_current(&a).await.unwrap());
        assert!(!store.embedding_is_current(&b).await.unwrap());

        store
            .upsert_embedding(&b.id, &[0.0, 1.0], &b.embedding_text())
            .await
            .unwrap();
        assert!(store.nodes_missing_embeddings(10).await.unwrap().is_empty());
        assert_eq!(store.active_embeddings().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_nodes_filters() {
        let store = setup_test_store().await;
        let mut tagged = sample_node("webapp", Outcome::Success, t0());
        tagged.semantic = Semantic {
            tags: vec!["auth".to_string()],
            ..Default::default()
        };
        store.create_node(&tagged, None).await.unwrap();
        store
            .create_node(&sample_node("cli-tool", Outcome::Failed, t0()), None)
            .await
            .unwrap();

        let filters = NodeFilters {
            tag: Some("auth".to_string()),
            ..Default::default()
        };
        let nodes = store.list_nodes(&filters, 10).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, tagged.id);

        let nodes = store.list_nodes(&NodeFilters::project("cli-tool"), 10).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(store.list_nodes(&NodeFilters::default(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_and_recent_nodes() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());
        store.create_node(&node, None).await.unwrap();

        assert_eq!(store.list_stale_nodes("v2", 10).await.unwrap().len(), 1);
        assert!(store.list_stale_nodes("v1", 10).await.unwrap().is_empty());

        assert_eq!(
            store.list_recent_nodes(t0() - Duration::hours(1), 10).await.unwrap().len(),
            1
        );
        assert!(store
            .list_recent_nodes(t0() + Duration::hours(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_edges_idempotent_and_traversal() {
        let store = setup_test_store().await;
        let (a, b, c) = ("aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb", "cccccccccccccccc");

        let first = store
            .create_edge(&Edge::new(a, b, EdgeType::Resume, EdgeCreator::Boundary))
            .await
            .unwrap();
        let again = store
            .create_edge(&Edge::new(a, b, EdgeType::Resume, EdgeCreator::Boundary))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);

        store
            .create_edge(&Edge::new(c, b, EdgeType::Semantic, EdgeCreator::Daemon).with_confidence(0.7))
            .await
            .unwrap();

        assert_eq!(store.edges_for_node(b).await.unwrap().len(), 2);
        assert!(store.has_edge_between(b, c, EdgeType::Semantic).await.unwrap());
        assert!(!store.has_edge_between(a, c, EdgeType::Semantic).await.unwrap());

        let connected = store.get_connected_nodes(a, 2).await.unwrap();
        assert_eq!(
            connected,
            vec![
                ConnectedNode { node_id: b.to_string(), depth: 1 },
                ConnectedNode { node_id: c.to_string(), depth: 2 },
            ]
        );
        assert_eq!(store.get_connected_nodes(a, 1).await.unwrap().len(), 1);

        let self_loop = store
            .create_edge(&Edge::new(a, a, EdgeType::Semantic, EdgeCreator::User))
            .await;
        assert!(matches!(self_loop, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_refine_edge() {
        let store = setup_test_store().await;
        let edge = store
            .create_edge(
                &Edge::new("aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb", EdgeType::Semantic, EdgeCreator::Daemon)
                    .with_confidence(0.4),
            )
            .await
            .unwrap();

        store.refine_edge(&edge.id, None, Some(0.91)).await.unwrap();
        let edges = store.edges_for_node("aaaaaaaaaaaaaaaa").await.unwrap();
        assert_eq!(edges[0].confidence, Some(0.4));
        assert_eq!(edges[0].similarity, Some(0.91));

        assert!(store.refine_edge("missing", Some(0.5), None).await.is_err());
    }

    #[tokio::test]
    async fn test_signals_preserve_manual_flags() {
        let store = setup_test_store().await;
        let node = sample_node("webapp", Outcome::Success, t0());
        store.create_node(&node, None).await.unwrap();

        let flag = ManualFlag {
            flag_type: ManualFlagType::Quirk,
            message: "model ignores AGENTS.md".to_string(),
            timestamp: t0(),
        };
        let signals = store.append_manual_flag(&node.id, &flag).await.unwrap();
        assert_eq!(signals.manual_flags, vec![flag.clone()]);

        let computed = NodeSignals {
            friction: FrictionSignals {
                score: 0.6,
                tool_loops: 2,
                ..Default::default()
            },
            delight: DelightSignals::default(),
            manual_flags: Vec::new(),
        };
        store.set_signals(&node.id, &computed).await.unwrap();

        let stored = store.get_node(&node.id).await.unwrap().unwrap().signals.unwrap();
        assert_eq!(stored.friction.tool_loops, 2);
        assert_eq!(stored.manual_flags, vec![flag]);

        let err = store.set_signals("0123456789abcdef", &computed).await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_read_nudges_relevance() {
        let store = setup_test_store().await.with_access_boost(0.1);
        let mut node = sample_node("webapp", Outcome::Success, t0());
        node.relevance_score = 0.5;
        store.create_node(&node, None).await.unwrap();

        store.get_node(&node.id).await.unwrap();
        let read = store.get_node(&node.id).await.unwrap().unwrap();
        assert!((read.relevance_score - 0.7).abs() < 1e-9);

        // historic reads do not touch
        let v1 = store.get_node_version(&node.id, 1).await.unwrap().unwrap();
        assert!((v1.relevance_score - 0.7).abs() < 1e-9);

        for _ in 0..10 {
            store.get_node(&node.id).await.unwrap();
        }
        let capped = store.get_node_version(&node.id, 1).await.unwrap().unwrap();
        assert_eq!(capped.relevance_score, 1.0);
    }

    #[test]
    fn test_fts_query_sanitizes() {
        assert_eq!(fts_query("jwt  refresh"), Some("\"jwt\"* \"refresh\"*".to_string()));
        assert_eq!(fts_query("\"*()"), None);
        assert_eq!(fts_query(""), None);
    }
}
