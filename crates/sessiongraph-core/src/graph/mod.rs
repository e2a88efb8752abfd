//! Versioned knowledge graph
//!
//! Nodes are analyzed segments, edges relate them. Every node write keeps the
//! full-text index, the derived lesson/tag/quirk tables and the vector index
//! in lockstep with the node row.
//!
//! Nodes are never updated in place for content changes: a re-analysis
//! inserts a new version and links the old ones through `previous_versions`.
//! Only the consolidation fields (relevance, archival, access time) and the
//! computed signals are mutable.

mod cluster;
mod decay;
mod edge;
mod insight;
mod node;
mod store;
mod vector;

pub use cluster::{Cluster, ClusterMember, ClusterStatus, SignalType};
pub use decay::{DecayConfig, DecayReport};
pub use edge::{Edge, EdgeCreator, EdgeType, RelationshipKind};
pub use insight::{
    insight_id, normalize_pattern, AggregatedInsight, InsightPrompt, InsightType,
    PromptEffectiveness,
};
pub use node::{
    generate_node_id, is_valid_node_id, version_ref, Classification, Confidence, DaemonDecision,
    DaemonMeta, Decision, DelightSignals, ErrorSeen, FrictionSignals, Lesson, LessonLevel,
    Lessons, ManualFlag, ManualFlagType, ModelQuirk, ModelUsage, Node, NodeContent,
    NodeContentUpdate, NodeMetadata, NodeSignals, NodeSource, NodeType, Observations, Outcome,
    SegmentSpan, Semantic, Severity, ToolUseError, NODE_ID_LEN,
};
pub use store::{
    text_hash, ConnectedNode, GraphStats, GraphStore, NodeFilters, SearchHit, SearchOptions,
    DEFAULT_ACCESS_BOOST,
};
pub use vector::{cosine_distance, cosine_similarity, decode_vector, encode_vector, squared_euclidean};

#[cfg(test)]
pub(crate) use node::test_support;
