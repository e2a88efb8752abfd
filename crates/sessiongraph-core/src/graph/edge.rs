//! Edge data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of a directed relation between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    // Structural, created from segmentation
    Fork,
    Branch,
    TreeJump,
    Resume,
    Compaction,
    Continuation,
    Handoff,
    // Semantic, created by background jobs
    Semantic,
    Reference,
    LessonApplication,
    FailurePattern,
    ProjectRelated,
    TechniqueShared,
}

impl EdgeType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Branch => "branch",
            Self::TreeJump => "tree_jump",
            Self::Resume => "resume",
            Self::Compaction => "compaction",
            Self::Continuation => "continuation",
            Self::Handoff => "handoff",
            Self::Semantic => "semantic",
            Self::Reference => "reference",
            Self::LessonApplication => "lesson_application",
            Self::FailurePattern => "failure_pattern",
            Self::ProjectRelated => "project_related",
            Self::TechniqueShared => "technique_shared",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fork" => Self::Fork,
            "branch" => Self::Branch,
            "tree_jump" => Self::TreeJump,
            "resume" => Self::Resume,
            "compaction" => Self::Compaction,
            "continuation" => Self::Continuation,
            "handoff" => Self::Handoff,
            "semantic" => Self::Semantic,
            "reference" => Self::Reference,
            "lesson_application" => Self::LessonApplication,
            "failure_pattern" => Self::FailurePattern,
            "project_related" => Self::ProjectRelated,
            "technique_shared" => Self::TechniqueShared,
            _ => return None,
        })
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Fork
                | Self::Branch
                | Self::TreeJump
                | Self::Resume
                | Self::Compaction
                | Self::Continuation
                | Self::Handoff
        )
    }
}

/// Who created an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCreator {
    Boundary,
    Daemon,
    User,
}

impl EdgeCreator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::Daemon => "daemon",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "boundary" => Self::Boundary,
            "user" => Self::User,
            _ => Self::Daemon,
        }
    }
}

/// A directed typed relation between two node ids
///
/// Immutable once written, except for `confidence` and `similarity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: EdgeCreator,
    pub confidence: Option<f64>,
    pub similarity: Option<f64>,
}

impl Edge {
    pub fn new(
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
        edge_type: EdgeType,
        created_by: EdgeCreator,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            edge_type,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
            created_by,
            confidence: None,
            similarity: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Relationship kinds an analyzer may propose between knowledge items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    LeadsTo,
    PrefersOver,
    Contradicts,
    Reinforces,
    DerivedFrom,
    Exemplifies,
    PartOf,
    RelatesTo,
    OccurredBefore,
    InvalidatedBy,
    EvolvedInto,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadsTo => "LEADS_TO",
            Self::PrefersOver => "PREFERS_OVER",
            Self::Contradicts => "CONTRADICTS",
            Self::Reinforces => "REINFORCES",
            Self::DerivedFrom => "DERIVED_FROM",
            Self::Exemplifies => "EXEMPLIFIES",
            Self::PartOf => "PART_OF",
            Self::RelatesTo => "RELATES_TO",
            Self::OccurredBefore => "OCCURRED_BEFORE",
            Self::InvalidatedBy => "INVALIDATED_BY",
            Self::EvolvedInto => "EVOLVED_INTO",
        }
    }

    /// Semantic edge type a resolved proposal is stored as
    pub fn edge_type(&self) -> EdgeType {
        match self {
            Self::LeadsTo | Self::OccurredBefore | Self::EvolvedInto | Self::DerivedFrom => {
                EdgeType::Reference
            }
            Self::Reinforces | Self::Exemplifies => EdgeType::LessonApplication,
            Self::Contradicts | Self::InvalidatedBy => EdgeType::FailurePattern,
            Self::PrefersOver => EdgeType::TechniqueShared,
            Self::PartOf => EdgeType::ProjectRelated,
            Self::RelatesTo => EdgeType::Semantic,
        }
    }
}
