//! Node data model
//!
//! A node is the versioned record of one analyzed segment. Versions share the
//! node id; `previous_versions` holds `"{id}-v{n}"` references to every earlier
//! version, which stay readable in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a node id in hex characters
pub const NODE_ID_LEN: usize = 16;

/// Generate a fresh random node id
pub fn generate_node_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..NODE_ID_LEN].to_string()
}

/// Whether `id` is a well-formed node id (16 lowercase hex characters)
pub fn is_valid_node_id(id: &str) -> bool {
    id.len() == NODE_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Reference to a specific version of a node
pub fn version_ref(id: &str, version: u32) -> String {
    format!("{id}-v{version}")
}

/// A versioned unit of knowledge derived from one session segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub version: u32,
    #[serde(default)]
    pub previous_versions: Vec<String>,
    pub source: NodeSource,
    pub classification: Classification,
    pub content: NodeContent,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub observations: Observations,
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub daemon_meta: DaemonMeta,
    #[serde(default)]
    pub signals: Option<NodeSignals>,

    // Consolidation
    pub relevance_score: f64,
    pub importance: f64,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Node {
    /// Create version 1 of a new node
    pub fn new(
        source: NodeSource,
        classification: Classification,
        content: NodeContent,
        metadata: NodeMetadata,
    ) -> Self {
        Self {
            id: generate_node_id(),
            version: 1,
            previous_versions: Vec::new(),
            source,
            classification,
            content,
            lessons: Lessons::default(),
            observations: Observations::default(),
            metadata,
            semantic: Semantic::default(),
            daemon_meta: DaemonMeta::default(),
            signals: None,
            relevance_score: 1.0,
            importance: 0.5,
            archived: false,
            last_accessed: None,
        }
    }

    pub fn with_lessons(mut self, lessons: Lessons) -> Self {
        self.lessons = lessons;
        self
    }

    pub fn with_observations(mut self, observations: Observations) -> Self {
        self.observations = observations;
        self
    }

    pub fn with_semantic(mut self, semantic: Semantic) -> Self {
        self.semantic = semantic;
        self
    }

    pub fn with_daemon_meta(mut self, daemon_meta: DaemonMeta) -> Self {
        self.daemon_meta = daemon_meta;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Reference to this exact version
    pub fn version_ref(&self) -> String {
        version_ref(&self.id, self.version)
    }

    /// Derive the next version from this one with new analysis results
    ///
    /// Manual flags and importance carry over; relevance is restored.
    pub fn next_version(&self, update: NodeContentUpdate, trigger: &str, now: DateTime<Utc>) -> Self {
        let mut previous_versions = self.previous_versions.clone();
        previous_versions.push(self.version_ref());

        let mut daemon_meta = update.daemon_meta;
        daemon_meta.reanalysis_trigger = Some(trigger.to_string());

        let mut source = self.source.clone();
        if let Some(segment) = update.segment {
            source.segment = segment;
        }

        Self {
            id: self.id.clone(),
            version: self.version + 1,
            previous_versions,
            source,
            classification: update.classification,
            content: update.content,
            lessons: update.lessons,
            observations: update.observations,
            metadata: NodeMetadata {
                tokens_used: update.tokens_used,
                cost: update.cost,
                duration_minutes: update.duration_minutes.unwrap_or(self.metadata.duration_minutes),
                timestamp: self.metadata.timestamp,
                analyzed_at: now,
                analyzer_version: update.analyzer_version,
            },
            semantic: update.semantic,
            daemon_meta,
            signals: self.signals.clone(),
            relevance_score: 1.0,
            importance: self.importance,
            archived: false,
            last_accessed: self.last_accessed,
        }
    }

    /// Reject malformed nodes before they reach the store
    pub fn validate(&self) -> Result<()> {
        if !is_valid_node_id(&self.id) {
            return Err(Error::Validation(format!(
                "node id '{}' must be {} lowercase hex characters",
                self.id, NODE_ID_LEN
            )));
        }
        if self.version == 0 {
            return Err(Error::Validation("node version starts at 1".to_string()));
        }
        if self.previous_versions.len() != (self.version - 1) as usize {
            return Err(Error::Validation(format!(
                "node '{}' v{} must reference {} previous versions",
                self.id,
                self.version,
                self.version - 1
            )));
        }
        for (name, value) in [
            ("relevance_score", self.relevance_score),
            ("importance", self.importance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!("{name} {value} is outside [0, 1]")));
            }
        }
        if self.source.session_file.is_empty() {
            return Err(Error::Validation("node source has no session file".to_string()));
        }
        Ok(())
    }

    /// Text that is embedded for semantic search
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!("[{}] {}", self.classification.node_type.as_str(), self.content.summary),
        ];
        if !self.content.key_decisions.is_empty() {
            let decisions: Vec<&str> = self.content.key_decisions.iter().map(|d| d.what.as_str()).collect();
            parts.push(format!("Decisions: {}", decisions.join("; ")));
        }
        let lessons: Vec<&str> = self.lessons.iter().map(|(_, l)| l.summary.as_str()).collect();
        if !lessons.is_empty() {
            parts.push(format!("Lessons: {}", lessons.join("; ")));
        }
        if !self.semantic.tags.is_empty() {
            parts.push(format!("Tags: {}", self.semantic.tags.join(", ")));
        }
        parts.join("\n")
    }
}

/// Where the node came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSource {
    pub session_file: String,
    pub session_id: Option<String>,
    pub segment: SegmentSpan,
    pub host: Option<String>,
    #[serde(default)]
    pub parent_session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpan {
    pub start_entry_id: String,
    pub end_entry_id: String,
    pub entry_count: usize,
}

/// Kind of work a segment represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Coding,
    Debugging,
    Refactoring,
    Research,
    Planning,
    Review,
    Documentation,
    Configuration,
    Sysadmin,
    Brainstorm,
    Other,
}

impl NodeType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Debugging => "debugging",
            Self::Refactoring => "refactoring",
            Self::Research => "research",
            Self::Planning => "planning",
            Self::Review => "review",
            Self::Documentation => "documentation",
            Self::Configuration => "configuration",
            Self::Sysadmin => "sysadmin",
            Self::Brainstorm => "brainstorm",
            Self::Other => "other",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "coding" | "code" | "feature" => Self::Coding,
            "debugging" | "debug" | "bugfix" => Self::Debugging,
            "refactoring" | "refactor" => Self::Refactoring,
            "research" | "exploration" => Self::Research,
            "planning" | "plan" => Self::Planning,
            "review" | "qa" => Self::Review,
            "documentation" | "docs" => Self::Documentation,
            "configuration" | "config" => Self::Configuration,
            "sysadmin" | "ops" => Self::Sysadmin,
            "brainstorm" => Self::Brainstorm,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub project: String,
    #[serde(default)]
    pub is_new_project: bool,
    #[serde(default)]
    pub had_clear_goal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeContent {
    pub summary: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub key_decisions: Vec<Decision>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub errors_seen: Vec<ErrorSeen>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub what: String,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub alternatives_considered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSeen {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub resolved: bool,
}

/// Scope a lesson applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonLevel {
    Project,
    Task,
    User,
    Model,
    Tool,
    Skill,
    Subagent,
}

impl LessonLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::Skill => "skill",
            Self::Subagent => "subagent",
        }
    }

    pub fn all() -> &'static [LessonLevel] {
        &[
            Self::Project,
            Self::Task,
            Self::User,
            Self::Model,
            Self::Tool,
            Self::Skill,
            Self::Subagent,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub summary: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Lessons keyed by the level they apply to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lessons {
    pub project: Vec<Lesson>,
    pub task: Vec<Lesson>,
    pub user: Vec<Lesson>,
    pub model: Vec<Lesson>,
    pub tool: Vec<Lesson>,
    pub skill: Vec<Lesson>,
    pub subagent: Vec<Lesson>,
}

impl Lessons {
    pub fn at(&self, level: LessonLevel) -> &[Lesson] {
        match level {
            LessonLevel::Project => &self.project,
            LessonLevel::Task => &self.task,
            LessonLevel::User => &self.user,
            LessonLevel::Model => &self.model,
            LessonLevel::Tool => &self.tool,
            LessonLevel::Skill => &self.skill,
            LessonLevel::Subagent => &self.subagent,
        }
    }

    pub fn push(&mut self, level: LessonLevel, lesson: Lesson) {
        match level {
            LessonLevel::Project => self.project.push(lesson),
            LessonLevel::Task => self.task.push(lesson),
            LessonLevel::User => self.user.push(lesson),
            LessonLevel::Model => self.model.push(lesson),
            LessonLevel::Tool => self.tool.push(lesson),
            LessonLevel::Skill => self.skill.push(lesson),
            LessonLevel::Subagent => self.subagent.push(lesson),
        }
    }

    /// Every lesson with its level, in level order
    pub fn iter(&self) -> impl Iterator<Item = (LessonLevel, &Lesson)> {
        LessonLevel::all()
            .iter()
            .flat_map(move |level| self.at(*level).iter().map(move |l| (*level, l)))
    }

    pub fn len(&self) -> usize {
        LessonLevel::all().iter().map(|l| self.at(*l).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observations {
    pub models_used: Vec<ModelUsage>,
    pub prompting_wins: Vec<String>,
    pub prompting_failures: Vec<String>,
    pub model_quirks: Vec<ModelQuirk>,
    pub tool_use_errors: Vec<ToolUseError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQuirk {
    pub model: String,
    pub observation: String,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default)]
    pub workaround: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

fn default_frequency() -> String {
    "once".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseError {
    pub tool: String,
    pub error_type: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" | "critical" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_minutes: f64,
    /// Segment start time; orders nodes within a project
    pub timestamp: DateTime<Utc>,
    pub analyzed_at: DateTime<Utc>,
    pub analyzer_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Semantic {
    pub tags: Vec<String>,
    pub topics: Vec<String>,
    pub related_projects: Vec<String>,
    pub concepts: Vec<String>,
}

/// Decisions the analyzer made about its own output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonMeta {
    pub decisions: Vec<DaemonDecision>,
    /// What caused this version to be written, for versions after the first
    pub reanalysis_trigger: Option<String>,
}

impl DaemonMeta {
    pub fn needs_review(&self) -> bool {
        self.decisions.iter().any(|d| d.needs_review)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonDecision {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub needs_review: bool,
}

/// Behavioral signals derived from a node's segment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSignals {
    pub friction: FrictionSignals,
    pub delight: DelightSignals,
    pub manual_flags: Vec<ManualFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrictionSignals {
    pub score: f64,
    pub rephrasing_cascades: u32,
    pub context_churn: u32,
    pub tool_loops: u32,
    pub abandoned_restart: bool,
    pub silent_termination: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelightSignals {
    pub score: f64,
    pub resilient_recoveries: u32,
    pub one_shot_success: bool,
    pub explicit_praise: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualFlagType {
    Quirk,
    Failure,
    Win,
    Note,
}

impl ManualFlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quirk => "quirk",
            Self::Failure => "failure",
            Self::Win => "win",
            Self::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quirk" => Some(Self::Quirk),
            "failure" => Some(Self::Failure),
            "win" => Some(Self::Win),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// User-supplied annotation appended to a node's signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualFlag {
    #[serde(rename = "type")]
    pub flag_type: ManualFlagType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// New analysis results applied by `create_version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeContentUpdate {
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
    pub analyzer_version: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    /// Current span of the segment, when it changed since the last version
    #[serde(default)]
    pub segment: Option<SegmentSpan>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..50 {
            assert!(is_valid_node_id(&generate_node_id()));
        }
        assert!(!is_valid_node_id("ABCDEF0123456789"));
        assert!(!is_valid_node_id("abc"));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut node = sample_node("webapp", Outcome::Success, Utc::now());
        assert!(node.validate().is_ok());

        node.importance = 1.5;
        assert!(matches!(node.validate(), Err(Error::Validation(_))));

        node.importance = 0.5;
        node.id = "not-hex".to_string();
        assert!(matches!(node.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_next_version_extends_chain() {
        let node = sample_node("webapp", Outcome::Partial, Utc::now());
        let v2 = node.next_version(sample_update("second pass", "v2"), "analyzer_upgrade", Utc::now());
        let v3 = v2.next_version(sample_update("third pass", "v3"), "manual", Utc::now());

        assert_eq!(v3.version, 3);
        assert_eq!(
            v3.previous_versions,
            vec![version_ref(&node.id, 1), version_ref(&node.id, 2)]
        );
        assert_eq!(v3.daemon_meta.reanalysis_trigger.as_deref(), Some("manual"));
        assert_eq!(v3.metadata.timestamp, node.metadata.timestamp);
        assert!(v3.validate().is_ok());
    }

    #[test]
    fn test_lessons_iterate_by_level() {
        let mut lessons = Lessons::default();
        lessons.push(
            LessonLevel::Tool,
            Lesson {
                summary: "grep before edit".into(),
                details: String::new(),
                confidence: Confidence::High,
                tags: vec![],
            },
        );
        lessons.push(
            LessonLevel::Project,
            Lesson {
                summary: "tests live in spec/".into(),
                details: String::new(),
                confidence: Confidence::Medium,
                tags: vec![],
            },
        );

        let levels: Vec<_> = lessons.iter().map(|(level, _)| level).collect();
        assert_eq!(levels, vec![LessonLevel::Project, LessonLevel::Tool]);
        assert_eq!(lessons.len(), 2);
    }

    #[test]
    fn test_node_json_round_trip_keeps_type_field() {
        let node = sample_node("webapp", Outcome::Success, Utc::now());
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["classification"]["type"], "coding");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
