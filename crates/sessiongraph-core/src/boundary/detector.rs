//! Boundary detection over a session entry stream
//!
//! Detection is a single ordered fold over the entries. All order-dependent
//! state lives in [`LeafTracker`], so the scan is a pure function of its input.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::EdgeType;
use crate::session::{EntryKind, SessionEntry};

/// Inactivity gap (inclusive) that marks a resumed session
pub const RESUME_GAP_MINUTES: i64 = 10;

/// Kind of discontinuity found in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryType {
    /// Explicit branch, recorded by a `branch_summary` entry
    Branch,
    /// Implicit move to another point in the tree
    TreeJump,
    /// Context compaction
    Compaction,
    /// Work resumed after a long pause
    Resume,
}

impl BoundaryType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::TreeJump => "tree_jump",
            Self::Compaction => "compaction",
            Self::Resume => "resume",
        }
    }

    /// Structural edge type linking the segments on either side of this boundary
    pub fn edge_type(&self) -> EdgeType {
        match self {
            Self::Branch => EdgeType::Branch,
            Self::TreeJump => EdgeType::TreeJump,
            Self::Compaction => EdgeType::Compaction,
            Self::Resume => EdgeType::Resume,
        }
    }
}

/// Type-specific boundary details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryMetadata {
    Branch {
        summary: String,
    },
    TreeJump {
        expected_parent: String,
        actual_parent: String,
    },
    Compaction {
        tokens_before: u64,
        summary: String,
    },
    Resume {
        gap_minutes: f64,
    },
}

/// A detected discontinuity at a specific entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub boundary_type: BoundaryType,
    /// Entry that opens the new segment
    pub entry_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_entry_id: Option<String>,
    pub metadata: BoundaryMetadata,
}

impl Boundary {
    pub fn edge_type(&self) -> EdgeType {
        self.boundary_type.edge_type()
    }
}

/// Accumulator threaded through the detection fold
///
/// There is one global leaf pointer. A session with several live branches
/// collapses to whichever branch was written last.
#[derive(Debug, Clone, Default)]
pub struct LeafTracker {
    /// Parent id to child ids, for every non-metadata entry in the session
    children: HashMap<String, Vec<String>>,
    /// Ids of every non-metadata entry in the session
    known: HashSet<String>,
    current_leaf: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
    previous_was_branch_summary: bool,
    boundaries: Vec<Boundary>,
}

impl LeafTracker {
    /// Index the entry tree ahead of the scan
    pub fn new(entries: &[SessionEntry]) -> Self {
        let mut tracker = Self::default();
        for entry in entries.iter().filter(|e| !e.is_metadata()) {
            tracker.known.insert(entry.id.clone());
            if let Some(parent) = &entry.parent_id {
                tracker
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(entry.id.clone());
            }
        }
        tracker
    }

    pub fn current_leaf(&self) -> Option<&str> {
        self.current_leaf.as_deref()
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Process one entry, recording any boundaries it opens
    pub fn observe(mut self, entry: &SessionEntry) -> Self {
        if entry.is_metadata() {
            return self;
        }

        match &entry.kind {
            EntryKind::BranchSummary { from_id, summary } => {
                self.boundaries.push(Boundary {
                    boundary_type: BoundaryType::Branch,
                    entry_id: entry.id.clone(),
                    timestamp: entry.timestamp,
                    previous_entry_id: Some(from_id.clone()),
                    metadata: BoundaryMetadata::Branch {
                        summary: summary.clone(),
                    },
                });
            }
            EntryKind::Message { .. } => {
                if let (Some(parent), Some(leaf)) = (&entry.parent_id, &self.current_leaf) {
                    if self.known.contains(parent)
                        && parent != leaf
                        && !self.previous_was_branch_summary
                    {
                        self.boundaries.push(Boundary {
                            boundary_type: BoundaryType::TreeJump,
                            entry_id: entry.id.clone(),
                            timestamp: entry.timestamp,
                            previous_entry_id: Some(leaf.clone()),
                            metadata: BoundaryMetadata::TreeJump {
                                expected_parent: leaf.clone(),
                                actual_parent: parent.clone(),
                            },
                        });
                    }
                }
            }
            EntryKind::Compaction {
                summary,
                tokens_before,
                ..
            } => {
                self.boundaries.push(Boundary {
                    boundary_type: BoundaryType::Compaction,
                    entry_id: entry.id.clone(),
                    timestamp: entry.timestamp,
                    previous_entry_id: entry.parent_id.clone(),
                    metadata: BoundaryMetadata::Compaction {
                        tokens_before: *tokens_before,
                        summary: summary.clone(),
                    },
                });
            }
            _ => {}
        }

        if let Some(last) = self.last_timestamp {
            let gap = entry.timestamp - last;
            if gap >= Duration::minutes(RESUME_GAP_MINUTES) {
                self.boundaries.push(Boundary {
                    boundary_type: BoundaryType::Resume,
                    entry_id: entry.id.clone(),
                    timestamp: entry.timestamp,
                    previous_entry_id: self.current_leaf.clone(),
                    metadata: BoundaryMetadata::Resume {
                        gap_minutes: round2(gap.num_milliseconds() as f64 / 60_000.0),
                    },
                });
            }
        }

        self.current_leaf = Some(entry.id.clone());
        self.last_timestamp = Some(entry.timestamp);
        self.previous_was_branch_summary = matches!(entry.kind, EntryKind::BranchSummary { .. });
        self
    }

    pub fn into_boundaries(self) -> Vec<Boundary> {
        self.boundaries
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Detect every boundary in an ordered entry list
///
/// Boundaries come out in entry order. When one entry opens several, the
/// type-specific boundary precedes the resume boundary.
pub fn detect_boundaries(entries: &[SessionEntry]) -> Vec<Boundary> {
    entries
        .iter()
        .fold(LeafTracker::new(entries), LeafTracker::observe)
        .into_boundaries()
}
