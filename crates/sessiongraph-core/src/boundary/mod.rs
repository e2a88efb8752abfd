//! Boundary detection and session segmentation
//!
//! Turns a possibly-branching session entry stream into contiguous analysis
//! units. Detection recognises four kinds of discontinuity:
//!
//! - **branch**: every `branch_summary` entry
//! - **tree_jump**: a message whose parent is not the current leaf
//! - **compaction**: every `compaction` entry
//! - **resume**: a gap of at least ten minutes since the previous entry
//!
//! Everything here is pure and deterministic.

mod detector;
mod segment;

pub use detector::{
    detect_boundaries, Boundary, BoundaryMetadata, BoundaryType, LeafTracker, RESUME_GAP_MINUTES,
};
pub use segment::{extract_segments, segment_entries, segments_from_boundaries, Segment};

#[cfg(test)]
pub(crate) use detector::test_support;
