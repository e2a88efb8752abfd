//! SessionGraph Core Library
//!
//! Turns coding-agent session transcripts into a versioned knowledge graph:
//! - Session parsing (JSONL transcripts)
//! - Boundary detection and segmentation
//! - Graph storage (SQLite with FTS5 and a vector index)
//! - Friction and delight signals
//! - Persistent priority job queue with leases and retries
//! - Cron scheduling of maintenance jobs
//! - Background daemon (analysis, connection discovery, clustering,
//!   pattern aggregation, prompt effectiveness, decay)

pub mod boundary;
pub mod config;
pub mod daemon;
pub mod error;
pub mod graph;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod signals;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::boundary::{extract_segments, Boundary, BoundaryType, Segment};
    pub use crate::config::Config;
    pub use crate::daemon::{Daemon, JobProcessor, SessionAnalyzer, EmbeddingProvider};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{Edge, EdgeType, GraphStore, Node, NodeFilters};
    pub use crate::queue::{Job, JobQueue, JobStatus, JobType, NewJob};
    pub use crate::session::{parse_session_file, SessionEntry, SessionFile};
    pub use crate::storage::Database;
}
