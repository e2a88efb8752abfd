//! Storage layer - SQLite connection pool and schema migrations
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use sessiongraph_core::storage::Database;
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//! ```
//!
//! Timestamps are written through [`format_timestamp`] so that string order
//! in SQL matches chronological order.

pub mod database;
pub mod migrations;

use chrono::{DateTime, SecondsFormat, Utc};

// Re-export commonly used types
pub use database::{default_database_path, Database, DatabaseConfig};
pub use migrations::{migration_status, run_migrations, MigrationStatus, CURRENT_VERSION};

/// Format a timestamp as fixed-width RFC 3339 (millisecond precision, `Z` suffix)
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored RFC 3339 timestamp, falling back to the Unix epoch on garbage
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parse an optional stored timestamp
pub fn parse_optional_timestamp(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
