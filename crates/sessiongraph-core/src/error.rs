//! Error types for sessiongraph

use thiserror::Error;

/// Result type alias using sessiongraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sessiongraph error types with stable codes and operator suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (E001-E099)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Node '{0}' not found. Run `sessiongraph search <query>` to find nodes.")]
    NodeNotFound(String),

    #[error("Job '{0}' not found. Run `sessiongraph queue list` to see queued jobs.")]
    JobNotFound(String),

    #[error("Node '{id}' version {version} already exists")]
    DuplicateId { id: String, version: u32 },

    // Storage errors (E100-E199)
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Queue errors (E200-E299)
    #[error("Lease conflict: job '{0}' was claimed by another worker")]
    LeaseConflict(String),

    #[error("Queue is full ({0} active jobs). Wait for the daemon to drain it or raise daemon.max_queue_size.")]
    QueueFull(usize),

    // Analyzer errors (E300-E399)
    #[error("Analysis timed out after {0} minutes")]
    AnalyzerTimeout(u64),

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    // Embedding errors (E400-E499)
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Network error: {0}. Check that the embedding endpoint is reachable.")]
    Network(#[from] reqwest::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E001",
            Self::NodeNotFound(_) => "E002",
            Self::JobNotFound(_) => "E003",
            Self::DuplicateId { .. } => "E004",
            Self::Storage(_) => "E100",
            Self::Serialization(_) => "E101",
            Self::LeaseConflict(_) => "E200",
            Self::QueueFull(_) => "E201",
            Self::AnalyzerTimeout(_) => "E300",
            Self::Analyzer(_) => "E301",
            Self::Embedding(_) => "E400",
            Self::Network(_) => "E401",
            Self::Configuration(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether the job that hit this error should be retried
    ///
    /// Malformed input and bad configuration will fail the same way on every
    /// attempt, so they go straight to `failed`.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateId { .. }
                | Self::Configuration(_)
                | Self::NodeNotFound(_)
                | Self::JobNotFound(_)
        )
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NodeNotFound(_) => Some("sessiongraph search <query>".to_string()),
            Self::JobNotFound(_) => Some("sessiongraph queue list".to_string()),
            Self::QueueFull(_) => Some("sessiongraph queue stats".to_string()),
            Self::Configuration(_) => Some("sessiongraph config show".to_string()),
            Self::Network(_) | Self::Embedding(_) => {
                Some("Check embedding.base_url in config.toml".to_string())
            }
            Self::AnalyzerTimeout(_) => {
                Some("Raise daemon.analysis_timeout_minutes in config.toml".to_string())
            }
            _ => None,
        }
    }

    /// Map a sqlx error from an insert into `DuplicateId` when it is a unique violation
    pub(crate) fn from_insert(err: sqlx::Error, id: &str, version: u32) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::DuplicateId {
                id: id.to_string(),
                version,
            },
            _ => Self::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "E001");
        assert_eq!(Error::LeaseConflict("job".into()).code(), "E200");
        assert_eq!(Error::AnalyzerTimeout(5).code(), "E300");
        assert_eq!(Error::Configuration("dims".into()).code(), "E600");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Configuration("bad".into()).is_retryable());
        assert!(Error::AnalyzerTimeout(10).is_retryable());
        assert!(Error::Analyzer("exit 1".into()).is_retryable());
        assert!(Error::Storage(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn test_suggestions() {
        assert!(Error::QueueFull(10).suggestion().is_some());
        assert!(Error::Other("x".into()).suggestion().is_none());
    }

    #[test]
    fn test_duplicate_message() {
        let err = Error::DuplicateId {
            id: "abcdef0123456789".into(),
            version: 2,
        };
        assert_eq!(
            err.to_string(),
            "Node 'abcdef0123456789' version 2 already exists"
        );
    }
}
