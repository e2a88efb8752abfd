//! JSONL session file parsing
//!
//! Lines that fail to parse are skipped with a warning; a damaged line never
//! aborts the rest of the session.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;

use super::entry::{SessionEntry, SessionHeader};

/// A parsed session transcript
#[derive(Debug, Clone, Default)]
pub struct SessionFile {
    /// Header line, absent for truncated or headerless files
    pub header: Option<SessionHeader>,
    /// Entries in file order
    pub entries: Vec<SessionEntry>,
    /// Number of lines that could not be parsed
    pub skipped_lines: usize,
}

impl SessionFile {
    pub fn session_id(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.id.as_str())
    }

    pub fn project(&self) -> String {
        self.header.as_ref().map(|h| h.project()).unwrap_or_default()
    }
}

/// Read and parse a session file from disk
pub async fn parse_session_file(path: impl AsRef<Path>) -> Result<SessionFile> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let parsed = parse_session_str(&text);

    debug!(
        path = %path.display(),
        entries = parsed.entries.len(),
        skipped = parsed.skipped_lines,
        "Parsed session file"
    );
    Ok(parsed)
}

/// Parse session JSONL text
pub fn parse_session_str(text: &str) -> SessionFile {
    let mut file = SessionFile::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed session line");
                file.skipped_lines += 1;
                continue;
            }
        };

        if value.get("type").and_then(|t| t.as_str()) == Some("session") {
            if file.header.is_some() {
                warn!(line = index + 1, "Ignoring repeated session header");
                file.skipped_lines += 1;
                continue;
            }
            match serde_json::from_value::<SessionHeader>(value) {
                Ok(header) => file.header = Some(header),
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping malformed session header");
                    file.skipped_lines += 1;
                }
            }
            continue;
        }

        match serde_json::from_value::<SessionEntry>(value) {
            Ok(entry) => file.entries.push(entry),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping unrecognised session entry");
                file.skipped_lines += 1;
            }
        }
    }

    file
}
