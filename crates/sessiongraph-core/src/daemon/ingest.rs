//! Session ingestion
//!
//! Turns a session file into initial analysis jobs, one per segment that has
//! no node yet. `ingested_sessions` remembers the size and modification time
//! of every fully enqueued file so unchanged files are skipped on rescans.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::boundary::extract_segments;
use crate::error::{Error, Result};
use crate::graph::GraphStore;
use crate::queue::{Enqueued, JobQueue, NewJob, PRIORITY_FORK};
use crate::session::parse_session_file;
use crate::storage::format_timestamp;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Re-read the file even if it has not changed
    pub force: bool,
    /// Priority for every job, overriding the fork and default priorities
    pub priority: Option<i64>,
}

/// What ingesting one file did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub session_file: String,
    pub segments: usize,
    pub enqueued: usize,
    pub already_analyzed: usize,
    pub already_queued: usize,
    /// Segments left out because the queue was full
    pub deferred: usize,
    /// The file was skipped as unchanged since the last ingestion
    pub unchanged: bool,
}

/// Enqueue initial analysis for every un-analysed segment of a session
pub async fn ingest_session(
    store: &GraphStore,
    queue: &JobQueue,
    path: impl AsRef<Path>,
    options: &IngestOptions,
) -> Result<IngestReport> {
    let path = tokio::fs::canonicalize(path.as_ref()).await?;
    let session_file = path.to_string_lossy().into_owned();
    let file_meta = tokio::fs::metadata(&path).await?;
    let modified_at = file_meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let size_bytes = file_meta.len() as i64;

    let mut report = IngestReport {
        session_file: session_file.clone(),
        ..Default::default()
    };

    if !options.force && is_unchanged(store, &session_file, modified_at, size_bytes).await? {
        debug!(session_file = %session_file, "Session unchanged since last ingestion");
        report.unchanged = true;
        return Ok(report);
    }

    let session = parse_session_file(&path).await?;
    let segments = extract_segments(&session.entries);
    report.segments = segments.len();

    let forked = session
        .header
        .as_ref()
        .is_some_and(|h| h.parent_session.is_some());
    let priority = options.priority.or(forked.then_some(PRIORITY_FORK));

    for (index, segment) in segments.iter().enumerate() {
        if store
            .find_node_by_segment(&session_file, &segment.end_entry_id)
            .await?
            .is_some()
        {
            report.already_analyzed += 1;
            continue;
        }

        let mut job = NewJob::analysis(&session_file, segment);
        if let Some(priority) = priority {
            job = job.with_priority(priority);
        }

        match queue.enqueue(job).await {
            Ok(Enqueued::Created { .. }) => report.enqueued += 1,
            Ok(Enqueued::Duplicate { .. }) => report.already_queued += 1,
            Err(Error::QueueFull(active)) => {
                report.deferred = segments.len() - index;
                warn!(
                    session_file = %session_file,
                    active_jobs = active,
                    deferred = report.deferred,
                    "Queue full, deferring the rest of the session"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    // a partially enqueued file is picked up again by the next scan
    if report.deferred == 0 {
        record_ingestion(
            store,
            &session_file,
            session.session_id(),
            modified_at,
            size_bytes,
            segments.len(),
        )
        .await?;
    }

    info!(
        session_file = %session_file,
        segments = report.segments,
        enqueued = report.enqueued,
        already_analyzed = report.already_analyzed,
        deferred = report.deferred,
        "Session ingested"
    );
    Ok(report)
}

async fn is_unchanged(
    store: &GraphStore,
    session_file: &str,
    modified_at: DateTime<Utc>,
    size_bytes: i64,
) -> Result<bool> {
    let row: Option<(String, i64)> = sqlx::query_as(
        "SELECT modified_at, size_bytes FROM ingested_sessions WHERE session_file = ?",
    )
    .bind(session_file)
    .fetch_optional(store.pool())
    .await?;

    Ok(row.is_some_and(|(recorded, size)| {
        recorded == format_timestamp(modified_at) && size == size_bytes
    }))
}

async fn record_ingestion(
    store: &GraphStore,
    session_file: &str,
    session_id: Option<&str>,
    modified_at: DateTime<Utc>,
    size_bytes: i64,
    segment_count: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingested_sessions
            (session_file, session_id, modified_at, size_bytes, segment_count, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_file) DO UPDATE SET
            session_id = excluded.session_id,
            modified_at = excluded.modified_at,
            size_bytes = excluded.size_bytes,
            segment_count = excluded.segment_count,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(session_file)
    .bind(session_id)
    .bind(format_timestamp(modified_at))
    .bind(size_bytes)
    .bind(segment_count as i64)
    .bind(format_timestamp(Utc::now()))
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Every `*.jsonl` file under `dir`, sorted by path
pub async fn find_session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Ingest every session file under `dir`
///
/// A file that fails to ingest is logged and skipped. Scanning stops early
/// once the queue is full.
pub async fn scan_sessions_dir(store: &GraphStore, queue: &JobQueue, dir: &Path) -> Result<Vec<IngestReport>> {
    let mut reports = Vec::new();
    for file in find_session_files(dir).await? {
        match ingest_session(store, queue, &file, &IngestOptions::default()).await {
            Ok(report) => {
                let full = report.deferred > 0;
                reports.push(report);
                if full {
                    break;
                }
            }
            Err(e) => warn!(path = %file.display(), error = %e, "Failed to ingest session"),
        }
    }
    Ok(reports)
}
