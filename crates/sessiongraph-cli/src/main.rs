//! SessionGraph CLI - knowledge graph daemon for coding-agent sessions

use std::path::PathBuf;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sessiongraph_core::boundary::extract_segments;
use sessiongraph_core::config::Config;
use sessiongraph_core::daemon::{
    ingest_session, Daemon, EmbeddingProvider, HttpEmbeddingProvider, IngestOptions,
};
use sessiongraph_core::graph::{GraphStore, ManualFlag, ManualFlagType, NodeFilters, SearchOptions};
use sessiongraph_core::queue::{JobQueue, JobStatus, PRIORITY_USER};
use sessiongraph_core::session::parse_session_file;
use sessiongraph_core::storage::{migration_status, Database};
use sessiongraph_core::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sessiongraph")]
#[command(author, version, about = "Knowledge graph daemon for coding-agent sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background daemon until interrupted
    Daemon {
        /// Directory scanned for session files (overrides daemon.sessions_dir)
        #[arg(long)]
        sessions_dir: Option<PathBuf>,
        /// Number of worker loops (overrides daemon.parallel_workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Queue analysis for every un-analysed segment of a session file
    Ingest {
        /// Session JSONL file
        file: PathBuf,
        /// Re-read the file even if it has not changed
        #[arg(short, long)]
        force: bool,
        /// Queue ahead of background work
        #[arg(long)]
        urgent: bool,
    },

    /// Show the segments a session file splits into
    Segments {
        /// Session JSONL file
        file: PathBuf,
    },

    /// Inspect and manage the job queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Attach a manual flag to a node
    Flag {
        /// Node ID
        node_id: String,
        /// Flag type (quirk, failure, win, note)
        flag_type: String,
        /// Free-text message
        message: String,
    },

    /// Search nodes
    Search {
        query: String,
        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Search by embedding similarity instead of full text
        #[arg(long)]
        semantic: bool,
        /// Only nodes of this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Show a node
    Node {
        /// Node ID
        id: String,
        /// Show a specific version instead of the latest
        #[arg(long)]
        version: Option<u32>,
        /// Also list the node's edges
        #[arg(long)]
        edges: bool,
    },

    /// Apply relevance decay now
    Decay,

    /// Run health check
    Doctor,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Job counts by status
    Stats,
    /// List jobs
    List {
        /// Filter by status (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Requeue failed jobs
    Retry {
        /// Job ID (all failed jobs if omitted)
        id: Option<String>,
    },
    /// Cancel a pending or running job
    Cancel { id: String },
    /// Delete completed jobs older than a number of days
    Purge {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiongraph=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = &result {
        if let Some(hint) = e.downcast_ref::<Error>().and_then(Error::suggestion) {
            eprintln!("Hint: {hint}");
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let quiet = cli.quiet;

    match cli.command {
        Commands::Daemon {
            sessions_dir,
            workers,
        } => cmd_daemon(sessions_dir, workers).await,

        Commands::Ingest {
            file,
            force,
            urgent,
        } => cmd_ingest(file, force, urgent, format, quiet).await,

        Commands::Segments { file } => cmd_segments(file, format).await,

        Commands::Queue { action } => cmd_queue(action, format, quiet).await,

        Commands::Flag {
            node_id,
            flag_type,
            message,
        } => cmd_flag(&node_id, &flag_type, message, quiet).await,

        Commands::Search {
            query,
            limit,
            semantic,
            project,
        } => cmd_search(&query, limit, semantic, project, format).await,

        Commands::Node { id, version, edges } => cmd_node(&id, version, edges, format).await,

        Commands::Decay => cmd_decay(format, quiet).await,

        Commands::Doctor => cmd_doctor(quiet).await,

        Commands::Config { action } => cmd_config(action),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config() -> anyhow::Result<Config> {
    let config = Config::load()?;
    config.validate()?;
    Ok(config)
}

/// Open the configured database with a graph store and job queue on it
async fn open(config: &Config) -> anyhow::Result<(Database, GraphStore, JobQueue)> {
    let db = Database::new(config.database.database_config()).await?;
    let mut store = GraphStore::new(db.pool().clone()).with_access_boost(config.decay.access_boost);
    if config.embedding.enabled {
        store = store.with_embedding_index(config.embedding.model.clone(), config.embedding.dimensions);
    }
    let queue = JobQueue::new(db.pool().clone(), config.daemon.queue.clone());
    Ok((db, store, queue))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_daemon(sessions_dir: Option<PathBuf>, workers: Option<usize>) -> anyhow::Result<()> {
    let mut config = load_config()?;
    if sessions_dir.is_some() {
        config.daemon.sessions_dir = sessions_dir;
    }
    if let Some(workers) = workers {
        config.daemon.parallel_workers = workers;
    }

    let daemon = Daemon::from_config(config).await?;
    let cancel = CancellationToken::new();

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        signal.cancel();
    });

    daemon.run(cancel).await?;
    Ok(())
}

async fn cmd_ingest(
    file: PathBuf,
    force: bool,
    urgent: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = load_config()?;
    let (_db, store, queue) = open(&config).await?;

    let options = IngestOptions {
        force,
        priority: urgent.then_some(PRIORITY_USER),
    };
    let report = ingest_session(&store, &queue, &file, &options).await?;

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "session_file": report.session_file,
            "segments": report.segments,
            "enqueued": report.enqueued,
            "already_analyzed": report.already_analyzed,
            "already_queued": report.already_queued,
            "deferred": report.deferred,
            "unchanged": report.unchanged,
        }));
    }
    if quiet {
        return Ok(());
    }

    if report.unchanged {
        println!("Unchanged since last ingestion: {}", report.session_file);
        println!("Use --force to read it again.");
        return Ok(());
    }
    println!("Ingested {}", report.session_file);
    println!("  Segments:         {}", report.segments);
    println!("  Enqueued:         {}", report.enqueued);
    println!("  Already analysed: {}", report.already_analyzed);
    println!("  Already queued:   {}", report.already_queued);
    if report.deferred > 0 {
        println!("  Deferred:         {} (queue full)", report.deferred);
    }
    Ok(())
}

async fn cmd_segments(file: PathBuf, format: OutputFormat) -> anyhow::Result<()> {
    let session = parse_session_file(&file).await?;
    let segments = extract_segments(&session.entries);

    if format == OutputFormat::Json {
        return print_json(&segments);
    }

    println!(
        "{} entries, {} segments{}",
        session.entries.len(),
        segments.len(),
        if session.skipped_lines > 0 {
            format!(" ({} unparseable lines skipped)", session.skipped_lines)
        } else {
            String::new()
        }
    );
    for (i, segment) in segments.iter().enumerate() {
        let cut: Vec<&str> = segment.boundaries.iter().map(|b| b.boundary_type.as_str()).collect();
        println!(
            "  #{i} {}..{}  {} entries  {:.1} min  {}",
            segment.start_entry_id,
            segment.end_entry_id,
            segment.entry_count,
            segment.duration_minutes(),
            if cut.is_empty() { "start".to_string() } else { cut.join("+") }
        );
    }
    Ok(())
}

async fn cmd_queue(action: QueueAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let (_db, _store, queue) = open(&config).await?;

    match action {
        QueueAction::Stats => {
            let stats = queue.stats().await?;
            if format == OutputFormat::Json {
                return print_json(&stats);
            }
            println!("Queue");
            println!("  Pending:   {}", stats.pending);
            println!("  Running:   {}", stats.running);
            println!("  Completed: {}", stats.completed);
            println!("  Failed:    {}", stats.failed);
            if let Some(oldest) = stats.oldest_pending {
                println!("  Oldest pending: {}", oldest.to_rfc3339());
            }
            if !stats.active_by_type.is_empty() {
                println!("  Active by type:");
                for (job_type, count) in &stats.active_by_type {
                    println!("    {job_type}: {count}");
                }
            }
        }
        QueueAction::List { status, limit } => {
            let status = match status.as_deref() {
                Some(s) => Some(JobStatus::parse(s).ok_or_else(|| {
                    Error::Validation(format!(
                        "unknown status '{s}' (expected pending, running, completed or failed)"
                    ))
                })?),
                None => None,
            };
            let jobs = queue.list(status, limit).await?;
            if format == OutputFormat::Json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "{}  {:<10} {:<22} p{:<4} {}{}",
                    job.id,
                    job.status.as_str(),
                    job.job_type.as_str(),
                    job.priority,
                    truncate(&job.target(), 60),
                    job.error
                        .as_deref()
                        .map(|e| format!("  [{}]", truncate(e, 60)))
                        .unwrap_or_default()
                );
            }
        }
        QueueAction::Retry { id } => {
            let retried = queue.retry_failed(id.as_deref()).await?;
            if !quiet {
                println!("Requeued {retried} job(s).");
            }
        }
        QueueAction::Cancel { id } => {
            queue.cancel(&id).await?;
            if !quiet {
                println!("Cancelled job {id}.");
            }
        }
        QueueAction::Purge { days } => {
            let purged = queue.purge_completed(Utc::now() - Duration::days(days)).await?;
            if !quiet {
                println!("Purged {purged} completed job(s).");
            }
        }
    }
    Ok(())
}

async fn cmd_flag(node_id: &str, flag_type: &str, message: String, quiet: bool) -> anyhow::Result<()> {
    let flag_type = ManualFlagType::parse(flag_type).ok_or_else(|| {
        Error::Validation(format!(
            "unknown flag type '{flag_type}' (expected quirk, failure, win or note)"
        ))
    })?;

    let config = load_config()?;
    let (_db, store, _queue) = open(&config).await?;
    let signals = store
        .append_manual_flag(
            node_id,
            &ManualFlag {
                flag_type,
                message,
                timestamp: Utc::now(),
            },
        )
        .await?;

    if !quiet {
        println!(
            "Flagged {node_id} as {} ({} manual flag(s))",
            flag_type.as_str(),
            signals.manual_flags.len()
        );
    }
    Ok(())
}

async fn cmd_search(
    query: &str,
    limit: usize,
    semantic: bool,
    project: Option<String>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = load_config()?;
    let (_db, store, _queue) = open(&config).await?;

    let results: Vec<(sessiongraph_core::graph::Node, Option<f32>)> = if semantic {
        if !config.embedding.enabled {
            return Err(Error::Configuration(
                "semantic search needs embedding.enabled = true".to_string(),
            )
            .into());
        }
        let provider = HttpEmbeddingProvider::from_config(&config.embedding)?;
        let vector = provider
            .embed(&[query.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::Embedding("no vector returned for the query".to_string()))?;
        let options = SearchOptions {
            limit,
            filters: NodeFilters {
                project,
                ..Default::default()
            },
            max_distance: None,
        };
        store
            .semantic_search(&vector, &options)
            .await?
            .into_iter()
            .map(|hit| {
                let similarity = hit.similarity();
                (hit.node, Some(similarity))
            })
            .collect()
    } else {
        store
            .search_text(query, limit)
            .await?
            .into_iter()
            .filter(|n| project.as_ref().is_none_or(|p| &n.classification.project == p))
            .map(|n| (n, None))
            .collect()
    };

    if format == OutputFormat::Json {
        let rows: Vec<_> = results
            .iter()
            .map(|(node, similarity)| serde_json::json!({ "node": node, "similarity": similarity }))
            .collect();
        return print_json(&rows);
    }

    if results.is_empty() {
        println!("No matching nodes.");
        return Ok(());
    }
    for (node, similarity) in results {
        let score = similarity.map(|s| format!(" ({s:.2})")).unwrap_or_default();
        println!(
            "{}  [{}] {} / {}{}",
            node.id,
            node.classification.node_type.as_str(),
            node.classification.project,
            node.content.outcome.as_str(),
            score
        );
        println!("    {}", truncate(&node.content.summary, 100));
    }
    Ok(())
}

async fn cmd_node(id: &str, version: Option<u32>, edges: bool, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config()?;
    let (_db, store, _queue) = open(&config).await?;

    let node = match version {
        Some(v) => store.get_node_version(id, v).await?,
        None => store.get_node(id).await?,
    }
    .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
    let node_edges = if edges {
        store.edges_for_node(id).await?
    } else {
        Vec::new()
    };

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "node": node, "edges": node_edges }));
    }

    println!("Node {} (version {})", node.id, node.version);
    println!("  Type:     {}", node.classification.node_type.as_str());
    println!("  Project:  {}", node.classification.project);
    println!("  Outcome:  {}", node.content.outcome.as_str());
    println!("  Session:  {}", node.source.session_file);
    println!(
        "  Segment:  {}..{} ({} entries)",
        node.source.segment.start_entry_id, node.source.segment.end_entry_id, node.source.segment.entry_count
    );
    println!("  Analyzed: {} by {}", node.metadata.analyzed_at.to_rfc3339(), node.metadata.analyzer_version);
    println!("  Relevance {:.2}, importance {:.2}{}", node.relevance_score, node.importance, if node.archived { ", archived" } else { "" });
    println!();
    println!("{}", node.content.summary);

    if let Some(signals) = &node.signals {
        println!();
        println!(
            "Signals: friction {:.2}, delight {:.2}, {} manual flag(s)",
            signals.friction.score,
            signals.delight.score,
            signals.manual_flags.len()
        );
    }
    if !node.previous_versions.is_empty() {
        println!("Previous versions: {}", node.previous_versions.join(", "));
    }
    if edges {
        println!();
        println!("Edges ({}):", node_edges.len());
        for edge in node_edges {
            let (direction, other) = if edge.source_node_id == node.id {
                ("->", &edge.target_node_id)
            } else {
                ("<-", &edge.source_node_id)
            };
            println!("  {direction} {other}  {} ({})", edge.edge_type.as_str(), edge.created_by.as_str());
        }
    }
    Ok(())
}

async fn cmd_decay(format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let (_db, store, _queue) = open(&config).await?;
    let report = store.apply_decay(&config.decay, Utc::now()).await?;

    if format == OutputFormat::Json {
        return print_json(&report);
    }
    if !quiet {
        println!(
            "Examined {}, decayed {}, archived {}",
            report.examined, report.decayed, report.archived
        );
    }
    Ok(())
}

async fn cmd_doctor(quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("SessionGraph Health Check");
        println!("=========================");
        println!();
    }

    let mut all_ok = true;

    // Check configuration
    let config = match Config::load() {
        Ok(config) => match config.validate() {
            Ok(()) => {
                if !quiet {
                    println!("[OK] Configuration: Valid");
                }
                Some(config)
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Configuration: {e}");
                }
                None
            }
        },
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {e}");
            }
            None
        }
    };

    // Check config file location
    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: Error - {e}"),
        }
    }

    let Some(config) = config else {
        return finish_doctor(all_ok, quiet);
    };

    // Check analyzer
    match config.analyzer.command.first() {
        Some(program) => {
            if !quiet {
                println!("[OK] Analyzer: {program} (version {})", config.analyzer.version);
            }
        }
        None => {
            all_ok = false;
            if !quiet {
                println!("[!!] Analyzer: Not configured");
                println!("     Set analyzer.command in config.toml");
            }
        }
    }

    // Check embeddings
    if !quiet {
        if config.embedding.enabled {
            let key = if config.embedding.resolved_api_key().is_some() {
                "API key set"
            } else {
                "no API key"
            };
            println!(
                "[OK] Embeddings: {} at {} ({} dims, {key})",
                config.embedding.model, config.embedding.base_url, config.embedding.dimensions
            );
        } else {
            println!("[--] Embeddings: Disabled (semantic search and discovery are off)");
        }
    }

    // Check database
    match open(&config).await {
        Ok((db, store, queue)) => {
            let status = migration_status(db.pool()).await?;
            let stats = store.stats().await?;
            let queue_stats = queue.stats().await?;
            if !quiet {
                println!(
                    "[OK] Database: {} (schema v{})",
                    config.database.resolved_path().display(),
                    status.current_version
                );
                println!(
                    "     {} nodes, {} edges, {} embeddings, {} archived",
                    stats.nodes, stats.edges, stats.embeddings, stats.archived
                );
                println!(
                    "     Queue: {} pending, {} running, {} failed",
                    queue_stats.pending, queue_stats.running, queue_stats.failed
                );
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Error - {e}");
            }
        }
    }

    finish_doctor(all_ok, quiet)
}

fn finish_doctor(all_ok: bool, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    if all_ok {
        Ok(())
    } else {
        anyhow::bail!("health check failed")
    }
}

fn cmd_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
    }
    Ok(())
}
