//! Database migrations
//!
//! This module manages SQLite schema migrations for sessiongraph.
//! Migrations are versioned and applied automatically on database connection.
//! Every migration only adds tables, columns or indices; existing rows are
//! never rewritten.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 5;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Nodes, edges and the derived per-node tables
const MIGRATION_V1: &str = r#"
    -- One row per node version; (id, version) is the identity
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT NOT NULL,
        version INTEGER NOT NULL CHECK (version >= 1),
        session_file TEXT NOT NULL,
        session_id TEXT,
        segment_start TEXT NOT NULL,
        segment_end TEXT NOT NULL,
        host TEXT,
        node_type TEXT NOT NULL,
        project TEXT NOT NULL DEFAULT '',
        is_new_project INTEGER NOT NULL DEFAULT 0,
        had_clear_goal INTEGER NOT NULL DEFAULT 0,
        summary TEXT NOT NULL DEFAULT '',
        outcome TEXT NOT NULL CHECK (outcome IN ('success', 'partial', 'failed', 'abandoned')),
        timestamp TEXT NOT NULL,
        analyzed_at TEXT NOT NULL,
        analyzer_version TEXT NOT NULL DEFAULT '',
        tokens_used INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0.0,
        duration_minutes REAL NOT NULL DEFAULT 0.0,
        data TEXT NOT NULL,
        signals TEXT,
        previous_versions TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        PRIMARY KEY (id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_project_timestamp ON nodes(project, timestamp);
    CREATE INDEX IF NOT EXISTS idx_nodes_session_segment ON nodes(session_file, segment_end);
    CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON nodes(timestamp);
    CREATE INDEX IF NOT EXISTS idx_nodes_analyzer_version ON nodes(analyzer_version);

    -- Directed typed relations between node ids
    CREATE TABLE IF NOT EXISTS edges (
        id TEXT PRIMARY KEY NOT NULL,
        source_node_id TEXT NOT NULL,
        target_node_id TEXT NOT NULL,
        edge_type TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_by TEXT NOT NULL CHECK (created_by IN ('boundary', 'daemon', 'user')),
        confidence REAL,
        similarity REAL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (source_node_id, target_node_id, edge_type)
    );

    CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_node_id);
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_node_id);
    CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(edge_type);

    -- Lessons of the latest version of each node, one row per lesson
    CREATE TABLE IF NOT EXISTS lessons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        level TEXT NOT NULL CHECK (level IN ('project', 'task', 'user', 'model', 'tool', 'skill', 'subagent')),
        summary TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '',
        confidence TEXT NOT NULL DEFAULT 'medium',
        tags TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_lessons_node_id ON lessons(node_id);
    CREATE INDEX IF NOT EXISTS idx_lessons_level ON lessons(level);

    CREATE TABLE IF NOT EXISTS node_tags (
        node_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (node_id, tag)
    );

    CREATE INDEX IF NOT EXISTS idx_node_tags_tag ON node_tags(tag);

    CREATE TABLE IF NOT EXISTS node_topics (
        node_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        PRIMARY KEY (node_id, topic)
    );

    CREATE INDEX IF NOT EXISTS idx_node_topics_topic ON node_topics(topic);

    CREATE TABLE IF NOT EXISTS model_quirks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        model TEXT NOT NULL,
        observation TEXT NOT NULL,
        frequency TEXT NOT NULL DEFAULT 'once',
        workaround TEXT,
        severity TEXT NOT NULL DEFAULT 'low',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_model_quirks_node_id ON model_quirks(node_id);
    CREATE INDEX IF NOT EXISTS idx_model_quirks_model ON model_quirks(model);

    CREATE TABLE IF NOT EXISTS tool_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        tool TEXT NOT NULL,
        error_type TEXT NOT NULL,
        context TEXT NOT NULL DEFAULT '',
        model TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tool_errors_node_id ON tool_errors(node_id);
    CREATE INDEX IF NOT EXISTS idx_tool_errors_tool ON tool_errors(tool, error_type);

    -- Full-text index over the latest version of each node
    CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
        node_id UNINDEXED,
        summary,
        decisions,
        lessons,
        tags,
        topics
    );
"#;

/// Migration 2: Vector index over node embeddings
const MIGRATION_V2: &str = r#"
    -- rowid doubles as insertion order for stable nearest-neighbour ties
    CREATE TABLE IF NOT EXISTS node_embeddings (
        rowid INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL UNIQUE,
        embedding_model TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        text_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_embeddings_model ON node_embeddings(embedding_model);
"#;

/// Migration 3: Daemon job queue and ingestion bookkeeping
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS analysis_queue (
        id TEXT PRIMARY KEY NOT NULL,
        job_type TEXT NOT NULL CHECK (job_type IN (
            'initial', 'reanalysis', 'connection_discovery', 'clustering',
            'pattern_aggregation', 'backfill_embeddings', 'effectiveness', 'decay'
        )),
        priority INTEGER NOT NULL DEFAULT 100,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'running', 'completed', 'failed')),
        session_file TEXT,
        segment_start TEXT,
        segment_end TEXT,
        node_id TEXT,
        context TEXT NOT NULL DEFAULT '{}',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        worker_id TEXT,
        locked_until TEXT,
        queued_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        run_after TEXT,
        result_node_id TEXT,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_claim ON analysis_queue(status, priority, queued_at);
    CREATE INDEX IF NOT EXISTS idx_queue_target ON analysis_queue(job_type, session_file, segment_end, node_id);

    CREATE TABLE IF NOT EXISTS ingested_sessions (
        session_file TEXT PRIMARY KEY NOT NULL,
        session_id TEXT,
        modified_at TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        segment_count INTEGER NOT NULL DEFAULT 0,
        ingested_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS connection_discovery_runs (
        node_id TEXT PRIMARY KEY NOT NULL,
        last_run_at TEXT NOT NULL,
        edges_created INTEGER NOT NULL DEFAULT 0
    );
"#;

/// Migration 4: Clusters, aggregated insights and prompt effectiveness
const MIGRATION_V4: &str = r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT,
        description TEXT,
        centroid BLOB NOT NULL,
        algorithm TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'confirmed', 'dismissed')),
        signal_type TEXT CHECK (signal_type IS NULL OR signal_type IN ('friction', 'delight')),
        node_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_clusters_status ON clusters(status);

    CREATE TABLE IF NOT EXISTS cluster_nodes (
        cluster_id TEXT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
        node_id TEXT NOT NULL,
        distance REAL NOT NULL,
        is_representative INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (cluster_id, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_cluster_nodes_node_id ON cluster_nodes(node_id);

    CREATE TABLE IF NOT EXISTS aggregated_insights (
        id TEXT PRIMARY KEY NOT NULL,
        insight_type TEXT NOT NULL CHECK (insight_type IN ('quirk', 'win', 'failure', 'tool_error', 'lesson')),
        model TEXT,
        tool TEXT,
        pattern TEXT NOT NULL,
        frequency INTEGER NOT NULL DEFAULT 0,
        confidence REAL NOT NULL DEFAULT 0.0,
        severity TEXT NOT NULL DEFAULT 'low' CHECK (severity IN ('low', 'medium', 'high')),
        workaround TEXT,
        examples TEXT NOT NULL DEFAULT '[]',
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        prompt_text TEXT,
        prompt_included INTEGER NOT NULL DEFAULT 0,
        prompt_version TEXT,
        prompt_added_at TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_insights_type ON aggregated_insights(insight_type);

    CREATE TABLE IF NOT EXISTS insight_nodes (
        insight_id TEXT NOT NULL REFERENCES aggregated_insights(id) ON DELETE CASCADE,
        node_id TEXT NOT NULL,
        observed_at TEXT NOT NULL,
        PRIMARY KEY (insight_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS prompt_effectiveness (
        id TEXT PRIMARY KEY NOT NULL,
        insight_id TEXT NOT NULL REFERENCES aggregated_insights(id) ON DELETE CASCADE,
        prompt_version TEXT NOT NULL,
        before_occurrences INTEGER NOT NULL,
        before_sessions INTEGER NOT NULL,
        after_occurrences INTEGER NOT NULL,
        after_sessions INTEGER NOT NULL,
        before_rate REAL NOT NULL,
        after_rate REAL NOT NULL,
        improvement_pct REAL NOT NULL,
        statistically_significant INTEGER NOT NULL DEFAULT 0,
        measured_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_prompt_effectiveness_insight ON prompt_effectiveness(insight_id, measured_at);
"#;

/// Migration 5: Consolidation fields for relevance decay and archival
const MIGRATION_V5: &str = r#"
    ALTER TABLE nodes ADD COLUMN relevance_score REAL NOT NULL DEFAULT 1.0;
    ALTER TABLE nodes ADD COLUMN importance REAL NOT NULL DEFAULT 0.5;
    ALTER TABLE nodes ADD COLUMN archived INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE nodes ADD COLUMN last_accessed TEXT;

    CREATE INDEX IF NOT EXISTS idx_nodes_archived ON nodes(archived);
    CREATE INDEX IF NOT EXISTS idx_nodes_last_accessed ON nodes(last_accessed);
"#;

/// Ordered list of (version, description, sql)
const MIGRATIONS: &[(i32, &str, &str)] = &[
    (1, "Nodes, edges and derived tables", MIGRATION_V1),
    (2, "Vector index", MIGRATION_V2),
    (3, "Job queue and ingestion bookkeeping", MIGRATION_V3),
    (4, "Clusters, insights and prompt effectiveness", MIGRATION_V4),
    (5, "Consolidation fields", MIGRATION_V5),
];

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Run all pending migrations
///
/// Each migration and its bookkeeping row are applied in one transaction, so
/// a crash mid-way leaves the schema at the previous version.
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    for (version, description, sql) in MIGRATIONS {
        if current_version >= *version {
            continue;
        }

        tracing::info!(version = version, "Applying migration: {}", description);

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_are_ordered() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
        assert_eq!(versions.last().copied(), Some(CURRENT_VERSION));
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables = vec![
            "nodes",
            "edges",
            "lessons",
            "node_tags",
            "node_topics",
            "model_quirks",
            "tool_errors",
            "nodes_fts",
            "node_embeddings",
            "analysis_queue",
            "ingested_sessions",
            "connection_discovery_runs",
            "clusters",
            "cluster_nodes",
            "aggregated_insights",
            "insight_nodes",
            "prompt_effectiveness",
        ];

        for table in tables {
            let result: (i32,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(result.0, 0, "Table {} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_consolidation_columns_added() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        sqlx::query("SELECT relevance_score, importance, archived, last_accessed FROM nodes")
            .fetch_all(&pool)
            .await
            .expect("consolidation columns should exist");
    }
}
