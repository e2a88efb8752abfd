//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::graph::DecayConfig;
use crate::queue::QueueConfig;
use crate::scheduler::ScheduleConfig;
use crate::signals::SignalConfig;
use crate::storage::{default_database_path, DatabaseConfig};

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "SESSIONGRAPH_CONFIG_DIR";

/// Sessiongraph configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub daemon: DaemonConfig,
    pub embedding: EmbeddingConfig,
    pub analyzer: AnalyzerConfig,
    pub decay: DecayConfig,
    pub signals: SignalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file; the platform data directory when unset
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl DatabaseSettings {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_database_path)
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig::with_path(self.resolved_path()).max_connections(self.max_connections)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Worker loops pulling analysis jobs
    pub parallel_workers: usize,
    /// Jobs in flight across all types
    pub max_concurrent_jobs: usize,
    /// Jobs in flight per maintenance type
    pub max_per_maintenance_type: usize,
    pub analysis_timeout_minutes: u64,
    /// Lease taken on a claimed job; renewed while the job runs
    pub lease_minutes: i64,
    /// Idle wait between dequeue attempts
    pub poll_interval_seconds: u64,
    /// Directory scanned for new or changed session files
    pub sessions_dir: Option<PathBuf>,
    pub scan_interval_seconds: u64,
    /// Completed jobs older than this are purged by the decay run
    pub purge_completed_after_days: i64,
    pub queue: QueueConfig,
    pub schedule: ScheduleConfig,
    pub clustering: ClusteringConfig,
    pub discovery: DiscoveryConfig,
    pub effectiveness: EffectivenessConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 2,
            max_concurrent_jobs: 4,
            max_per_maintenance_type: 1,
            analysis_timeout_minutes: 10,
            lease_minutes: 15,
            poll_interval_seconds: 5,
            sessions_dir: None,
            scan_interval_seconds: 60,
            purge_completed_after_days: 30,
            queue: QueueConfig::default(),
            schedule: ScheduleConfig::default(),
            clustering: ClusteringConfig::default(),
            discovery: DiscoveryConfig::default(),
            effectiveness: EffectivenessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Upper bound on clusters per run; fewer when there are few nodes
    pub max_clusters: usize,
    /// Nodes per cluster the run aims for when choosing k
    pub target_cluster_size: usize,
    /// Clusters smaller than this are dropped
    pub min_cluster_size: usize,
    pub max_iterations: usize,
    pub seed: u64,
    /// Nodes whose signal score reaches this join the friction or delight run
    pub signal_threshold: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_clusters: 20,
            target_cluster_size: 8,
            min_cluster_size: 3,
            max_iterations: 50,
            seed: 42,
            signal_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Neighbours examined per node
    pub neighbours: usize,
    /// Cosine distance above which a neighbour is ignored
    pub max_distance: f32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            neighbours: 10,
            max_distance: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectivenessConfig {
    /// Days compared on each side of a prompt's introduction
    pub window_days: i64,
    /// Sessions needed on each side before significance is claimed
    pub min_sessions: u32,
}

impl Default for EffectivenessConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            min_sessions: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    /// OpenAI-compatible API root; `/embeddings` is appended
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    /// Environment variable holding the API key, if the endpoint needs one
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434/v1".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
            api_key_env: "SESSIONGRAPH_EMBEDDING_API_KEY".to_string(),
            timeout_secs: 30,
            batch_size: 32,
        }
    }
}

impl EmbeddingConfig {
    /// API key from the configured environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Program and arguments; the request is written to stdin as JSON
    pub command: Vec<String>,
    /// Recorded on every node; nodes from other versions are re-analysed
    pub version: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            version: "v1".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("sessiongraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let daemon = &self.daemon;
        for (name, value) in [
            ("daemon.parallel_workers", daemon.parallel_workers),
            ("daemon.max_concurrent_jobs", daemon.max_concurrent_jobs),
            ("daemon.max_per_maintenance_type", daemon.max_per_maintenance_type),
            ("daemon.queue.max_queue_size", daemon.queue.max_queue_size),
            ("daemon.clustering.max_clusters", daemon.clustering.max_clusters),
            ("daemon.clustering.target_cluster_size", daemon.clustering.target_cluster_size),
            ("embedding.dimensions", self.embedding.dimensions),
            ("embedding.batch_size", self.embedding.batch_size),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be at least 1")));
            }
        }
        if daemon.analysis_timeout_minutes == 0 {
            return Err(Error::Configuration(
                "daemon.analysis_timeout_minutes must be at least 1".to_string(),
            ));
        }
        if daemon.lease_minutes <= 0 {
            return Err(Error::Configuration("daemon.lease_minutes must be positive".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(Error::Configuration(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        daemon.schedule.schedules()?;
        self.decay.validate()?;
        self.signals.validate()?;
        Ok(())
    }
}
