//! Relevance decay and archival
//!
//! Decay runs as a batch job over a snapshot of access timestamps. Each batch
//! is read first and then written in one transaction, so the read path never
//! waits on decay bookkeeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::parse_timestamp;

use super::store::GraphStore;

const BATCH_SIZE: i64 = 500;

/// Decay parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Nodes accessed within this many days are left alone
    pub window_days: u32,
    /// Relevance lost per run by a node of zero importance
    pub base_rate: f64,
    /// Nodes whose relevance falls below this are archived
    pub archive_below: f64,
    /// Nodes at or above this importance are never archived
    pub protect_importance: f64,
    /// Relevance added on each read
    pub access_boost: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            base_rate: 0.1,
            archive_below: 0.1,
            protect_importance: 0.8,
            access_boost: 0.05,
        }
    }
}

impl DecayConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("decay.base_rate", self.base_rate),
            ("decay.archive_below", self.archive_below),
            ("decay.protect_importance", self.protect_importance),
            ("decay.access_boost", self.access_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.window_days == 0 {
            return Err(Error::Configuration("decay.window_days must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Relevance after one decay step; higher importance decays slower
    pub fn decayed(&self, relevance: f64, importance: f64) -> f64 {
        (relevance - self.base_rate * (1.0 - importance.clamp(0.0, 1.0))).max(0.0)
    }

    pub fn should_archive(&self, relevance: f64, importance: f64) -> bool {
        relevance < self.archive_below && importance < self.protect_importance
    }
}

/// Outcome of one decay run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    /// Nodes outside the access window
    pub examined: u64,
    /// Nodes whose relevance went down
    pub decayed: u64,
    /// Nodes archived by this run
    pub archived: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct DecayCandidate {
    id: String,
    version: i64,
    relevance_score: f64,
    importance: f64,
    touched_at: String,
}

impl GraphStore {
    /// Lower relevance of nodes not accessed within the window and archive the faded ones
    pub async fn apply_decay(&self, config: &DecayConfig, now: DateTime<Utc>) -> Result<DecayReport> {
        let cutoff = now - Duration::days(config.window_days as i64);
        let mut report = DecayReport::default();
        let mut after = String::new();

        loop {
            let batch: Vec<DecayCandidate> = sqlx::query_as(
                r#"
                SELECT n.id, n.version, n.relevance_score, n.importance,
                       COALESCE(n.last_accessed, n.analyzed_at) AS touched_at
                FROM nodes n
                WHERE n.version = (SELECT MAX(m.version) FROM nodes m WHERE m.id = n.id)
                  AND n.archived = 0
                  AND n.id > ?
                ORDER BY n.id
                LIMIT ?
                "#,
            )
            .bind(&after)
            .bind(BATCH_SIZE)
            .fetch_all(self.pool())
            .await?;

            let Some(last) = batch.last() else {
                break;
            };
            after = last.id.clone();

            let mut tx = self.pool().begin().await?;
            for candidate in &batch {
                if parse_timestamp(&candidate.touched_at) >= cutoff {
                    continue;
                }
                report.examined += 1;

                let relevance = config.decayed(candidate.relevance_score, candidate.importance);
                let archive = config.should_archive(relevance, candidate.importance);
                if relevance < candidate.relevance_score {
                    report.decayed += 1;
                }
                if archive {
                    report.archived += 1;
                }

                sqlx::query(
                    r#"
                    UPDATE nodes
                    SET relevance_score = ?, archived = ?
                    WHERE id = ? AND version = ?
                    "#,
                )
                .bind(relevance)
                .bind(archive)
                .bind(&candidate.id)
                .bind(candidate.version)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }

        info!(
            examined = report.examined,
            decayed = report.decayed,
            archived = report.archived,
            "Relevance decay applied"
        );
        Ok(report)
    }

    /// Bring an archived node back into normal queries
    pub async fn restore_node(&self, node_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes AS n
            SET archived = 0, relevance_score = MAX(relevance_score, ?)
            WHERE n.id = ? AND n.version = (SELECT MAX(m.version) FROM nodes m WHERE m.id = n.id)
            "#,
        )
        .bind(0.5f64)
        .bind(node_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        info!(node_id = %node_id, "Node restored from archive");
        Ok(())
    }
}
