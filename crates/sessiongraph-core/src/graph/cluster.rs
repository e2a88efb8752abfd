//! Cluster persistence
//!
//! Each clustering run replaces the pending clusters wholesale. Clusters an
//! operator confirmed or dismissed survive later runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::{format_timestamp, parse_timestamp};

use super::store::GraphStore;
use super::vector::{decode_vector, encode_vector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Pending,
    Confirmed,
    Dismissed,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }
}

/// Behavioral theme a cluster was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Friction,
    Delight,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Friction => "friction",
            Self::Delight => "delight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "friction" => Some(Self::Friction),
            "delight" => Some(Self::Delight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node_id: String,
    /// Distance from the centroid
    pub distance: f32,
    pub is_representative: bool,
}

/// A group of nodes with nearby embeddings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub centroid: Vec<f32>,
    pub algorithm: String,
    pub status: ClusterStatus,
    pub signal_type: Option<SignalType>,
    pub members: Vec<ClusterMember>,
    pub created_at: DateTime<Utc>,
}

impl GraphStore {
    /// Replace all pending clusters with `clusters` in one transaction
    pub async fn replace_clusters(&self, clusters: &[Cluster]) -> Result<usize> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM cluster_nodes WHERE cluster_id IN (SELECT id FROM clusters WHERE status = 'pending')",
        )
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM clusters WHERE status = 'pending'")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for cluster in clusters {
            let now = format_timestamp(cluster.created_at);
            sqlx::query(
                r#"
                INSERT INTO clusters (
                    id, name, description, centroid, algorithm, status, signal_type,
                    node_count, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&cluster.id)
            .bind(&cluster.name)
            .bind(&cluster.description)
            .bind(encode_vector(&cluster.centroid))
            .bind(&cluster.algorithm)
            .bind(cluster.status.as_str())
            .bind(cluster.signal_type.map(|s| s.as_str()))
            .bind(cluster.members.len() as i64)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            for member in &cluster.members {
                sqlx::query(
                    r#"
                    INSERT INTO cluster_nodes (cluster_id, node_id, distance, is_representative)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&cluster.id)
                .bind(&member.node_id)
                .bind(member.distance as f64)
                .bind(member.is_representative)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(
            removed = removed,
            created = clusters.len(),
            "Pending clusters replaced"
        );
        Ok(clusters.len())
    }

    /// Clusters with their members, optionally restricted to one status
    pub async fn list_clusters(&self, status: Option<ClusterStatus>) -> Result<Vec<Cluster>> {
        let rows: Vec<ClusterRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, centroid, algorithm, status, signal_type, created_at
            FROM clusters
            WHERE ? IS NULL OR status = ?
            ORDER BY node_count DESC, created_at ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.pool())
        .await?;

        let mut clusters = Vec::with_capacity(rows.len());
        for row in rows {
            let members: Vec<(String, f64, bool)> = sqlx::query_as(
                r#"
                SELECT node_id, distance, is_representative FROM cluster_nodes
                WHERE cluster_id = ?
                ORDER BY distance ASC, node_id ASC
                "#,
            )
            .bind(&row.id)
            .fetch_all(self.pool())
            .await?;

            clusters.push(row.into_cluster(
                members
                    .into_iter()
                    .map(|(node_id, distance, is_representative)| ClusterMember {
                        node_id,
                        distance: distance as f32,
                        is_representative,
                    })
                    .collect(),
            )?);
        }
        Ok(clusters)
    }

    /// Confirm or dismiss a cluster
    pub async fn set_cluster_status(&self, cluster_id: &str, status: ClusterStatus) -> Result<()> {
        let result = sqlx::query("UPDATE clusters SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_timestamp(Utc::now()))
            .bind(cluster_id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Validation(format!("cluster '{cluster_id}' not found")));
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ClusterRow {
    id: String,
    name: Option<String>,
    description: Option<String>,
    centroid: Vec<u8>,
    algorithm: String,
    status: String,
    signal_type: Option<String>,
    created_at: String,
}

impl ClusterRow {
    fn into_cluster(self, members: Vec<ClusterMember>) -> Result<Cluster> {
        let status = ClusterStatus::parse(&self.status)
            .ok_or_else(|| Error::Validation(format!("unknown cluster status '{}'", self.status)))?;

        Ok(Cluster {
            id: self.id,
            name: self.name,
            description: self.description,
            centroid: decode_vector(&self.centroid),
            algorithm: self.algorithm,
            status,
            signal_type: self.signal_type.as_deref().and_then(SignalType::parse),
            members,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}
