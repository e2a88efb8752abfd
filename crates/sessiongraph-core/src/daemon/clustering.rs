//! Embedding clustering
//!
//! Seeded k-means (k-means++ initialisation) over L2-normalised embeddings,
//! so squared euclidean distance orders points the same way cosine distance
//! does. Three independent runs per job: every active node, high-friction
//! nodes and high-delight nodes.

use std::collections::HashMap;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClusteringConfig;
use crate::error::Result;
use crate::graph::{
    cosine_distance, squared_euclidean, Cluster, ClusterMember, ClusterStatus, GraphStore, NodeFilters,
    NodeSignals, SignalType,
};

pub const ALGORITHM: &str = "kmeans";

/// Nodes loaded to read signal scores from
const SIGNAL_SCAN_LIMIT: usize = 10_000;

/// Result of a k-means run
#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    pub centroids: Vec<Vec<f32>>,
    /// Centroid index of every input point
    pub assignments: Vec<usize>,
    pub iterations: usize,
}

/// Scale a vector to unit length; zero vectors are returned unchanged
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

/// Cluster `points` into at most `k` groups
///
/// Deterministic for a given seed. Fewer than `k` centroids come back when
/// there are fewer distinct points than `k`.
pub fn kmeans(points: &[Vec<f32>], k: usize, seed: u64, max_iterations: usize) -> KMeans {
    if points.is_empty() || k == 0 {
        return KMeans {
            centroids: Vec::new(),
            assignments: Vec::new(),
            iterations: 0,
        };
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(points, k, &mut rng);
    let mut assignments = vec![usize::MAX; points.len()];
    let mut iterations = 0;

    while iterations < max_iterations.max(1) {
        iterations += 1;

        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let nearest = nearest_centroid(point, &centroids);
            if assignments[i] != nearest {
                assignments[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let dims = centroids[0].len();
        let mut sums = vec![vec![0.0f32; dims]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (point, &cluster) in points.iter().zip(&assignments) {
            counts[cluster] += 1;
            for (sum, x) in sums[cluster].iter_mut().zip(point) {
                *sum += x;
            }
        }
        for (c, centroid) in centroids.iter_mut().enumerate() {
            // an emptied cluster keeps its previous centroid
            if counts[c] > 0 {
                *centroid = sums[c].iter().map(|s| s / counts[c] as f32).collect();
            }
        }
    }

    KMeans {
        centroids,
        assignments,
        iterations,
    }
}

/// k-means++: each further centroid is drawn with probability proportional
/// to its squared distance from the nearest centroid chosen so far
fn seed_centroids(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];

    while centroids.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                centroids
                    .iter()
                    .map(|c| squared_euclidean(p, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }

        let mut target = rng.gen_range(0.0..total);
        let mut chosen = points.len() - 1;
        for (i, weight) in weights.iter().enumerate() {
            if target < *weight {
                chosen = i;
                break;
            }
            target -= weight;
        }
        centroids.push(points[chosen].clone());
    }
    centroids
}

fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_euclidean(point, centroid);
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}

/// Number of clusters for `n` points
pub fn choose_k(n: usize, config: &ClusteringConfig) -> usize {
    n.div_ceil(config.target_cluster_size.max(1))
        .clamp(1, config.max_clusters.max(1))
}

/// Group embedded nodes into clusters, dropping groups below the minimum size
pub fn build_clusters(
    embeddings: &[(String, Vec<f32>)],
    signal_type: Option<SignalType>,
    config: &ClusteringConfig,
) -> Vec<Cluster> {
    if embeddings.len() < config.min_cluster_size.max(1) {
        return Vec::new();
    }

    let points: Vec<Vec<f32>> = embeddings.iter().map(|(_, v)| normalize(v)).collect();
    let result = kmeans(
        &points,
        choose_k(points.len(), config),
        config.seed,
        config.max_iterations,
    );

    let now = Utc::now();
    let mut clusters = Vec::new();
    for (c, centroid) in result.centroids.iter().enumerate() {
        let mut members: Vec<ClusterMember> = result
            .assignments
            .iter()
            .enumerate()
            .filter(|(_, assigned)| **assigned == c)
            .map(|(i, _)| ClusterMember {
                node_id: embeddings[i].0.clone(),
                distance: cosine_distance(&points[i], centroid),
                is_representative: false,
            })
            .collect();
        if members.len() < config.min_cluster_size.max(1) {
            continue;
        }

        members.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        members[0].is_representative = true;

        clusters.push(Cluster {
            id: Uuid::new_v4().to_string(),
            name: None,
            description: Some(format!("{} similar nodes", members.len())),
            centroid: centroid.clone(),
            algorithm: ALGORITHM.to_string(),
            status: ClusterStatus::Pending,
            signal_type,
            members,
            created_at: now,
        });
    }
    clusters
}

/// Recompute every pending cluster
pub async fn run_clustering(store: &GraphStore, config: &ClusteringConfig) -> Result<usize> {
    let embeddings = store.active_embeddings().await?;

    let signals: HashMap<String, NodeSignals> = store
        .list_nodes(&NodeFilters::default(), SIGNAL_SCAN_LIMIT)
        .await?
        .into_iter()
        .filter_map(|node| node.signals.map(|s| (node.id, s)))
        .collect();

    let subset = |score: fn(&NodeSignals) -> f64| -> Vec<(String, Vec<f32>)> {
        embeddings
            .iter()
            .filter(|(id, _)| {
                signals
                    .get(id)
                    .is_some_and(|s| score(s) >= config.signal_threshold)
            })
            .cloned()
            .collect()
    };
    let friction = subset(|s| s.friction.score);
    let delight = subset(|s| s.delight.score);

    let mut clusters = build_clusters(&embeddings, None, config);
    clusters.extend(build_clusters(&friction, Some(SignalType::Friction), config));
    clusters.extend(build_clusters(&delight, Some(SignalType::Delight), config));

    debug!(
        embedded = embeddings.len(),
        friction = friction.len(),
        delight = delight.len(),
        "Clustering inputs"
    );
    let created = store.replace_clusters(&clusters).await?;
    info!(clusters = created, "Clustering complete");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<(String, Vec<f32>)> {
        let mut points = Vec::new();
        for i in 0..5 {
            let jitter = i as f32 * 0.01;
            points.push((format!("a{i}"), vec![1.0, jitter, 0.0]));
            points.push((format!("b{i}"), vec![0.0, jitter, 1.0]));
        }
        points
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            max_clusters: 2,
            target_cluster_size: 5,
            min_cluster_size: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let points: Vec<Vec<f32>> = blobs().into_iter().map(|(_, v)| normalize(&v)).collect();
        let result = kmeans(&points, 2, 7, 50);

        assert_eq!(result.centroids.len(), 2);
        // a-points sit at even indices, b-points at odd ones
        let a = result.assignments[0];
        let b = result.assignments[1];
        assert_ne!(a, b);
        for (i, assigned) in result.assignments.iter().enumerate() {
            assert_eq!(*assigned, if i % 2 == 0 { a } else { b });
        }
    }

    #[test]
    fn test_kmeans_is_deterministic_per_seed() {
        let points: Vec<Vec<f32>> = blobs().into_iter().map(|(_, v)| v).collect();
        assert_eq!(kmeans(&points, 3, 42, 50), kmeans(&points, 3, 42, 50));
    }

    #[test]
    fn test_kmeans_with_identical_points() {
        let points = vec![vec![1.0, 0.0]; 4];
        let result = kmeans(&points, 3, 1, 10);
        assert_eq!(result.centroids.len(), 1);
        assert!(result.assignments.iter().all(|a| *a == 0));
        assert!(kmeans(&[], 3, 1, 10).centroids.is_empty());
    }

    #[test]
    fn test_choose_k() {
        let config = config();
        assert_eq!(choose_k(1, &config), 1);
        assert_eq!(choose_k(6, &config), 2);
        assert_eq!(choose_k(100, &config), 2);
    }

    #[test]
    fn test_build_clusters_marks_representatives() {
        let clusters = build_clusters(&blobs(), Some(SignalType::Friction), &config());
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert_eq!(cluster.members.len(), 5);
            assert_eq!(cluster.signal_type, Some(SignalType::Friction));
            assert_eq!(cluster.members.iter().filter(|m| m.is_representative).count(), 1);
            assert!(cluster.members[0].is_representative);
            let prefix = &cluster.members[0].node_id[..1];
            assert!(cluster.members.iter().all(|m| m.node_id.starts_with(prefix)));
        }

        // too few points for a cluster
        assert!(build_clusters(&blobs()[..2], None, &config()).is_empty());
    }
}
