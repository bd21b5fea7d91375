//! Cluster initialization for EM and cluster-quality scoring.
//!
//! EM needs K seed means. The [`ClusterInitializer`] trait is the seam through
//! which a regime model obtains them; [`KMeansInitializer`] is the default
//! (k-means++ seeding followed by Lloyd iterations, best of several restarts).
//! [`silhouette_score`] rates a labelling and drives the greedy elbow search.

use crate::{
    errors::{RegimeError, RegimeResult},
    math_utils::squared_distance,
    preprocessing::ObservationMatrix,
    secure_rng::{derive_seed, SecureRng},
};

/// Output of a cluster initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSeeds {
    /// One centroid per cluster
    pub centroids: Vec<Vec<f64>>,
    /// Cluster index of every observation
    pub assignments: Vec<usize>,
    /// Sum of squared distances to the assigned centroid
    pub inertia: f64,
}

impl ClusterSeeds {
    /// Number of observations assigned to each cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.len()];
        for &a in &self.assignments {
            sizes[a] += 1;
        }
        sizes
    }
}

/// Source of seed means for a K-state model.
pub trait ClusterInitializer: Send + Sync + std::fmt::Debug {
    /// Partition `x` into `k` clusters.
    fn initialize(
        &self,
        x: &ObservationMatrix,
        k: usize,
        rng: &mut SecureRng,
    ) -> RegimeResult<ClusterSeeds>;
}

/// K-means with k-means++ seeding.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansInitializer {
    /// Independent restarts; the lowest-inertia run wins
    pub n_init: usize,
    /// Lloyd iteration cap per restart
    pub max_iterations: usize,
    /// Stop when no centroid moves more than this
    pub tolerance: f64,
}

impl Default for KMeansInitializer {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_iterations: 300,
            tolerance: 1e-6,
        }
    }
}

impl ClusterInitializer for KMeansInitializer {
    fn initialize(
        &self,
        x: &ObservationMatrix,
        k: usize,
        rng: &mut SecureRng,
    ) -> RegimeResult<ClusterSeeds> {
        if k == 0 {
            return Err(RegimeError::InvalidParameter {
                parameter: "k".to_string(),
                value: 0.0,
                constraint: "at least one cluster".to_string(),
            });
        }
        if x.num_rows() < k {
            return Err(RegimeError::InputShape {
                required: k,
                actual: x.num_rows(),
                states: k,
            });
        }

        // Restart streams are derived up front so the result does not depend
        // on how many draws each restart consumes.
        let base = rng.usize(0..usize::MAX) as u64;
        let mut best: Option<ClusterSeeds> = None;
        for restart in 0..self.n_init.max(1) {
            let mut restart_rng = SecureRng::with_seed(derive_seed(base, restart as u64));
            let seeds = self.lloyd(x, k, &mut restart_rng);
            if best.as_ref().map_or(true, |b| seeds.inertia < b.inertia) {
                best = Some(seeds);
            }
        }

        best.ok_or_else(|| RegimeError::NumericalError {
            reason: "k-means produced no clustering".to_string(),
            operation: Some("cluster initialization".to_string()),
        })
    }
}

impl KMeansInitializer {
    fn lloyd(&self, x: &ObservationMatrix, k: usize, rng: &mut SecureRng) -> ClusterSeeds {
        let d = x.num_cols();
        let mut centroids = initialize_centroids_plus_plus(x, k, rng);
        let mut assignments = assign(x, &centroids);

        for _iteration in 0..self.max_iterations {
            let mut new_centroids = vec![vec![0.0; d]; k];
            let mut counts = vec![0usize; k];
            for (row, &cluster) in x.rows().zip(&assignments) {
                for (acc, v) in new_centroids[cluster].iter_mut().zip(row) {
                    *acc += v;
                }
                counts[cluster] += 1;
            }

            let mut max_change = 0.0f64;
            for i in 0..k {
                if counts[i] > 0 {
                    let inv = 1.0 / counts[i] as f64;
                    new_centroids[i].iter_mut().for_each(|v| *v *= inv);
                    let change = squared_distance(&new_centroids[i], &centroids[i]).sqrt();
                    max_change = max_change.max(change);
                } else {
                    // empty cluster keeps its centroid
                    new_centroids[i] = centroids[i].clone();
                }
            }

            centroids = new_centroids;
            assignments = assign(x, &centroids);

            if max_change < self.tolerance {
                break;
            }
        }

        let inertia = x
            .rows()
            .zip(&assignments)
            .map(|(row, &c)| squared_distance(row, &centroids[c]))
            .sum();

        ClusterSeeds {
            centroids,
            assignments,
            inertia,
        }
    }
}

fn assign(x: &ObservationMatrix, centroids: &[Vec<f64>]) -> Vec<usize> {
    x.rows()
        .map(|row| {
            let mut min_dist = f64::INFINITY;
            let mut best_cluster = 0;
            for (j, centroid) in centroids.iter().enumerate() {
                let dist = squared_distance(row, centroid);
                if dist < min_dist {
                    min_dist = dist;
                    best_cluster = j;
                }
            }
            best_cluster
        })
        .collect()
}

/// k-means++: each next centroid is drawn with probability proportional to
/// its squared distance from the nearest centroid chosen so far.
fn initialize_centroids_plus_plus(
    x: &ObservationMatrix,
    k: usize,
    rng: &mut SecureRng,
) -> Vec<Vec<f64>> {
    let n = x.num_rows();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(x.row(rng.usize(0..n)).to_vec());

    let mut distances: Vec<f64> = x
        .rows()
        .map(|row| squared_distance(row, &centroids[0]))
        .collect();

    for _ in 1..k {
        let total_dist: f64 = distances.iter().sum();
        let chosen_idx = if total_dist > 0.0 {
            let target = rng.f64() * total_dist;
            let mut cumulative = 0.0;
            let mut chosen = n - 1;
            for (i, &dist) in distances.iter().enumerate() {
                cumulative += dist;
                if dist > 0.0 && cumulative >= target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.usize(0..n)
        };

        let centroid = x.row(chosen_idx).to_vec();
        for (dist, row) in distances.iter_mut().zip(x.rows()) {
            *dist = dist.min(squared_distance(row, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Mean silhouette coefficient of a labelling.
///
/// Returns `None` when fewer than two distinct labels are present or every
/// observation is its own cluster. Singleton clusters contribute zero.
pub fn silhouette_score(x: &ObservationMatrix, labels: &[usize]) -> Option<f64> {
    let n = x.num_rows();
    if n != labels.len() || n < 2 {
        return None;
    }
    let num_labels = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; num_labels];
    for &l in labels {
        sizes[l] += 1;
    }
    let occupied = sizes.iter().filter(|&&s| s > 0).count();
    if occupied < 2 || occupied >= n {
        return None;
    }

    let mut total = 0.0;
    let mut sums = vec![0.0; num_labels];
    for i in 0..n {
        sums.iter_mut().for_each(|s| *s = 0.0);
        let row_i = x.row(i);
        for j in 0..n {
            if i != j {
                sums[labels[j]] += squared_distance(row_i, x.row(j)).sqrt();
            }
        }

        let own = labels[i];
        if sizes[own] <= 1 {
            continue;
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..num_labels)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    Some(total / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn two_blobs() -> ObservationMatrix {
        let mut rows = Vec::new();
        for i in 0..10 {
            let jitter = i as f64 * 0.01;
            rows.push(vec![-5.0 + jitter, -5.0 - jitter]);
            rows.push(vec![5.0 - jitter, 5.0 + jitter]);
        }
        ObservationMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let x = two_blobs();
        let mut rng = SecureRng::with_seed(7);
        let seeds = KMeansInitializer::default()
            .initialize(&x, 2, &mut rng)
            .unwrap();

        assert_eq!(seeds.cluster_sizes(), vec![10, 10]);
        for pair in seeds.assignments.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
        let mut firsts: Vec<f64> = seeds.centroids.iter().map(|c| c[0]).collect();
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(firsts[0] < -4.0 && firsts[1] > 4.0);
    }

    #[test]
    fn test_kmeans_is_reproducible_with_seed() {
        let x = two_blobs();
        let init = KMeansInitializer::default();
        let a = init.initialize(&x, 3, &mut SecureRng::with_seed(11)).unwrap();
        let b = init.initialize(&x, 3, &mut SecureRng::with_seed(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmeans_rejects_too_many_clusters() {
        let x = ObservationMatrix::from_rows(vec![vec![1.0], vec![2.0]]).unwrap();
        let result = KMeansInitializer::default().initialize(&x, 3, &mut SecureRng::with_seed(1));
        assert!(matches!(result, Err(RegimeError::InputShape { .. })));
    }

    #[test]
    fn test_kmeans_handles_identical_points() {
        let x = ObservationMatrix::from_rows(vec![vec![1.0]; 6]).unwrap();
        let seeds = KMeansInitializer::default()
            .initialize(&x, 2, &mut SecureRng::with_seed(3))
            .unwrap();
        assert_eq!(seeds.assignments.len(), 6);
        assert_approx_eq!(seeds.inertia, 0.0, 1e-12);
    }

    #[test]
    fn test_silhouette_well_separated_is_near_one() {
        let x = two_blobs();
        let labels: Vec<usize> = (0..20).map(|i| i % 2).collect();
        let score = silhouette_score(&x, &labels).unwrap();
        assert!(score > 0.95, "score = {}", score);

        let scrambled: Vec<usize> = (0..20).map(|i| (i / 2) % 2).collect();
        assert!(silhouette_score(&x, &scrambled).unwrap() < 0.1);
    }

    #[test]
    fn test_silhouette_undefined_for_single_cluster() {
        let x = two_blobs();
        assert!(silhouette_score(&x, &vec![0; 20]).is_none());
    }
}
