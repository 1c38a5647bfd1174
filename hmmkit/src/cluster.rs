//! Clustering used to seed emission means before training.
//!
//! The model only relies on the [`Clusterer`] contract, `(points, k) ->
//! (centroids, labels)`. [`KMeans`] is the stock implementation: k-means++
//! seeding followed by Lloyd iterations.

use hmmkit_core::{HmmError, Result, Summarizable};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Result of clustering a set of points.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Cluster centres, shape `(k, dim)`.
    pub centroids: Array2<f64>,
    /// Cluster index for each input point.
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
    /// Number of iterations run.
    pub n_iter: usize,
}

impl Summarizable for Clustering {
    fn summary(&self) -> String {
        format!(
            "KMeans: k={}, inertia={:.4}, iterations={}",
            self.centroids.nrows(),
            self.inertia,
            self.n_iter,
        )
    }
}

/// Anything that can partition points (one per row) into `k` clusters.
pub trait Clusterer {
    /// Cluster the rows of `points` into `k` groups.
    fn cluster(&self, points: ArrayView2<'_, f64>, k: usize) -> Result<Clustering>;
}

// ---------------------------------------------------------------------------
// K-Means
// ---------------------------------------------------------------------------

/// Configuration for k-means clustering.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KMeansConfig {
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iter: 300,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// K-means clustering with k-means++ initialisation.
#[derive(Debug, Clone, Default)]
pub struct KMeans {
    pub config: KMeansConfig,
}

impl KMeans {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }
}

impl Clusterer for KMeans {
    fn cluster(&self, points: ArrayView2<'_, f64>, k: usize) -> Result<Clustering> {
        kmeans(points, k, &self.config)
    }
}

/// Run k-means on the rows of `data`.
///
/// # Errors
///
/// Returns an error if `data` is empty or zero-dimensional, if `k` is zero,
/// or if `k` exceeds the number of points.
pub fn kmeans(data: ArrayView2<'_, f64>, k: usize, config: &KMeansConfig) -> Result<Clustering> {
    let (n, dim) = data.dim();

    if n == 0 {
        return Err(HmmError::InvalidInput("empty data".into()));
    }
    if dim == 0 {
        return Err(HmmError::InvalidInput("zero-dimensional data".into()));
    }
    if k == 0 {
        return Err(HmmError::InvalidInput("n_clusters must be > 0".into()));
    }
    if k > n {
        return Err(HmmError::InvalidInput(format!(
            "n_clusters ({k}) > n_samples ({n})"
        )));
    }

    // k-means++ init
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut centroids = Array2::<f64>::zeros((k, dim));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    for c in 1..k {
        let dists: Vec<f64> = data
            .rows()
            .into_iter()
            .map(|p| {
                (0..c)
                    .map(|prev| sq_euclidean(p, centroids.row(prev)))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = dists.iter().sum();
        let chosen = if total == 0.0 {
            // All points coincide with existing centroids
            c % n
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = n - 1;
            for (i, &d) in dists.iter().enumerate() {
                cumulative += d;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.row_mut(c).assign(&data.row(chosen));
    }

    // Lloyd's iterations
    let mut labels = vec![0usize; n];
    let mut n_iter = 0;

    for _ in 0..config.max_iter {
        n_iter += 1;

        for (i, p) in data.rows().into_iter().enumerate() {
            labels[i] = nearest(p, centroids.view());
        }

        let mut new_centroids = Array2::<f64>::zeros((k, dim));
        let mut counts = vec![0usize; k];
        for (i, p) in data.rows().into_iter().enumerate() {
            counts[labels[i]] += 1;
            let mut row = new_centroids.row_mut(labels[i]);
            row += &p;
        }
        for c in 0..k {
            if counts[c] > 0 {
                let cnt = counts[c] as f64;
                new_centroids.row_mut(c).mapv_inplace(|v| v / cnt);
            } else {
                // Empty cluster: keep old centroid
                new_centroids.row_mut(c).assign(&centroids.row(c));
            }
        }

        let max_shift = (0..k)
            .map(|c| sq_euclidean(centroids.row(c), new_centroids.row(c)).sqrt())
            .fold(0.0_f64, f64::max);

        centroids = new_centroids;

        if max_shift < config.tolerance {
            break;
        }
    }

    for (i, p) in data.rows().into_iter().enumerate() {
        labels[i] = nearest(p, centroids.view());
    }
    let inertia = data
        .rows()
        .into_iter()
        .zip(&labels)
        .map(|(p, &c)| sq_euclidean(p, centroids.row(c)))
        .sum();

    Ok(Clustering {
        centroids,
        labels,
        inertia,
        n_iter,
    })
}

fn nearest(p: ArrayView1<'_, f64>, centroids: ArrayView2<'_, f64>) -> usize {
    let mut best_dist = f64::INFINITY;
    let mut best_c = 0;
    for (c, cent) in centroids.rows().into_iter().enumerate() {
        let d = sq_euclidean(p, cent);
        if d < best_dist {
            best_dist = d;
            best_c = c;
        }
    }
    best_c
}

fn sq_euclidean(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn kmeans_two_clusters() {
        let data = arr2(&[
            [0.0, 0.0],
            [0.1, 0.1],
            [0.2, 0.0],
            [10.0, 10.0],
            [10.1, 10.1],
            [10.2, 10.0],
        ]);
        let result = KMeans::default().cluster(data.view(), 2).unwrap();
        assert_eq!(result.labels.len(), 6);
        assert_eq!(result.labels[0], result.labels[1]);
        assert_eq!(result.labels[0], result.labels[2]);
        assert_eq!(result.labels[3], result.labels[4]);
        assert_eq!(result.labels[3], result.labels[5]);
        assert_ne!(result.labels[0], result.labels[3]);
        assert_eq!(result.centroids.dim(), (2, 2));
    }

    #[test]
    fn kmeans_single_cluster() {
        let data = arr2(&[[1.0, 2.0], [1.1, 2.1], [0.9, 1.9]]);
        let result = kmeans(data.view(), 1, &KMeansConfig::default()).unwrap();
        assert!(result.labels.iter().all(|&l| l == 0));
        assert!((result.centroids[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((result.centroids[[0, 1]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn kmeans_rejects_bad_arguments() {
        let data = arr2(&[[1.0], [2.0]]);
        let config = KMeansConfig::default();
        assert!(kmeans(data.view(), 3, &config).is_err());
        assert!(kmeans(data.view(), 0, &config).is_err());
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(kmeans(empty.view(), 1, &config).is_err());
    }

    #[test]
    fn kmeans_summary() {
        let data = arr2(&[[0.0], [1.0], [10.0], [11.0]]);
        let result = kmeans(data.view(), 2, &KMeansConfig::default()).unwrap();
        assert!(result.summary().contains("k=2"));
    }

    #[test]
    fn kmeans_convergence() {
        let data = arr2(&[[0.0], [100.0]]);
        let result = kmeans(data.view(), 2, &KMeansConfig::default()).unwrap();
        assert!(result.n_iter <= 5);
        assert!(result.inertia < 1e-12);
    }
}
