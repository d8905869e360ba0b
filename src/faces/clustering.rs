use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Label given to faces that belong to no cluster.
pub const NOISE: i32 = -1;

/// Neighborhood radius in cosine distance.
pub const DEFAULT_EPS: f32 = 0.45;

/// Points (including the point itself) needed within `eps` to seed a cluster.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// Density-based (DBSCAN) grouping of face embeddings on cosine distance.
///
/// The clusterer is stateless. Label values only describe a partition:
/// faces sharing a label belong together, but the numbers themselves carry
/// no meaning across runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clusterer {
    pub eps: f32,
    pub min_samples: usize,
}

impl Default for Clusterer {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl Clusterer {
    pub fn new(eps: f32, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    /// One label per embedding, in input order. `NOISE` marks outliers.
    ///
    /// Builds the full pairwise distance matrix, so memory and time grow with
    /// the square of the face count.
    pub fn cluster(&self, embeddings: &[Vec<f32>]) -> Result<Vec<i32>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }

        let distances = cosine_distance_matrix(embeddings)?;
        let neighborhoods = self.neighborhoods(&distances);
        let labels = self.expand(&neighborhoods);

        let clusters = labels.iter().filter(|&&l| l != NOISE).max().map_or(0, |&l| l + 1);
        let noise = labels.iter().filter(|&&l| l == NOISE).count();
        tracing::debug!(faces = labels.len(), clusters, noise, "Clustering finished");

        Ok(labels)
    }

    /// Indices within `eps` of each point, the point itself included.
    fn neighborhoods(&self, distances: &Array2<f32>) -> Vec<Vec<usize>> {
        let eps = self.eps;
        (0..distances.nrows())
            .into_par_iter()
            .map(|i| {
                distances
                    .row(i)
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| **d <= eps)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect()
    }

    fn expand(&self, neighborhoods: &[Vec<usize>]) -> Vec<i32> {
        let is_core = |i: usize| neighborhoods[i].len() >= self.min_samples;
        let mut labels = vec![NOISE; neighborhoods.len()];
        let mut next_label = 0;

        for seed in 0..neighborhoods.len() {
            if labels[seed] != NOISE || !is_core(seed) {
                continue;
            }

            labels[seed] = next_label;
            let mut frontier = vec![seed];
            while let Some(point) = frontier.pop() {
                for &neighbor in &neighborhoods[point] {
                    if labels[neighbor] != NOISE {
                        continue;
                    }
                    labels[neighbor] = next_label;
                    // Border points join the cluster but do not extend it.
                    if is_core(neighbor) {
                        frontier.push(neighbor);
                    }
                }
            }
            next_label += 1;
        }

        labels
    }
}

/// `1 - E·Eᵗ` for (assumed unit-norm) embeddings, with an exact zero diagonal.
pub fn cosine_distance_matrix(embeddings: &[Vec<f32>]) -> Result<Array2<f32>> {
    let n = embeddings.len();
    let dim = embeddings.first().map_or(0, Vec::len);
    if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
        return Err(Error::DimensionMismatch {
            expected: dim,
            found: bad.len(),
        });
    }

    let matrix = Array2::from_shape_fn((n, dim), |(i, j)| embeddings[i][j]);
    let similarity = matrix.dot(&matrix.t());
    let mut distances = similarity.mapv(|s| 1.0 - s);
    distances.diag_mut().fill(0.0);
    Ok(distances)
}
