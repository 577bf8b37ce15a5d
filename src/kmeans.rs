//! Lloyd's k-means over f32 training vectors, used to place the IVF
//! partition centroids.

use num_traits::AsPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::distances::squared_l2;
use crate::matrix::ColMajorMatrix;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KmeansInit {
    Random,
    #[default]
    PlusPlus,
}

#[derive(Clone, Copy, Debug)]
pub struct KmeansParams {
    pub max_iter: usize,
    pub tol: f32,
    pub init: KmeansInit,
    /// Fixed seed for reproducible training; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for KmeansParams {
    fn default() -> Self {
        Self {
            max_iter: 10,
            tol: 1e-4,
            init: KmeansInit::PlusPlus,
            seed: None,
        }
    }
}

/// Index of the centroid closest to `vector`; equal distances keep the
/// smaller partition id.
#[must_use]
pub fn nearest_centroid<T: AsPrimitive<f32>>(
    vector: &[T],
    centroids: &ColMajorMatrix<f32>,
) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (p, centroid) in centroids.iter_cols().enumerate() {
        let dist = squared_l2(centroid, vector);
        if dist < best_dist {
            best = p;
            best_dist = dist;
        }
    }
    best
}

/// Trains `centroids_n` centroids on the sampled training vectors. With no
/// training data the centroids come back zero-filled, which still yields a
/// valid (single-effective-partition) layout.
#[must_use]
pub fn train(
    data: &ColMajorMatrix<f32>,
    centroids_n: usize,
    params: &KmeansParams,
) -> ColMajorMatrix<f32> {
    let d = data.nrows();
    let n = data.ncols();
    if n == 0 || centroids_n == 0 {
        return ColMajorMatrix::new(d, centroids_n);
    }
    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut centroids = match params.init {
        KmeansInit::Random => init_random(data, centroids_n, &mut rng),
        KmeansInit::PlusPlus => init_plus_plus(data, centroids_n, &mut rng),
    };

    for _ in 0..params.max_iter {
        let assign: Vec<usize> = (0..n)
            .into_par_iter()
            .map(|i| nearest_centroid(data.col(i), &centroids))
            .collect();

        let mut sums = vec![0f32; d * centroids_n];
        let mut counts = vec![0usize; centroids_n];
        for (i, &p) in assign.iter().enumerate() {
            counts[p] += 1;
            for (s, &v) in sums[p * d..(p + 1) * d].iter_mut().zip(data.col(i)) {
                *s += v;
            }
        }

        let mut next = ColMajorMatrix::<f32>::with_rows(d);
        let mut shift = 0f32;
        for p in 0..centroids_n {
            let col: Vec<f32> = if counts[p] == 0 {
                // A cluster that lost all members restarts on a random
                // training vector.
                data.col(rng.gen_range(0..n)).to_vec()
            } else {
                sums[p * d..(p + 1) * d]
                    .iter()
                    .map(|&s| s / counts[p] as f32)
                    .collect()
            };
            shift += squared_l2(centroids.col(p), &col);
            next.push_col(&col);
        }
        centroids = next;
        if shift / centroids_n as f32 <= params.tol {
            break;
        }
    }
    centroids
}

fn init_random(
    data: &ColMajorMatrix<f32>,
    centroids_n: usize,
    rng: &mut StdRng,
) -> ColMajorMatrix<f32> {
    let n = data.ncols();
    let mut centroids = ColMajorMatrix::with_rows(data.nrows());
    let picks = rand::seq::index::sample(rng, n, centroids_n.min(n));
    for i in picks {
        centroids.push_col(data.col(i));
    }
    // Fewer training vectors than centroids: cycle through the data so the
    // centroid count stays fixed; surplus clusters simply end up empty.
    let mut i = 0;
    while centroids.ncols() < centroids_n {
        centroids.push_col(data.col(i % n));
        i += 1;
    }
    centroids
}

fn init_plus_plus(
    data: &ColMajorMatrix<f32>,
    centroids_n: usize,
    rng: &mut StdRng,
) -> ColMajorMatrix<f32> {
    let n = data.ncols();
    let mut centroids = ColMajorMatrix::with_rows(data.nrows());
    let first = rng.gen_range(0..n);
    centroids.push_col(data.col(first));

    let mut dist2: Vec<f32> = (0..n)
        .map(|i| squared_l2(data.col(first), data.col(i)))
        .collect();
    while centroids.ncols() < centroids_n {
        let total: f32 = dist2.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.gen_range(0.0..total);
            let mut pick = n - 1;
            for (i, &w) in dist2.iter().enumerate() {
                if target < w {
                    pick = i;
                    break;
                }
                target -= w;
            }
            pick
        } else {
            // All mass collapsed onto chosen centroids; any vector works.
            rng.gen_range(0..n)
        };
        centroids.push_col(data.col(pick));
        let latest = centroids.ncols() - 1;
        for (i, d2) in dist2.iter_mut().enumerate() {
            *d2 = d2.min(squared_l2(centroids.col(latest), data.col(i)));
        }
    }
    centroids
}
