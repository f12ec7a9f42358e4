//! Local outlier factor in novelty mode.
//!
//! The detector is fit on training embeddings and scores other embeddings
//! against that fixed neighbourhood. Fit points are never scored against
//! themselves; a query's neighbours are always fit points.

use std::fmt;

use anyhow::Result;
use log::info;
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{Contamination, NoveltyConfig};
use crate::errors::PipelineError;

/// Score offset used when contamination is `auto`.
pub const AUTO_OFFSET: f64 = -1.5;
const LRD_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NoveltyFlag {
    Normal,
    Abnormal,
}

impl fmt::Display for NoveltyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoveltyFlag::Normal => write!(f, "normal"),
            NoveltyFlag::Abnormal => write!(f, "abnormal"),
        }
    }
}

fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// The `k` nearest fit points to `query`, nearest first, skipping `exclude`.
fn nearest(
    fit: &Array2<f32>,
    query: ArrayView1<f32>,
    k: usize,
    exclude: Option<usize>,
) -> Vec<(usize, f64)> {
    let mut best: Vec<(usize, f64)> = Vec::with_capacity(k + 1);
    for (index, row) in fit.axis_iter(Axis(0)).enumerate() {
        if Some(index) == exclude {
            continue;
        }
        let distance = euclidean(query, row);
        if best.len() == k && distance >= best[k - 1].1 {
            continue;
        }
        let at = best.partition_point(|&(_, d)| d <= distance);
        best.insert(at, (index, distance));
        best.truncate(k);
    }
    best
}

fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

#[derive(Debug, Clone)]
pub struct LocalOutlierFactor {
    config: NoveltyConfig,
}

impl LocalOutlierFactor {
    pub fn new(config: NoveltyConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, train: Array2<f32>) -> Result<FittedLof> {
        let n = train.nrows();
        if n < 2 {
            return Err(PipelineError::InsufficientTrainingData {
                needed: 2,
                found: n,
            }
            .into());
        }
        let k = self.config.n_neighbors.min(n - 1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads.max(1))
            .build()?;

        let neighbours: Vec<Vec<(usize, f64)>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|i| nearest(&train, train.row(i), k, Some(i)))
                .collect()
        });
        let k_distance: Vec<f64> = neighbours.iter().map(|nb| nb[k - 1].1).collect();
        let lrd: Vec<f64> = neighbours
            .iter()
            .map(|nb| local_reachability_density(nb, &k_distance))
            .collect();
        let training_scores: Vec<f64> = neighbours
            .iter()
            .zip(&lrd)
            .map(|(nb, &own)| outlier_score(nb, &lrd, own))
            .collect();

        let offset = match self.config.contamination {
            Contamination::Auto => AUTO_OFFSET,
            Contamination::Fraction(fraction) => percentile(&training_scores, 100.0 * fraction),
        };
        info!(
            "Fitted local outlier factor on {} embeddings (k={}, offset={:.3}, threads={})",
            n,
            k,
            offset,
            self.config.threads
        );

        Ok(FittedLof {
            train,
            k,
            k_distance,
            lrd,
            offset,
            training_scores,
            pool,
        })
    }
}

fn local_reachability_density(neighbours: &[(usize, f64)], k_distance: &[f64]) -> f64 {
    let reach: f64 = neighbours
        .iter()
        .map(|&(j, d)| d.max(k_distance[j]))
        .sum::<f64>()
        / neighbours.len() as f64;
    1.0 / (reach + LRD_EPSILON)
}

/// Negated local outlier factor; inliers sit near -1, outliers far below.
fn outlier_score(neighbours: &[(usize, f64)], lrd: &[f64], own_lrd: f64) -> f64 {
    let mean_lrd = neighbours.iter().map(|&(j, _)| lrd[j]).sum::<f64>() / neighbours.len() as f64;
    -(mean_lrd / own_lrd)
}

pub struct FittedLof {
    train: Array2<f32>,
    k: usize,
    k_distance: Vec<f64>,
    lrd: Vec<f64>,
    offset: f64,
    /// Scores of the fit points themselves.
    pub training_scores: Vec<f64>,
    pool: rayon::ThreadPool,
}

impl FittedLof {
    pub fn n_neighbors(&self) -> usize {
        self.k
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Negated local outlier factor of each query row.
    pub fn score_samples(&self, queries: &Array2<f32>) -> Result<Vec<f64>> {
        if queries.ncols() != self.train.ncols() {
            return Err(PipelineError::ShapeMismatch(format!(
                "detector was fit on {}-d embeddings but got {}-d",
                self.train.ncols(),
                queries.ncols()
            ))
            .into());
        }
        Ok(self.pool.install(|| {
            (0..queries.nrows())
                .into_par_iter()
                .map(|i| {
                    let nb = nearest(&self.train, queries.row(i), self.k, None);
                    let own = local_reachability_density(&nb, &self.k_distance);
                    outlier_score(&nb, &self.lrd, own)
                })
                .collect()
        }))
    }

    /// Score shifted by the offset; negative means outlier.
    pub fn decision_function(&self, queries: &Array2<f32>) -> Result<Vec<f64>> {
        Ok(self
            .score_samples(queries)?
            .into_iter()
            .map(|s| s - self.offset)
            .collect())
    }

    pub fn predict(&self, queries: &Array2<f32>) -> Result<Vec<NoveltyFlag>> {
        Ok(self
            .decision_function(queries)?
            .into_iter()
            .map(|d| {
                if d < 0.0 {
                    NoveltyFlag::Abnormal
                } else {
                    NoveltyFlag::Normal
                }
            })
            .collect())
    }
}
