//! Isolation forest anomaly detector.
//!
//! Scores follow the usual convention: `score_samples` is the negated anomaly
//! score in `[-1, 0]`, and the decision score subtracts the contamination
//! percentile of the training scores, so negative means anomalous.
use anyhow::{ensure, Result};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::features::FEATURE_DIM;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub trees: usize,
    pub sample_size: usize,
    /// Expected fraction of outliers in the training data
    pub contamination: f64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            contamination: 0.1,
        }
    }
}

/// Average path length of an unsuccessful BST search among `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow<R: Rng>(
        rows: &[[f32; FEATURE_DIM]],
        sample: Vec<usize>,
        max_depth: usize,
        rng: &mut R,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.split(rows, sample, 0, max_depth, rng);
        tree
    }

    fn split<R: Rng>(
        &mut self,
        rows: &[[f32; FEATURE_DIM]],
        sample: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: sample.len() });

        if depth >= max_depth || sample.len() <= 1 {
            return id;
        }

        // Only features that still vary inside this node can isolate anything.
        let spans: Vec<(usize, f32, f32)> = (0..FEATURE_DIM)
            .filter_map(|f| {
                let (lo, hi) = sample
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &i| {
                        (lo.min(rows[i][f]), hi.max(rows[i][f]))
                    });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if spans.is_empty() {
            return id;
        }

        let (feature, lo, hi) = spans[rng.gen_range(0..spans.len())];
        let threshold = rng.gen_range(lo..hi);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            sample.into_iter().partition(|&i| rows[i][feature] < threshold);

        let left = self.split(rows, left_rows, depth + 1, max_depth, rng);
        let right = self.split(rows, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, row: &[f32; FEATURE_DIM]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[idx] {
                Node::Leaf { size } => return depth + average_path_length(size),
                Node::Split { feature, threshold, left, right } => {
                    idx = if row[feature] < threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForest {
    pub fn fit<R: Rng>(
        rows: &[[f32; FEATURE_DIM]],
        config: &ForestConfig,
        rng: &mut R,
    ) -> Result<Self> {
        ensure!(!rows.is_empty(), "no training rows");
        ensure!(config.trees > 0, "forest needs at least one tree");
        ensure!(
            config.contamination > 0.0 && config.contamination <= 0.5,
            "contamination must be in (0, 0.5], got {}",
            config.contamination
        );

        let sample_size = config.sample_size.clamp(1, rows.len());
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..config.trees)
            .map(|_| {
                let sample = index::sample(rng, rows.len(), sample_size).into_vec();
                IsolationTree::grow(rows, sample, max_depth, rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };

        let mut training_scores: Vec<f64> = rows.iter().map(|r| forest.score_samples(r)).collect();
        forest.offset = percentile(&mut training_scores, config.contamination * 100.0);
        Ok(forest)
    }

    /// Negated anomaly score: close to -1 for outliers, around -0.5 for inliers.
    pub fn score_samples(&self, row: &[f32; FEATURE_DIM]) -> f64 {
        let mean_depth =
            self.trees.iter().map(|t| t.path_length(row)).sum::<f64>() / self.trees.len() as f64;
        -(2f64).powf(-mean_depth / average_path_length(self.sample_size).max(f64::EPSILON))
    }

    /// Shifted score; negative values are anomalies.
    pub fn decision_function(&self, row: &[f32; FEATURE_DIM]) -> f64 {
        self.score_samples(row) - self.offset
    }

    pub fn is_anomaly(&self, row: &[f32; FEATURE_DIM]) -> bool {
        self.decision_function(row) < 0.0
    }
}

/// Linear-interpolated percentile, `q` in [0, 100].
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let rank = (q / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}
