//! Gradient-boosted regression trees with a multi-class softmax objective.
//!
//! Each round fits one tree per class on the softmax gradients, using
//! second-order leaf weights `-G / (H + lambda)`. Training uses every row and
//! every feature, so a fitted model is fully determined by its data.
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::FEATURE_DIM;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub rounds: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// L2 penalty on leaf weights
    pub lambda: f64,
    /// Minimum hessian sum on each side of a split
    pub min_child_weight: f64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            rounds: 40,
            max_depth: 3,
            learning_rate: 0.3,
            lambda: 1.0,
            min_child_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn value(&self, row: &[f32; FEATURE_DIM]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf(v) => return v,
                Node::Split { feature, threshold, left, right } => {
                    idx = if row[feature] < threshold { left } else { right };
                }
            }
        }
    }
}

struct TreeBuilder<'a> {
    rows: &'a [[f32; FEATURE_DIM]],
    grad: &'a [f64],
    hess: &'a [f64],
    config: &'a BoostConfig,
    nodes: Vec<Node>,
}

struct BestSplit {
    gain: f64,
    feature: usize,
    threshold: f32,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, indices: Vec<usize>) -> RegressionTree {
        self.grow(indices, 0);
        RegressionTree { nodes: self.nodes }
    }

    fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.config.lambda)
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.config.lambda)
    }

    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let g: f64 = indices.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = indices.iter().map(|&i| self.hess[i]).sum();
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf(self.leaf_weight(g, h)));

        if depth >= self.config.max_depth || indices.len() < 2 {
            return id;
        }

        let Some(best) = self.best_split(&indices, g, h) else {
            return id;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][best.feature] < best.threshold);

        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[id] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        id
    }

    fn best_split(&self, indices: &[usize], g: f64, h: f64) -> Option<BestSplit> {
        let parent = self.score(g, h);
        let mut best: Option<BestSplit> = None;
        let mut order = indices.to_vec();

        for feature in 0..FEATURE_DIM {
            order.sort_by(|&a, &b| self.rows[a][feature].total_cmp(&self.rows[b][feature]));

            let (mut gl, mut hl) = (0.0, 0.0);
            for w in 0..order.len() - 1 {
                let i = order[w];
                gl += self.grad[i];
                hl += self.hess[i];

                let here = self.rows[i][feature];
                let next = self.rows[order[w + 1]][feature];
                if here == next {
                    continue;
                }
                let (gr, hr) = (g - gl, h - hl);
                if hl < self.config.min_child_weight || hr < self.config.min_child_weight {
                    continue;
                }

                let gain = 0.5 * (self.score(gl, hl) + self.score(gr, hr) - parent);
                if gain > best.as_ref().map_or(0.0, |b| b.gain) {
                    best = Some(BestSplit {
                        gain,
                        feature,
                        threshold: here + (next - here) / 2.0,
                    });
                }
            }
        }
        best
    }
}

/// Boosted tree ensemble, `trees[round][class]`.
#[derive(Debug, Clone)]
pub struct GradientBoostedTrees {
    trees: Vec<Vec<RegressionTree>>,
    learning_rate: f64,
    num_classes: usize,
}

impl GradientBoostedTrees {
    pub fn fit(
        rows: &[[f32; FEATURE_DIM]],
        labels: &[u8],
        num_classes: usize,
        config: &BoostConfig,
    ) -> Result<Self> {
        ensure!(!rows.is_empty(), "no training rows");
        ensure!(rows.len() == labels.len(), "rows and labels differ in length");
        ensure!(num_classes >= 2, "need at least two classes");

        let n = rows.len();
        let mut margins = vec![vec![0.0f64; num_classes]; n];
        let mut trees = Vec::with_capacity(config.rounds);
        let all: Vec<usize> = (0..n).collect();

        for round in 0..config.rounds {
            let probs: Vec<Vec<f64>> = margins.iter().map(|m| softmax(m)).collect();
            let mut round_trees = Vec::with_capacity(num_classes);

            for class in 0..num_classes {
                let grad: Vec<f64> = (0..n)
                    .map(|i| probs[i][class] - if labels[i] as usize == class { 1.0 } else { 0.0 })
                    .collect();
                let hess: Vec<f64> = (0..n)
                    .map(|i| (probs[i][class] * (1.0 - probs[i][class])).max(1e-6))
                    .collect();

                let tree = TreeBuilder {
                    rows,
                    grad: &grad,
                    hess: &hess,
                    config,
                    nodes: Vec::new(),
                }
                .build(all.clone());
                round_trees.push(tree);
            }

            for (row, margin) in rows.iter().zip(margins.iter_mut()) {
                for (m, tree) in margin.iter_mut().zip(&round_trees) {
                    *m += config.learning_rate * tree.value(row);
                }
            }
            trees.push(round_trees);

            if round % 10 == 0 {
                debug!("boosting round {} done", round);
            }
        }

        Ok(Self {
            trees,
            learning_rate: config.learning_rate,
            num_classes,
        })
    }

    /// Summed raw scores per class.
    pub fn margins(&self, row: &[f32; FEATURE_DIM]) -> Vec<f64> {
        let mut margins = vec![0.0; self.num_classes];
        for round in &self.trees {
            for (m, tree) in margins.iter_mut().zip(round) {
                *m += self.learning_rate * tree.value(row);
            }
        }
        margins
    }

    pub fn predict(&self, row: &[f32; FEATURE_DIM]) -> u8 {
        let margins = self.margins(row);
        let mut best = 0;
        for (i, &m) in margins.iter().enumerate() {
            if m > margins[best] {
                best = i;
            }
        }
        best as u8
    }
}

fn softmax(margins: &[f64]) -> Vec<f64> {
    let max = margins.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = margins.iter().map(|m| (m - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
