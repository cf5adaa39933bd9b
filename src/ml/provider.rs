//! Sources of labelled training vectors.
use anyhow::{anyhow, ensure, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Dirichlet, Distribution, Normal};

use crate::features::FEATURE_DIM;
use crate::protocols::Category;

/// Labelled rows in feature-vector order.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub features: Vec<[f32; FEATURE_DIM]>,
    pub labels: Vec<u8>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.is_empty(), "training set is empty");
        ensure!(
            self.features.len() == self.labels.len(),
            "training set has {} rows but {} labels",
            self.features.len(),
            self.labels.len()
        );
        if let Some(bad) = self.labels.iter().find(|&&l| l as usize >= Category::COUNT) {
            anyhow::bail!("training label {} is outside the category range", bad);
        }
        if self.features.iter().flatten().any(|v| !v.is_finite()) {
            anyhow::bail!("training set contains non-finite values");
        }
        Ok(())
    }
}

/// Supplies the data the ensemble trains on.
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, samples: usize) -> Result<TrainingSet>;
}

/// Manufactures vectors whose dominant category ratio matches the label.
///
/// Ratios come from a sparse Dirichlet draw with the label's component boosted
/// by [`SyntheticProvider::LABEL_BOOST`] and renormalised, so the ratios alone
/// predict the label almost perfectly.
#[derive(Debug, Clone, Default)]
pub struct SyntheticProvider {
    seed: Option<u64>,
}

impl SyntheticProvider {
    pub const LABEL_BOOST: f64 = 5.0;
    pub const CONCENTRATION: f64 = 0.1;

    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

impl DataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn generate(&self, samples: usize) -> Result<TrainingSet> {
        let mut rng = self.rng();
        let avg = Normal::new(800.0, 200.0).map_err(|e| anyhow!("avg size prior: {:?}", e))?;
        let std = Normal::new(100.0, 20.0).map_err(|e| anyhow!("std size prior: {:?}", e))?;
        let prior = Dirichlet::new(&[Self::CONCENTRATION; Category::COUNT])
            .map_err(|e| anyhow!("ratio prior: {:?}", e))?;

        let mut set = TrainingSet {
            features: Vec::with_capacity(samples),
            labels: Vec::with_capacity(samples),
        };

        for _ in 0..samples {
            let label = rng.gen_range(0..Category::COUNT);

            let mut ratios: Vec<f64> = prior.sample(&mut rng);
            if ratios.iter().any(|r| !r.is_finite()) {
                ratios = vec![0.0; Category::COUNT];
            }
            ratios[label] += Self::LABEL_BOOST;
            let total: f64 = ratios.iter().sum();

            let mut row = [0f32; FEATURE_DIM];
            row[0] = avg.sample(&mut rng) as f32;
            row[1] = std.sample(&mut rng) as f32;
            row[2] = 64.0;
            row[3] = 1500.0;
            row[4] = rng.gen_range(100..5000) as f32;
            for (slot, r) in row[5..].iter_mut().zip(&ratios) {
                *slot = (r / total) as f32;
            }

            set.features.push(row);
            set.labels.push(label as u8);
        }

        Ok(set)
    }
}
