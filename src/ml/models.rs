use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    conv1d, linear, loss, ops, AdamW, Conv1d, Conv1dConfig, Linear, Module, Optimizer,
    ParamsAdamW, VarBuilder, VarMap,
};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::features::FEATURE_DIM;

const CONV_CHANNELS: usize = 16;
const POOL: usize = 2;
const HIDDEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralConfig {
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.01,
        }
    }
}

/// Per-feature (mean, std) fitted on the training set.
#[derive(Debug, Clone)]
pub struct Standardizer {
    mean: [f32; FEATURE_DIM],
    std: [f32; FEATURE_DIM],
}

impl Standardizer {
    pub fn fit(rows: &[[f32; FEATURE_DIM]]) -> Self {
        let n = rows.len().max(1) as f32;
        let mut mean = [0f32; FEATURE_DIM];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut std = [0f32; FEATURE_DIM];
        for row in rows {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        // Constant columns (min/max size in synthetic data) pass through centred.
        for s in std.iter_mut() {
            *s = if *s > f32::EPSILON { s.sqrt() } else { 1.0 };
        }
        Self { mean, std }
    }

    pub fn transform(&self, row: &[f32; FEATURE_DIM]) -> [f32; FEATURE_DIM] {
        let mut out = [0f32; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            out[i] = (row[i] - self.mean[i]) / self.std[i];
        }
        out
    }

    fn to_tensor(
        &self,
        rows: &[[f32; FEATURE_DIM]],
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let flat: Vec<f32> = rows.iter().flat_map(|r| self.transform(r)).collect();
        Tensor::from_vec(flat, (rows.len(), FEATURE_DIM), device)
    }
}

/// Small 1-D convolutional classifier over the feature vector.
///
/// conv(1→16, k=3) → relu → maxpool(2) → linear(80→32) → relu → linear(32→classes)
#[derive(Clone)]
pub struct SequenceClassifier {
    conv: Conv1d,
    hidden: Linear,
    output: Linear,
    scaler: Standardizer,
    device: Device,
}

impl SequenceClassifier {
    pub fn new(vs: VarBuilder, scaler: Standardizer, num_classes: usize) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv1d(1, CONV_CHANNELS, 3, cfg, vs.pp("conv1"))?;
        let hidden = linear(CONV_CHANNELS * (FEATURE_DIM / POOL), HIDDEN, vs.pp("fc1"))?;
        let output = linear(HIDDEN, num_classes, vs.pp("fc2"))?;
        Ok(Self {
            conv,
            hidden,
            output,
            scaler,
            device: vs.device().clone(),
        })
    }

    /// Fit on labelled rows with full-batch Adam and cross-entropy.
    /// Initial weights are drawn from `rng`, so a seeded rng gives a
    /// reproducible model. Returns the model and the final training loss.
    pub fn train<R: Rng + ?Sized>(
        rows: &[[f32; FEATURE_DIM]],
        labels: &[u8],
        num_classes: usize,
        config: &NeuralConfig,
        device: &Device,
        rng: &mut R,
    ) -> Result<(Self, f32)> {
        ensure!(!rows.is_empty(), "no training rows");
        ensure!(rows.len() == labels.len(), "rows and labels differ in length");

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(vb, Standardizer::fit(rows), num_classes)?;
        reinitialize(&varmap, device, rng)?;

        let xs = model.scaler.to_tensor(rows, device)?;
        let targets: Vec<u32> = labels.iter().map(|&l| l as u32).collect();
        let ys = Tensor::from_vec(targets, rows.len(), device)?;

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

        let mut last_loss = f32::NAN;
        for epoch in 0..config.epochs {
            let logits = model.forward(&xs)?;
            let loss = loss::cross_entropy(&logits, &ys)?;
            optimizer.backward_step(&loss)?;
            last_loss = loss.to_scalar::<f32>()?;
            if epoch % 10 == 0 {
                debug!("cnn epoch {} loss {:.4}", epoch, last_loss);
            }
        }
        ensure!(
            last_loss.is_finite() || config.epochs == 0,
            "cnn training diverged (loss {})",
            last_loss
        );

        Ok((model, last_loss))
    }

    /// Raw logits for already standardized input of shape (batch, FEATURE_DIM).
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, _) = xs.dims2()?;
        let xs = xs.unsqueeze(1)?;
        let xs = self.conv.forward(&xs)?.relu()?;
        let xs = xs
            .reshape((batch, CONV_CHANNELS, FEATURE_DIM / POOL, POOL))?
            .max(D::Minus1)?;
        let xs = xs.flatten_from(1)?;
        let xs = self.hidden.forward(&xs)?.relu()?;
        self.output.forward(&xs)
    }

    /// Class probabilities per row.
    pub fn probabilities(&self, rows: &[[f32; FEATURE_DIM]]) -> Result<Vec<Vec<f32>>> {
        let xs = self.scaler.to_tensor(rows, &self.device)?;
        let logits = self.forward(&xs)?;
        Ok(ops::softmax(&logits, 1)?.to_vec2::<f32>()?)
    }

    /// Arg-max class and its probability.
    pub fn predict(&self, row: &[f32; FEATURE_DIM]) -> Result<(u8, f32)> {
        let probs = self.probabilities(std::slice::from_ref(row))?;
        Ok(arg_max(&probs[0]))
    }
}

/// Overwrite every variable with values drawn from `rng`.
///
/// Same scheme candle uses by default: weights are Kaiming normal over the
/// fan-in, biases uniform in ±1/sqrt(fan-in) of their layer's weight.
fn reinitialize<R: Rng + ?Sized>(varmap: &VarMap, device: &Device, rng: &mut R) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("cnn variable map lock poisoned"))?;

    let fan_in: HashMap<&str, usize> = vars
        .iter()
        .filter_map(|(name, var)| {
            let layer = name.strip_suffix(".weight")?;
            Some((layer, var.dims().iter().skip(1).product::<usize>().max(1)))
        })
        .collect();

    // HashMap order is random; draw in name order to keep the stream stable.
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        let var = &vars[name];
        let (layer, is_bias) = match name.strip_suffix(".bias") {
            Some(layer) => (layer, true),
            None => (name.strip_suffix(".weight").unwrap_or(name), false),
        };
        let fan_in = fan_in.get(layer).copied().unwrap_or(1) as f32;
        let count = var.elem_count();

        let values: Vec<f32> = if is_bias {
            let bound = 1.0 / fan_in.sqrt();
            let dist = Uniform::new_inclusive(-bound, bound);
            (0..count).map(|_| dist.sample(&mut *rng)).collect()
        } else {
            let dist = Normal::new(0.0f32, (2.0 / fan_in).sqrt())
                .map_err(|e| anyhow!("invalid init distribution for {}: {}", name, e))?;
            (0..count).map(|_| dist.sample(&mut *rng)).collect()
        };
        var.set(&Tensor::from_vec(values, var.dims().to_vec(), device)?)?;
    }
    Ok(())
}

pub(crate) fn arg_max(probs: &[f32]) -> (u8, f32) {
    probs
        .iter()
        .enumerate()
        .fold((0u8, f32::NEG_INFINITY), |best, (i, &p)| {
            if p > best.1 {
                (i as u8, p)
            } else {
                best
            }
        })
}
