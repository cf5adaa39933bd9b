//! Three-model ensemble: a convolutional classifier, boosted trees and an
//! isolation forest, all reading the same feature vector.
pub mod boost;
pub mod isolation;
pub mod models;
pub mod provider;

use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, info};

use crate::features::FeatureVector;
use crate::protocols::Category;
use boost::{BoostConfig, GradientBoostedTrees};
use isolation::{ForestConfig, IsolationForest};
use models::{NeuralConfig, SequenceClassifier};
use provider::{DataProvider, SyntheticProvider};

/// Mixed into the seed so the models do not replay the provider's stream.
const FOREST_SEED_SALT: u64 = 0x1f0e_57a1_d00d_5eed;
const CNN_SEED_SALT: u64 = 0x0c22_7e1a_b0a7_5eed;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Rows requested from the data provider
    pub samples: usize,
    /// Fixes the synthetic data, CNN initialisation and forest sampling when set
    pub seed: Option<u64>,
    pub neural: NeuralConfig,
    pub boosting: BoostConfig,
    pub forest: ForestConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            samples: 1000,
            seed: None,
            neural: NeuralConfig::default(),
            boosting: BoostConfig::default(),
            forest: ForestConfig::default(),
        }
    }
}

impl EnsembleConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).context("Failed to open ensemble config file")?;
        let reader = BufReader::new(file);
        let config =
            serde_json::from_reader(reader).context("Failed to parse ensemble config JSON")?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NeuralPrediction {
    pub class_id: u8,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreePrediction {
    pub class_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnomalyPrediction {
    pub is_anomaly: bool,
    pub score: f64,
}

/// Outputs of all three models for one vector. No voting is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnsembleResult {
    pub cnn: NeuralPrediction,
    pub xgboost: TreePrediction,
    pub isolation_forest: AnomalyPrediction,
}

/// Summary of the one-time training pass, measured on the training rows.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub trained_at: DateTime<Utc>,
    pub provider: String,
    pub samples: usize,
    pub duration_secs: f64,
    pub cnn_final_loss: f32,
    pub cnn_accuracy: f64,
    pub xgboost_accuracy: f64,
    pub isolation_forest_anomaly_rate: f64,
}

struct TrainedModels {
    neural: SequenceClassifier,
    boosted: GradientBoostedTrees,
    forest: IsolationForest,
    report: TrainingReport,
}

/// Owns the ensemble and trains it on first use.
///
/// Training runs at most once per instance, even when several threads ask
/// for a prediction at the same time. Afterwards the models are read-only and
/// predictions take no lock.
pub struct Ensemble {
    config: EnsembleConfig,
    provider: Box<dyn DataProvider>,
    device: Device,
    models: OnceLock<Arc<TrainedModels>>,
    train_lock: Mutex<()>,
    training_runs: AtomicUsize,
}

impl Ensemble {
    pub fn new(config: EnsembleConfig) -> Self {
        let provider = SyntheticProvider::new(config.seed);
        Self::with_provider(config, Box::new(provider))
    }

    pub fn with_provider(config: EnsembleConfig, provider: Box<dyn DataProvider>) -> Self {
        Self {
            config,
            provider,
            device: Device::Cpu,
            models: OnceLock::new(),
            train_lock: Mutex::new(()),
            training_runs: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        self.models.get().is_some()
    }

    /// Number of training passes started on this instance.
    pub fn training_runs(&self) -> usize {
        self.training_runs.load(Ordering::SeqCst)
    }

    /// Train now if not trained yet. Returns the report of the single pass.
    pub fn train(&self) -> Result<TrainingReport> {
        Ok(self.trained()?.report.clone())
    }

    /// Score one vector with all three models, training first if needed.
    pub fn predict(&self, vector: &FeatureVector) -> Result<EnsembleResult> {
        let models = self.trained()?;
        let row = vector.to_array();

        let (class_id, confidence) = models.neural.predict(&row).context("CNN inference failed")?;
        let tree_class = models.boosted.predict(&row);
        let score = models.forest.decision_function(&row);

        let result = EnsembleResult {
            cnn: NeuralPrediction {
                class_id,
                confidence,
            },
            xgboost: TreePrediction {
                class_id: tree_class,
            },
            isolation_forest: AnomalyPrediction {
                is_anomaly: score < 0.0,
                score,
            },
        };
        debug!("Ensemble prediction: {:?}", result);
        Ok(result)
    }

    fn trained(&self) -> Result<Arc<TrainedModels>> {
        if let Some(models) = self.models.get() {
            return Ok(models.clone());
        }

        let _guard = self
            .train_lock
            .lock()
            .map_err(|_| anyhow!("training lock poisoned by an earlier panic"))?;

        // Another caller may have finished while we waited.
        if let Some(models) = self.models.get() {
            return Ok(models.clone());
        }

        self.training_runs.fetch_add(1, Ordering::SeqCst);
        let models = Arc::new(self.fit().context("Ensemble training failed")?);
        let _ = self.models.set(models.clone());
        Ok(models)
    }

    fn fit(&self) -> Result<TrainedModels> {
        let started = Instant::now();
        info!(
            "Training ensemble on {} samples from {} provider",
            self.config.samples,
            self.provider.name()
        );

        let data = self.provider.generate(self.config.samples)?;
        data.validate()?;
        let rows = &data.features;
        let labels = &data.labels;

        let mut cnn_rng = self.rng(CNN_SEED_SALT);
        let (neural, cnn_final_loss) = SequenceClassifier::train(
            rows,
            labels,
            Category::COUNT,
            &self.config.neural,
            &self.device,
            &mut cnn_rng,
        )
        .context("CNN training failed")?;
        info!("CNN trained, final loss {:.4}", cnn_final_loss);

        let boosted =
            GradientBoostedTrees::fit(rows, labels, Category::COUNT, &self.config.boosting)
                .context("Gradient boosting failed")?;
        info!("Boosted trees trained ({} rounds)", self.config.boosting.rounds);

        let mut rng = self.rng(FOREST_SEED_SALT);
        let forest = IsolationForest::fit(rows, &self.config.forest, &mut rng)
            .context("Isolation forest training failed")?;
        info!("Isolation forest trained ({} trees)", self.config.forest.trees);

        let n = rows.len() as f64;
        let probabilities = neural.probabilities(rows)?;
        let cnn_hits = probabilities
            .iter()
            .zip(labels)
            .filter(|(p, &l)| models::arg_max(p).0 == l)
            .count();
        let tree_hits = rows
            .iter()
            .zip(labels)
            .filter(|(r, &l)| boosted.predict(r) == l)
            .count();
        let flagged = rows.iter().filter(|r| forest.is_anomaly(r)).count();

        let report = TrainingReport {
            trained_at: Utc::now(),
            provider: self.provider.name().to_string(),
            samples: rows.len(),
            duration_secs: started.elapsed().as_secs_f64(),
            cnn_final_loss,
            cnn_accuracy: cnn_hits as f64 / n,
            xgboost_accuracy: tree_hits as f64 / n,
            isolation_forest_anomaly_rate: flagged as f64 / n,
        };
        info!(
            "Ensemble trained in {:.2}s: cnn {:.3}, xgboost {:.3}, anomaly rate {:.3}",
            report.duration_secs,
            report.cnn_accuracy,
            report.xgboost_accuracy,
            report.isolation_forest_anomaly_rate
        );

        Ok(TrainedModels {
            neural,
            boosted,
            forest,
            report,
        })
    }

    fn rng(&self, salt: u64) -> ChaCha8Rng {
        match self.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed ^ salt),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::provider::TrainingSet;
    use super::*;
    use crate::features::default_vector;

    /// Small but complete configuration so tests train quickly.
    pub fn quick_config() -> EnsembleConfig {
        EnsembleConfig {
            samples: 300,
            seed: Some(17),
            neural: NeuralConfig {
                epochs: 40,
                learning_rate: 0.01,
            },
            boosting: BoostConfig {
                rounds: 10,
                ..Default::default()
            },
            forest: ForestConfig {
                trees: 30,
                ..Default::default()
            },
        }
    }

    struct FailingProvider;

    impl DataProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn generate(&self, _samples: usize) -> Result<TrainingSet> {
            Ok(TrainingSet {
                features: vec![[f32::NAN; crate::features::FEATURE_DIM]],
                labels: vec![0],
            })
        }
    }

    #[test]
    fn trains_lazily_on_first_predict() {
        let ensemble = Ensemble::new(quick_config());
        assert!(!ensemble.is_trained());
        assert_eq!(ensemble.training_runs(), 0);

        let (vector, _) = default_vector();
        let result = ensemble.predict(&vector).unwrap();
        assert!(ensemble.is_trained());
        assert_eq!(ensemble.training_runs(), 1);

        assert!(result.cnn.class_id < 5);
        assert!((0.0..=1.0).contains(&result.cnn.confidence));
        assert!(result.xgboost.class_id < 5);
        assert!(result.isolation_forest.score.is_finite());
        assert_eq!(result.isolation_forest.is_anomaly, result.isolation_forest.score < 0.0);

        ensemble.predict(&vector).unwrap();
        ensemble.train().unwrap();
        assert_eq!(ensemble.training_runs(), 1);
    }

    #[test]
    fn predictions_are_repeatable() {
        let ensemble = Ensemble::new(quick_config());
        let (vector, _) = default_vector();
        let first = ensemble.predict(&vector).unwrap();
        for _ in 0..5 {
            assert_eq!(ensemble.predict(&vector).unwrap(), first);
        }
    }

    #[test]
    fn concurrent_first_calls_train_once() {
        let ensemble = Arc::new(Ensemble::new(quick_config()));
        let (vector, _) = default_vector();

        let results: Vec<EnsembleResult> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let ensemble = ensemble.clone();
                    s.spawn(move || ensemble.predict(&vector).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(ensemble.training_runs(), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn boosted_trees_follow_dominant_ratio() {
        let ensemble = Ensemble::new(quick_config());
        let report = ensemble.train().unwrap();
        assert_eq!(report.samples, 300);
        assert!(report.xgboost_accuracy > 0.95, "{:?}", report);

        for category in Category::ALL {
            let mut vector = FeatureVector {
                avg_size: 800.0,
                std_size: 100.0,
                min_size: 64.0,
                max_size: 1500.0,
                packet_count: 2000.0,
                ratios: [0.0; Category::COUNT],
            };
            vector.ratios[category.id() as usize] = 1.0;
            let result = ensemble.predict(&vector).unwrap();
            assert_eq!(result.xgboost.class_id, category.id());
        }
    }

    #[test]
    fn default_training_converges() {
        let config = EnsembleConfig {
            seed: Some(1),
            ..Default::default()
        };
        let ensemble = Ensemble::new(config);
        let report = ensemble.train().unwrap();
        assert_eq!(report.samples, 1000);
        assert!(report.cnn_accuracy > 0.95, "{:?}", report);
        assert!(report.xgboost_accuracy > 0.95, "{:?}", report);
        assert!((report.isolation_forest_anomaly_rate - 0.1).abs() < 0.02, "{:?}", report);

        let (vector, _) = default_vector();
        let result = ensemble.predict(&vector).unwrap();
        assert_eq!(result.cnn.class_id, Category::Web.id());
        assert!(result.cnn.confidence > 0.5);
    }

    #[test]
    fn seeded_ensembles_agree() {
        let (vector, _) = default_vector();
        let a = Ensemble::new(quick_config()).predict(&vector).unwrap();
        let b = Ensemble::new(quick_config()).predict(&vector).unwrap();
        assert_eq!(a.cnn.class_id, b.cnn.class_id);
        assert!((a.cnn.confidence - b.cnn.confidence).abs() < 1e-5);
        assert_eq!(a.xgboost, b.xgboost);
        assert!((a.isolation_forest.score - b.isolation_forest.score).abs() < 1e-9);
    }

    #[test]
    fn training_failure_surfaces_to_caller() {
        let ensemble = Ensemble::with_provider(quick_config(), Box::new(FailingProvider));
        let (vector, _) = default_vector();
        let err = ensemble.predict(&vector).unwrap_err();
        assert!(format!("{:#}", err).contains("non-finite"));
        assert!(!ensemble.is_trained());
    }

    #[test]
    fn config_loads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = br#"{"samples": 50, "boosting": {"rounds": 3}}"#;
        std::io::Write::write_all(&mut file, json).unwrap();

        let config = EnsembleConfig::load(file.path()).unwrap();
        assert_eq!(config.samples, 50);
        assert_eq!(config.boosting.rounds, 3);
        assert_eq!(config.boosting.max_depth, 3);
        assert_eq!(config.neural.epochs, 100);
        assert_eq!(config.forest.contamination, 0.1);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn result_serializes_per_model() {
        let result = EnsembleResult {
            cnn: NeuralPrediction {
                class_id: 0,
                confidence: 0.5,
            },
            xgboost: TreePrediction { class_id: 0 },
            isolation_forest: AnomalyPrediction {
                is_anomaly: true,
                score: -0.1,
            },
        };
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["cnn"]["class_id"], 0);
        assert_eq!(json["isolation_forest"]["is_anomaly"], true);
    }
}
