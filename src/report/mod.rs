//! Turns ensemble output into the response payload.
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::features::{AuxiliaryStats, FeatureVector};
use crate::ml::EnsembleResult;
use crate::protocols::Category;

/// Display name of a category ID. IDs outside 0..=4 map to "Unknown".
pub fn category_name(class_id: u8) -> &'static str {
    match Category::from_id(class_id) {
        Some(Category::Web) => "Class A (Web browsing)",
        Some(Category::Streaming) => "Class B (Streaming)",
        Some(Category::FileTransfer) => "Class C (File Transfer)",
        Some(Category::Messaging) => "Class D (Messaging)",
        Some(Category::System) => "Class E (System / Other)",
        None => "Unknown",
    }
}

/// Where the feature vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSource {
    Capture,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeaturesPayload {
    #[serde(flatten)]
    pub vector: FeatureVector,
    pub protocol_counts: BTreeMap<String, u64>,
    pub class_counts: BTreeMap<u8, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CnnPayload {
    pub class_id: u8,
    pub class_name: &'static str,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct XgboostPayload {
    pub class_id: u8,
    pub class_name: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct IsolationForestPayload {
    pub is_anomaly: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionsPayload {
    pub cnn: CnnPayload,
    pub xgboost: XgboostPayload,
    pub isolation_forest: IsolationForestPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub source: FeatureSource,
    pub features: FeaturesPayload,
    pub predictions: PredictionsPayload,
    pub statistics: AuxiliaryStats,
}

impl AnalysisReport {
    pub fn new(
        vector: FeatureVector,
        stats: AuxiliaryStats,
        result: &EnsembleResult,
        source: FeatureSource,
    ) -> Self {
        let predictions = PredictionsPayload {
            cnn: CnnPayload {
                class_id: result.cnn.class_id,
                class_name: category_name(result.cnn.class_id),
                confidence: result.cnn.confidence,
            },
            xgboost: XgboostPayload {
                class_id: result.xgboost.class_id,
                class_name: category_name(result.xgboost.class_id),
            },
            isolation_forest: IsolationForestPayload {
                is_anomaly: result.isolation_forest.is_anomaly,
                score: result.isolation_forest.score,
            },
        };

        Self {
            source,
            features: FeaturesPayload {
                vector,
                protocol_counts: stats.protocol_counts.clone(),
                class_counts: stats.class_counts.clone(),
            },
            predictions,
            statistics: stats,
        }
    }

    pub fn models_agree(&self) -> bool {
        self.predictions.cnn.class_id == self.predictions.xgboost.class_id
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text summary for terminals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let v = &self.features.vector;
        let p = &self.predictions;

        let _ = writeln!(out, "Traffic analysis ({:?} features)", self.source);
        let _ = writeln!(out);
        let _ = writeln!(out, "  Packets        : {}", v.packet_count);
        let _ = writeln!(
            out,
            "  Packet size    : avg {:.1}, std {:.1}, min {}, max {}",
            v.avg_size, v.std_size, v.min_size, v.max_size
        );
        let _ = writeln!(out, "  Category mix   :");
        for category in Category::ALL {
            let _ = writeln!(
                out,
                "    {:<26} {:>6.2}%",
                category_name(category.id()),
                v.ratio(category) * 100.0
            );
        }
        let _ = writeln!(out, "  Protocols      :");
        for (name, count) in &self.features.protocol_counts {
            let _ = writeln!(out, "    {:<26} {:>6}", name, count);
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  CNN            : {} ({:.1}% confidence)",
            p.cnn.class_name,
            p.cnn.confidence * 100.0
        );
        let _ = writeln!(out, "  XGBoost        : {}", p.xgboost.class_name);
        let _ = writeln!(
            out,
            "  IsolationForest: {} (score {:.4})",
            if p.isolation_forest.is_anomaly { "ANOMALY" } else { "normal" },
            p.isolation_forest.score
        );
        if !self.models_agree() {
            let _ = writeln!(out, "  Note: classifiers disagree");
        }
        out
    }
}
