use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capture;
use crate::features::{self, AuxiliaryStats, FeatureVector};
use crate::ml::Ensemble;
use crate::protocols::PacketLayers;
use crate::report::{AnalysisReport, FeatureSource};

/// Runs capture → features → ensemble → report for one request.
///
/// Cheap to clone; clones share the same ensemble and its one training pass.
#[derive(Clone)]
pub struct TrafficAnalyzer {
    ensemble: Arc<Ensemble>,
}

impl TrafficAnalyzer {
    pub fn new(ensemble: Arc<Ensemble>) -> Self {
        Self { ensemble }
    }

    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }

    /// Analyze a capture file. An unreadable file is replaced by the default
    /// feature vector instead of failing the request.
    pub fn analyze_file<P: AsRef<Path>>(&self, path: P) -> Result<AnalysisReport> {
        let (vector, stats, source) = match capture::read_capture(path.as_ref()) {
            Ok(packets) => {
                let (vector, stats) = features::aggregate(&packets);
                (vector, stats, FeatureSource::Capture)
            }
            Err(e) => {
                warn!("{}; using default feature vector", e);
                let (vector, stats) = features::default_vector();
                (vector, stats, FeatureSource::Fallback)
            }
        };
        self.finish(vector, stats, source)
    }

    /// Analyze packets that were decoded elsewhere.
    pub fn analyze_packets<P: PacketLayers>(&self, packets: &[P]) -> Result<AnalysisReport> {
        let (vector, stats) = features::aggregate(packets);
        self.finish(vector, stats, FeatureSource::Capture)
    }

    fn finish(
        &self,
        vector: FeatureVector,
        stats: AuxiliaryStats,
        source: FeatureSource,
    ) -> Result<AnalysisReport> {
        if !self.ensemble.is_trained() {
            info!("Ensemble not trained yet, training before first prediction");
        }
        let result = self.ensemble.predict(&vector)?;
        let report = AnalysisReport::new(vector, stats, &result, source);
        info!(
            "Classified {} packets: cnn={} xgboost={} anomaly={}",
            vector.packet_count,
            report.predictions.cnn.class_name,
            report.predictions.xgboost.class_name,
            report.predictions.isolation_forest.is_anomaly
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::packet::tests::{stp_frame, tcp_frame, udp_frame};
    use crate::capture::tests::write_pcap;
    use crate::features::tests::mixed_web_capture;
    use crate::ml::tests::quick_config;
    use crate::ml::EnsembleConfig;
    use crate::protocols::Category;

    fn analyzer() -> TrafficAnalyzer {
        TrafficAnalyzer::new(Arc::new(Ensemble::new(quick_config())))
    }

    #[test]
    fn unreadable_capture_falls_back() {
        let report = analyzer().analyze_file("/does/not/exist.pcap").unwrap();
        let v = report.features.vector;
        assert_eq!(report.source, FeatureSource::Fallback);
        assert_eq!(v.packet_count, 1000.0);
        assert_eq!(v.ratios, [0.7, 0.1, 0.1, 0.05, 0.05]);
        assert!(report.predictions.cnn.class_id < 5);
    }

    #[test]
    fn mixed_capture_end_to_end() {
        let config = EnsembleConfig {
            seed: Some(1),
            ..Default::default()
        };
        let analyzer = TrafficAnalyzer::new(Arc::new(Ensemble::new(config)));
        let report = analyzer.analyze_packets(&mixed_web_capture()).unwrap();
        let v = report.features.vector;
        assert_eq!(report.source, FeatureSource::Capture);
        assert_eq!(v.packet_count, 1000.0);
        assert!((v.ratio(Category::Web) - 0.8).abs() < 1e-9);
        assert!((v.ratio(Category::System) - 0.2).abs() < 1e-9);
        assert_eq!(v.ratio(Category::Streaming), 0.0);
        assert_eq!(v.ratio(Category::FileTransfer), 0.0);
        assert_eq!(v.ratio(Category::Messaging), 0.0);
        assert_eq!(report.predictions.xgboost.class_id, Category::Web.id());
        assert_eq!(report.predictions.cnn.class_id, Category::Web.id());
        assert!(report.models_agree());
        assert_eq!(analyzer.ensemble().training_runs(), 1);
    }

    #[test]
    fn pcap_file_end_to_end() {
        let mut frames = Vec::new();
        for i in 0..8 {
            frames.push(tcp_frame(40000 + i, 22, &[0u8; 200]));
        }
        frames.push(udp_frame(40100, 53, &[0u8; 30]));
        frames.push(stp_frame());
        let file = write_pcap(&frames);

        let report = analyzer().analyze_file(file.path()).unwrap();
        let v = report.features.vector;
        assert_eq!(report.source, FeatureSource::Capture);
        assert_eq!(v.packet_count, 10.0);
        assert!((v.ratio(Category::FileTransfer) - 0.8).abs() < 1e-9);
        assert!((v.ratio(Category::Messaging) - 0.1).abs() < 1e-9);
        assert!((v.ratio(Category::System) - 0.1).abs() < 1e-9);
        assert_eq!(report.features.protocol_counts["SFTP"], 8);
        assert_eq!(report.features.protocol_counts["STP"], 1);
        assert_eq!(report.features.protocol_counts["DNS"], 1);
    }

    #[test]
    fn empty_packet_list_is_not_an_error() {
        let packets: Vec<capture::DecodedPacket> = Vec::new();
        let report = analyzer().analyze_packets(&packets).unwrap();
        assert_eq!(report.features.vector, FeatureVector::zeroed());
        assert_eq!(report.source, FeatureSource::Capture);
    }

    #[test]
    fn clones_share_training() {
        let analyzer = analyzer();
        let other = analyzer.clone();
        analyzer.analyze_file("/does/not/exist.pcap").unwrap();
        other.analyze_file("/does/not/exist.pcap").unwrap();
        assert_eq!(other.ensemble().training_runs(), 1);
    }
}
