//! Reduction of a packet sequence to the fixed feature vector the models consume.
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::protocols::{self, Category, PacketLayers};

/// Number of scalars in a [`FeatureVector`].
pub const FEATURE_DIM: usize = 10;

/// Field names in vector order.
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "avg_packet_size",
    "std_packet_size",
    "min_packet_size",
    "max_packet_size",
    "packet_count",
    "ratio_A",
    "ratio_B",
    "ratio_C",
    "ratio_D",
    "ratio_E",
];

/// Summary of one capture.
///
/// The order of [`FeatureVector::to_array`] is fixed: size statistics, packet
/// count, then one ratio per category. The ratios sum to 1 whenever
/// `packet_count > 0` and are all zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub avg_size: f64,
    pub std_size: f64,
    pub min_size: f64,
    pub max_size: f64,
    pub packet_count: f64,
    pub ratios: [f64; Category::COUNT],
}

impl Serialize for FeatureVector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(FEATURE_DIM))?;
        for (name, value) in FEATURE_NAMES.iter().zip(self.to_f64_array()) {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

impl FeatureVector {
    pub fn zeroed() -> Self {
        Self {
            avg_size: 0.0,
            std_size: 0.0,
            min_size: 0.0,
            max_size: 0.0,
            packet_count: 0.0,
            ratios: [0.0; Category::COUNT],
        }
    }

    pub fn ratio(&self, category: Category) -> f64 {
        self.ratios[category.id() as usize]
    }

    fn to_f64_array(&self) -> [f64; FEATURE_DIM] {
        let [r0, r1, r2, r3, r4] = self.ratios;
        [
            self.avg_size,
            self.std_size,
            self.min_size,
            self.max_size,
            self.packet_count,
            r0,
            r1,
            r2,
            r3,
            r4,
        ]
    }

    pub fn to_array(&self) -> [f32; FEATURE_DIM] {
        self.to_f64_array().map(|v| v as f32)
    }
}

/// Display-only counters carried next to the vector. Never fed to models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuxiliaryStats {
    pub protocol_counts: BTreeMap<String, u64>,
    pub class_counts: BTreeMap<u8, u64>,
}

impl AuxiliaryStats {
    fn new() -> Self {
        Self {
            protocol_counts: BTreeMap::new(),
            class_counts: Category::ALL.iter().map(|c| (c.id(), 0)).collect(),
        }
    }
}

/// Classify every packet and fold the sequence into a feature vector.
pub fn aggregate<P: PacketLayers>(packets: &[P]) -> (FeatureVector, AuxiliaryStats) {
    let mut stats = AuxiliaryStats::new();
    let mut category_counts = [0u64; Category::COUNT];
    let mut sizes = Vec::with_capacity(packets.len());

    for packet in packets {
        sizes.push(packet.length() as f64);
        let label = protocols::classify(packet);
        category_counts[label.category.id() as usize] += 1;
        *stats.class_counts.entry(label.category.id()).or_insert(0) += 1;
        *stats.protocol_counts.entry(label.name.to_string()).or_insert(0) += 1;
    }

    if sizes.is_empty() {
        debug!("No packets to aggregate, returning zero vector");
        return (FeatureVector::zeroed(), stats);
    }

    let count = sizes.len() as f64;
    let mean = sizes.iter().sum::<f64>() / count;
    let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count;
    let min = sizes.iter().copied().fold(f64::INFINITY, f64::min);
    let max = sizes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut ratios = [0.0; Category::COUNT];
    for (ratio, &n) in ratios.iter_mut().zip(&category_counts) {
        *ratio = n as f64 / count;
    }

    debug!("Aggregated {} packets, ratios {:?}", sizes.len(), ratios);

    let vector = FeatureVector {
        avg_size: mean,
        std_size: variance.sqrt(),
        min_size: min,
        max_size: max,
        packet_count: count,
        ratios,
    };
    (vector, stats)
}

/// Fixed demonstration vector used when no capture could be read.
/// Mostly web traffic.
pub fn default_vector() -> (FeatureVector, AuxiliaryStats) {
    let vector = FeatureVector {
        avg_size: 850.0,
        std_size: 120.0,
        min_size: 64.0,
        max_size: 1500.0,
        packet_count: 1000.0,
        ratios: [0.7, 0.1, 0.1, 0.05, 0.05],
    };

    let protocol_counts = [("HTTP", 600), ("HTTPS", 100), ("DNS", 50), ("Other", 250)]
        .into_iter()
        .map(|(name, n)| (name.to_string(), n))
        .collect();
    let class_counts = [(0, 700), (1, 100), (2, 100), (3, 50), (4, 50)]
        .into_iter()
        .collect();

    (
        vector,
        AuxiliaryStats {
            protocol_counts,
            class_counts,
        },
    )
}
