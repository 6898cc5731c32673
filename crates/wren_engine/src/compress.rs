//! Neural compression analysis: entropy estimation, pattern scanning, and
//! compression-strategy recommendation built on the byte predictor.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::Result;
use crate::models::{recommend_algorithm, Model, NeuralCompressor};
use crate::params::ModelState;

/// Default chunk length fed to the recurrent estimator.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

const MAX_PATTERN_LEN: usize = 16;
const MIN_PATTERN_COUNT: usize = 3;
const TOP_PATTERNS: usize = 10;

// ============================================================
// Entropy estimation
// ============================================================

#[derive(Clone, Debug, Serialize)]
pub struct PatternInfo {
    pub pattern: String,
    pub length: usize,
    pub count: usize,
    pub savings: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PatternAnalysis {
    pub shannon_entropy: f64,
    pub neural_entropy: f64,
    pub redundancy: f64,
    pub patterns: Vec<PatternInfo>,
    pub byte_distribution: Vec<f64>,
}

/// Entropy estimator over the byte predictor.
///
/// An untrained predictor would grossly overestimate entropy, so the neural
/// path is only used once the model reports `Trained`; otherwise the
/// order-0 Shannon estimate stands in.
pub struct NeuralEntropyEstimator<'m> {
    model: &'m NeuralCompressor,
    chunk_size: usize,
}

impl<'m> NeuralEntropyEstimator<'m> {
    pub fn new(model: &'m NeuralCompressor, chunk_size: usize) -> Self {
        Self {
            model,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn estimate_entropy(&self, data: &[u8]) -> Result<f64> {
        if data.is_empty() {
            return Ok(0.0);
        }
        if matches!(
            self.model.store().state,
            ModelState::Trained | ModelState::Exported
        ) {
            self.model.estimate_entropy(data, self.chunk_size)
        } else {
            tracing::debug!("byte predictor untrained; using Shannon estimate");
            Ok(shannon_entropy(data))
        }
    }

    /// Byte distribution, order-0 and model entropy, and the top repeating
    /// n-grams ranked by naive savings.
    pub fn analyze_patterns(&self, data: &[u8]) -> Result<PatternAnalysis> {
        if data.is_empty() {
            return Ok(PatternAnalysis {
                shannon_entropy: 0.0,
                neural_entropy: 0.0,
                redundancy: 1.0,
                patterns: Vec::new(),
                byte_distribution: vec![0.0; 256],
            });
        }

        let mut freq = vec![0.0f64; 256];
        for &b in data {
            freq[b as usize] += 1.0;
        }
        for f in freq.iter_mut() {
            *f /= data.len() as f64;
        }

        let shannon = shannon_entropy(data);
        let neural = self.estimate_entropy(data)?;

        Ok(PatternAnalysis {
            shannon_entropy: shannon,
            neural_entropy: neural,
            redundancy: 1.0 - neural / 8.0,
            patterns: find_patterns(data),
            byte_distribution: freq,
        })
    }
}

/// Order-0 entropy of the byte histogram, in bits per byte.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let n = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Repeating n-grams (n in 2..=16) seen more than three times, ranked by
/// `(count - 1) * length` savings; top ten returned.
pub fn find_patterns(data: &[u8]) -> Vec<PatternInfo> {
    let mut patterns = Vec::new();

    let max_len = MAX_PATTERN_LEN.min(data.len() / 2);
    for pattern_len in 2..max_len {
        let mut counts: HashMap<&[u8], usize> = HashMap::new();
        for window in data.windows(pattern_len) {
            *counts.entry(window).or_insert(0) += 1;
        }
        for (pattern, count) in counts {
            if count > MIN_PATTERN_COUNT {
                patterns.push(PatternInfo {
                    pattern: hex_string(pattern),
                    length: pattern_len,
                    count,
                    savings: (count - 1) * pattern_len,
                });
            }
        }
    }

    patterns.sort_by(|a, b| b.savings.cmp(&a.savings));
    patterns.truncate(TOP_PATTERNS);
    patterns
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================
// Compression analysis
// ============================================================

#[derive(Clone, Debug, Serialize)]
pub struct CompressionReport {
    pub original_size: usize,
    pub estimated_compressed_size: usize,
    pub entropy_bits_per_byte: f64,
    pub compression_ratio: f64,
    pub recommended_algorithm: String,
    pub pattern_predictions: Vec<f32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StrategyRecommendation {
    pub algorithm: String,
    pub expected_ratio: f64,
    pub entropy: f64,
    pub use_dictionary: bool,
    pub use_rle: bool,
    pub use_neural: bool,
    pub passes: usize,
    pub order: Vec<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnhancementReport {
    pub original_ratio: f64,
    pub ml_enhanced_ratio: f64,
    pub improvement_percent: f64,
    pub theoretical_max: f64,
    pub efficiency_before: f64,
    pub efficiency_after: f64,
}

/// Compression-strategy recommender over the byte predictor.
pub struct CompressionAnalyzer<'m> {
    model: &'m NeuralCompressor,
    chunk_size: usize,
}

impl<'m> CompressionAnalyzer<'m> {
    pub fn new(model: &'m NeuralCompressor) -> Self {
        Self {
            model,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn estimator(&self) -> NeuralEntropyEstimator<'m> {
        NeuralEntropyEstimator::new(self.model, self.chunk_size)
    }

    /// Size, entropy, estimated compressed size, and the primary algorithm
    /// recommendation. Empty input yields a defined zero report.
    pub fn analyze(&self, data: &[u8]) -> Result<CompressionReport> {
        let original_size = data.len();
        if original_size == 0 {
            return Ok(CompressionReport {
                original_size: 0,
                estimated_compressed_size: 0,
                entropy_bits_per_byte: 0.0,
                compression_ratio: 1.0,
                recommended_algorithm: "none".to_string(),
                pattern_predictions: Vec::new(),
            });
        }

        let entropy = self.estimator().estimate_entropy(data)?;
        let estimated_compressed = (original_size as f64 * entropy / 8.0) as usize;

        Ok(CompressionReport {
            original_size,
            estimated_compressed_size: estimated_compressed,
            entropy_bits_per_byte: entropy,
            compression_ratio: original_size as f64 / estimated_compressed.max(1) as f64,
            recommended_algorithm: recommend_algorithm(entropy).to_string(),
            pattern_predictions: self.predict_patterns(data)?,
        })
    }

    /// Confidence the predictor assigns to each actual continuation byte of
    /// the (truncated) payload.
    fn predict_patterns(&self, data: &[u8]) -> Result<Vec<f32>> {
        if data.len() < 2 {
            return Ok(Vec::new());
        }
        let window = &data[..data.len().min(DEFAULT_CHUNK_SIZE)];
        let context: Vec<u8> = window[..window.len() - 1].to_vec();

        let (probs, _) = self.model.predict_next_byte(&[context], None, 1.0)?;
        let row = probs.as_f32()?;

        let mut confidences = Vec::new();
        for i in 0..row.len().min(window.len() - 1) {
            let actual_next = window[i + 1] as usize;
            confidences.push(row[actual_next]);
        }
        Ok(confidences)
    }

    /// Combine the entropy bucket with the pattern scan into a pass plan.
    pub fn recommend_strategy(&self, data: &[u8]) -> Result<StrategyRecommendation> {
        let analysis = self.analyze(data)?;
        let patterns = self.estimator().analyze_patterns(data)?;

        let (passes, order): (usize, Vec<&'static str>) = if analysis.compression_ratio > 10.0 {
            (3, vec!["rle", "dictionary", "arithmetic"])
        } else if analysis.compression_ratio > 3.0 {
            (2, vec!["dictionary", "arithmetic"])
        } else {
            (1, vec!["arithmetic"])
        };

        Ok(StrategyRecommendation {
            algorithm: analysis.recommended_algorithm,
            expected_ratio: analysis.compression_ratio,
            entropy: analysis.entropy_bits_per_byte,
            use_dictionary: analysis.entropy_bits_per_byte < 4.0,
            use_rle: patterns.redundancy > 0.3,
            use_neural: analysis.entropy_bits_per_byte > 5.0,
            passes,
            order,
        })
    }

    /// Headroom left between an achieved ratio and the entropy bound, and
    /// the bounded boost better prediction could claim from it.
    pub fn enhance_compression(
        &self,
        data: &[u8],
        existing_ratio: f64,
    ) -> Result<EnhancementReport> {
        let analysis = self.analyze(data)?;

        let theoretical_max = if analysis.entropy_bits_per_byte > 0.0 {
            8.0 / analysis.entropy_bits_per_byte
        } else {
            f64::INFINITY
        };
        let efficiency_before = if theoretical_max.is_finite() {
            existing_ratio / theoretical_max
        } else {
            0.0
        };

        // Up to a 30% boost, proportional to the unclaimed headroom.
        let ml_boost = (0.3f64).min((1.0 - efficiency_before) * 0.5);
        let new_ratio = existing_ratio * (1.0 + ml_boost);

        Ok(EnhancementReport {
            original_ratio: existing_ratio,
            ml_enhanced_ratio: new_ratio,
            improvement_percent: (new_ratio - existing_ratio) / existing_ratio * 100.0,
            theoretical_max,
            efficiency_before,
            efficiency_after: if theoretical_max.is_finite() {
                new_ratio / theoretical_max
            } else {
                0.0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NeuralCompressorConfig;

    fn model() -> NeuralCompressor {
        NeuralCompressor::new(NeuralCompressorConfig {
            context_size: 64,
            hidden_size: 16,
            num_layers: 1,
        })
        .unwrap()
    }

    #[test]
    fn shannon_of_constant_data_is_zero() {
        assert_eq!(shannon_entropy(&[b'A'; 1024]), 0.0);
    }

    #[test]
    fn shannon_of_all_byte_values_is_eight() {
        let data: Vec<u8> = (0..=255).collect();
        assert!((shannon_entropy(&data) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn analyze_constant_run_recommends_rle() {
        let model = model();
        let analyzer = CompressionAnalyzer::new(&model);
        let report = analyzer.analyze(&[b'A'; 1024]).unwrap();
        assert!(report.entropy_bits_per_byte < 1.0);
        assert_eq!(report.recommended_algorithm, "rle");
        assert_eq!(report.original_size, 1024);
    }

    #[test]
    fn analyze_empty_input_is_defined() {
        let model = model();
        let analyzer = CompressionAnalyzer::new(&model);
        let report = analyzer.analyze(&[]).unwrap();
        assert_eq!(report.original_size, 0);
        assert_eq!(report.estimated_compressed_size, 0);
        assert_eq!(report.recommended_algorithm, "none");
        assert_eq!(report.compression_ratio, 1.0);
    }

    #[test]
    fn find_patterns_ranks_by_savings() {
        let mut data = Vec::new();
        for _ in 0..10 {
            data.extend_from_slice(b"abcabc--");
        }
        let patterns = find_patterns(&data);
        assert!(!patterns.is_empty());
        assert!(patterns.len() <= 10);
        for pair in patterns.windows(2) {
            assert!(pair[0].savings >= pair[1].savings);
        }
    }

    #[test]
    fn strategy_passes_follow_ratio_buckets() {
        let model = model();
        let analyzer = CompressionAnalyzer::new(&model);

        let strategy = analyzer.recommend_strategy(&[b'z'; 2048]).unwrap();
        // Near-zero entropy means a huge expected ratio and a 3-pass plan.
        assert_eq!(strategy.passes, 3);
        assert_eq!(strategy.order, vec!["rle", "dictionary", "arithmetic"]);
        assert!(strategy.use_rle);
        assert!(strategy.use_dictionary);
    }

    #[test]
    fn enhancement_boost_is_bounded() {
        let model = model();
        let analyzer = CompressionAnalyzer::new(&model);
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 31 % 251) as u8).collect();
        let report = analyzer.enhance_compression(&data, 2.0).unwrap();
        assert!(report.ml_enhanced_ratio >= report.original_ratio);
        assert!(report.ml_enhanced_ratio <= report.original_ratio * 1.3 + 1e-9);
        assert!(report.improvement_percent >= 0.0);
    }
}
