//! Prediction data structures

use crate::error::{EnsembleError, ErrorKind};
use crate::plausibility::PlausibilityAnnotation;
use crate::toxicity::ToxicityInfo;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Confidence band of the fused top prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// Determine confidence level from a percentage and thresholds
    pub fn from_confidence(confidence: f64, thresholds: &ConfidenceLevelThresholds) -> Self {
        if confidence >= thresholds.high {
            ConfidenceLevel::High
        } else if confidence >= thresholds.medium {
            ConfidenceLevel::Medium
        } else if confidence >= thresholds.low {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

/// Configurable confidence level boundaries (percent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceLevelThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for ConfidenceLevelThresholds {
    fn default() -> Self {
        Self {
            low: 30.0,
            medium: 50.0,
            high: 70.0,
        }
    }
}

/// A class label with a confidence in [0, 100]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub label: String,
    pub confidence: f64,
}

impl ClassProbability {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Descending by confidence, ties broken by label
pub fn rank_order(a: &ClassProbability, b: &ClassProbability) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.label.cmp(&b.label))
}

/// One backbone's output for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub backbone: String,
    pub display_name: String,
    /// Index of the top class in the backbone's label list
    pub top_index: usize,
    pub top: ClassProbability,
    /// Every class, ranked
    pub probabilities: Vec<ClassProbability>,
}

impl ModelPrediction {
    /// Build from a normalized probability vector aligned with `labels`
    pub fn from_probabilities(
        backbone: &str,
        display_name: &str,
        labels: &[String],
        probabilities: &[f32],
    ) -> Self {
        let mut ranked: Vec<ClassProbability> = labels
            .iter()
            .zip(probabilities.iter())
            .map(|(label, &p)| ClassProbability::new(label.clone(), p as f64 * 100.0))
            .collect();
        ranked.sort_by(rank_order);

        let top = ranked
            .first()
            .cloned()
            .unwrap_or_else(|| ClassProbability::new("", 0.0));
        let top_index = labels.iter().position(|l| *l == top.label).unwrap_or(0);

        Self {
            backbone: backbone.to_string(),
            display_name: display_name.to_string(),
            top_index,
            top,
            probabilities: ranked,
        }
    }
}

/// Why a backbone's result is missing from an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneFailure {
    pub backbone: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl BackboneFailure {
    pub fn new(backbone: &str, error: &EnsembleError) -> Self {
        Self {
            backbone: backbone.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of running one backbone: success with a value or failure with a reason
#[derive(Debug, Clone)]
pub struct BackboneOutcome<T> {
    pub backbone: String,
    pub result: Result<T, EnsembleError>,
}

impl<T> BackboneOutcome<T> {
    pub fn new(backbone: &str, result: Result<T, EnsembleError>) -> Self {
        Self {
            backbone: backbone.to_string(),
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure(&self) -> Option<BackboneFailure> {
        self.result
            .as_ref()
            .err()
            .map(|e| BackboneFailure::new(&self.backbone, e))
    }
}

/// Fused top prediction with its toxicity annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPrediction {
    pub label: String,
    pub confidence: f64,
    pub toxicity: ToxicityInfo,
    pub confidence_level: ConfidenceLevel,
    pub is_low_confidence: bool,
    pub is_very_low_confidence: bool,
    pub warning: Option<String>,
}

/// Fused ensemble result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub top: TopPrediction,
    /// Every class, fused and ranked
    pub ranked: Vec<ClassProbability>,
    /// Number of ranked entries the caller asked for
    pub top_k: usize,
    /// Successful per-backbone predictions that were fused
    pub models: Vec<ModelPrediction>,
    /// Backbones excluded from fusion
    pub failures: Vec<BackboneFailure>,
    pub plausibility: PlausibilityAnnotation,
}

impl EnsemblePrediction {
    pub fn top_predictions(&self) -> &[ClassProbability] {
        &self.ranked[..self.top_k.min(self.ranked.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["Amanita".into(), "Boletus".into(), "Russula".into()]
    }

    #[test]
    fn test_confidence_level_from_confidence() {
        let thresholds = ConfidenceLevelThresholds::default();

        assert_eq!(
            ConfidenceLevel::from_confidence(12.0, &thresholds),
            ConfidenceLevel::VeryLow
        );
        assert_eq!(
            ConfidenceLevel::from_confidence(30.0, &thresholds),
            ConfidenceLevel::Low
        );
        assert_eq!(
            ConfidenceLevel::from_confidence(55.0, &thresholds),
            ConfidenceLevel::Medium
        );
        assert_eq!(
            ConfidenceLevel::from_confidence(92.5, &thresholds),
            ConfidenceLevel::High
        );
    }

    #[test]
    fn test_model_prediction_ranking() {
        let prediction =
            ModelPrediction::from_probabilities("resnet50", "ResNet50", &labels(), &[0.2, 0.5, 0.3]);

        assert_eq!(prediction.top.label, "Boletus");
        assert_eq!(prediction.top_index, 1);
        assert!((prediction.top.confidence - 50.0).abs() < 1e-4);
        let order: Vec<&str> = prediction
            .probabilities
            .iter()
            .map(|p| p.label.as_str())
            .collect();
        assert_eq!(order, vec!["Boletus", "Russula", "Amanita"]);

        let total: f64 = prediction.probabilities.iter().map(|p| p.confidence).sum();
        assert!((total - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_ties_broken_by_label() {
        let prediction = ModelPrediction::from_probabilities(
            "m",
            "m",
            &["Russula".into(), "Agaricus".into()],
            &[0.5, 0.5],
        );
        assert_eq!(prediction.top.label, "Agaricus");
        assert_eq!(prediction.top_index, 1);
    }

    #[test]
    fn test_backbone_outcome_failure() {
        let outcome: BackboneOutcome<ModelPrediction> = BackboneOutcome::new(
            "mobilenet_v3_large",
            Err(EnsembleError::inference("mobilenet_v3_large", "non-finite logits")),
        );
        assert!(!outcome.is_ok());
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Inference);
        assert_eq!(failure.backbone, "mobilenet_v3_large");
    }
}
