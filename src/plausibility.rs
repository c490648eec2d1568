//! Content-plausibility check.
//!
//! A deterministic guard over the fused confidences: a weak or ambiguous top
//! prediction usually means the picture is not a mushroom at all, or not one the
//! backbones were trained on.

use crate::config::PlausibilityConfig;
use crate::types::prediction::{ClassProbability, ConfidenceLevel, EnsemblePrediction};
use serde::{Deserialize, Serialize};

/// Verdict of the plausibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plausibility {
    Plausible,
    Uncertain,
    Implausible,
}

/// Annotation attached to every fused prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlausibilityAnnotation {
    pub is_likely_mushroom: bool,
    pub status: Plausibility,
    pub confidence_level: ConfidenceLevel,
    pub is_low_confidence: bool,
    pub is_very_low_confidence: bool,
    pub is_ambiguous: bool,
    pub warning_message: Option<String>,
}

const IMPLAUSIBLE_WARNING: &str = "Very low confidence: this image may not show a mushroom. \
     Please upload a clear, well-lit photo of a mushroom, ideally from several angles.";
const AMBIGUOUS_WARNING: &str = "Ambiguous result: the top candidates are nearly tied. \
     Please try another photo showing the cap, gills and stem.";

/// Confidence-based heuristic guard
#[derive(Debug, Clone, Default)]
pub struct PlausibilityCheck {
    config: PlausibilityConfig,
}

impl PlausibilityCheck {
    pub fn new(config: PlausibilityConfig) -> Self {
        Self { config }
    }

    /// Assess a fused prediction
    pub fn assess(&self, ensemble: &EnsemblePrediction) -> PlausibilityAnnotation {
        self.assess_ranked(&ensemble.ranked)
    }

    /// Assess a fused, descending-ranked confidence list
    pub fn assess_ranked(&self, ranked: &[ClassProbability]) -> PlausibilityAnnotation {
        let top = ranked.first().map(|p| p.confidence).unwrap_or(0.0);
        let second = ranked.get(1).map(|p| p.confidence);

        let is_low_confidence = top < self.config.low_confidence;
        let is_very_low_confidence = top < self.config.very_low_confidence;
        let is_ambiguous = second
            .map(|s| top - s < self.config.ambiguity_margin)
            .unwrap_or(false);

        // Ranked descending, so a low top means every candidate is low
        let (status, warning) = if is_low_confidence {
            (Plausibility::Implausible, Some(IMPLAUSIBLE_WARNING))
        } else if is_ambiguous {
            (Plausibility::Uncertain, Some(AMBIGUOUS_WARNING))
        } else {
            (Plausibility::Plausible, None)
        };

        PlausibilityAnnotation {
            is_likely_mushroom: status != Plausibility::Implausible,
            status,
            confidence_level: ConfidenceLevel::from_confidence(top, &self.config.levels),
            is_low_confidence,
            is_very_low_confidence,
            is_ambiguous,
            warning_message: warning.map(str::to_string),
        }
    }
}
