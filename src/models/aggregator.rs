//! Soft-voting fusion of per-backbone predictions

use crate::error::{EnsembleError, Result};
use crate::plausibility::PlausibilityCheck;
use crate::toxicity::ToxicityTable;
use crate::types::prediction::{
    rank_order, BackboneFailure, ClassProbability, EnsemblePrediction, ModelPrediction,
    TopPrediction,
};
use std::collections::BTreeMap;

/// Combines per-backbone probability lists into one ranked, annotated result.
pub struct EnsembleFusion {
    toxicity: ToxicityTable,
    plausibility: PlausibilityCheck,
}

impl EnsembleFusion {
    pub fn new(toxicity: ToxicityTable, plausibility: PlausibilityCheck) -> Self {
        Self {
            toxicity,
            plausibility,
        }
    }

    pub fn toxicity(&self) -> &ToxicityTable {
        &self.toxicity
    }

    /// Fuse the successful predictions of one image.
    ///
    /// Each class is averaged over the backbones that reported it; failed
    /// backbones are absent from `predictions` and therefore never pull the
    /// mean towards zero.
    pub fn fuse(
        &self,
        predictions: Vec<ModelPrediction>,
        failures: Vec<BackboneFailure>,
        top_k: usize,
    ) -> Result<EnsemblePrediction> {
        if predictions.is_empty() {
            let detail = if failures.is_empty() {
                "no backbones available".to_string()
            } else {
                failures
                    .iter()
                    .map(|f| format!("{}: {}", f.backbone, f.kind.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return Err(EnsembleError::NoValidPredictions(detail));
        }

        let ranked = Self::average(&predictions);
        let plausibility = self.plausibility.assess_ranked(&ranked);

        // average() yields one entry per reported label, and predictions is non-empty
        let best = ranked
            .first()
            .cloned()
            .ok_or_else(|| EnsembleError::NoValidPredictions("no class scores".into()))?;

        let top = TopPrediction {
            toxicity: self.toxicity.lookup(&best.label),
            label: best.label,
            confidence: best.confidence,
            confidence_level: plausibility.confidence_level,
            is_low_confidence: plausibility.is_low_confidence,
            is_very_low_confidence: plausibility.is_very_low_confidence,
            warning: plausibility.warning_message.clone(),
        };

        Ok(EnsemblePrediction {
            top,
            ranked,
            top_k: top_k.max(1),
            models: predictions,
            failures,
            plausibility,
        })
    }

    /// Mean confidence per class, ranked descending with label tie-break.
    pub fn average(predictions: &[ModelPrediction]) -> Vec<ClassProbability> {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for prediction in predictions {
            for p in &prediction.probabilities {
                let entry = sums.entry(p.label.as_str()).or_insert((0.0, 0));
                entry.0 += p.confidence;
                entry.1 += 1;
            }
        }

        let mut ranked: Vec<ClassProbability> = sums
            .into_iter()
            .map(|(label, (sum, count))| ClassProbability::new(label, sum / count as f64))
            .collect();
        ranked.sort_by(rank_order);
        ranked
    }

    /// Fraction of backbones whose own top label matches `label`.
    pub fn agreement(predictions: &[ModelPrediction], label: &str) -> f64 {
        if predictions.is_empty() {
            return 0.0;
        }
        let votes = predictions.iter().filter(|p| p.top.label == label).count();
        votes as f64 / predictions.len() as f64
    }
}
