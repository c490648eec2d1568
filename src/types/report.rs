//! Caller-facing result structures

use crate::error::{EnsembleError, ErrorKind};
use crate::models::registry::BackboneHealth;
use crate::plausibility::PlausibilityAnnotation;
use crate::saliency::SaliencyMap;
use crate::toxicity::{ToxicityInfo, ToxicityTable};
use crate::types::prediction::{
    BackboneFailure, BackboneOutcome, EnsemblePrediction, ModelPrediction, TopPrediction,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Serializable error for a failed request or item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub client_error: bool,
}

impl From<&EnsembleError> for ErrorReport {
    fn from(error: &EnsembleError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            client_error: error.is_client_error(),
        }
    }
}

/// One entry of the fused top-K list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPrediction {
    pub rank: usize,
    pub label: String,
    pub confidence: f64,
    pub toxicity: ToxicityInfo,
}

/// One backbone's contribution to a fused prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBreakdown {
    pub backbone: String,
    pub display_name: String,
    pub reported_accuracy: Option<f64>,
    pub label: String,
    pub confidence: f64,
    pub toxicity: ToxicityInfo,
}

impl ModelBreakdown {
    pub fn new(
        prediction: &ModelPrediction,
        toxicity: &ToxicityTable,
        reported_accuracy: Option<f64>,
    ) -> Self {
        Self {
            backbone: prediction.backbone.clone(),
            display_name: prediction.display_name.clone(),
            reported_accuracy,
            label: prediction.top.label.clone(),
            confidence: prediction.top.confidence,
            toxicity: toxicity.lookup(&prediction.top.label),
        }
    }
}

/// Result of a single-image prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReport {
    pub success: bool,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub prediction: TopPrediction,
    pub top_predictions: Vec<RankedPrediction>,
    pub individual_models: Vec<ModelBreakdown>,
    pub plausibility: PlausibilityAnnotation,
    /// Fused confidence of every class
    pub all_probabilities: BTreeMap<String, f64>,
    /// Fraction of backbones whose own top label equals the fused one
    pub agreement: f64,
    /// Backbones left out of the fusion, with the reason
    pub failures: Vec<BackboneFailure>,
    pub processing_time_ms: u64,
}

impl PredictionReport {
    pub fn new(
        ensemble: &EnsemblePrediction,
        toxicity: &ToxicityTable,
        accuracy_of: impl Fn(&str) -> Option<f64>,
        agreement: f64,
    ) -> Self {
        let top_predictions = ensemble
            .top_predictions()
            .iter()
            .enumerate()
            .map(|(i, p)| RankedPrediction {
                rank: i + 1,
                label: p.label.clone(),
                confidence: p.confidence,
                toxicity: toxicity.lookup(&p.label),
            })
            .collect();

        let individual_models = ensemble
            .models
            .iter()
            .map(|m| ModelBreakdown::new(m, toxicity, accuracy_of(&m.backbone)))
            .collect();

        Self {
            success: true,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            prediction: ensemble.top.clone(),
            top_predictions,
            individual_models,
            plausibility: ensemble.plausibility.clone(),
            all_probabilities: ensemble
                .ranked
                .iter()
                .map(|p| (p.label.clone(), p.confidence))
                .collect(),
            agreement,
            failures: ensemble.failures.clone(),
            processing_time_ms: 0,
        }
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }
}

/// One image of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PredictionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl BatchItem {
    pub fn from_result(filename: &str, result: Result<PredictionReport, EnsembleError>) -> Self {
        match result {
            Ok(report) => Self {
                filename: filename.to_string(),
                success: true,
                result: Some(report),
                error: None,
            },
            Err(e) => Self {
                filename: filename.to_string(),
                success: false,
                result: None,
                error: Some(ErrorReport::from(&e)),
            },
        }
    }
}

/// Result of a batch prediction, items in input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub successful: usize,
    pub results: Vec<BatchItem>,
    pub processing_time_ms: u64,
}

impl BatchReport {
    pub fn new(results: Vec<BatchItem>, elapsed: Duration) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            total: results.len(),
            successful: results.iter().filter(|r| r.success).count(),
            results,
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Saliency outcome for one backbone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyEntry {
    pub backbone: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl SaliencyEntry {
    pub fn from_outcome(outcome: BackboneOutcome<SaliencyMap>) -> Self {
        let encoded = outcome
            .result
            .and_then(|map| map.overlay_base64().map(|b64| (map, b64)));
        match encoded {
            Ok((map, overlay)) => Self {
                backbone: outcome.backbone,
                success: true,
                overlay_base64: Some(overlay),
                label: Some(map.label),
                confidence: Some(map.confidence),
                target_label: Some(map.target_label),
                error: None,
            },
            Err(e) => Self {
                backbone: outcome.backbone,
                success: false,
                overlay_base64: None,
                label: None,
                confidence: None,
                target_label: None,
                error: Some(ErrorReport::from(&e)),
            },
        }
    }
}

/// Saliency overlays for one image, entries in backbone order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyReport {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub alpha: f32,
    pub explanations: Vec<SaliencyEntry>,
    pub processing_time_ms: u64,
}

impl SaliencyReport {
    pub fn new(alpha: f32, explanations: Vec<SaliencyEntry>, elapsed: Duration) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            alpha,
            explanations,
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn get(&self, backbone: &str) -> Option<&SaliencyEntry> {
        self.explanations.iter().find(|e| e.backbone == backbone)
    }

    pub fn successful(&self) -> usize {
        self.explanations.iter().filter(|e| e.success).count()
    }
}

/// Static description of the loaded ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub ensemble_type: String,
    pub num_models: usize,
    pub models: Vec<BackboneHealth>,
    pub num_classes: usize,
    pub classes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassesConfig;
    use crate::models::aggregator::EnsembleFusion;
    use crate::plausibility::PlausibilityCheck;

    fn table() -> ToxicityTable {
        ToxicityTable::new(&ClassesConfig::default().toxicity)
    }

    fn ensemble() -> EnsemblePrediction {
        let labels: Vec<String> = ["Amanita", "Boletus", "Russula"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let models = vec![
            ModelPrediction::from_probabilities("resnet50", "ResNet50", &labels, &[0.8, 0.15, 0.05]),
            ModelPrediction::from_probabilities("efficientnet_b0", "EfficientNet-B0", &labels, &[0.2, 0.7, 0.1]),
        ];
        EnsembleFusion::new(table(), PlausibilityCheck::default())
            .fuse(models, vec![], 2)
            .unwrap()
    }

    #[test]
    fn test_prediction_report() {
        let report = PredictionReport::new(
            &ensemble(),
            &table(),
            |name| (name == "resnet50").then_some(91.59),
            0.5,
        )
        .with_processing_time(Duration::from_millis(42));

        assert!(report.success);
        assert_eq!(report.processing_time_ms, 42);
        assert_eq!(report.top_predictions.len(), 2);
        assert_eq!(report.top_predictions[0].rank, 1);
        assert_eq!(report.top_predictions[0].label, "Amanita");
        assert!(report.top_predictions[0].toxicity.is_poisonous);
        assert_eq!(report.individual_models.len(), 2);
        assert_eq!(report.individual_models[0].reported_accuracy, Some(91.59));
        assert_eq!(report.individual_models[1].label, "Boletus");
        assert_eq!(report.all_probabilities.len(), 3);
        assert!(uuid::Uuid::parse_str(&report.request_id).is_ok());
    }

    #[test]
    fn test_batch_report_counts() {
        let ok = PredictionReport::new(&ensemble(), &table(), |_| None, 1.0);
        let items = vec![
            BatchItem::from_result("a.jpg", Ok(ok)),
            BatchItem::from_result("b.jpg", Err(EnsembleError::InvalidImage("corrupt".into()))),
        ];
        let batch = BatchReport::new(items, Duration::from_millis(5));
        assert_eq!(batch.total, 2);
        assert_eq!(batch.successful, 1);
        assert_eq!(batch.results[1].filename, "b.jpg");
        let error = batch.results[1].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::InvalidImage);
        assert!(error.client_error);
    }

    #[test]
    fn test_report_serializes() {
        let report = PredictionReport::new(&ensemble(), &table(), |_| None, 1.0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["prediction"]["label"], "Amanita");
        assert_eq!(json["plausibility"]["status"], "plausible");
        assert_eq!(json["prediction"]["confidence_level"], "medium");
    }
}
