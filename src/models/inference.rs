//! Multi-backbone ensemble engine

use crate::config::AppConfig;
use crate::error::{EnsembleError, ErrorKind, Result};
use crate::metrics::EngineMetrics;
use crate::models::aggregator::EnsembleFusion;
use crate::models::registry::{ModelRegistry, RegistryHealth};
use crate::plausibility::PlausibilityCheck;
use crate::preprocessing::{DecodedImage, InputSpec, PreprocessedImage, Preprocessor};
use crate::saliency::SaliencyEngine;
use crate::toxicity::{ClassCatalogue, ToxicityTable};
use crate::types::prediction::{BackboneFailure, EnsemblePrediction, ModelPrediction};
use crate::types::report::{
    BatchItem, BatchReport, ModelInfo, PredictionReport, SaliencyEntry, SaliencyReport,
};
use crate::types::upload::ImageUpload;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Wall-clock budget of one request, checked between pipeline stages
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
    budget_ms: u64,
}

impl Deadline {
    pub fn unbounded() -> Self {
        Self {
            expires_at: None,
            budget_ms: 0,
        }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + budget),
            budget_ms: budget.as_millis() as u64,
        }
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget_ms
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    /// Time left before expiry, `Duration::MAX` when unbounded
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::MAX)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(EnsembleError::ProcessingTimeout {
                budget_ms: self.budget_ms,
            })
        } else {
            Ok(())
        }
    }
}

/// Preprocessed tensors of one image, one per distinct input contract
struct PreparedInputs<'a> {
    source: &'a DecodedImage,
    preprocessor: &'a Preprocessor,
    tensors: Vec<(InputSpec, PreprocessedImage)>,
}

impl<'a> PreparedInputs<'a> {
    fn new(source: &'a DecodedImage, preprocessor: &'a Preprocessor) -> Self {
        Self {
            source,
            preprocessor,
            tensors: Vec::new(),
        }
    }

    fn get(&mut self, spec: &InputSpec) -> &PreprocessedImage {
        let index = match self.tensors.iter().position(|(s, _)| s == spec) {
            Some(index) => index,
            None => {
                let image = self.preprocessor.prepare_decoded(self.source, spec);
                self.tensors.push((*spec, image));
                self.tensors.len() - 1
            }
        };
        &self.tensors[index].1
    }
}

/// Ensemble inference and explainability engine
///
/// Owns nothing per request; every call works on its own buffers and the
/// registry is shared read-only.
pub struct EnsembleEngine {
    registry: Arc<ModelRegistry>,
    preprocessor: Preprocessor,
    fusion: EnsembleFusion,
    saliency: SaliencyEngine,
    labels: Vec<String>,
    default_top_k: usize,
    metrics: Arc<EngineMetrics>,
}

impl EnsembleEngine {
    /// Load every configured backbone and build the engine
    pub fn new(config: &AppConfig) -> Self {
        Self::with_registry(config, ModelRegistry::load(config))
    }

    /// Build the engine around an existing registry
    pub fn with_registry(config: &AppConfig, registry: ModelRegistry) -> Self {
        let fusion = EnsembleFusion::new(
            ToxicityTable::new(&config.classes.toxicity),
            PlausibilityCheck::new(config.plausibility.clone()),
        );

        info!(
            backbones = registry.ready_count(),
            classes = config.classes.labels.len(),
            resize_policy = ?config.preprocessing.resize_policy,
            "Ensemble engine initialized"
        );

        Self {
            registry: Arc::new(registry),
            preprocessor: Preprocessor::new(&config.preprocessing),
            fusion,
            saliency: SaliencyEngine::new(config.saliency.default_alpha),
            labels: config.classes.labels.clone(),
            default_top_k: config.inference.default_top_k,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.registry.is_ready()
    }

    pub fn health(&self) -> RegistryHealth {
        self.registry.health()
    }

    /// Predict one image without a time budget
    pub fn predict(&self, bytes: &[u8], top_k: Option<usize>) -> Result<PredictionReport> {
        self.predict_within(bytes, top_k, &Deadline::unbounded())
    }

    /// Predict one image, failing with `ProcessingTimeout` once `deadline` passes
    pub fn predict_within(
        &self,
        bytes: &[u8],
        top_k: Option<usize>,
        deadline: &Deadline,
    ) -> Result<PredictionReport> {
        let started = Instant::now();
        let result = self
            .preprocessor
            .decode(bytes)
            .and_then(|image| self.ensemble(&image, top_k, deadline));

        let ensemble = match result {
            Ok(ensemble) => ensemble,
            Err(e) => {
                self.metrics.record_failure(e.kind());
                warn!(error = %e, "Prediction failed");
                return Err(e);
            }
        };

        let agreement = EnsembleFusion::agreement(&ensemble.models, &ensemble.top.label);
        let elapsed = started.elapsed();
        self.metrics.record_prediction(
            elapsed,
            ensemble.top.confidence,
            ensemble.top.toxicity.is_poisonous,
            ensemble.plausibility.is_likely_mushroom,
        );
        self.metrics.record_agreement(agreement);

        info!(
            label = %ensemble.top.label,
            confidence = ensemble.top.confidence,
            poisonous = ensemble.top.toxicity.is_poisonous,
            backbones = ensemble.models.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Prediction complete"
        );

        Ok(PredictionReport::new(
            &ensemble,
            self.fusion.toxicity(),
            |name| self.reported_accuracy(name),
            agreement,
        )
        .with_processing_time(elapsed))
    }

    /// Run every ready backbone on one decoded image and fuse the successes
    pub fn ensemble(
        &self,
        image: &DecodedImage,
        top_k: Option<usize>,
        deadline: &Deadline,
    ) -> Result<EnsemblePrediction> {
        let mut inputs = PreparedInputs::new(image, &self.preprocessor);
        let mut predictions: Vec<ModelPrediction> = Vec::new();
        let mut failures: Vec<BackboneFailure> = self
            .registry
            .failed()
            .into_iter()
            .map(|(backbone, message)| BackboneFailure {
                backbone,
                kind: ErrorKind::ModelLoad,
                message,
            })
            .collect();

        for backbone in self.registry.ready() {
            deadline.check()?;
            let name = backbone.name().to_string();
            let tensor = inputs.get(&backbone.descriptor().input);

            let started = Instant::now();
            let result = backbone.predict(tensor);
            self.metrics.record_backbone_time(&name, started.elapsed());

            match result {
                Ok(prediction) => predictions.push(prediction),
                Err(e) => {
                    error!(backbone = %name, error = %e, "Backbone dropped from fusion");
                    failures.push(BackboneFailure::new(&name, &e));
                }
            }
        }

        deadline.check()?;
        self.fusion
            .fuse(predictions, failures, top_k.unwrap_or(self.default_top_k))
    }

    /// Predict each upload in order, one image at a time
    ///
    /// Per-image failures are reported in place; only an expired deadline
    /// fails the whole batch.
    pub fn predict_batch(
        &self,
        uploads: &[ImageUpload],
        top_k: Option<usize>,
        deadline: &Deadline,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(uploads.len());

        for upload in uploads {
            deadline.check()?;
            let item = match self.predict_within(&upload.bytes, top_k, deadline) {
                Err(e @ EnsembleError::ProcessingTimeout { .. }) => return Err(e),
                result => BatchItem::from_result(&upload.filename, result),
            };
            debug!(filename = %upload.filename, success = item.success, "Batch item done");
            results.push(item);
        }

        let report = BatchReport::new(results, started.elapsed());
        info!(
            total = report.total,
            successful = report.successful,
            elapsed_ms = report.processing_time_ms,
            "Batch prediction complete"
        );
        Ok(report)
    }

    /// Saliency overlays for one backbone, or for every ready backbone
    pub fn saliency(
        &self,
        bytes: &[u8],
        alpha: Option<f32>,
        backbone: Option<&str>,
        target: Option<usize>,
        deadline: &Deadline,
    ) -> Result<SaliencyReport> {
        let started = Instant::now();
        let result = self.saliency_inner(bytes, alpha, backbone, target, deadline, started);
        if let Err(e) = &result {
            self.metrics.record_failure(e.kind());
            warn!(error = %e, "Saliency request failed");
        }
        result
    }

    fn saliency_inner(
        &self,
        bytes: &[u8],
        alpha: Option<f32>,
        backbone: Option<&str>,
        target: Option<usize>,
        deadline: &Deadline,
        started: Instant,
    ) -> Result<SaliencyReport> {
        let backbones = match backbone {
            Some(name) => vec![self.registry.get(name)?],
            None => self.registry.ready(),
        };
        if backbones.is_empty() {
            return Err(EnsembleError::NoValidPredictions(
                "no backbones available".to_string(),
            ));
        }
        if let Some(index) = target {
            if index >= self.labels.len() {
                return Err(EnsembleError::NotFound(format!("class index {}", index)));
            }
        }

        let image = self.preprocessor.decode(bytes)?;
        let outcomes = self.saliency.compute_all(
            &backbones,
            &self.preprocessor,
            &image,
            alpha,
            target,
            deadline,
        )?;

        let explanations: Vec<SaliencyEntry> =
            outcomes.into_iter().map(SaliencyEntry::from_outcome).collect();
        let report = SaliencyReport::new(
            self.saliency.resolve_alpha(alpha),
            explanations,
            started.elapsed(),
        );
        self.metrics.record_saliency(report.successful());

        info!(
            backbones = report.explanations.len(),
            successful = report.successful(),
            alpha = report.alpha,
            elapsed_ms = report.processing_time_ms,
            "Saliency complete"
        );
        Ok(report)
    }

    /// Static description of the ensemble
    pub fn model_info(&self) -> ModelInfo {
        let health = self.registry.health();
        ModelInfo {
            ensemble_type: "soft_voting".to_string(),
            num_models: health.loaded,
            models: health.backbones,
            num_classes: self.labels.len(),
            classes: self.labels.clone(),
        }
    }

    /// Every class with its toxicity
    pub fn classes(&self) -> ClassCatalogue {
        self.fusion.toxicity().catalogue(&self.labels)
    }

    fn reported_accuracy(&self, backbone: &str) -> Option<f64> {
        self.registry
            .get(backbone)
            .ok()
            .and_then(|b| b.descriptor().reported_accuracy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        assert!(Deadline::unbounded().check().is_ok());

        let expired = Deadline::after(Duration::ZERO);
        match expired.check() {
            Err(EnsembleError::ProcessingTimeout { budget_ms }) => assert_eq!(budget_ms, 0),
            other => panic!("unexpected: {other:?}"),
        }

        let generous = Deadline::after(Duration::from_secs(60));
        assert!(!generous.is_expired());
        assert_eq!(generous.budget_ms(), 60_000);
    }

    #[test]
    fn test_empty_registry_has_no_valid_predictions() {
        let config = AppConfig::default();
        let engine = EnsembleEngine::with_registry(&config, ModelRegistry::default());
        assert!(!engine.is_ready());

        let png = {
            let image = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
            let mut bytes = std::io::Cursor::new(Vec::new());
            image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
            bytes.into_inner()
        };
        let err = engine.predict(&png, None).unwrap_err();
        assert!(matches!(err, EnsembleError::NoValidPredictions(_)));
        assert_eq!(engine.metrics().total_failures(), 1);
    }

    #[test]
    fn test_model_info_and_classes() {
        let config = AppConfig::default();
        let engine = EnsembleEngine::with_registry(&config, ModelRegistry::default());
        let info = engine.model_info();
        assert_eq!(info.ensemble_type, "soft_voting");
        assert_eq!(info.num_models, 0);
        assert_eq!(info.num_classes, 11);

        let catalogue = engine.classes();
        assert_eq!(catalogue.total, 11);
        assert_eq!(catalogue.poisonous_count, 4);
    }
}
