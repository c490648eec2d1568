//! Bounded async front of the ensemble engine
//!
//! Requests run on tokio's blocking pool, at most `workers` at a time. Each
//! request gets a wall-clock budget: the engine checks it between backbones,
//! and the caller stops waiting once it has passed.

use crate::config::InferenceConfig;
use crate::error::{EnsembleError, Result};
use crate::models::inference::{Deadline, EnsembleEngine};
use crate::types::report::{BatchReport, PredictionReport, SaliencyReport};
use crate::types::upload::ImageUpload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Concurrency-limited, deadline-enforcing wrapper around [`EnsembleEngine`]
#[derive(Clone)]
pub struct EnsembleService {
    engine: Arc<EnsembleEngine>,
    semaphore: Arc<Semaphore>,
    request_budget: Duration,
    per_image_budget: Duration,
    max_batch_size: usize,
}

impl EnsembleService {
    pub fn new(engine: Arc<EnsembleEngine>, config: &InferenceConfig) -> Self {
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(config.workers.max(1))),
            request_budget: Duration::from_millis(config.request_timeout_ms),
            per_image_budget: Duration::from_millis(config.batch_timeout_per_image_ms),
            max_batch_size: config.max_batch_size,
        }
    }

    pub fn engine(&self) -> &Arc<EnsembleEngine> {
        &self.engine
    }

    /// Workers currently free
    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn predict(&self, bytes: Vec<u8>, top_k: Option<usize>) -> Result<PredictionReport> {
        self.run(self.request_budget, move |engine, deadline| {
            engine.predict_within(&bytes, top_k, deadline)
        })
        .await
    }

    /// Batches are rejected up front when larger than `max_batch_size`
    pub async fn predict_batch(
        &self,
        uploads: Vec<ImageUpload>,
        top_k: Option<usize>,
    ) -> Result<BatchReport> {
        if uploads.is_empty() {
            return Err(EnsembleError::InvalidImage("batch contains no images".into()));
        }
        if uploads.len() > self.max_batch_size {
            return Err(EnsembleError::InvalidImage(format!(
                "batch of {} images exceeds the limit of {}",
                uploads.len(),
                self.max_batch_size
            )));
        }

        let budget = self.per_image_budget * uploads.len() as u32;
        self.run(budget, move |engine, deadline| {
            engine.predict_batch(&uploads, top_k, deadline)
        })
        .await
    }

    pub async fn saliency(
        &self,
        bytes: Vec<u8>,
        alpha: Option<f32>,
        backbone: Option<String>,
        target: Option<usize>,
    ) -> Result<SaliencyReport> {
        self.run(self.request_budget, move |engine, deadline| {
            engine.saliency(&bytes, alpha, backbone.as_deref(), target, deadline)
        })
        .await
    }

    async fn run<T, F>(&self, budget: Duration, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EnsembleEngine, &Deadline) -> Result<T> + Send + 'static,
    {
        let timeout = EnsembleError::ProcessingTimeout {
            budget_ms: budget.as_millis() as u64,
        };
        let deadline = Deadline::after(budget);

        // Waiting for a worker counts against the budget
        let permit = match tokio::time::timeout(budget, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EnsembleError::inference("service", "worker pool closed")),
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "No worker available within budget");
                return Err(timeout);
            }
        };

        let engine = self.engine.clone();
        let handle = tokio::task::spawn_blocking(move || {
            // Held until the job really finishes, even if the caller gave up
            let _permit = permit;
            job(&engine, &deadline)
        });

        let remaining = deadline.remaining();
        match tokio::time::timeout(remaining, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "Worker task failed");
                Err(EnsembleError::inference("service", "worker task failed"))
            }
            Err(_) => {
                debug!(budget_ms = budget.as_millis() as u64, "Request exceeded its budget");
                Err(timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::registry::ModelRegistry;

    fn service(max_batch_size: usize) -> EnsembleService {
        let config = AppConfig::default();
        let engine = EnsembleEngine::with_registry(&config, ModelRegistry::default());
        let inference = InferenceConfig {
            max_batch_size,
            ..InferenceConfig::default()
        };
        EnsembleService::new(Arc::new(engine), &inference)
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected() {
        let service = service(2);
        let uploads = (0..3)
            .map(|i| ImageUpload::new(format!("{i}.jpg"), vec![0u8; 4]))
            .collect();
        let err = service.predict_batch(uploads, None).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(service.engine().metrics().total_failures(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_are_invalid_image() {
        let service = service(10);
        let err = service.predict(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10], None).await.unwrap_err();
        assert!(matches!(err, EnsembleError::InvalidImage(_)));
        assert_eq!(service.available_workers(), 4);
    }

    #[tokio::test]
    async fn test_unknown_backbone_saliency() {
        let service = service(10);
        let err = service
            .saliency(vec![0u8; 16], None, Some("vgg16".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::NotFound(_)));
    }
}
