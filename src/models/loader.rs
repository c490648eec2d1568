//! ONNX feature-extractor loader

use crate::config::{BackboneSpec, ModelsConfig};
use crate::error::{EnsembleError, Result};
use crate::models::backbone::{BackboneDescriptor, Device, FeatureExtractor, HeadedBackbone};
use crate::models::head::ClassifierHead;
use crate::preprocessing::InputSpec;
use ndarray::{Array3, ArrayView4};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Convolutional trunk of a backbone running in ONNX Runtime
///
/// `Session::run` needs exclusive access, so each backbone keeps a small pool
/// of sessions and every call runs on its own one.
pub struct OnnxFeatureExtractor {
    name: String,
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
    input_name: String,
    output_name: String,
}

impl OnnxFeatureExtractor {
    /// Take a free session, or wait on one picked round-robin
    fn acquire(&self) -> Result<MutexGuard<'_, Session>> {
        for session in &self.sessions {
            if let Ok(guard) = session.try_lock() {
                return Ok(guard);
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        self.sessions[index]
            .lock()
            .map_err(|_| EnsembleError::inference(&self.name, "session lock poisoned"))
    }
}

impl FeatureExtractor for OnnxFeatureExtractor {
    fn extract(&self, input: ArrayView4<f32>) -> Result<Array3<f32>> {
        let tensor = TensorRef::from_array_view(input).map_err(|e| {
            error!(backbone = %self.name, error = %e, "Failed to create input tensor");
            EnsembleError::inference(&self.name, "could not create input tensor")
        })?;

        let mut session = self.acquire()?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| {
                error!(backbone = %self.name, error = %e, "ONNX Runtime call failed");
                EnsembleError::inference(&self.name, "feature extractor run failed")
            })?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            EnsembleError::inference(
                &self.name,
                format!("missing output '{}'", self.output_name),
            )
        })?;
        let (shape, data) = output.try_extract_tensor::<f32>().map_err(|e| {
            error!(backbone = %self.name, error = %e, "Failed to extract activations");
            EnsembleError::inference(&self.name, "activation output is not an f32 tensor")
        })?;

        activations_from_output(&self.name, shape, data)
    }
}

/// Reshape a raw `[1, C, h, w]` runtime output into a `[C, h, w]` map
fn activations_from_output(backbone: &str, shape: &[i64], data: &[f32]) -> Result<Array3<f32>> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    if dims.len() != 4 || dims[0] != 1 {
        return Err(EnsembleError::inference(
            backbone,
            format!("expected activations shaped [1, C, h, w], got {:?}", dims),
        ));
    }
    Array3::from_shape_vec((dims[1], dims[2], dims[3]), data.to_vec()).map_err(|e| {
        error!(backbone = %backbone, error = %e, "Activation buffer does not match its shape");
        EnsembleError::inference(backbone, "activation output has an inconsistent size")
    })
}

/// Loader for ONNX feature extractors and their classifier heads
pub struct ModelLoader {
    models_dir: PathBuf,
    /// Number of threads for ONNX inference
    onnx_threads: usize,
    sessions_per_backbone: usize,
    device: Device,
    cuda_device_id: i32,
}

impl ModelLoader {
    pub fn new(config: &ModelsConfig) -> Self {
        // Repeated initialisation is harmless; the first committed environment wins
        if let Err(e) = ort::init().with_name("mushroom-ensemble").commit() {
            warn!(error = %e, "ONNX Runtime environment could not be committed");
        }
        info!(
            onnx_threads = config.onnx_threads,
            sessions = config.sessions_per_backbone,
            device = ?config.device,
            "ONNX Runtime initialized"
        );
        Self {
            models_dir: PathBuf::from(&config.models_dir),
            onnx_threads: config.onnx_threads.max(1),
            sessions_per_backbone: config.sessions_per_backbone.max(1),
            device: config.device,
            cuda_device_id: config.cuda_device_id,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Load one backbone: session pool for the trunk plus the safetensors head
    pub fn load_backbone(&self, spec: &BackboneSpec, labels: &[String]) -> Result<HeadedBackbone> {
        let feature_path = spec.feature_model_path(&self.models_dir);
        let head_path = spec.head_weights_path(&self.models_dir);

        info!(
            backbone = %spec.name,
            path = %feature_path.display(),
            threads = self.onnx_threads,
            "Loading backbone"
        );

        for path in [&feature_path, &head_path] {
            if !path.exists() {
                warn!(backbone = %spec.name, path = %path.display(), "Weight file not found");
                return Err(EnsembleError::model_load(
                    &spec.name,
                    format!("weight file not found: {}", path.display()),
                ));
            }
        }

        let head = ClassifierHead::from_safetensors(&spec.name, &head_path)?;
        let extractor = self.load_extractor(spec, &feature_path)?;

        let descriptor = BackboneDescriptor {
            name: spec.name.clone(),
            display_name: spec.display_name().to_string(),
            architecture: spec.architecture,
            input: InputSpec {
                size: spec.input_size,
                mean: spec.mean,
                std: spec.std,
            },
            labels: labels.to_vec(),
            device: self.device,
            reported_accuracy: spec.reported_accuracy,
        };
        let backbone = HeadedBackbone::new(descriptor, Box::new(extractor), head)?;

        info!(backbone = %spec.name, "Backbone loaded successfully");
        Ok(backbone)
    }

    fn load_extractor(&self, spec: &BackboneSpec, path: &Path) -> Result<OnnxFeatureExtractor> {
        let mut sessions = Vec::with_capacity(self.sessions_per_backbone);
        for _ in 0..self.sessions_per_backbone {
            sessions.push(self.create_session(&spec.name, path)?);
        }

        let first = &sessions[0];
        let input_name = first
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| EnsembleError::model_load(&spec.name, "model has no inputs"))?;

        let output_name = match &spec.feature_output {
            Some(wanted) => first
                .outputs
                .iter()
                .find(|o| &o.name == wanted)
                .map(|o| o.name.clone())
                .ok_or_else(|| {
                    EnsembleError::model_load(
                        &spec.name,
                        format!("model has no output named '{}'", wanted),
                    )
                })?,
            None => first
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| EnsembleError::model_load(&spec.name, "model has no outputs"))?,
        };

        debug!(
            backbone = %spec.name,
            input = %input_name,
            output = %output_name,
            sessions = sessions.len(),
            "Feature extractor ready"
        );

        Ok(OnnxFeatureExtractor {
            name: spec.name.clone(),
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            input_name,
            output_name,
        })
    }

    fn create_session(&self, backbone: &str, path: &Path) -> Result<Session> {
        let builder = Session::builder()
            .map_err(|e| session_error(backbone, path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error(backbone, path, e))?
            .with_intra_threads(self.onnx_threads)
            .map_err(|e| session_error(backbone, path, e))?;

        let builder = match self.device {
            Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
            Device::Cuda => builder.with_execution_providers([
                CUDAExecutionProvider::default()
                    .with_device_id(self.cuda_device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ]),
        }
        .map_err(|e| session_error(backbone, path, e))?;

        builder
            .commit_from_file(path)
            .map_err(|e| session_error(backbone, path, e))
    }
}

/// Log the runtime's message and return a sanitized load error
fn session_error(backbone: &str, path: &Path, e: impl std::fmt::Display) -> EnsembleError {
    error!(backbone = %backbone, path = %path.display(), error = %e, "Failed to create session");
    EnsembleError::model_load(backbone, "ONNX model could not be loaded")
}
