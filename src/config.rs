//! Configuration management for the ensemble engine

use crate::error::EnsembleError;
use crate::models::backbone::{Architecture, Device};
use crate::preprocessing::{ResizeFilter, ResizePolicy};
use crate::toxicity::{ToxicityCode, ToxicityEntry};
use crate::types::prediction::ConfidenceLevelThresholds;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// ImageNet channel statistics the backbones were trained with
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub classes: ClassesConfig,
    pub preprocessing: PreprocessingConfig,
    pub inference: InferenceConfig,
    pub saliency: SaliencyConfig,
    pub plausibility: PlausibilityConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Backbone weights and runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory that relative weight paths are resolved against
    pub models_dir: String,
    /// Intra-op threads per ONNX session
    pub onnx_threads: usize,
    /// Sessions kept per backbone so concurrent requests never share scratch buffers
    pub sessions_per_backbone: usize,
    /// Execution device for every backbone
    pub device: Device,
    /// CUDA ordinal when `device = "cuda"`
    pub cuda_device_id: i32,
    pub backbones: Vec<BackboneSpec>,
}

/// Description of one trained backbone
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BackboneSpec {
    /// Registry key, e.g. `resnet50`
    pub name: String,
    /// Human readable name, e.g. `ResNet50`
    #[serde(default)]
    pub display_name: Option<String>,
    pub architecture: Architecture,
    /// ONNX graph producing the last convolutional activation map `[1, C, h, w]`
    pub feature_model: String,
    /// Safetensors file with the classifier head weights
    pub head_weights: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    /// Validation accuracy recorded at training time (informational)
    #[serde(default)]
    pub reported_accuracy: Option<f64>,
    /// Output to read activations from; first output when unset
    #[serde(default)]
    pub feature_output: Option<String>,
}

fn default_input_size() -> u32 {
    224
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl BackboneSpec {
    pub fn new(name: &str, architecture: Architecture) -> Self {
        Self {
            name: name.to_string(),
            display_name: None,
            architecture,
            feature_model: format!("{}_features.onnx", name),
            head_weights: format!("{}_head.safetensors", name),
            input_size: default_input_size(),
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            reported_accuracy: None,
            feature_output: None,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn with_reported_accuracy(mut self, accuracy: f64) -> Self {
        self.reported_accuracy = Some(accuracy);
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn feature_model_path(&self, models_dir: &Path) -> PathBuf {
        resolve(models_dir, &self.feature_model)
    }

    pub fn head_weights_path(&self, models_dir: &Path) -> PathBuf {
        resolve(models_dir, &self.head_weights)
    }
}

fn resolve(models_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        models_dir.join(path)
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: "models".to_string(),
            onnx_threads: 1,
            sessions_per_backbone: 2,
            device: Device::Cpu,
            cuda_device_id: 0,
            backbones: default_backbones(),
        }
    }
}

fn default_backbones() -> Vec<BackboneSpec> {
    vec![
        BackboneSpec::new("resnet50", Architecture::ResNet50)
            .with_display_name("ResNet50")
            .with_reported_accuracy(91.59),
        BackboneSpec::new("efficientnet_b0", Architecture::EfficientNetB0)
            .with_display_name("EfficientNet-B0")
            .with_reported_accuracy(88.33),
        BackboneSpec::new("mobilenet_v3_large", Architecture::MobileNetV3Large)
            .with_display_name("MobileNetV3-Large")
            .with_reported_accuracy(87.64),
    ]
}

/// Ordered class labels and the toxicity lookup table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassesConfig {
    /// Class labels in the order of the classifier outputs
    pub labels: Vec<String>,
    pub toxicity: Vec<ToxicityEntry>,
}

pub const DEFAULT_CLASSES: [&str; 11] = [
    "Agaricus",
    "Amanita",
    "Boletus",
    "Cortinarius",
    "Entoloma",
    "Hygrocybe",
    "Lactarius",
    "Russula",
    "Suillus",
    "Exidia",
    "Inocybe",
];

const POISONOUS_GENERA: [&str; 4] = ["Amanita", "Cortinarius", "Entoloma", "Inocybe"];

impl Default for ClassesConfig {
    fn default() -> Self {
        let toxicity = DEFAULT_CLASSES
            .iter()
            .map(|genus| {
                let code = if POISONOUS_GENERA.contains(genus) {
                    ToxicityCode::Poisonous
                } else {
                    ToxicityCode::Edible
                };
                ToxicityEntry::with_default_text(genus, code)
            })
            .collect();

        Self {
            labels: DEFAULT_CLASSES.iter().map(|s| s.to_string()).collect(),
            toxicity,
        }
    }
}

/// Preprocessing policy; must match the training-time transforms
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub resize_policy: ResizePolicy,
    pub filter: ResizeFilter,
}

/// Request handling configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of fused predictions returned when the caller gives none
    pub default_top_k: usize,
    /// Number of requests processed concurrently
    pub workers: usize,
    /// Budget for a single prediction or saliency request
    pub request_timeout_ms: u64,
    /// Budget added per image of a batch
    pub batch_timeout_per_image_ms: u64,
    pub max_batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_top_k: 3,
            workers: 4,
            request_timeout_ms: 30_000,
            batch_timeout_per_image_ms: 15_000,
            max_batch_size: 10,
        }
    }
}

/// Saliency overlay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    pub default_alpha: f32,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            default_alpha: 0.45,
        }
    }
}

/// Thresholds used by the content-plausibility check (percent)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlausibilityConfig {
    /// Top confidence below this is flagged as low confidence
    pub low_confidence: f64,
    /// Top confidence below this is treated as "probably not a mushroom"
    pub very_low_confidence: f64,
    /// Top-two confidences closer than this are ambiguous
    pub ambiguity_margin: f64,
    pub levels: ConfidenceLevelThresholds,
}

impl Default for PlausibilityConfig {
    fn default() -> Self {
        Self {
            low_confidence: 40.0,
            very_low_confidence: 25.0,
            ambiguity_margin: 5.0,
            levels: ConfidenceLevelThresholds::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between summaries; 0 disables the reporter
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path, layered with `MUSHROOM__*` environment variables
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("MUSHROOM").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app.validate()?;
        Ok(app)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> std::result::Result<(), EnsembleError> {
        if self.classes.labels.is_empty() {
            return Err(EnsembleError::Config("class label list is empty".into()));
        }
        let mut seen = HashSet::new();
        for label in &self.classes.labels {
            if !seen.insert(label.as_str()) {
                return Err(EnsembleError::Config(format!(
                    "duplicate class label '{}'",
                    label
                )));
            }
        }

        let mut names = HashSet::new();
        for spec in &self.models.backbones {
            if !names.insert(spec.name.as_str()) {
                return Err(EnsembleError::Config(format!(
                    "duplicate backbone name '{}'",
                    spec.name
                )));
            }
            if spec.input_size == 0 {
                return Err(EnsembleError::Config(format!(
                    "backbone '{}' has zero input size",
                    spec.name
                )));
            }
            if spec.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err(EnsembleError::Config(format!(
                    "backbone '{}' has an invalid normalization std",
                    spec.name
                )));
            }
        }

        if self.inference.default_top_k == 0 {
            return Err(EnsembleError::Config("default_top_k must be at least 1".into()));
        }
        if self.inference.workers == 0 {
            return Err(EnsembleError::Config("workers must be at least 1".into()));
        }
        if self.models.sessions_per_backbone == 0 {
            return Err(EnsembleError::Config(
                "sessions_per_backbone must be at least 1".into(),
            ));
        }
        if self.plausibility.very_low_confidence > self.plausibility.low_confidence {
            return Err(EnsembleError::Config(
                "very_low_confidence must not exceed low_confidence".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.models.backbones.len(), 3);
        assert_eq!(config.classes.labels.len(), 11);
        assert_eq!(config.classes.toxicity.len(), 11);
        assert_eq!(config.inference.default_top_k, 3);
        assert_eq!(config.saliency.default_alpha, 0.45);
        assert_eq!(config.preprocessing.resize_policy, ResizePolicy::Stretch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_backbones() {
        let config = AppConfig::default();
        let resnet = &config.models.backbones[0];
        assert_eq!(resnet.name, "resnet50");
        assert_eq!(resnet.display_name(), "ResNet50");
        assert_eq!(resnet.reported_accuracy, Some(91.59));
        assert_eq!(resnet.input_size, 224);
        assert_eq!(
            resnet.feature_model_path(Path::new("models")),
            PathBuf::from("models/resnet50_features.onnx")
        );
    }

    #[test]
    fn test_absolute_weight_paths_are_kept() {
        let mut spec = BackboneSpec::new("tiny", Architecture::Custom);
        spec.head_weights = "/opt/weights/tiny.safetensors".to_string();
        assert_eq!(
            spec.head_weights_path(Path::new("models")),
            PathBuf::from("/opt/weights/tiny.safetensors")
        );
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = AppConfig::default();
        config.classes.labels.push("Amanita".to_string());
        assert!(matches!(config.validate(), Err(EnsembleError::Config(_))));

        let mut config = AppConfig::default();
        let dup = config.models.backbones[0].clone();
        config.models.backbones.push(dup);
        assert!(matches!(config.validate(), Err(EnsembleError::Config(_))));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[inference]
default_top_k = 5

[plausibility]
ambiguity_margin = 2.5

[[models.backbones]]
name = "tiny"
architecture = "custom"
feature_model = "tiny.onnx"
head_weights = "tiny.safetensors"
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.inference.default_top_k, 5);
        assert_eq!(config.inference.workers, 4);
        assert_eq!(config.plausibility.ambiguity_margin, 2.5);
        assert_eq!(config.plausibility.low_confidence, 40.0);
        assert_eq!(config.models.backbones.len(), 1);
        assert_eq!(config.models.backbones[0].mean, IMAGENET_MEAN);
    }
}
