//! Backbone capability model.
//!
//! A backbone is anything that can turn a preprocessed image into class
//! probabilities and, on request, hand back the last convolutional activation
//! map together with the gradient of one class score with respect to it.
//! Fusion and saliency only ever talk to [`Backbone`]; the concrete
//! architecture lives behind a [`FeatureExtractor`].

use crate::error::{EnsembleError, Result};
use crate::models::head::{ClassifierHead, HeadPass};
use crate::preprocessing::{InputSpec, PreprocessedImage};
use crate::types::prediction::ModelPrediction;
use ndarray::{Array3, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// Architecture family of a backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "resnet50")]
    ResNet50,
    #[serde(rename = "efficientnet_b0")]
    EfficientNetB0,
    #[serde(rename = "mobilenet_v3_large")]
    MobileNetV3Large,
    #[serde(rename = "custom")]
    Custom,
}

impl Architecture {
    /// Channels of the last convolutional stage for the stock torchvision networks
    pub fn feature_channels(&self) -> Option<usize> {
        match self {
            Architecture::ResNet50 => Some(2048),
            Architecture::EfficientNetB0 => Some(1280),
            Architecture::MobileNetV3Large => Some(960),
            Architecture::Custom => None,
        }
    }
}

/// Where a backbone runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

/// Lifecycle of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// Immutable identity and input contract of a loaded backbone
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneDescriptor {
    pub name: String,
    pub display_name: String,
    pub architecture: Architecture,
    pub input: InputSpec,
    /// Class labels in classifier output order
    pub labels: Vec<String>,
    pub device: Device,
    pub reported_accuracy: Option<f64>,
}

/// Produces the last convolutional activation map for a `[1, 3, S, S]` input
///
/// Implementations must not keep per-call state between invocations: the same
/// extractor is called concurrently from several requests.
pub trait FeatureExtractor: Send + Sync {
    /// Returns activations shaped `[C, h, w]`
    fn extract(&self, input: ArrayView4<f32>) -> Result<Array3<f32>>;
}

/// Activations and target-class gradients from one gradient-mode call
#[derive(Debug, Clone)]
pub struct ActivationGradients {
    /// `[C, h, w]`
    pub activations: Array3<f32>,
    /// d score[target] / d activations, same shape as `activations`
    pub gradients: Array3<f32>,
    pub target_index: usize,
    pub target_label: String,
}

/// Uniform interface over heterogeneous backbone architectures
pub trait Backbone: Send + Sync {
    fn descriptor(&self) -> &BackboneDescriptor;

    /// Forward pass only
    fn predict(&self, image: &PreprocessedImage) -> Result<ModelPrediction>;

    /// Forward pass plus activations and gradients for `target`
    /// (the backbone's own top class when `None`)
    fn predict_with_gradients(
        &self,
        image: &PreprocessedImage,
        target: Option<usize>,
    ) -> Result<(ModelPrediction, ActivationGradients)>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// Normalized exponential over raw class scores
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Gradient-tracking scope for a single call
///
/// Owns every intermediate buffer of the backward pass; dropping the scope
/// (normal return, `?` or panic unwinding) releases them and decrements the
/// backbone's active-scope counter.
pub struct GradientScope<'a> {
    backbone: &'a str,
    active: &'a AtomicUsize,
    pass: Option<HeadPass>,
}

impl<'a> GradientScope<'a> {
    pub fn enter(backbone: &'a str, active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            backbone,
            active,
            pass: None,
        }
    }

    /// Run the head and keep its intermediates for the backward pass
    pub fn forward(&mut self, head: &ClassifierHead, activations: ArrayView3<f32>) -> &HeadPass {
        self.pass.insert(head.forward(activations))
    }

    /// Gradient of `target`'s logit with respect to the activation map
    pub fn backward(
        &self,
        head: &ClassifierHead,
        target: usize,
        height: usize,
        width: usize,
    ) -> Result<Array3<f32>> {
        let pass = self.pass.as_ref().ok_or_else(|| {
            EnsembleError::inference(self.backbone, "backward pass requested before forward pass")
        })?;
        Ok(head.activation_gradient(pass, target, height, width))
    }
}

impl Drop for GradientScope<'_> {
    fn drop(&mut self) {
        self.pass = None;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backbone made of a feature extractor and a natively evaluated classifier head
pub struct HeadedBackbone {
    descriptor: BackboneDescriptor,
    extractor: Box<dyn FeatureExtractor>,
    head: ClassifierHead,
    active_scopes: AtomicUsize,
}

impl HeadedBackbone {
    /// Fails with `ModelLoad` when the head's class count differs from the label list
    pub fn new(
        descriptor: BackboneDescriptor,
        extractor: Box<dyn FeatureExtractor>,
        head: ClassifierHead,
    ) -> Result<Self> {
        if head.num_classes() != descriptor.labels.len() {
            return Err(EnsembleError::model_load(
                &descriptor.name,
                format!(
                    "classifier head has {} outputs but {} class labels are configured",
                    head.num_classes(),
                    descriptor.labels.len()
                ),
            ));
        }
        if let Some(channels) = descriptor.architecture.feature_channels() {
            if channels != head.in_features() {
                return Err(EnsembleError::model_load(
                    &descriptor.name,
                    format!(
                        "{:?} produces {} channels but the head expects {}",
                        descriptor.architecture,
                        channels,
                        head.in_features()
                    ),
                ));
            }
        }

        Ok(Self {
            descriptor,
            extractor,
            head,
            active_scopes: AtomicUsize::new(0),
        })
    }

    /// Gradient scopes currently open on this backbone
    pub fn active_gradient_scopes(&self) -> usize {
        self.active_scopes.load(Ordering::SeqCst)
    }

    fn activations(&self, image: &PreprocessedImage) -> Result<Array3<f32>> {
        let name = &self.descriptor.name;
        let expected = self.descriptor.input.size as usize;
        let shape = image.tensor.shape();
        if shape != [1, 3, expected, expected].as_slice() {
            return Err(EnsembleError::inference(
                name,
                format!("input tensor shape {:?} does not match {}x{}", shape, expected, expected),
            ));
        }

        let activations = self.extractor.extract(image.tensor.view())?;
        if activations.shape()[0] != self.head.in_features() {
            return Err(EnsembleError::inference(
                name,
                format!(
                    "feature extractor produced {} channels, head expects {}",
                    activations.shape()[0],
                    self.head.in_features()
                ),
            ));
        }
        if activations.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::inference(name, "non-finite activations"));
        }
        Ok(activations)
    }

    fn prediction(&self, logits: &[f32]) -> Result<ModelPrediction> {
        let name = &self.descriptor.name;
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::inference(name, "non-finite class scores"));
        }
        let probabilities = softmax(logits);
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(EnsembleError::inference(name, "non-finite probabilities"));
        }
        Ok(ModelPrediction::from_probabilities(
            name,
            &self.descriptor.display_name,
            &self.descriptor.labels,
            &probabilities,
        ))
    }
}

impl Backbone for HeadedBackbone {
    fn descriptor(&self) -> &BackboneDescriptor {
        &self.descriptor
    }

    fn predict(&self, image: &PreprocessedImage) -> Result<ModelPrediction> {
        let started = Instant::now();
        let activations = self.activations(image)?;
        let logits = self.head.forward(activations.view()).logits.to_vec();
        let prediction = self.prediction(&logits)?;

        debug!(
            backbone = %self.descriptor.name,
            label = %prediction.top.label,
            confidence = prediction.top.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backbone prediction complete"
        );
        Ok(prediction)
    }

    fn predict_with_gradients(
        &self,
        image: &PreprocessedImage,
        target: Option<usize>,
    ) -> Result<(ModelPrediction, ActivationGradients)> {
        let name = &self.descriptor.name;
        let activations = self.activations(image)?;
        let (height, width) = (activations.shape()[1], activations.shape()[2]);

        let mut scope = GradientScope::enter(name, &self.active_scopes);
        let logits = scope.forward(&self.head, activations.view()).logits.to_vec();
        let prediction = self.prediction(&logits)?;

        let target_index = target.unwrap_or(prediction.top_index);
        let target_label = self
            .descriptor
            .labels
            .get(target_index)
            .cloned()
            .ok_or_else(|| {
                EnsembleError::inference(
                    name,
                    format!(
                        "target class {} out of range for {} classes",
                        target_index,
                        self.descriptor.labels.len()
                    ),
                )
            })?;

        let gradients = scope.backward(&self.head, target_index, height, width)?;
        if gradients.iter().any(|g| !g.is_finite()) {
            return Err(EnsembleError::inference(name, "non-finite gradients"));
        }
        drop(scope);

        debug!(
            backbone = %name,
            target = %target_label,
            activation_shape = ?activations.shape(),
            "Gradient pass complete"
        );

        Ok((
            prediction,
            ActivationGradients {
                activations,
                gradients,
                target_index,
                target_label,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::head::DenseLayer;
    use ndarray::{Array1, Array2, Array4};

    /// Emits the per-channel mean of the input on a 2×2 grid
    struct ChannelMean;

    impl FeatureExtractor for ChannelMean {
        fn extract(&self, input: ArrayView4<f32>) -> Result<Array3<f32>> {
            let mut out = Array3::zeros((3, 2, 2));
            for c in 0..3 {
                let mean = input.index_axis(ndarray::Axis(1), c).mean().unwrap_or(0.0);
                out.index_axis_mut(ndarray::Axis(0), c).fill(mean);
            }
            Ok(out)
        }
    }

    struct Exploding;

    impl FeatureExtractor for Exploding {
        fn extract(&self, _input: ArrayView4<f32>) -> Result<Array3<f32>> {
            Ok(Array3::from_elem((3, 2, 2), f32::NAN))
        }
    }

    fn descriptor(labels: &[&str]) -> BackboneDescriptor {
        BackboneDescriptor {
            name: "tiny".to_string(),
            display_name: "Tiny".to_string(),
            architecture: Architecture::Custom,
            input: InputSpec::imagenet(8),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            device: Device::Cpu,
            reported_accuracy: None,
        }
    }

    fn identity_head() -> ClassifierHead {
        ClassifierHead::linear(DenseLayer::new(Array2::eye(3), Array1::zeros(3))).unwrap()
    }

    fn image_with_red(value: f32) -> PreprocessedImage {
        let mut tensor = Array4::zeros((1, 3, 8, 8));
        tensor.index_axis_mut(ndarray::Axis(1), 0).fill(value);
        PreprocessedImage {
            tensor,
            original_width: 8,
            original_height: 8,
        }
    }

    #[test]
    fn test_softmax_is_normalized_and_stable() {
        let probs = softmax(&[1000.0, 1000.0, 999.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!((probs[0] - probs[1]).abs() < 1e-6);
        assert!(probs[2] < probs[0]);
    }

    #[test]
    fn test_label_count_mismatch_is_load_error() {
        let err = HeadedBackbone::new(
            descriptor(&["A", "B"]),
            Box::new(ChannelMean),
            identity_head(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EnsembleError::ModelLoad { .. }));
    }

    #[test]
    fn test_architecture_channel_check() {
        let mut desc = descriptor(&["A", "B", "C"]);
        desc.architecture = Architecture::ResNet50;
        let result = HeadedBackbone::new(desc, Box::new(ChannelMean), identity_head());
        assert!(matches!(result, Err(EnsembleError::ModelLoad { .. })));
    }

    #[test]
    fn test_predict_ranks_classes() {
        let backbone =
            HeadedBackbone::new(descriptor(&["A", "B", "C"]), Box::new(ChannelMean), identity_head())
                .unwrap();
        let prediction = backbone.predict(&image_with_red(4.0)).unwrap();
        assert_eq!(prediction.top.label, "A");
        assert_eq!(prediction.top_index, 0);
        let total: f64 = prediction.probabilities.iter().map(|p| p.confidence).sum();
        assert!((total - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_gradients_for_explicit_target() {
        let backbone =
            HeadedBackbone::new(descriptor(&["A", "B", "C"]), Box::new(ChannelMean), identity_head())
                .unwrap();
        let (prediction, grads) = backbone
            .predict_with_gradients(&image_with_red(4.0), Some(2))
            .unwrap();

        assert_eq!(prediction.top.label, "A");
        assert_eq!(grads.target_index, 2);
        assert_eq!(grads.target_label, "C");
        assert_eq!(grads.gradients.shape(), grads.activations.shape());
        // identity head: only channel 2 influences logit 2, spread over 4 cells
        assert!((grads.gradients[[2, 0, 0]] - 0.25).abs() < 1e-6);
        assert_eq!(grads.gradients[[0, 1, 1]], 0.0);
        assert_eq!(backbone.active_gradient_scopes(), 0);
    }

    #[test]
    fn test_non_finite_output_is_inference_error() {
        let backbone =
            HeadedBackbone::new(descriptor(&["A", "B", "C"]), Box::new(Exploding), identity_head())
                .unwrap();
        let err = backbone.predict(&image_with_red(1.0)).unwrap_err();
        assert!(matches!(err, EnsembleError::Inference { .. }));
    }

    #[test]
    fn test_scope_released_on_error() {
        let backbone =
            HeadedBackbone::new(descriptor(&["A", "B", "C"]), Box::new(ChannelMean), identity_head())
                .unwrap();
        let err = backbone
            .predict_with_gradients(&image_with_red(1.0), Some(7))
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Inference { .. }));
        assert_eq!(backbone.active_gradient_scopes(), 0);
    }

    #[test]
    fn test_wrong_input_size_is_rejected() {
        let backbone =
            HeadedBackbone::new(descriptor(&["A", "B", "C"]), Box::new(ChannelMean), identity_head())
                .unwrap();
        let image = PreprocessedImage {
            tensor: Array4::zeros((1, 3, 16, 16)),
            original_width: 16,
            original_height: 16,
        };
        assert!(matches!(
            backbone.predict(&image),
            Err(EnsembleError::Inference { .. })
        ));
    }
}
