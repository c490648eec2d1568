//! Classifier head evaluated natively on top of the backbone activations.
//!
//! The trained networks end in global-average-pool → Dropout → Linear(C→512) →
//! ReLU → Dropout → Linear(512→K). Dropout is the identity at inference, so the
//! head is two dense layers. Keeping it out of the ONNX graph lets us
//! back-propagate a class logit to the last convolutional activations exactly,
//! without a training runtime.

use crate::error::{EnsembleError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};
use safetensors::{Dtype, SafeTensors};
use std::path::Path;
use tracing::debug;

/// Fully connected layer, `weight` is `[out, in]`
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLayer {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseLayer {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(input) + &self.bias
    }
}

/// Intermediate values of one head evaluation, owned by the calling request
#[derive(Debug, Clone)]
pub struct HeadPass {
    pub pooled: Array1<f32>,
    /// Hidden pre-activations, `None` for a single-layer head
    pub hidden: Option<Array1<f32>>,
    pub logits: Array1<f32>,
}

/// GAP → [Linear → ReLU] → Linear
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierHead {
    hidden: Option<DenseLayer>,
    output: DenseLayer,
}

// PyTorch state-dict names of the two linear layers inside `nn.Sequential`
const HIDDEN_WEIGHT: &str = "classifier.1.weight";
const HIDDEN_BIAS: &str = "classifier.1.bias";
const OUTPUT_WEIGHT: &str = "classifier.4.weight";
const OUTPUT_BIAS: &str = "classifier.4.bias";
const LINEAR_WEIGHT: &str = "classifier.weight";
const LINEAR_BIAS: &str = "classifier.bias";
// Prefix left behind by compiled training checkpoints
const COMPILED_PREFIX: &str = "_orig_mod.";

impl ClassifierHead {
    /// Two-layer head
    pub fn mlp(hidden: DenseLayer, output: DenseLayer) -> std::result::Result<Self, String> {
        validate_layer(&hidden)?;
        validate_layer(&output)?;
        if hidden.out_features() != output.in_features() {
            return Err(format!(
                "hidden layer produces {} features but output layer expects {}",
                hidden.out_features(),
                output.in_features()
            ));
        }
        Ok(Self {
            hidden: Some(hidden),
            output,
        })
    }

    /// Single linear layer
    pub fn linear(output: DenseLayer) -> std::result::Result<Self, String> {
        validate_layer(&output)?;
        Ok(Self {
            hidden: None,
            output,
        })
    }

    /// Load head weights from a safetensors file
    pub fn from_safetensors(backbone: &str, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            EnsembleError::model_load(
                backbone,
                format!("cannot read head weights {}: {}", path.display(), e),
            )
        })?;
        Self::from_safetensors_bytes(backbone, &bytes)
    }

    pub fn from_safetensors_bytes(backbone: &str, bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes).map_err(|e| {
            EnsembleError::model_load(backbone, format!("corrupt head weights: {}", e))
        })?;

        let head = Self::from_tensors(&tensors)
            .map_err(|reason| EnsembleError::model_load(backbone, reason))?;

        debug!(
            backbone = %backbone,
            in_features = head.in_features(),
            classes = head.num_classes(),
            hidden = head.hidden.as_ref().map(|h| h.out_features()),
            "Classifier head loaded"
        );
        Ok(head)
    }

    /// Two-layer head when the output layer sits at `classifier.4`, single linear otherwise
    fn from_tensors(tensors: &SafeTensors) -> std::result::Result<Self, String> {
        if has_tensor(tensors, OUTPUT_WEIGHT) {
            let hidden = DenseLayer::new(
                read_matrix(tensors, HIDDEN_WEIGHT)?,
                read_vector(tensors, HIDDEN_BIAS)?,
            );
            let output = DenseLayer::new(
                read_matrix(tensors, OUTPUT_WEIGHT)?,
                read_vector(tensors, OUTPUT_BIAS)?,
            );
            Self::mlp(hidden, output)
        } else {
            let output = DenseLayer::new(
                read_matrix(tensors, LINEAR_WEIGHT)?,
                read_vector(tensors, LINEAR_BIAS)?,
            );
            Self::linear(output)
        }
    }

    /// Channels expected from the feature extractor
    pub fn in_features(&self) -> usize {
        self.hidden
            .as_ref()
            .map(|h| h.in_features())
            .unwrap_or_else(|| self.output.in_features())
    }

    pub fn num_classes(&self) -> usize {
        self.output.out_features()
    }

    /// Evaluate the head on a `[C, h, w]` activation map
    pub fn forward(&self, activations: ArrayView3<f32>) -> HeadPass {
        let spatial = (activations.shape()[1] * activations.shape()[2]).max(1) as f32;
        let pooled = activations.sum_axis(Axis(2)).sum_axis(Axis(1)) / spatial;

        match &self.hidden {
            Some(hidden) => {
                let pre = hidden.forward(&pooled);
                let activated = pre.mapv(|v| v.max(0.0));
                let logits = self.output.forward(&activated);
                HeadPass {
                    pooled,
                    hidden: Some(pre),
                    logits,
                }
            }
            None => {
                let logits = self.output.forward(&pooled);
                HeadPass {
                    pooled,
                    hidden: None,
                    logits,
                }
            }
        }
    }

    /// d logit[target] / d pooled features
    pub fn pooled_gradient(&self, pass: &HeadPass, target: usize) -> Array1<f32> {
        let upstream = self.output.weight.row(target).to_owned();
        match (&self.hidden, &pass.hidden) {
            (Some(hidden), Some(pre)) => {
                let masked = &upstream * &pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                hidden.weight.t().dot(&masked)
            }
            _ => upstream,
        }
    }

    /// d logit[target] / d activations, shaped like the activation map
    ///
    /// Global average pooling spreads each channel's gradient evenly over its
    /// `h × w` positions.
    pub fn activation_gradient(
        &self,
        pass: &HeadPass,
        target: usize,
        height: usize,
        width: usize,
    ) -> Array3<f32> {
        let per_channel = self.pooled_gradient(pass, target) / (height * width).max(1) as f32;
        let mut gradient = Array3::<f32>::zeros((per_channel.len(), height, width));
        for (mut plane, &g) in gradient.outer_iter_mut().zip(per_channel.iter()) {
            plane.fill(g);
        }
        gradient
    }
}

fn validate_layer(layer: &DenseLayer) -> std::result::Result<(), String> {
    if layer.weight.nrows() == 0 || layer.weight.ncols() == 0 {
        return Err("dense layer has an empty weight matrix".to_string());
    }
    if layer.bias.len() != layer.out_features() {
        return Err(format!(
            "bias has {} entries but weight has {} rows",
            layer.bias.len(),
            layer.out_features()
        ));
    }
    if layer.weight.iter().chain(layer.bias.iter()).any(|v| !v.is_finite()) {
        return Err("dense layer contains non-finite weights".to_string());
    }
    Ok(())
}

fn has_tensor(tensors: &SafeTensors, name: &str) -> bool {
    tensors.tensor(name).is_ok() || tensors.tensor(&format!("{COMPILED_PREFIX}{name}")).is_ok()
}

fn read_f32(
    tensors: &SafeTensors,
    name: &str,
) -> std::result::Result<(Vec<usize>, Vec<f32>), String> {
    let view = tensors
        .tensor(name)
        .or_else(|_| tensors.tensor(&format!("{COMPILED_PREFIX}{name}")))
        .map_err(|_| format!("missing tensor '{}'", name))?;
    if view.dtype() != Dtype::F32 {
        return Err(format!(
            "tensor '{}' has dtype {:?}, expected F32",
            name,
            view.dtype()
        ));
    }
    let values = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((view.shape().to_vec(), values))
}

fn read_matrix(tensors: &SafeTensors, name: &str) -> std::result::Result<Array2<f32>, String> {
    let (shape, values) = read_f32(tensors, name)?;
    if shape.len() != 2 {
        return Err(format!("tensor '{}' has shape {:?}, expected 2-D", name, shape));
    }
    Array2::from_shape_vec((shape[0], shape[1]), values)
        .map_err(|e| format!("tensor '{}': {}", name, e))
}

fn read_vector(tensors: &SafeTensors, name: &str) -> std::result::Result<Array1<f32>, String> {
    let (shape, values) = read_f32(tensors, name)?;
    if shape.len() != 1 {
        return Err(format!("tensor '{}' has shape {:?}, expected 1-D", name, shape));
    }
    Ok(Array1::from(values))
}
