//! Gradient-weighted class activation maps and their overlays.
//!
//! The map is computed at the backbone's activation resolution, stretched back
//! to the source image with bilinear interpolation, run through a JET color
//! ramp and alpha-blended over the original pixels.

use crate::error::{EnsembleError, Result};
use crate::models::backbone::{ActivationGradients, Backbone};
use crate::models::inference::Deadline;
use crate::preprocessing::{DecodedImage, InputSpec, PreprocessedImage, Preprocessor};
use crate::types::prediction::{BackboneOutcome, ModelPrediction};
use base64::{engine::general_purpose, Engine};
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array2, Axis};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Saliency result for one backbone and one image
#[derive(Debug, Clone)]
pub struct SaliencyMap {
    pub backbone: String,
    /// Intensities in [0, 1] at activation resolution, `[h, w]`
    pub heatmap: Array2<f32>,
    /// Opacity actually used, after clamping
    pub alpha: f32,
    /// Source image with the colored heatmap blended on top
    pub overlay: RgbImage,
    /// The backbone's own top prediction
    pub label: String,
    pub confidence: f64,
    /// Class the map explains
    pub target_label: String,
}

impl SaliencyMap {
    pub fn overlay_png(&self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        self.overlay
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| {
                warn!(backbone = %self.backbone, error = %e, "PNG encoding failed");
                EnsembleError::inference(&self.backbone, "could not encode overlay image")
            })?;
        Ok(buffer.into_inner())
    }

    pub fn overlay_base64(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(self.overlay_png()?))
    }
}

/// Renders saliency maps
#[derive(Debug, Clone)]
pub struct SaliencyEngine {
    default_alpha: f32,
}

impl Default for SaliencyEngine {
    fn default() -> Self {
        Self::new(0.45)
    }
}

impl SaliencyEngine {
    pub fn new(default_alpha: f32) -> Self {
        Self {
            default_alpha: if default_alpha.is_finite() {
                default_alpha.clamp(0.0, 1.0)
            } else {
                0.45
            },
        }
    }

    pub fn default_alpha(&self) -> f32 {
        self.default_alpha
    }

    /// Clamp into [0, 1]; a missing or NaN opacity falls back to the default
    pub fn resolve_alpha(&self, alpha: Option<f32>) -> f32 {
        match alpha {
            Some(a) if !a.is_nan() => a.clamp(0.0, 1.0),
            _ => self.default_alpha,
        }
    }

    /// Build the map and overlay from one gradient-mode call
    pub fn compute(
        &self,
        prediction: &ModelPrediction,
        gradients: &ActivationGradients,
        source: &DecodedImage,
        alpha: Option<f32>,
    ) -> SaliencyMap {
        let alpha = self.resolve_alpha(alpha);
        let heatmap = grad_cam(gradients);
        let upscaled = upsample(&heatmap, source.width(), source.height());
        let overlay = blend(source.rgb(), &upscaled, alpha);

        debug!(
            backbone = %prediction.backbone,
            target = %gradients.target_label,
            map_shape = ?heatmap.shape(),
            alpha = alpha,
            "Saliency map rendered"
        );

        SaliencyMap {
            backbone: prediction.backbone.clone(),
            heatmap,
            alpha,
            overlay,
            label: prediction.top.label.clone(),
            confidence: prediction.top.confidence,
            target_label: gradients.target_label.clone(),
        }
    }

    /// Run every backbone independently, in order, collecting per-backbone failures
    ///
    /// Only an expired deadline aborts the whole call.
    pub fn compute_all(
        &self,
        backbones: &[Arc<dyn Backbone>],
        preprocessor: &Preprocessor,
        source: &DecodedImage,
        alpha: Option<f32>,
        target: Option<usize>,
        deadline: &Deadline,
    ) -> Result<Vec<BackboneOutcome<SaliencyMap>>> {
        let mut prepared: Vec<(InputSpec, PreprocessedImage)> = Vec::new();
        let mut outcomes = Vec::with_capacity(backbones.len());

        for backbone in backbones {
            deadline.check()?;
            let name = backbone.name().to_string();
            let spec = backbone.descriptor().input;
            let image = match prepared.iter().position(|(s, _)| *s == spec) {
                Some(index) => &prepared[index].1,
                None => {
                    prepared.push((spec, preprocessor.prepare_decoded(source, &spec)));
                    &prepared[prepared.len() - 1].1
                }
            };

            let result = backbone
                .predict_with_gradients(image, target)
                .map(|(prediction, grads)| self.compute(&prediction, &grads, source, alpha));
            if let Err(e) = &result {
                warn!(backbone = %name, error = %e, "Saliency failed for backbone");
            }
            outcomes.push(BackboneOutcome::new(&name, result));
        }
        Ok(outcomes)
    }
}

/// Gradient-weighted class activation map, rectified and normalized to [0, 1]
pub fn grad_cam(gradients: &ActivationGradients) -> Array2<f32> {
    let activations = &gradients.activations;
    let (height, width) = (activations.shape()[1], activations.shape()[2]);
    let mut cam = Array2::<f32>::zeros((height, width));

    // Channel importance = spatial mean of the gradient
    for (channel, grad) in activations
        .axis_iter(Axis(0))
        .zip(gradients.gradients.axis_iter(Axis(0)))
    {
        let weight = grad.mean().unwrap_or(0.0);
        if weight != 0.0 {
            cam.scaled_add(weight, &channel);
        }
    }

    cam.mapv_inplace(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
    let max = cam.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        cam.mapv_inplace(|v| (v / max).clamp(0.0, 1.0));
    }
    cam
}

/// Bilinear resize of a `[h, w]` map to `width × height`, sampling at pixel centers
pub fn upsample(map: &Array2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (in_h, in_w) = map.dim();
    let (out_h, out_w) = (height as usize, width as usize);
    let mut out = Array2::<f32>::zeros((out_h, out_w));
    if in_h == 0 || in_w == 0 {
        return out;
    }

    let scale_x = in_w as f32 / out_w.max(1) as f32;
    let scale_y = in_h as f32 / out_h.max(1) as f32;
    for y in 0..out_h {
        let v = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (in_h - 1) as f32);
        let y0 = v.floor() as usize;
        let y1 = (y0 + 1).min(in_h - 1);
        let dy = v - y0 as f32;
        for x in 0..out_w {
            let u = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (in_w - 1) as f32);
            let x0 = u.floor() as usize;
            let x1 = (x0 + 1).min(in_w - 1);
            let dx = u - x0 as f32;

            let top = map[[y0, x0]] * (1.0 - dx) + map[[y0, x1]] * dx;
            let bottom = map[[y1, x0]] * (1.0 - dx) + map[[y1, x1]] * dx;
            out[[y, x]] = top * (1.0 - dy) + bottom * dy;
        }
    }
    out
}

/// JET color ramp: dark blue → cyan → yellow → dark red
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |center: f32| -> u8 {
        ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Blend a full-resolution heatmap over `base` at opacity `alpha`
pub fn blend(base: &RgbImage, heatmap: &Array2<f32>, alpha: f32) -> RgbImage {
    let a = alpha.clamp(0.0, 1.0);
    let mut out = base.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = heatmap
            .get([y as usize, x as usize])
            .copied()
            .unwrap_or(0.0);
        let Rgb(heat) = jet(value);
        for c in 0..3 {
            pixel[c] = (a * heat[c] as f32 + (1.0 - a) * pixel[c] as f32).round() as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::Preprocessor;
    use image::DynamicImage;
    use ndarray::Array3;

    fn gradients(activations: Array3<f32>, gradients: Array3<f32>) -> ActivationGradients {
        ActivationGradients {
            activations,
            gradients,
            target_index: 0,
            target_label: "Amanita".to_string(),
        }
    }

    fn source(width: u32, height: u32) -> DecodedImage {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10 % 256) as u8, (y * 10 % 256) as u8, 90])
        });
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        Preprocessor::default().decode(bytes.get_ref()).unwrap()
    }

    fn prediction() -> ModelPrediction {
        ModelPrediction::from_probabilities(
            "resnet50",
            "ResNet50",
            &["Amanita".to_string(), "Boletus".to_string()],
            &[0.8, 0.2],
        )
    }

    #[test]
    fn test_grad_cam_is_normalized() {
        let mut activations = Array3::zeros((2, 3, 3));
        activations[[0, 1, 1]] = 4.0;
        activations[[0, 0, 0]] = 1.0;
        activations[[1, 2, 2]] = 10.0;
        let mut grads = Array3::zeros((2, 3, 3));
        grads.index_axis_mut(Axis(0), 0).fill(1.0);
        grads.index_axis_mut(Axis(0), 1).fill(-1.0);

        let cam = grad_cam(&gradients(activations, grads));
        assert_eq!(cam.dim(), (3, 3));
        assert!((cam[[1, 1]] - 1.0).abs() < 1e-6);
        assert!((cam[[0, 0]] - 0.25).abs() < 1e-6);
        // channel 1 only contributes negatively and is rectified away
        assert_eq!(cam[[2, 2]], 0.0);
        assert!(cam.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_zero_gradient_gives_zero_map() {
        let activations = Array3::from_elem((4, 7, 7), 3.0);
        let cam = grad_cam(&gradients(activations, Array3::zeros((4, 7, 7))));
        assert!(cam.iter().all(|v| *v == 0.0));
        assert!(!cam.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn test_upsample_keeps_constant_maps() {
        let map = Array2::from_elem((7, 7), 0.6);
        let up = upsample(&map, 50, 30);
        assert_eq!(up.dim(), (30, 50));
        assert!(up.iter().all(|v| (v - 0.6).abs() < 1e-6));
    }

    #[test]
    fn test_upsample_interpolates_between_cells() {
        let map = Array2::from_shape_vec((1, 2), vec![0.0, 1.0]).unwrap();
        let up = upsample(&map, 4, 1);
        assert_eq!(up[[0, 0]], 0.0);
        assert_eq!(up[[0, 3]], 1.0);
        assert!(up[[0, 1]] > 0.0 && up[[0, 1]] < up[[0, 2]]);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        assert_eq!(jet(-3.0), jet(0.0));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
    }

    #[test]
    fn test_alpha_is_clamped() {
        let engine = SaliencyEngine::default();
        assert_eq!(engine.resolve_alpha(Some(-0.2)), 0.0);
        assert_eq!(engine.resolve_alpha(Some(1.4)), 1.0);
        assert_eq!(engine.resolve_alpha(None), 0.45);
        assert_eq!(engine.resolve_alpha(Some(f32::NAN)), 0.45);

        let image = source(20, 10);
        let mut activations = Array3::zeros((1, 2, 2));
        activations[[0, 0, 1]] = 1.0;
        let grads = gradients(activations, Array3::from_elem((1, 2, 2), 1.0));
        let pred = prediction();

        let below = engine.compute(&pred, &grads, &image, Some(-0.2));
        let zero = engine.compute(&pred, &grads, &image, Some(0.0));
        assert_eq!(below.overlay, zero.overlay);
        assert_eq!(zero.overlay, *image.rgb());

        let above = engine.compute(&pred, &grads, &image, Some(1.4));
        let one = engine.compute(&pred, &grads, &image, Some(1.0));
        assert_eq!(above.overlay, one.overlay);
        assert_eq!(above.alpha, 1.0);
    }

    #[test]
    fn test_overlay_matches_source_dimensions() {
        let engine = SaliencyEngine::default();
        let image = source(33, 21);
        let grads = gradients(
            Array3::from_elem((2, 7, 7), 1.0),
            Array3::from_elem((2, 7, 7), 0.5),
        );
        let map = engine.compute(&prediction(), &grads, &image, None);

        assert_eq!(map.overlay.dimensions(), (33, 21));
        assert_eq!(map.heatmap.dim(), (7, 7));
        assert_eq!(map.label, "Amanita");
        assert_eq!(map.target_label, "Amanita");

        let png = general_purpose::STANDARD
            .decode(map.overlay_base64().unwrap())
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (33, 21));
    }
}
