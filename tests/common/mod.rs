//! Shared fixtures: stub backbones over a pooling extractor and encoded test images

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use mushroom_ensemble::config::{AppConfig, DEFAULT_CLASSES};
use mushroom_ensemble::models::backbone::{
    Architecture, Backbone, BackboneDescriptor, Device, FeatureExtractor, HeadedBackbone,
};
use mushroom_ensemble::models::head::{ClassifierHead, DenseLayer};
use mushroom_ensemble::models::registry::ModelRegistry;
use mushroom_ensemble::preprocessing::InputSpec;
use mushroom_ensemble::{EnsembleEngine, EnsembleError, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView4};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

pub const INPUT_SIZE: u32 = 56;
pub const GRID: usize = 7;

pub const AGARICUS: usize = 0;
pub const AMANITA: usize = 1;
pub const BOLETUS: usize = 2;
pub const RUSSULA: usize = 7;

/// Average-pools each input channel onto a 7×7 grid, so activations are the
/// normalized colour of each image region
pub struct PoolingExtractor {
    pub delay: Duration,
}

impl FeatureExtractor for PoolingExtractor {
    fn extract(&self, input: ArrayView4<f32>) -> Result<Array3<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let (_, channels, height, width) = input.dim();
        let mut out = Array3::zeros((channels, GRID, GRID));
        for c in 0..channels {
            for i in 0..GRID {
                for j in 0..GRID {
                    let (y0, y1) = (i * height / GRID, (i + 1) * height / GRID);
                    let (x0, x1) = (j * width / GRID, (j + 1) * width / GRID);
                    out[[c, i, j]] = input.slice(s![0, c, y0..y1, x0..x1]).mean().unwrap_or(0.0);
                }
            }
        }
        Ok(out)
    }
}

/// Produces NaN activations
pub struct BrokenExtractor;

impl FeatureExtractor for BrokenExtractor {
    fn extract(&self, _input: ArrayView4<f32>) -> Result<Array3<f32>> {
        Ok(Array3::from_elem((3, GRID, GRID), f32::NAN))
    }
}

pub fn labels() -> Vec<String> {
    DEFAULT_CLASSES.iter().map(|s| s.to_string()).collect()
}

/// Linear head: red votes Amanita, green Boletus, blue Russula; Agaricus has no weights
pub fn colour_head(red_weight: f32) -> ClassifierHead {
    let mut weight = Array2::<f32>::zeros((DEFAULT_CLASSES.len(), 3));
    weight[[AMANITA, 0]] = red_weight;
    weight[[BOLETUS, 1]] = 3.0;
    weight[[RUSSULA, 2]] = 3.0;
    let bias = Array1::zeros(DEFAULT_CLASSES.len());
    ClassifierHead::linear(DenseLayer::new(weight, bias)).unwrap()
}

pub fn descriptor(name: &str) -> BackboneDescriptor {
    BackboneDescriptor {
        name: name.to_string(),
        display_name: name.to_uppercase(),
        architecture: Architecture::Custom,
        input: InputSpec::imagenet(INPUT_SIZE),
        labels: labels(),
        device: Device::Cpu,
        reported_accuracy: Some(90.0),
    }
}

pub fn stub(name: &str, red_weight: f32) -> Arc<HeadedBackbone> {
    stub_with(name, Box::new(PoolingExtractor { delay: Duration::ZERO }), red_weight)
}

pub fn slow_stub(name: &str, delay: Duration) -> Arc<HeadedBackbone> {
    stub_with(name, Box::new(PoolingExtractor { delay }), 5.0)
}

pub fn broken_stub(name: &str) -> Arc<HeadedBackbone> {
    stub_with(name, Box::new(BrokenExtractor), 5.0)
}

fn stub_with(name: &str, extractor: Box<dyn FeatureExtractor>, red_weight: f32) -> Arc<HeadedBackbone> {
    Arc::new(HeadedBackbone::new(descriptor(name), extractor, colour_head(red_weight)).unwrap())
}

/// Three healthy stubs named like the shipped backbones
pub fn healthy_backbones() -> Vec<Arc<dyn Backbone>> {
    [("resnet50", 5.0), ("efficientnet_b0", 4.0), ("mobilenet_v3_large", 3.0)]
        .into_iter()
        .map(|(name, red_weight)| stub(name, red_weight) as Arc<dyn Backbone>)
        .collect()
}

pub fn engine(registry: ModelRegistry) -> EnsembleEngine {
    EnsembleEngine::with_registry(&AppConfig::default(), registry)
}

pub fn load_failure(name: &str) -> EnsembleError {
    EnsembleError::ModelLoad {
        backbone: name.to_string(),
        reason: "weight file not found".to_string(),
    }
}

pub fn solid(colour: [u8; 3], width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(colour))
}

/// Red cap on a reddish-brown forest floor
pub fn red_cap(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - width as f32 / 2.0;
        let dy = y as f32 - height as f32 / 2.0;
        if (dx * dx + dy * dy).sqrt() < width.min(height) as f32 / 3.0 {
            Rgb([230, 20, 20])
        } else {
            Rgb([180, 40, 30])
        }
    })
}

pub fn encode(image: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, format)
        .unwrap();
    bytes.into_inner()
}
