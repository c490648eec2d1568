//! Image preprocessing for backbone inference.
//!
//! Decodes raw upload bytes and turns them into the `[1, 3, S, S]` tensor a
//! backbone expects. The geometry and normalization used here must match the
//! transforms the backbones were trained with, otherwise accuracy drops without
//! any visible error.

use crate::config::PreprocessingConfig;
use crate::error::{EnsembleError, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the decoded image is brought to the square input edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizePolicy {
    /// Resize both axes directly to the input edge (aspect ratio is not kept)
    #[default]
    Stretch,
    /// Resize the shorter side to the input edge, then crop the center square
    ShorterSideCenterCrop,
}

/// Interpolation used when resizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    /// Bilinear
    #[default]
    Triangle,
    CatmullRom,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
        }
    }
}

/// Input contract of one backbone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    /// Square input edge in pixels
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl InputSpec {
    pub fn imagenet(size: u32) -> Self {
        Self {
            size,
            mean: crate::config::IMAGENET_MEAN,
            std: crate::config::IMAGENET_STD,
        }
    }
}

/// A decoded RGB image, kept around when a saliency overlay is requested
#[derive(Debug, Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
    format: ImageFormat,
}

impl DecodedImage {
    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }
}

/// Normalized tensor ready for a backbone, plus the source dimensions
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    /// `[1, 3, size, size]`, channel order RGB
    pub tensor: Array4<f32>,
    pub original_width: u32,
    pub original_height: u32,
}

impl PreprocessedImage {
    pub fn input_size(&self) -> usize {
        self.tensor.shape()[2]
    }
}

/// Stateless preprocessing pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct Preprocessor {
    policy: ResizePolicy,
    filter: ResizeFilter,
}

impl Preprocessor {
    pub fn new(config: &PreprocessingConfig) -> Self {
        Self {
            policy: config.resize_policy,
            filter: config.filter,
        }
    }

    /// Decode JPEG, PNG or WEBP bytes into an RGB image
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedImage> {
        if bytes.is_empty() {
            return Err(EnsembleError::InvalidImage("image data is empty".into()));
        }

        let format = image::guess_format(bytes).map_err(|_| {
            EnsembleError::InvalidImage("unrecognized image format".into())
        })?;
        if !matches!(
            format,
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP
        ) {
            return Err(EnsembleError::InvalidImage(format!(
                "unsupported image format {:?} (expected JPEG, PNG or WEBP)",
                format
            )));
        }

        let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
            debug!(error = %e, format = ?format, "Image decode failed");
            EnsembleError::InvalidImage(format!("could not decode {:?} data", format))
        })?;

        if image.width() == 0 || image.height() == 0 {
            return Err(EnsembleError::InvalidImage("image has zero area".into()));
        }

        Ok(DecodedImage {
            rgb: image.to_rgb8(),
            format,
        })
    }

    /// Decode and preprocess in one step
    pub fn prepare(&self, bytes: &[u8], spec: &InputSpec) -> Result<PreprocessedImage> {
        let decoded = self.decode(bytes)?;
        Ok(self.prepare_decoded(&decoded, spec))
    }

    /// Resize and normalize an already decoded image
    pub fn prepare_decoded(&self, image: &DecodedImage, spec: &InputSpec) -> PreprocessedImage {
        let resized = self.resize(&image.rgb, spec.size);
        let size = spec.size as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - spec.mean[c]) / spec.std[c];
            }
        }

        debug!(
            width = image.width(),
            height = image.height(),
            size = spec.size,
            policy = ?self.policy,
            "Preprocessed image"
        );

        PreprocessedImage {
            tensor,
            original_width: image.width(),
            original_height: image.height(),
        }
    }

    fn resize(&self, rgb: &RgbImage, size: u32) -> RgbImage {
        let filter: FilterType = self.filter.into();
        let (width, height) = rgb.dimensions();
        if width == size && height == size {
            return rgb.clone();
        }

        match self.policy {
            ResizePolicy::Stretch => imageops::resize(rgb, size, size, filter),
            ResizePolicy::ShorterSideCenterCrop => {
                let scale = size as f64 / width.min(height) as f64;
                let scaled_w = ((width as f64 * scale).round() as u32).max(size);
                let scaled_h = ((height as f64 * scale).round() as u32).max(size);
                let scaled = imageops::resize(rgb, scaled_w, scaled_h, filter);
                let left = (scaled_w - size) / 2;
                let top = (scaled_h - size) / 2;
                imageops::crop_imm(&scaled, left, top, size, size).to_image()
            }
        }
    }
}
