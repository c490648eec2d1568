//! Mushroom Ensemble Library
//!
//! Ensemble genus classification of mushroom photographs with toxicity
//! annotation and Grad-CAM explanations. Three convolutional backbones are
//! fused by soft voting.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod plausibility;
pub mod preprocessing;
pub mod saliency;
pub mod service;
pub mod toxicity;
pub mod types;

pub use config::AppConfig;
pub use error::{EnsembleError, ErrorKind, Result};
pub use models::inference::{Deadline, EnsembleEngine};
pub use models::registry::ModelRegistry;
pub use service::EnsembleService;
pub use types::{BatchReport, ImageUpload, PredictionReport, SaliencyReport};
