//! Type definitions for the ensemble engine

pub mod prediction;
pub mod report;
pub mod upload;

pub use prediction::{
    BackboneFailure, BackboneOutcome, ClassProbability, ConfidenceLevel, EnsemblePrediction,
    ModelPrediction, TopPrediction,
};
pub use report::{BatchItem, BatchReport, ModelInfo, PredictionReport, SaliencyEntry, SaliencyReport};
pub use upload::ImageUpload;
