//! Backbone models and ensemble inference

pub mod aggregator;
pub mod backbone;
pub mod head;
pub mod inference;
pub mod loader;
pub mod registry;

pub use aggregator::EnsembleFusion;
pub use backbone::{
    ActivationGradients, Architecture, Backbone, BackboneDescriptor, Device, FeatureExtractor,
    HeadedBackbone, LoadState,
};
pub use head::ClassifierHead;
pub use inference::{Deadline, EnsembleEngine};
pub use loader::ModelLoader;
pub use registry::{BackboneHealth, ModelRegistry, RegistryHealth};
