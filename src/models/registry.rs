//! Process-wide model registry.
//!
//! Built once at startup and handed to the engine by reference. A backbone that
//! fails to load is recorded with its reason instead of aborting the whole
//! registry, so the ensemble degrades to the backbones that did load.

use crate::config::AppConfig;
use crate::error::{EnsembleError, Result};
use crate::models::backbone::{Architecture, Backbone, Device, LoadState};
use crate::models::loader::ModelLoader;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

struct RegistryEntry {
    name: String,
    display_name: String,
    architecture: Architecture,
    device: Device,
    reported_accuracy: Option<f64>,
    state: LoadState,
    backbone: Option<Arc<dyn Backbone>>,
    error: Option<String>,
}

/// Health of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneHealth {
    pub name: String,
    pub display_name: String,
    pub architecture: Architecture,
    pub device: Device,
    pub state: LoadState,
    pub reported_accuracy: Option<f64>,
    pub error: Option<String>,
}

/// Registry-wide health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHealth {
    /// At least one backbone is ready
    pub ready: bool,
    pub loaded: usize,
    pub failed: usize,
    pub backbones: Vec<BackboneHealth>,
}

/// Named, ready-to-use backbones plus per-backbone load state
#[derive(Default)]
pub struct ModelRegistry {
    entries: Vec<RegistryEntry>,
}

impl ModelRegistry {
    /// Load every configured backbone, keeping whichever succeed
    pub fn load(config: &AppConfig) -> Self {
        let started = Instant::now();
        let loader = ModelLoader::new(&config.models);
        let labels = &config.classes.labels;
        let mut registry = Self::default();

        for spec in &config.models.backbones {
            let index = registry.entries.len();
            registry.entries.push(RegistryEntry {
                name: spec.name.clone(),
                display_name: spec.display_name().to_string(),
                architecture: spec.architecture,
                device: config.models.device,
                reported_accuracy: spec.reported_accuracy,
                state: LoadState::Loading,
                backbone: None,
                error: None,
            });

            let entry = &mut registry.entries[index];
            match loader.load_backbone(spec, labels) {
                Ok(backbone) => {
                    entry.backbone = Some(Arc::new(backbone));
                    entry.state = LoadState::Ready;
                }
                Err(e) => {
                    error!(backbone = %spec.name, error = %e, "Failed to load backbone, skipping");
                    entry.state = LoadState::Failed;
                    entry.error = Some(e.to_string());
                }
            }
        }

        info!(
            ready = registry.ready_count(),
            failed = registry.failed_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model registry loaded from {}",
            loader.models_dir().display()
        );
        registry
    }

    /// Registry over already constructed backbones
    pub fn from_backbones(backbones: Vec<Arc<dyn Backbone>>) -> Self {
        let mut registry = Self::default();
        for backbone in backbones {
            registry.insert(backbone);
        }
        registry
    }

    /// Register a ready backbone
    pub fn insert(&mut self, backbone: Arc<dyn Backbone>) {
        let descriptor = backbone.descriptor();
        self.entries.push(RegistryEntry {
            name: descriptor.name.clone(),
            display_name: descriptor.display_name.clone(),
            architecture: descriptor.architecture,
            device: descriptor.device,
            reported_accuracy: descriptor.reported_accuracy,
            state: LoadState::Ready,
            backbone: Some(backbone.clone()),
            error: None,
        });
    }

    /// Record a backbone that could not be loaded
    pub fn insert_failed(&mut self, name: &str, architecture: Architecture, error: &EnsembleError) {
        self.entries.push(RegistryEntry {
            name: name.to_string(),
            display_name: name.to_string(),
            architecture,
            device: Device::Cpu,
            reported_accuracy: None,
            state: LoadState::Failed,
            backbone: None,
            error: Some(error.to_string()),
        });
    }

    /// Ready backbone by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backbone>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.backbone.clone())
            .ok_or_else(|| EnsembleError::NotFound(name.to_string()))
    }

    /// Every ready backbone, in configuration order
    pub fn ready(&self) -> Vec<Arc<dyn Backbone>> {
        self.entries
            .iter()
            .filter_map(|e| e.backbone.clone())
            .collect()
    }

    /// Backbones that failed to load, with their reason
    pub fn failed(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| e.state == LoadState::Failed)
            .map(|e| (e.name.clone(), e.error.clone().unwrap_or_default()))
            .collect()
    }

    /// True when at least one backbone is usable
    pub fn is_ready(&self) -> bool {
        self.ready_count() > 0
    }

    pub fn ready_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == LoadState::Ready)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == LoadState::Failed)
            .count()
    }

    /// All registered names, ready or not
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn health(&self) -> RegistryHealth {
        RegistryHealth {
            ready: self.is_ready(),
            loaded: self.ready_count(),
            failed: self.failed_count(),
            backbones: self
                .entries
                .iter()
                .map(|e| BackboneHealth {
                    name: e.name.clone(),
                    display_name: e.display_name.clone(),
                    architecture: e.architecture,
                    device: e.device,
                    state: e.state,
                    reported_accuracy: e.reported_accuracy,
                    error: e.error.clone(),
                })
                .collect(),
        }
    }
}
