//! Whole-model snapshots of attribute values.

use thiserror::Error;
use tracing::debug;

use super::error::ModelError;
use super::model::Model;
use crate::core::attributes::AttributeColumns;
use crate::core::ids::ModelId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Configuration belongs to {expected}, not {actual}")]
    WrongModel { expected: ModelId, actual: ModelId },

    #[error("Configuration has already captured a model state")]
    AlreadyCaptured,

    #[error("Configuration has not captured a model state yet")]
    NotCaptured,

    #[error("Configuration index {index} is out of range ({count} saved)")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Where a configuration is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationState {
    /// Created without a snapshot.
    Unused,
    /// Holds a snapshot that was never loaded.
    Captured,
    /// Loaded exactly once.
    LoadedOnce,
    /// Loaded two or more times.
    LoadedMany,
}

/// A deep copy of every attribute value of one model at one moment.
///
/// Loading restores each attribute of each particle that still exists. Particles added after
/// the capture lose their attributes (they had none in the snapshot); particles removed since
/// stay removed.
#[derive(Debug, Clone)]
pub struct Configuration {
    model: ModelId,
    snapshot: Option<AttributeColumns>,
    state: ConfigurationState,
    loads: u64,
}

impl Configuration {
    /// Captures the current state of `model`.
    pub fn new(model: &Model) -> Self {
        let mut configuration = Self::empty(model);
        configuration.snapshot = Some(model.attribute_columns().clone());
        configuration.state = ConfigurationState::Captured;
        configuration
    }

    /// A configuration bound to `model` that has not captured anything yet.
    pub fn empty(model: &Model) -> Self {
        Self {
            model: model.id(),
            snapshot: None,
            state: ConfigurationState::Unused,
            loads: 0,
        }
    }

    /// Captures `model` into an unused configuration.
    pub fn capture(&mut self, model: &Model) -> Result<(), ConfigurationError> {
        self.check_model(model)?;
        if self.snapshot.is_some() {
            return Err(ConfigurationError::AlreadyCaptured);
        }
        self.snapshot = Some(model.attribute_columns().clone());
        self.state = ConfigurationState::Captured;
        Ok(())
    }

    /// Writes the captured state back into `model`. Loading twice in a row gives the same
    /// model state as loading once.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigurationError::WrongModel`] for another model and with
    /// [`ConfigurationError::NotCaptured`] if nothing was captured.
    pub fn load_configuration(&mut self, model: &mut Model) -> Result<(), ModelError> {
        self.check_model(model)?;
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or(ConfigurationError::NotCaptured)?;
        model.restore_columns(snapshot);
        self.loads += 1;
        self.state = if self.loads == 1 {
            ConfigurationState::LoadedOnce
        } else {
            ConfigurationState::LoadedMany
        };
        debug!(model = model.name(), loads = self.loads, "Loaded configuration");
        Ok(())
    }

    pub fn state(&self) -> ConfigurationState {
        self.state
    }

    pub fn load_count(&self) -> u64 {
        self.loads
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    fn check_model(&self, model: &Model) -> Result<(), ConfigurationError> {
        if model.id() == self.model {
            Ok(())
        } else {
            Err(ConfigurationError::WrongModel {
                expected: self.model,
                actual: model.id(),
            })
        }
    }
}

/// An ordered collection of saved configurations plus the state at creation time.
#[derive(Debug, Clone)]
pub struct ConfigurationSet {
    base: Configuration,
    saved: Vec<Configuration>,
}

impl ConfigurationSet {
    /// Captures the current state of `model` as the base.
    pub fn new(model: &Model) -> Self {
        Self {
            base: Configuration::new(model),
            saved: Vec::new(),
        }
    }

    /// Appends the current state of `model` and returns its index.
    pub fn save_configuration(&mut self, model: &Model) -> Result<usize, ConfigurationError> {
        self.base.check_model(model)?;
        self.saved.push(Configuration::new(model));
        Ok(self.saved.len() - 1)
    }

    pub fn load_configuration(&mut self, index: usize, model: &mut Model) -> Result<(), ModelError> {
        let count = self.saved.len();
        let configuration = self
            .saved
            .get_mut(index)
            .ok_or(ConfigurationError::IndexOutOfRange { index, count })?;
        configuration.load_configuration(model)
    }

    /// Restores the state captured when the set was created.
    pub fn load_base(&mut self, model: &mut Model) -> Result<(), ModelError> {
        self.base.load_configuration(model)
    }

    pub fn number_of_configurations(&self) -> usize {
        self.saved.len()
    }

    pub fn configuration(&self, index: usize) -> Option<&Configuration> {
        self.saved.get(index)
    }
}
