use thiserror::Error;

use super::configuration::ConfigurationError;
use super::model::Stage;
use super::objects::ScoreError;
use super::restraint_set::RestraintSetError;
use crate::core::attributes::AttributeError;
use crate::core::check::{InvariantViolation, NumericalError};
use crate::core::ids::{RestraintId, ScoreStateId};
use crate::core::keys::KeyError;
use crate::decorators::DecoratorError;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Decorator error: {0}")]
    Decorator(#[from] DecoratorError),

    #[error("Restraint set error: {0}")]
    RestraintSet(#[from] RestraintSetError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Numerical error: {0}")]
    Numerical(#[from] NumericalError),

    /// Produced only after the failure handler chose to report instead of aborting.
    #[error("Invariant violation: {0}")]
    Invariant(InvariantViolation),

    #[error("Restraint '{name}' failed: {source}")]
    Restraint { name: String, source: ScoreError },

    #[error("Score state '{name}' failed during {phase}: {source}")]
    ScoreState {
        name: String,
        phase: Stage,
        source: ScoreError,
    },

    #[error("Optimizer state '{name}' failed: {source}")]
    OptimizerState { name: String, source: ScoreError },

    #[error("'{object}' depends on {dependency}, which no longer exists")]
    StaleDependency { object: String, dependency: String },

    #[error("Restraint {0:?} is not part of the model's scoring function")]
    RestraintNotActive(RestraintId),

    #[error("Score state {0:?} is not active in this model")]
    ScoreStateNotActive(ScoreStateId),

    #[error("Ordering constraint would make score state '{0}' run before itself")]
    SelfOrdering(String),
}
