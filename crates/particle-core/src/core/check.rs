use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{error, warn};

use super::object::LifecycleError;

/// How much checking the engine does on top of the checks that guard memory safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    /// Only errors that would otherwise corrupt state.
    None,
    /// Usage errors such as dependencies on removed particles.
    #[default]
    Usage,
    /// Usage errors plus validation that objects touch only what they declare.
    UsageAndInternal,
}

/// A broken internal invariant. Continuing after one risks silent corruption.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("{0}")]
    DestroyedObject(#[from] LifecycleError),

    #[error("Dependency cycle among: {}", .objects.join(" -> "))]
    DependencyCycle { objects: Vec<String> },

    #[error("Internal bookkeeping is inconsistent: {0}")]
    Corrupted(String),

    #[error(
        "Incremental evaluation of {restraint} disagrees with a full evaluation: {detail}"
    )]
    IncrementalMismatch { restraint: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Panic with the diagnostic.
    Abort,
    /// Log the diagnostic and hand the violation back to the caller as an error.
    Report,
}

/// Decides what happens when an invariant violation is detected.
pub trait FailureHandler: Send + Sync {
    fn handle(&self, violation: &InvariantViolation) -> FailureAction;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFailure;

impl FailureHandler for AbortOnFailure {
    fn handle(&self, _violation: &InvariantViolation) -> FailureAction {
        FailureAction::Abort
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReportFailure;

impl FailureHandler for ReportFailure {
    fn handle(&self, _violation: &InvariantViolation) -> FailureAction {
        FailureAction::Report
    }
}

/// Serializable choice between the two built-in handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Abort,
    Report,
}

impl FailurePolicy {
    pub fn handler(self) -> Arc<dyn FailureHandler> {
        match self {
            FailurePolicy::Abort => Arc::new(AbortOnFailure),
            FailurePolicy::Report => Arc::new(ReportFailure),
        }
    }
}

static FAILURE_HANDLER: LazyLock<RwLock<Arc<dyn FailureHandler>>> =
    LazyLock::new(|| RwLock::new(Arc::new(AbortOnFailure)));

/// Installs the process-wide failure handler and returns the previous one.
pub fn set_failure_handler(handler: Arc<dyn FailureHandler>) -> Arc<dyn FailureHandler> {
    std::mem::replace(&mut *FAILURE_HANDLER.write(), handler)
}

/// The process-wide failure handler. Defaults to [`AbortOnFailure`].
pub fn failure_handler() -> Arc<dyn FailureHandler> {
    FAILURE_HANDLER.read().clone()
}

/// Routes a violation through `handler`.
///
/// Panics if the handler asks to abort; otherwise returns the violation so the caller can
/// propagate it.
pub fn raise(handler: &dyn FailureHandler, violation: InvariantViolation) -> InvariantViolation {
    error!(%violation, "Invariant violation detected");
    match handler.handle(&violation) {
        FailureAction::Abort => panic!("invariant violation: {violation}"),
        FailureAction::Report => violation,
    }
}

/// What to do when a score or derivative is NaN or infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericalPolicy {
    Ignore,
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NumericalError {
    #[error("{what} is not finite: {value}")]
    NonFinite { what: String, value: f64 },
}

/// Returns `value` unchanged if it is finite.
pub fn check_finite(what: &str, value: f64) -> Result<f64, NumericalError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(NumericalError::NonFinite {
            what: what.to_string(),
            value,
        })
    }
}

impl NumericalPolicy {
    /// Applies the policy to one value. `what` is only rendered when the value is bad.
    pub fn apply(self, what: impl FnOnce() -> String, value: f64) -> Result<(), NumericalError> {
        if self == NumericalPolicy::Ignore || value.is_finite() {
            return Ok(());
        }
        let what = what();
        match self {
            NumericalPolicy::Warn => {
                warn!(what = %what, value, "Non-finite value");
                Ok(())
            }
            _ => Err(NumericalError::NonFinite { what, value }),
        }
    }
}
