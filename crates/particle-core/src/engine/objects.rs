//! Capability traits implemented by plugins: score states (constraints), restraints and
//! optimizer states. The engine never looks past the dependencies they declare.

use thiserror::Error;

use crate::core::attributes::{
    AttributeError, AttributeStore, ChangeSet, DerivativeAccumulator, IncrementalDerivatives,
};
use crate::core::check::NumericalError;
use crate::core::ids::{ContainerId, ParticleIndex};
use crate::core::keys::{AnyKey, AttributeType, Key};

/// One thing a model object reads or writes.
///
/// Attribute-level dependencies are folded into their particle when the dependency graph is
/// built; they exist so objects can state precisely what they touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Particle(ParticleIndex),
    Attribute { particle: ParticleIndex, key: AnyKey },
    Container(ContainerId),
}

impl Dependency {
    pub fn attribute<T: AttributeType>(key: Key<T>, particle: ParticleIndex) -> Self {
        Dependency::Attribute {
            particle,
            key: key.erase(),
        }
    }

    /// The particle this dependency is attached to, if any.
    pub fn particle(&self) -> Option<ParticleIndex> {
        match *self {
            Dependency::Particle(particle) | Dependency::Attribute { particle, .. } => {
                Some(particle)
            }
            Dependency::Container(_) => None,
        }
    }
}

impl From<ParticleIndex> for Dependency {
    fn from(particle: ParticleIndex) -> Self {
        Dependency::Particle(particle)
    }
}

impl From<ContainerId> for Dependency {
    fn from(container: ContainerId) -> Self {
        Dependency::Container(container)
    }
}

/// Failure reported by a plugin object.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoreError {
    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error(transparent)]
    Numerical(#[from] NumericalError),

    #[error("{0}")]
    Failed(String),
}

/// The declared read and write sets of an object living in a model.
pub trait ModelObject: Send {
    fn name(&self) -> &str;

    /// What the object reads.
    fn inputs(&self) -> Vec<Dependency>;

    /// What the object writes. Restraints never write into the graph and keep the default.
    fn outputs(&self) -> Vec<Dependency> {
        Vec::new()
    }
}

/// An object that brings attributes into a consistent state before scoring and propagates
/// derivatives back afterwards.
///
/// `before_evaluate` runs in dependency order, `after_evaluate` in reverse order. The
/// accumulator passed to `after_evaluate` is present only when derivatives are computed.
pub trait ScoreState: ModelObject {
    fn before_evaluate(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError>;

    fn after_evaluate(
        &mut self,
        store: &AttributeStore,
        accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<(), ScoreError>;
}

/// A score state split into its two halves. Every constraint is a [`ScoreState`].
pub trait Constraint: ModelObject {
    /// Recomputes the outputs from the inputs.
    fn update_attributes(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError>;

    /// Moves derivatives accumulated on the outputs onto the inputs.
    fn update_derivatives(
        &mut self,
        _store: &AttributeStore,
        _accumulator: &mut DerivativeAccumulator<'_>,
    ) -> Result<(), ScoreError> {
        Ok(())
    }
}

impl<C: Constraint> ScoreState for C {
    fn before_evaluate(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError> {
        self.update_attributes(store)
    }

    fn after_evaluate(
        &mut self,
        store: &AttributeStore,
        accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<(), ScoreError> {
        match accumulator {
            Some(accumulator) => self.update_derivatives(store, accumulator),
            None => Ok(()),
        }
    }
}

/// A scalar contribution to the total score, computed from particle attributes.
pub trait Restraint: ModelObject {
    /// Computes the unweighted score. When an accumulator is given, the restraint adds the
    /// derivatives of its score to it; the accumulator applies the restraint's weight.
    fn unprotected_evaluate(
        &self,
        store: &AttributeStore,
        accumulator: Option<&mut DerivativeAccumulator<'_>>,
    ) -> Result<f64, ScoreError>;

    /// Whether the restraint can update its score from the particles that changed.
    fn is_incremental(&self) -> bool {
        false
    }

    /// Returns the unweighted score given the particles changed since the previous incremental
    /// evaluation. `derivatives` holds this restraint's own unweighted derivatives from that
    /// evaluation, to be brought up to date.
    ///
    /// A full change set means nothing can be reused. The default ignores `changes` and
    /// recomputes everything.
    fn unprotected_incremental_evaluate(
        &mut self,
        store: &AttributeStore,
        changes: &ChangeSet,
        derivatives: Option<&mut IncrementalDerivatives<'_>>,
    ) -> Result<f64, ScoreError> {
        let _ = changes;
        match derivatives {
            Some(derivatives) => {
                derivatives.clear();
                self.unprotected_evaluate(store, Some(&mut derivatives.accumulator()))
            }
            None => self.unprotected_evaluate(store, None),
        }
    }
}

/// An object an optimizer updates between steps, outside of scoring.
pub trait OptimizerState: ModelObject {
    fn update(&mut self, store: &mut AttributeStore) -> Result<(), ScoreError>;
}
