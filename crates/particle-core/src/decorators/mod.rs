//! # Decorators Module
//!
//! Typed views over a particle's attributes.
//!
//! ## Overview
//!
//! A decorator is a particle index paired with the knowledge of which keys it expects. It
//! owns nothing: every accessor goes through the [`AttributeStore`], so any number of
//! decorators may view the same particle as long as their key sets do not conflict.
//!
//! Decorators are obtained in one of two ways:
//!
//! - `setup_particle` adds whatever keys are missing and returns the view.
//! - [`Decorator::decorate`] checks that the keys are already present.

pub mod hierarchy;
pub mod xyz;

pub use hierarchy::Hierarchy;
pub use xyz::{XYZ, XYZR};

use thiserror::Error;

use crate::core::attributes::{AttributeError, AttributeStore};
use crate::core::ids::ParticleIndex;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecoratorError {
    #[error("Particle {particle:?} is not a {decorator} particle")]
    NotInstance {
        decorator: &'static str,
        particle: ParticleIndex,
    },

    #[error("Particle {0:?} already has a parent")]
    AlreadyHasParent(ParticleIndex),

    #[error("Making {child:?} a child of {parent:?} would close a cycle")]
    WouldCreateCycle {
        parent: ParticleIndex,
        child: ParticleIndex,
    },

    #[error("Particle {child:?} is not a child of {parent:?}")]
    NotAChild {
        parent: ParticleIndex,
        child: ParticleIndex,
    },

    #[error(transparent)]
    Attribute(#[from] AttributeError),
}

/// A typed view of a particle carrying a known set of keys.
pub trait Decorator: Sized + Copy {
    /// Name used in diagnostics.
    const NAME: &'static str;

    /// Whether `particle` carries every key this decorator needs.
    fn particle_is_instance(store: &AttributeStore, particle: ParticleIndex) -> bool;

    fn particle_index(&self) -> ParticleIndex;

    #[doc(hidden)]
    fn wrap(particle: ParticleIndex) -> Self;

    /// Views an existing particle.
    ///
    /// # Errors
    ///
    /// Fails with [`AttributeError::InvalidParticle`] for a dead particle and with
    /// [`DecoratorError::NotInstance`] if a required key is missing.
    fn decorate(store: &AttributeStore, particle: ParticleIndex) -> Result<Self, DecoratorError> {
        if !store.is_live(particle) {
            return Err(AttributeError::InvalidParticle(particle).into());
        }
        if Self::particle_is_instance(store, particle) {
            Ok(Self::wrap(particle))
        } else {
            Err(DecoratorError::NotInstance {
                decorator: Self::NAME,
                particle,
            })
        }
    }
}
