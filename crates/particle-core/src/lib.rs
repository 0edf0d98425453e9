//! # particle-kernel
//!
//! The kernel runtime of a structural-modeling toolkit: a generic, typed attribute store for
//! simulation entities ("particles") and an evaluation engine that keeps derived quantities
//! ("constraints") consistent before a set of scoring functions ("restraints") is evaluated,
//! in a deterministic, dependency-correct order.
//!
//! ## Architectural Philosophy
//!
//! The library is split into layers with a strict direction of dependency:
//!
//! - **[`core`]: The Foundation.** Interned attribute keys, the columnar attribute store,
//!   generation-checked object arenas, and the process-level invariant checking machinery.
//!   Nothing in this layer knows about scoring.
//!
//! - **[`decorators`]: Typed Views.** Lightweight wrappers that give a particle a typed
//!   interface (coordinates, radius, hierarchy links) over a named set of keys.
//!
//! - **[`engine`]: The Logic Core.** The stateful layer. It owns the [`engine::Model`], builds
//!   the dependency graph from the inputs and outputs declared by score states and restraints,
//!   schedules and runs evaluation passes, and saves and restores whole model states through
//!   [`engine::Configuration`].
//!
//! Scoring functions, samplers and file readers are plugins: they implement the traits in
//! [`engine::objects`] and touch the model only through the attribute store.

pub mod core;
pub mod decorators;
pub mod engine;

#[cfg(test)]
pub(crate) mod test_support;
