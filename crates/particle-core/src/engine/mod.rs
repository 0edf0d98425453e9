//! # Engine Module
//!
//! The stateful layer: the model, the objects it schedules, and the evaluation pass.
//!
//! ## Overview
//!
//! A [`Model`] owns an attribute store and three kinds of plugin objects, each declaring the
//! particles and containers it reads and writes:
//!
//! - **Score states** ([`objects::ScoreState`], [`objects::Constraint`]) keep derived
//!   attributes consistent before scoring and push derivatives back afterwards.
//! - **Restraints** ([`objects::Restraint`]) contribute weighted terms to the total score and
//!   are grouped in a tree of [`RestraintSet`]s.
//! - **Optimizer states** ([`objects::OptimizerState`]) are updated by optimizers between
//!   steps.
//!
//! ## Architecture
//!
//! - **Dependencies** ([`graph`]) - The data-flow graph and its stable topological order
//! - **Evaluation** - `before_evaluate` in order, scoring, `after_evaluate` in reverse order
//!   (incremental restraints may rescore only the particles that changed since the last pass)
//! - **Snapshots** ([`configuration`]) - Whole-model attribute snapshots and their sets
//! - **Settings** ([`config`]) - TOML-loadable model settings with a builder
//! - **Statistics** ([`statistics`]) - Optional per-object timing and score summaries

pub mod config;
pub mod configuration;
pub mod error;
mod evaluate;
pub mod graph;
pub mod model;
pub mod objects;
pub mod restraint_set;
pub mod statistics;

pub use config::{ConfigError, ModelConfig, ModelConfigBuilder};
pub use configuration::{Configuration, ConfigurationError, ConfigurationSet, ConfigurationState};
pub use error::ModelError;
pub use graph::{DependencyGraph, GraphNode};
pub use model::{Model, Stage};
pub use objects::{
    Constraint, Dependency, ModelObject, OptimizerState, Restraint, ScoreError, ScoreState,
};
pub use restraint_set::{RestraintSet, RestraintSetError, SetMember};
pub use statistics::{RestraintStatistics, ScoreStateStatistics, Statistics};
