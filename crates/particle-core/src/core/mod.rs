//! # Core Module
//!
//! Stateless foundations of the kernel: everything here is independent of scoring and of the
//! evaluation schedule.
//!
//! ## Overview
//!
//! Simulation state lives in exactly one place, the [`attributes::AttributeStore`]. Every
//! value in it is addressed by a particle index and an interned, typed key. The remaining
//! submodules provide the identity and lifetime machinery that the engine layer builds on.
//!
//! ## Architecture
//!
//! - **Identifiers** ([`ids`]) - Generation-checked handles for particles, containers and model objects
//! - **Keys** ([`keys`]) - The process-wide registry interning attribute names per value category
//! - **Attributes** ([`attributes`]) - Columnar per-key storage, derivative columns and access locks
//! - **Lifecycle** ([`object`]) - Reference-counted object arenas with stale-handle detection
//! - **Checks** ([`check`]) - Check levels, the pluggable failure handler and numerical checks

pub mod attributes;
pub mod check;
pub mod ids;
pub mod keys;
pub mod object;
