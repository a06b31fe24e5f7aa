//! Core types shared across the agentmesh crates.
//!
//! # Main types
//!
//! - [`MeshError`] — Unified error enum for all agentmesh subsystems.
//! - [`MeshResult`] — Convenience alias for `Result<T, MeshError>`.
//! - [`Action`] — Publish or subscribe, the two operations gated per subject.
//! - [`subject`] — The single subject matcher used by authorization and routing.

/// Error taxonomy.
pub mod error;
/// Subject matching and naming helpers.
pub mod subject;

pub use error::{Action, MeshError, MeshResult};
