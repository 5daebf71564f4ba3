//! # concord-core
//!
//! Core types, traits, and lexical utilities for the concord entity
//! resolution engine.
//!
//! This crate provides the data model (canonical concepts, signal breakdowns,
//! deferred candidates, proposals, merge audit records) and the collaborator
//! traits that the storage, inference and engine crates implement or consume.

pub mod concept;
pub mod defaults;
pub mod error;
pub mod ids;
pub mod lexical;
pub mod logging;
pub mod resolution;
pub mod traits;

// Re-export commonly used types at crate root
pub use concept::*;
pub use error::{Error, Result};
pub use ids::{new_v7, PairId};
pub use resolution::*;
pub use traits::*;
