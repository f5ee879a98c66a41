//! # sapphire-core
//!
//! Core types, traits, and the image lifecycle for the sapphire annotation
//! pipeline.
//!
//! This crate provides the data model shared by every other crate, the store
//! and embedding-backend traits, and the state machine that governs an
//! image's processing status.

pub mod defaults;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use lifecycle::{next_status, ImageEvent, ImageLifecycle, TransitionOutcome};
pub use models::*;
pub use traits::*;
