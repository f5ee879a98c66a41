//! # sapphire-jobs
//!
//! Background embedding for the sapphire annotation pipeline.
//!
//! This crate provides:
//! - A recurring scheduler that claims `Unembedded` images in batches
//! - A single-flight guard so at most one batch runs at a time
//! - Per-image timeouts, retries, and abandonment after repeated failures
//! - Scheduler events via broadcast channels
//! - A simulated embedding backend
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sapphire_jobs::{EmbeddingScheduler, SchedulerConfig, SimulatedEmbeddingBackend};
//!
//! let scheduler = EmbeddingScheduler::new(
//!     lifecycle,
//!     Arc::new(SimulatedEmbeddingBackend::new()),
//!     SchedulerConfig::from_env(),
//! );
//!
//! // Start scheduler and get handle
//! let handle = scheduler.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown, waits for the in-flight batch
//! handle.stop().await?;
//! ```

pub mod embedding;
pub mod guard;
pub mod scheduler;

// Re-export core types
pub use sapphire_core::*;

pub use embedding::SimulatedEmbeddingBackend;
pub use guard::{FlightPermit, SingleFlight};
pub use scheduler::{
    BatchHandle, BatchReport, EmbeddingScheduler, SchedulerConfig, SchedulerEvent,
    SchedulerHandle, TickOutcome,
};
