//! # sapphire-consensus
//!
//! Turns independent annotator submissions into one label per image.
//!
//! This crate provides:
//! - Index-wise mean aggregation of submitted regions
//! - Quorum evaluation that accepts or rejects a consensus through the
//!   image lifecycle
//! - The submission service used by annotators
//! - A plain-text result archive per dataset

pub mod aggregate;
pub mod export;
pub mod policy;
pub mod service;

pub use aggregate::{aggregate_regions, Aggregator, Evaluation};
pub use export::ResultExporter;
pub use policy::ConsensusPolicy;
pub use service::AnnotationService;
