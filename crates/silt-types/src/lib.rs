//! # silt-types
//!
//! Shared domain types for the Silt indexing pipeline.
//!
//! This crate defines the core data structures used throughout the
//! pipeline:
//! - Etags: totally ordered document position markers
//! - Document records: the unit of ingestion and indexing
//! - Index identifiers and priorities
//! - Pipeline configuration
//!
//! ## Usage
//!
//! ```rust
//! use silt_types::{DocumentRecord, Etag};
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod etag;
pub mod ids;

pub use config::{ExecuterConfig, PipelineConfig, PoolConfig, PrefetchConfig, TunerConfig};
pub use document::DocumentRecord;
pub use error::TypesError;
pub use etag::Etag;
pub use ids::{IndexId, IndexPriority};
