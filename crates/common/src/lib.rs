//! Shared configuration, error types, IDs, and observability primitives for GridFlow crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`GfqError`] / [`Result`] contracts
//! - hosts the metrics registry used by caches, the executor, and shuffle

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{GfqError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
