//! Shared configuration, error types, IDs, data framing and observability
//! primitives for DQR crates.
//!
//! Architecture role:
//! - defines result limits/config passed from the query layer to coordinators
//! - provides common [`DqrError`] / [`Result`] contracts
//! - defines the [`Chunk`] row framing and the overflow [`ContinueEnvelope`]
//! - hosts the issue model, failure injection and metrics
//!
//! Key modules:
//! - [`chunk`]
//! - [`config`]
//! - [`error`]
//! - [`failure`]
//! - [`ids`]
//! - [`issue`]
//! - [`metrics`]

pub mod chunk;
pub mod config;
pub mod error;
pub mod failure;
pub mod ids;
pub mod issue;
pub mod metrics;

pub use chunk::{Chunk, ContinueEnvelope, RowFrames};
pub use config::{ResultConfig, ResultLimits};
pub use error::{DqrError, Result};
pub use failure::{FailureInjector, global_failure_injector};
pub use ids::*;
pub use issue::{Issue, IssueCode, IssueLog, Severity};
pub use metrics::MetricsRegistry;
