//! # kiln-core
//!
//! Core abstractions for the kiln instrument-activity orchestrator.
//!
//! This crate provides the foundational types used across all kiln components:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks, runs, campaigns,
//!   controllers, and remote activities
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap
//!
//! ## Crate Boundary
//!
//! `kiln-core` is the only crate allowed to define shared primitives.
//! All cross-component interaction happens via types defined here.
//!
//! ## Example
//!
//! ```rust
//! use kiln_core::prelude::*;
//!
//! let task_id = TaskId::generate();
//! let run_id = RunId::new("run-7f3a");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use id::{ActivityId, CampaignId, ControllerId, EventId, ProductId, RunId, TaskId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use kiln_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ActivityId, CampaignId, ControllerId, EventId, ProductId, RunId, TaskId};
    pub use crate::observability::{init_logging, LogFormat};
}
