//! # mural-core
//!
//! Batch anchor scheduler for dependency-ordered edits over a 2D tile grid.
//!
//! Start a run with [`batch::start_batch_run`], plugging in collaborators
//! for generation and parent refreshing; the engine handles wave formation,
//! overlap exclusion, retries, review gating, and parent pyramid rebuilds,
//! and publishes immutable state snapshots after every transition.

pub mod batch;
pub mod config;
pub mod error;
pub mod logging;

pub use batch::{start_batch_run, BatchRunHandle, BatchRunInput, BatchRunState};
pub use config::BatchRunConfig;
pub use error::{MuralError, Result};
