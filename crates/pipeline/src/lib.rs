//! `pipeline` crate: the workspace execution job pipeline.
//!
//! [`ExecutionController`] owns the job lifecycle: enqueueing jobs for a
//! batch spec, handing them to workers in fair order, recording their
//! progress, and finalizing them. Finalization turns the cache results found
//! in a job's execution log into cache entries and changeset specs in one
//! transaction.

pub mod cancel;
pub mod changeset;
pub mod config;
pub mod controller;
pub mod error;
pub mod finalize;
pub mod logs;
pub mod resetter;
pub mod retry;

pub use cancel::CancelOpts;
pub use config::LifecycleConfig;
pub use controller::{ExecutionController, MarkOpts};
pub use error::PipelineError;
pub use resetter::{run_resetter, ResetStats};
pub use retry::RetryOpts;

#[cfg(test)]
mod test_support;
