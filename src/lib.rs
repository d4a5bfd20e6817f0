//! Declarative batch runner for external-command experiments.
//!
//! Describe every process invocation as a [`JobSpec`] (command templates
//! over a parameter set, dependencies, retry policy), hand the set to a
//! [`Batch`], and get back a stream of per-job results plus a
//! [`BatchReport`] with streaming aggregates. Scheduling is
//! dependency-aware with a bounded worker pool; failures skip their
//! dependents instead of aborting the batch.

pub mod aggregate;
pub mod batch;
pub mod cancel;
pub mod collect;
pub mod config;
pub mod error;
pub mod graph;
pub mod params;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod spec;
pub mod state;

pub use batch::{Batch, BatchHandle, BatchReport};
pub use config::BatchConfig;
pub use error::{Error, Result};
pub use result::{FailureReason, JobResult};
pub use spec::{JobId, JobSpec};
pub use state::JobState;
