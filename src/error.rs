//! Error types for jobfarm.

use crate::spec::JobId;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Job specification errors. Raised while authoring specs, before a batch starts.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Job id must not be empty")]
    EmptyId,

    #[error("Job {id} has an empty program")]
    EmptyProgram { id: JobId },

    #[error("Unknown placeholder {{{name}}} in template \"{template}\"")]
    UnknownPlaceholder { name: String, template: String },

    #[error("Unbalanced braces in template \"{template}\"")]
    UnbalancedBraces { template: String },

    #[error("Retry policy must allow at least one attempt")]
    ZeroAttempts,

    #[error("Zipped parameter axes have mismatched lengths: {left} vs {right}")]
    UnevenZip { left: usize, right: usize },

    #[error("Instantiation produced duplicate job id {id}")]
    DuplicateInstance { id: JobId },
}

/// Dependency graph errors. Fatal at build time, the batch never starts.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate job id {id}")]
    DuplicateId { id: JobId },

    #[error("Job {id} depends on unknown job {dependency}")]
    UnknownDependency { id: JobId, dependency: JobId },

    #[error("Job {id} depends on itself")]
    SelfDependency { id: JobId },

    #[error("Dependency cycle among jobs: {}", join_ids(ids))]
    Cycle { ids: Vec<JobId> },
}

/// Errors around spawning and driving a child process. Recorded per job
/// attempt and subject to the retry policy, never fatal to the batch.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read stdin file {path}: {source}")]
    StdinFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result sink errors. Reported per batch, never unwind into scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Batch configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

fn join_ids(ids: &[JobId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
