//! Per-job result types flowing from the scheduler into collection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::ParamSet;
use crate::spec::JobId;
use crate::state::JobState;

/// One captured output stream of a finished attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Captured {
    /// Captured text, lossy UTF-8.
    pub text: String,
    /// Whether the capture cap cut the stream short.
    pub truncated: bool,
    /// Total bytes the process wrote, including dropped ones.
    pub total_bytes: u64,
}

impl Captured {
    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Final attempt exited with a code outside the spec's success set.
    ExitCode { code: i32 },
    /// Process was killed by a signal.
    Signal,
    /// Final attempt exceeded its timeout and was killed.
    Timeout,
    /// Process could not be spawned or driven.
    SpawnFailed { message: String },
    /// Stdout did not match the expected output contract.
    MalformedOutput { message: String },
    /// A dependency ended failed or skipped; this job never ran.
    DependencyFailed { dependency: JobId },
    /// The batch was cancelled before or while this job ran.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitCode { code } => write!(f, "exit code {code}"),
            Self::Signal => write!(f, "killed by signal"),
            Self::Timeout => write!(f, "timed out"),
            Self::SpawnFailed { message } => write!(f, "spawn failed: {message}"),
            Self::MalformedOutput { message } => write!(f, "malformed output: {message}"),
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency {dependency} did not succeed")
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal outcome of one job. Emitted exactly once per job; retries fold
/// into [`JobResult::attempts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: JobId,
    /// Terminal state: `Succeeded`, `Failed` or `Skipped`.
    pub state: JobState,
    /// Exit code of the final attempt, if it exited normally.
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    /// Attempts actually started; 0 for jobs that never ran.
    pub attempts: u32,
    /// Wall-clock time of the final attempt.
    pub duration: Duration,
    pub reason: Option<FailureReason>,
    /// When the terminal state was reached.
    pub finished_at: DateTime<Utc>,
    /// Parameter bindings of the spec; results travel with their parameters.
    pub params: ParamSet,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }

    /// Result for a job that never ran.
    pub(crate) fn skipped(id: JobId, params: ParamSet, reason: FailureReason) -> Self {
        Self {
            id,
            state: JobState::Skipped,
            exit_code: None,
            stdout: Captured::default(),
            stderr: Captured::default(),
            attempts: 0,
            duration: Duration::ZERO,
            reason: Some(reason),
            finished_at: Utc::now(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_result_shape() {
        let result = JobResult::skipped(
            "b".into(),
            ParamSet::new(),
            FailureReason::DependencyFailed {
                dependency: "a".into(),
            },
        );
        assert_eq!(result.state, JobState::Skipped);
        assert_eq!(result.attempts, 0);
        assert!(!result.is_success());
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn failure_reason_serde_tag() {
        let reason = FailureReason::ExitCode { code: 3 };
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(json, r#"{"kind":"exit_code","code":3}"#);
    }

    #[test]
    fn failure_reason_display() {
        assert_eq!(FailureReason::Timeout.to_string(), "timed out");
        assert_eq!(
            FailureReason::DependencyFailed {
                dependency: "a".into()
            }
            .to_string(),
            "dependency a did not succeed"
        );
    }
}
