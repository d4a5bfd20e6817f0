//! Job state machine.
//!
//! Lifecycle: a job is `Pending` until every dependency has `Succeeded`, then
//! `Ready`; `Ready -> Running` when a worker claims it; `Running` ends in
//! `Succeeded` or `Failed`, or drops back to `Pending` while a retry backoff
//! timer runs. A job whose dependency ends in `Failed` or `Skipped` is marked
//! `Skipped` and never runs. Only the scheduler mutates states.

use serde::{Deserialize, Serialize};

/// State of a job within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting on dependencies (or on a retry backoff timer).
    Pending,
    /// All dependencies succeeded; eligible for dispatch.
    Ready,
    /// Claimed by a worker; an attempt is in flight.
    Running,
    /// Final attempt exited successfully.
    Succeeded,
    /// All attempts exhausted without success.
    Failed,
    /// Never ran: a dependency failed or was skipped, or the batch was cancelled.
    Skipped,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Ready) | (Pending, Skipped) |
            // From Ready
            (Ready, Running) | (Ready, Skipped) |
            // From Running (Pending = retry backoff, Skipped = cancelled mid-flight)
            (Running, Succeeded) | (Running, Failed) |
            (Running, Pending) | (Running, Skipped)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Check if the job still participates in scheduling (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobState::Pending.can_transition_to(JobState::Ready));
        assert!(JobState::Ready.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Pending));
        assert!(JobState::Pending.can_transition_to(JobState::Skipped));
        assert!(JobState::Ready.can_transition_to(JobState::Skipped));
        assert!(JobState::Running.can_transition_to(JobState::Skipped));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Ready));
        assert!(!JobState::Skipped.can_transition_to(JobState::Ready));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Skipped.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Ready.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn job_state_display() {
        assert_eq!(JobState::Running.to_string(), "running");
        assert_eq!(JobState::Skipped.to_string(), "skipped");
    }

    #[test]
    fn job_state_serde_roundtrip() {
        let state = JobState::Succeeded;
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let parsed: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
