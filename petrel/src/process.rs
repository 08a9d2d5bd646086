use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id! {
    /// Registry-assigned identifier of a process (one launch of a computation).
    ProcessId
}

string_id! {
    /// Identifier of the experiment a process belongs to.
    ExperimentId
}

string_id! {
    /// Identifier of the gateway that submitted the experiment.
    GatewayId
}

string_id! {
    /// Credential-store token used to resolve the credentials for a launch.
    TokenId
}

/// Launch request as carried on the message bus.
///
/// Immutable; the same event may arrive more than once (redelivery) and may
/// arrive after a cancellation request for the same process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessLaunchEvent {
    pub process_id: ProcessId,
    pub experiment_id: ExperimentId,
    pub gateway_id: GatewayId,
    pub token_id: TokenId,
}

/// Lifecycle state of a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Created,
    Validated,
    Started,
    Executing,
    Cancelling,
    Canceled,
    Completed,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "CREATED",
            ProcessState::Validated => "VALIDATED",
            ProcessState::Started => "STARTED",
            ProcessState::Executing => "EXECUTING",
            ProcessState::Cancelling => "CANCELLING",
            ProcessState::Canceled => "CANCELED",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Failed => "FAILED",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Canceled | ProcessState::Completed | ProcessState::Failed
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    ///
    /// Same-state writes are allowed (idempotent refresh on redelivery).
    /// Cancelling is reachable only from Started and Executing.
    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            ProcessState::Created => matches!(
                next,
                ProcessState::Validated | ProcessState::Started | ProcessState::Failed
            ),
            ProcessState::Validated => {
                matches!(next, ProcessState::Started | ProcessState::Failed)
            }
            ProcessState::Started => matches!(
                next,
                ProcessState::Executing
                    | ProcessState::Completed
                    | ProcessState::Failed
                    | ProcessState::Cancelling
            ),
            ProcessState::Executing => matches!(
                next,
                ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelling
            ),
            ProcessState::Cancelling => matches!(next, ProcessState::Canceled),
            ProcessState::Canceled | ProcessState::Completed | ProcessState::Failed => false,
        }
    }
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a process's append-only status history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl ProcessStatus {
    pub fn new(state: ProcessState) -> Self {
        Self {
            state,
            reason: None,
            changed_at: Utc::now(),
        }
    }

    pub fn with_reason(state: ProcessState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
            changed_at: Utc::now(),
        }
    }
}

/// Canonical state of a remote batch-scheduler job.
///
/// Scheduler-specific state letters/words are normalized to this enum by the
/// output parser family.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Queued,
    Active,
    Suspended,
    Canceled,
    Failed,
    Complete,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Queued => "QUEUED",
            JobState::Active => "ACTIVE",
            JobState::Suspended => "SUSPENDED",
            JobState::Canceled => "CANCELED",
            JobState::Failed => "FAILED",
            JobState::Complete => "COMPLETE",
            JobState::Unknown => "UNKNOWN",
        }
    }

    /// Whether the job has left the scheduler for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Canceled | JobState::Failed | JobState::Complete
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a job's status stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub changed_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            changed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelling_only_reachable_from_started_or_executing() {
        assert!(ProcessState::Started.can_transition_to(ProcessState::Cancelling));
        assert!(ProcessState::Executing.can_transition_to(ProcessState::Cancelling));

        assert!(!ProcessState::Created.can_transition_to(ProcessState::Cancelling));
        assert!(!ProcessState::Validated.can_transition_to(ProcessState::Cancelling));
        assert!(!ProcessState::Completed.can_transition_to(ProcessState::Cancelling));
        assert!(!ProcessState::Failed.can_transition_to(ProcessState::Cancelling));
        assert!(!ProcessState::Canceled.can_transition_to(ProcessState::Cancelling));
    }

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [
            ProcessState::Completed,
            ProcessState::Failed,
            ProcessState::Canceled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                ProcessState::Created,
                ProcessState::Validated,
                ProcessState::Started,
                ProcessState::Executing,
                ProcessState::Cancelling,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn test_same_state_transition_is_idempotent() {
        assert!(ProcessState::Started.can_transition_to(ProcessState::Started));
        assert!(ProcessState::Executing.can_transition_to(ProcessState::Executing));
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            ProcessState::Created,
            ProcessState::Validated,
            ProcessState::Started,
            ProcessState::Executing,
            ProcessState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn test_cancelling_resolves_to_canceled_only() {
        assert!(ProcessState::Cancelling.can_transition_to(ProcessState::Canceled));
        assert!(!ProcessState::Cancelling.can_transition_to(ProcessState::Failed));
        assert!(!ProcessState::Cancelling.can_transition_to(ProcessState::Completed));
    }

    #[test]
    fn test_job_state_terminality() {
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
    }
}
