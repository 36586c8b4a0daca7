//! Instance status state machines
//!
//! Statuses are persisted as snake_case strings; the transition relations
//! here are what the store enforces when applying observed state changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error for status strings read back from the store.
#[derive(Debug, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct StatusParseError(pub String);

/// Status of a workflow instance (run).
///
/// `Success` and `Failed` are terminal and monotone: once set they are never
/// reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl WorkflowInstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowInstanceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Status of a task instance (run step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInstanceStatus {
    Queued,
    Pushed,
    Running,
    Retrying,
    Success,
    Failed,
    TimedOut,
}

impl TaskInstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::TimedOut)
    }

    /// Terminal failure states; a workflow layer containing one fails the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Whether an observed transition from `self` to `next` is legal.
    ///
    /// Same-state reports are idempotent no-ops. Terminal states accept
    /// nothing. `Retrying` loops back to `Pushed`; everything else only
    /// moves forward along `queued -> pushed -> running -> terminal`.
    pub fn can_transition_to(&self, next: TaskInstanceStatus) -> bool {
        use TaskInstanceStatus::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Queued, Pushed)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, TimedOut)
                | (Pushed, Running)
                | (Pushed, Success)
                | (Pushed, Failed)
                | (Pushed, TimedOut)
                | (Pushed, Retrying)
                | (Running, Success)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Retrying)
                | (Retrying, Pushed)
                | (Retrying, Running)
                | (Retrying, Success)
                | (Retrying, Failed)
                | (Retrying, TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pushed => "pushed",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskInstanceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "pushed" => Ok(Self::Pushed),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskInstanceStatus::*;
    use super::*;

    #[test]
    fn workflow_terminal_statuses() {
        assert!(WorkflowInstanceStatus::Success.is_terminal());
        assert!(WorkflowInstanceStatus::Failed.is_terminal());
        assert!(!WorkflowInstanceStatus::Queued.is_terminal());
        assert!(!WorkflowInstanceStatus::Running.is_terminal());
    }

    #[test]
    fn task_status_round_trips_through_strings() {
        for status in [Queued, Pushed, Running, Retrying, Success, Failed, TimedOut] {
            assert_eq!(status.as_str().parse::<TaskInstanceStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskInstanceStatus>().is_err());
    }

    #[test]
    fn terminal_states_reject_all_transitions() {
        for terminal in [Success, Failed, TimedOut] {
            for next in [Queued, Pushed, Running, Retrying] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
            // idempotent re-report of the same terminal state is fine
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn retrying_loops_back_to_pushed() {
        assert!(Retrying.can_transition_to(Pushed));
        assert!(!Pushed.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Pushed));
    }

    #[test]
    fn forward_progression_is_legal() {
        assert!(Queued.can_transition_to(Pushed));
        assert!(Pushed.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(TimedOut));
    }
}
