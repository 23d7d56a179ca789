//! Task status as two explicit axes: lifecycle phase and outcome.
//!
//! The relay's clients still see the flat status names (`"ApproveFailed"`,
//! `"Completed"`, ...) and the legacy integer codes, but both are derived here
//! at the serialization boundary. Inside the crate a status is always one of
//! the variants below, so combinations such as "confirmed but reverted" cannot
//! be constructed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Ordered lifecycle phase. A task's phase never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Opened,
    Approval,
    Sent,
    Confirmed,
    Finished,
}

/// Why an approval attempt did not produce a sent transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalFailure {
    /// The approval transaction could not be built, signed or submitted.
    Failed,
    /// The approval transaction was mined but reverted.
    Reverted,
}

/// Terminal states. Once reached, a task is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    Completed,
    Closed,
    Denied,
    Failed,
    Timeout,
}

impl Terminal {
    pub fn is_success(self) -> bool {
        matches!(self, Terminal::Completed | Terminal::Closed)
    }
}

/// Outcome axis of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Still progressing without a recorded failure.
    Pending,
    /// Progressing, but the latest attempt failed and will be retried.
    Retrying,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Opened,
    Approval(ApprovalFailure),
    Sent,
    Confirmed,
    Finished(Terminal),
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Opened,
        TaskStatus::Approval(ApprovalFailure::Failed),
        TaskStatus::Approval(ApprovalFailure::Reverted),
        TaskStatus::Sent,
        TaskStatus::Confirmed,
        TaskStatus::Finished(Terminal::Completed),
        TaskStatus::Finished(Terminal::Closed),
        TaskStatus::Finished(Terminal::Denied),
        TaskStatus::Finished(Terminal::Failed),
        TaskStatus::Finished(Terminal::Timeout),
    ];

    pub fn phase(self) -> Phase {
        match self {
            TaskStatus::Opened => Phase::Opened,
            TaskStatus::Approval(_) => Phase::Approval,
            TaskStatus::Sent => Phase::Sent,
            TaskStatus::Confirmed => Phase::Confirmed,
            TaskStatus::Finished(_) => Phase::Finished,
        }
    }

    pub fn outcome(self) -> Outcome {
        match self {
            TaskStatus::Opened | TaskStatus::Sent | TaskStatus::Confirmed => Outcome::Pending,
            TaskStatus::Approval(_) => Outcome::Retrying,
            TaskStatus::Finished(t) if t.is_success() => Outcome::Succeeded,
            TaskStatus::Finished(_) => Outcome::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished(_))
    }

    /// States from which a new submission attempt may start.
    pub fn awaits_submission(self) -> bool {
        matches!(self, TaskStatus::Opened | TaskStatus::Approval(_))
    }

    /// Flat status name used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Opened => "Opened",
            TaskStatus::Approval(ApprovalFailure::Failed) => "ApproveFailed",
            TaskStatus::Approval(ApprovalFailure::Reverted) => "ApproveReverted",
            TaskStatus::Sent => "Sent",
            TaskStatus::Confirmed => "Confirmed",
            TaskStatus::Finished(Terminal::Completed) => "Completed",
            TaskStatus::Finished(Terminal::Closed) => "Closed",
            TaskStatus::Finished(Terminal::Denied) => "Denied",
            TaskStatus::Finished(Terminal::Failed) => "Failed",
            TaskStatus::Finished(Terminal::Timeout) => "Timeout",
        }
    }

    /// Legacy flat integer code. The tens digit tracks the phase.
    pub fn legacy_code(self) -> u16 {
        match self {
            TaskStatus::Opened => 10,
            TaskStatus::Approval(ApprovalFailure::Failed) => 21,
            TaskStatus::Approval(ApprovalFailure::Reverted) => 22,
            TaskStatus::Sent => 30,
            TaskStatus::Confirmed => 40,
            TaskStatus::Finished(Terminal::Completed) => 50,
            TaskStatus::Finished(Terminal::Closed) => 51,
            TaskStatus::Finished(Terminal::Denied) => 52,
            TaskStatus::Finished(Terminal::Failed) => 53,
            TaskStatus::Finished(Terminal::Timeout) => 54,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl Serialize for TaskStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("Pending".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn legacy_codes_follow_phase_order() {
        let mut sorted = TaskStatus::ALL.to_vec();
        sorted.sort_by_key(|s| s.legacy_code());
        let phases: Vec<Phase> = sorted.iter().map(|s| s.phase()).collect();
        let mut ordered = phases.clone();
        ordered.sort();
        assert_eq!(phases, ordered);
    }

    #[test]
    fn terminal_statuses_split_by_outcome() {
        assert_eq!(TaskStatus::Finished(Terminal::Closed).outcome(), Outcome::Succeeded);
        assert_eq!(TaskStatus::Finished(Terminal::Timeout).outcome(), Outcome::Failed);
        assert_eq!(
            TaskStatus::Approval(ApprovalFailure::Reverted).outcome(),
            Outcome::Retrying
        );
        assert!(!TaskStatus::Confirmed.is_terminal());
    }
}
