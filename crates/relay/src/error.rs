//! Error taxonomy for the relay.
//!
//! Errors fall into two groups. Validation, lookup and concurrency-guard
//! errors surface to the caller through the result envelope. Ledger-side
//! failures never reach the original caller synchronously: they are absorbed
//! into task state and observed later through the query boundary.

use crate::envelope::ResultCode;
use crate::ledger::SubmissionError;
use crate::status::TaskStatus;
use crate::task::Sequence;
use thiserror::Error;

/// A malformed client request. Raised before any task is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("amount must be non-negative, got {0}")]
    NegativeAmount(i64),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid task selector `{0}`: expected a sequence, \"latest\" or \"0\"")]
    Selector(String),
}

/// Why the state machine refused an event for a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task is already terminal ({0})")]
    AlreadyTerminal(TaskStatus),

    #[error("event `{event}` does not apply in state {status}")]
    Inapplicable { status: TaskStatus, event: &'static str },

    #[error("stale outcome for attempt {got}, current attempt is {current}")]
    StaleAttempt { current: u32, got: u32 },

    #[error("outcome for a transaction handle this task does not hold")]
    HandleMismatch,

    #[error("a submission attempt is already in flight")]
    AlreadyInFlight,

    #[error("attempt budget of {0} is exhausted")]
    AttemptsExhausted(u32),

    #[error("confirmation window has not elapsed")]
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(Sequence),

    #[error("sequence {0} already exists")]
    DuplicateSequence(Sequence),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("sequence {0} already exists")]
    DuplicateSequence(Sequence),

    #[error("task {0} already has a submission in flight")]
    AlreadyInFlight(Sequence),

    #[error("ledger submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("invalid transition for task {sequence}: {source}")]
    InvalidTransition {
        sequence: Sequence,
        #[source]
        source: TransitionError,
    },

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(sequence) => RelayError::NotFound(format!("task {sequence}")),
            StoreError::DuplicateSequence(sequence) => RelayError::DuplicateSequence(sequence),
            other => RelayError::Store(other),
        }
    }
}

impl RelayError {
    pub(crate) fn transition(sequence: Sequence, source: TransitionError) -> Self {
        match source {
            TransitionError::AlreadyInFlight => RelayError::AlreadyInFlight(sequence),
            source => RelayError::InvalidTransition { sequence, source },
        }
    }

    /// Result code reported in the envelope for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            RelayError::Validation(_) => ResultCode::ValidationFailed,
            RelayError::NotFound(_) => ResultCode::NotFound,
            RelayError::DuplicateSequence(_) | RelayError::AlreadyInFlight(_) => {
                ResultCode::Conflict
            }
            RelayError::Submission(_) => ResultCode::LedgerError,
            RelayError::InvalidTransition { .. } => ResultCode::Conflict,
            RelayError::Store(_) => ResultCode::Internal,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_fold_into_relay_taxonomy() {
        let err: RelayError = StoreError::NotFound(Sequence(9)).into();
        assert_eq!(err.result_code(), ResultCode::NotFound);
        assert!(err.to_string().contains('9'));

        let err: RelayError = StoreError::DuplicateSequence(Sequence(3)).into();
        assert!(matches!(err, RelayError::DuplicateSequence(Sequence(3))));

        let err: RelayError = StoreError::Backend("connection reset".into()).into();
        assert_eq!(err.result_code(), ResultCode::Internal);
    }

    #[test]
    fn in_flight_transition_maps_to_guard_error() {
        let err = RelayError::transition(Sequence(4), TransitionError::AlreadyInFlight);
        assert!(matches!(err, RelayError::AlreadyInFlight(Sequence(4))));
        assert_eq!(err.result_code(), ResultCode::Conflict);
    }
}
