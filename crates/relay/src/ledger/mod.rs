//! Ledger boundary.
//!
//! The relay never builds or signs ledger transactions itself. It hands a
//! [`SubmitRequest`] to a [`LedgerSubmitter`] and later watches the returned
//! [`TxHandle`] for an outcome. Adapters:
//!
//! - [`SimulatedLedger`]: deterministic in-memory ledger for local runs and tests.
//! - `HttpLedgerSubmitter` (feature `ledger-http`): talks to a signing gateway
//!   over HTTP with explicitly configured endpoint paths.

pub mod simulated;

#[cfg(feature = "ledger-http")]
pub mod http;

pub use simulated::{SimulatedLedger, SimulatedLedgerConfig};

use crate::task::{Sequence, Task};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque reference to a submitted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHandle(pub String);

impl TxHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contract call inputs derived from a task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFields {
    pub method: String,
    pub args: serde_json::Value,
}

/// One submission attempt for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub sequence: Sequence,
    pub attempt: u32,
    /// Stable per attempt, so a replayed attempt is recognised by the ledger side.
    pub idempotency_key: String,
    pub transaction: TransactionFields,
}

impl SubmitRequest {
    pub fn for_attempt(task: &Task) -> Self {
        Self {
            sequence: task.sequence,
            attempt: task.attempts,
            idempotency_key: format!("{}-{}", task.sequence, task.attempts),
            transaction: task.payload.transaction_fields(),
        }
    }
}

/// Result of an accepted submission call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Submission {
    /// Approval succeeded and the transaction is on its way to the ledger.
    Sent { handle: TxHandle },
    /// The approval transaction was mined but reverted.
    ApprovalReverted { reason: String },
}

/// Events observed while watching a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchEvent {
    Pending,
    Confirmed,
    Reverted { reason: String },
    Denied { reason: String },
}

impl WatchEvent {
    pub fn is_final(&self) -> bool {
        !matches!(self, WatchEvent::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("ledger network error: {0}")]
    Network(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("ledger protocol error: {0}")]
    Protocol(String),

    /// The ledger itself refused the request; resubmitting cannot help.
    #[error("ledger rejected the transaction: {0}")]
    Rejected(String),
}

impl SubmissionError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SubmissionError::Rejected(_))
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SubmissionError>>;

/// Builds, signs and submits ledger transactions on the relay's behalf.
#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmissionError>;

    /// Lazy stream of outcome events for `handle`.
    ///
    /// The stream ends after a final event. Watching is restartable: calling
    /// `watch` again with the same handle resumes observation, and the same
    /// final event may be delivered more than once.
    fn watch(&self, handle: &TxHandle) -> WatchStream;
}

/// Outcome notifications that drive the task state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum LedgerOutcome {
    ApprovedFailedTx { reason: String },
    ApprovedRevertedTx { reason: String },
    ApprovedSentTx { handle: TxHandle },
    ApprovedConfirmedTx { handle: TxHandle },
    Denied { reason: String },
}

impl LedgerOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerOutcome::ApprovedFailedTx { .. } => "ApprovedFailedTx",
            LedgerOutcome::ApprovedRevertedTx { .. } => "ApprovedRevertedTx",
            LedgerOutcome::ApprovedSentTx { .. } => "ApprovedSentTx",
            LedgerOutcome::ApprovedConfirmedTx { .. } => "ApprovedConfirmedTx",
            LedgerOutcome::Denied { .. } => "Denied",
        }
    }

    /// Maps a submission call result onto the outcome it represents.
    pub fn from_submission(result: Result<Submission, SubmissionError>) -> Self {
        match result {
            Ok(Submission::Sent { handle }) => LedgerOutcome::ApprovedSentTx { handle },
            Ok(Submission::ApprovalReverted { reason }) => {
                LedgerOutcome::ApprovedRevertedTx { reason }
            }
            Err(err) if err.is_permanent() => LedgerOutcome::Denied {
                reason: err.to_string(),
            },
            Err(err) => LedgerOutcome::ApprovedFailedTx {
                reason: err.to_string(),
            },
        }
    }

    /// Maps a final watch event for `handle`; `Pending` maps to nothing.
    pub fn from_watch(handle: &TxHandle, event: WatchEvent) -> Option<Self> {
        match event {
            WatchEvent::Pending => None,
            WatchEvent::Confirmed => Some(LedgerOutcome::ApprovedConfirmedTx {
                handle: handle.clone(),
            }),
            WatchEvent::Reverted { reason } | WatchEvent::Denied { reason } => {
                Some(LedgerOutcome::Denied { reason })
            }
        }
    }
}

/// An outcome addressed to one attempt of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEnvelope {
    pub sequence: Sequence,
    pub attempt: u32,
    pub outcome: LedgerOutcome,
}
