//! Pure task state machine.
//!
//! [`TaskMachine::apply`] decides the successor of a task record for one
//! event. It performs no IO and holds no state beyond the retry policy; the
//! engine runs it inside the store's per-task update scope, so a decision and
//! its commit are atomic for that task.

use crate::error::TransitionError;
use crate::ledger::LedgerOutcome;
use crate::retry::RetryPolicy;
use crate::status::{ApprovalFailure, TaskStatus, Terminal};
use crate::task::{FailureCode, Task, TaskKind, TerminalReason};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// Claim the next submission attempt.
    BeginAttempt,
    /// Ledger feedback for one attempt.
    Ledger { attempt: u32, outcome: LedgerOutcome },
    /// Close out a confirmed task.
    Finalize,
    /// Confirmation window check for a sent task.
    Expire { window: Duration },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::BeginAttempt => "BeginAttempt",
            TaskEvent::Ledger { outcome, .. } => outcome.name(),
            TaskEvent::Finalize => "Finalize",
            TaskEvent::Expire { .. } => "Expire",
        }
    }
}

/// Whether the lifecycle allows `from -> to` for `kind`.
///
/// Unchanged non-terminal statuses are allowed: attempts are claimed and
/// retried failures recorded without a status change.
pub fn is_allowed(kind: TaskKind, from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if from.is_terminal() {
        return false;
    }
    if from == to {
        return true;
    }
    let reverted_ok = kind.has_approval_step();
    let success = success_terminal(kind);

    match (from, to) {
        (_, Finished(Terminal::Failed)) => true,
        (Opened | Approval(_), Approval(ApprovalFailure::Failed)) => true,
        (Opened | Approval(_), Approval(ApprovalFailure::Reverted)) => reverted_ok,
        (Opened | Approval(_), Sent) => true,
        (Opened | Approval(_) | Sent, Finished(Terminal::Denied)) => true,
        (Sent, Confirmed) => true,
        (Sent, Finished(Terminal::Timeout)) => true,
        (Confirmed, Finished(t)) => t == success,
        _ => false,
    }
}

fn success_terminal(kind: TaskKind) -> Terminal {
    match kind {
        TaskKind::CancelPayment => Terminal::Closed,
        TaskKind::NewPayment | TaskKind::ShopAction => Terminal::Completed,
    }
}

/// `from + delay`, saturating at the far future.
pub(crate) fn deadline(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone)]
pub struct TaskMachine {
    policy: RetryPolicy,
}

impl TaskMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn apply(
        &self,
        task: &Task,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) -> Result<Task, TransitionError> {
        if task.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(task.status));
        }

        let mut next = task.clone();
        next.updated_at = now.max(task.updated_at);

        match event {
            TaskEvent::BeginAttempt => {
                if task.in_flight || matches!(task.status, TaskStatus::Sent | TaskStatus::Confirmed)
                {
                    return Err(TransitionError::AlreadyInFlight);
                }
                if task.attempts >= self.policy.max_attempts {
                    return Err(TransitionError::AttemptsExhausted(self.policy.max_attempts));
                }
                next.attempts += 1;
                next.in_flight = true;
                next.transaction_handle = None;
                next.next_attempt_at = None;
            }

            TaskEvent::Ledger { attempt, outcome } => match outcome {
                LedgerOutcome::ApprovedFailedTx { reason }
                | LedgerOutcome::ApprovedRevertedTx { reason } => {
                    expect_open_attempt(task, *attempt, event)?;
                    let failure = match outcome {
                        LedgerOutcome::ApprovedRevertedTx { .. } => ApprovalFailure::Reverted,
                        _ => ApprovalFailure::Failed,
                    };
                    if failure == ApprovalFailure::Reverted && !task.kind().has_approval_step() {
                        return Err(inapplicable(task, event));
                    }

                    next.in_flight = false;
                    next.last_error = Some(reason.clone());
                    if self.policy.allows_retry_after(task.attempts) {
                        next.status = TaskStatus::Approval(failure);
                        next.next_attempt_at =
                            Some(deadline(now, self.policy.backoff(task.attempts)));
                    } else {
                        next.status = TaskStatus::Finished(Terminal::Failed);
                        next.next_attempt_at = None;
                        next.terminal_reason = Some(TerminalReason {
                            code: FailureCode::ApprovalExhausted,
                            message: reason.clone(),
                            attempts: task.attempts,
                        });
                    }
                }

                LedgerOutcome::ApprovedSentTx { handle } => {
                    expect_open_attempt(task, *attempt, event)?;
                    next.status = TaskStatus::Sent;
                    next.in_flight = false;
                    next.transaction_handle = Some(handle.clone());
                }

                LedgerOutcome::ApprovedConfirmedTx { handle } => {
                    if task.status != TaskStatus::Sent {
                        return Err(inapplicable(task, event));
                    }
                    expect_current_attempt(task, *attempt)?;
                    if task.transaction_handle.as_ref() != Some(handle) {
                        return Err(TransitionError::HandleMismatch);
                    }
                    next.status = TaskStatus::Confirmed;
                }

                LedgerOutcome::Denied { reason } => {
                    match task.status {
                        TaskStatus::Opened | TaskStatus::Approval(_) => {
                            expect_open_attempt(task, *attempt, event)?
                        }
                        TaskStatus::Sent => expect_current_attempt(task, *attempt)?,
                        _ => return Err(inapplicable(task, event)),
                    }
                    next.status = TaskStatus::Finished(Terminal::Denied);
                    next.in_flight = false;
                    next.next_attempt_at = None;
                    next.terminal_reason = Some(TerminalReason {
                        code: FailureCode::LedgerDenied,
                        message: reason.clone(),
                        attempts: task.attempts,
                    });
                }
            },

            TaskEvent::Finalize => {
                if task.status != TaskStatus::Confirmed {
                    return Err(inapplicable(task, event));
                }
                next.status = TaskStatus::Finished(success_terminal(task.kind()));
            }

            TaskEvent::Expire { window } => {
                if task.status != TaskStatus::Sent {
                    return Err(inapplicable(task, event));
                }
                if deadline(task.updated_at, *window) > now {
                    return Err(TransitionError::NotDue);
                }
                next.status = TaskStatus::Finished(Terminal::Timeout);
                next.terminal_reason = Some(TerminalReason {
                    code: FailureCode::ConfirmationTimeout,
                    message: format!(
                        "no confirmation within {}s of submission",
                        window.as_secs()
                    ),
                    attempts: task.attempts,
                });
            }
        }

        debug_assert!(is_allowed(task.kind(), task.status, next.status));
        Ok(next)
    }
}

fn inapplicable(task: &Task, event: &TaskEvent) -> TransitionError {
    TransitionError::Inapplicable {
        status: task.status,
        event: event.name(),
    }
}

fn expect_current_attempt(task: &Task, attempt: u32) -> Result<(), TransitionError> {
    if attempt != task.attempts {
        return Err(TransitionError::StaleAttempt {
            current: task.attempts,
            got: attempt,
        });
    }
    Ok(())
}

/// Approval outcomes only apply to the attempt that is still in flight.
fn expect_open_attempt(task: &Task, attempt: u32, event: &TaskEvent) -> Result<(), TransitionError> {
    if !task.status.awaits_submission() {
        return Err(inapplicable(task, event));
    }
    expect_current_attempt(task, attempt)?;
    if !task.in_flight {
        return Err(inapplicable(task, event));
    }
    Ok(())
}
