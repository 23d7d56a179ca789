//! A ledger whose behaviour is scripted per task.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use relay_core::{
    LedgerSubmitter, Sequence, Submission, SubmissionError, SubmitRequest, TxHandle, WatchEvent,
    WatchStream,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// What one `submit` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStep {
    /// Accept and hand out a handle derived from the idempotency key.
    Send,
    /// Approval mined but reverted.
    Revert(String),
    /// Retryable transport failure.
    Fail(String),
    /// The ledger refuses the transaction outright.
    Reject(String),
    /// Never return.
    Hang,
}

/// What a watch subscription for a task's handle yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPlan {
    /// `Pending`, then `Confirmed`.
    Confirm,
    /// `Pending`, then `Denied`.
    Deny(String),
    /// `Pending` once, then nothing ever again.
    Stall,
    /// The first `failures` subscriptions error out, later ones confirm.
    FlakyThenConfirm { failures: u32 },
}

pub struct ScriptedLedger {
    submit_steps: DashMap<Sequence, VecDeque<SubmitStep>>,
    watch_plans: DashMap<Sequence, WatchPlan>,
    default_watch: Mutex<WatchPlan>,
    handles: DashMap<TxHandle, Sequence>,
    subscriptions: DashMap<Sequence, u32>,
    submissions: Mutex<Vec<SubmitRequest>>,
    submit_delay: Duration,
}

impl Default for ScriptedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLedger {
    /// Every submission is sent and every watch confirms unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            submit_steps: DashMap::new(),
            watch_plans: DashMap::new(),
            default_watch: Mutex::new(WatchPlan::Confirm),
            handles: DashMap::new(),
            subscriptions: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            submit_delay: Duration::ZERO,
        }
    }

    /// Every `submit` call sleeps this long before answering.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Queues steps for the next submissions of `sequence`. Once drained,
    /// submissions fall back to [`SubmitStep::Send`].
    pub fn script_submits(&self, sequence: Sequence, steps: impl IntoIterator<Item = SubmitStep>) {
        self.submit_steps
            .entry(sequence)
            .or_default()
            .extend(steps);
    }

    pub fn script_watch(&self, sequence: Sequence, plan: WatchPlan) {
        self.watch_plans.insert(sequence, plan);
    }

    /// Makes `handle` watchable for `sequence` without a submission, as if it
    /// had been sent before a restart.
    pub fn register_handle(&self, handle: TxHandle, sequence: Sequence) {
        self.handles.insert(handle, sequence);
    }

    pub fn set_default_watch(&self, plan: WatchPlan) {
        if let Ok(mut default) = self.default_watch.lock() {
            *default = plan;
        }
    }

    /// Every request received, in arrival order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions
            .lock()
            .map(|recorded| recorded.clone())
            .unwrap_or_default()
    }

    pub fn submissions_for(&self, sequence: Sequence) -> Vec<SubmitRequest> {
        self.submissions()
            .into_iter()
            .filter(|request| request.sequence == sequence)
            .collect()
    }

    /// Number of watch subscriptions opened for `sequence`.
    pub fn subscriptions(&self, sequence: Sequence) -> u32 {
        self.subscriptions
            .get(&sequence)
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn next_step(&self, sequence: Sequence) -> SubmitStep {
        self.submit_steps
            .get_mut(&sequence)
            .and_then(|mut steps| steps.pop_front())
            .unwrap_or(SubmitStep::Send)
    }

    fn plan_for(&self, sequence: Sequence) -> WatchPlan {
        match self.watch_plans.get(&sequence) {
            Some(plan) => plan.clone(),
            None => self
                .default_watch
                .lock()
                .map(|plan| plan.clone())
                .unwrap_or(WatchPlan::Confirm),
        }
    }
}

#[async_trait]
impl LedgerSubmitter for ScriptedLedger {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmissionError> {
        if let Ok(mut recorded) = self.submissions.lock() {
            recorded.push(request.clone());
        }
        let step = self.next_step(request.sequence);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        tracing::debug!(sequence = %request.sequence, attempt = request.attempt, ?step, "scripted submit");

        match step {
            SubmitStep::Send => {
                let handle = TxHandle(format!("0x{}", request.idempotency_key));
                self.handles.insert(handle.clone(), request.sequence);
                Ok(Submission::Sent { handle })
            }
            SubmitStep::Revert(reason) => Ok(Submission::ApprovalReverted { reason }),
            SubmitStep::Fail(reason) => Err(SubmissionError::Network(reason)),
            SubmitStep::Reject(reason) => Err(SubmissionError::Rejected(reason)),
            SubmitStep::Hang => futures::future::pending().await,
        }
    }

    fn watch(&self, handle: &TxHandle) -> WatchStream {
        let Some(sequence) = self.handles.get(handle).map(|entry| *entry.value()) else {
            let message = format!("unknown transaction {handle}");
            return stream::once(async move { Err(SubmissionError::Protocol(message)) }).boxed();
        };
        let subscription = {
            let mut count = self.subscriptions.entry(sequence).or_insert(0);
            *count += 1;
            *count
        };

        match self.plan_for(sequence) {
            WatchPlan::Confirm => {
                stream::iter(vec![Ok(WatchEvent::Pending), Ok(WatchEvent::Confirmed)]).boxed()
            }
            WatchPlan::Deny(reason) => {
                stream::iter(vec![Ok(WatchEvent::Pending), Ok(WatchEvent::Denied { reason })])
                    .boxed()
            }
            WatchPlan::Stall => stream::once(async { Ok(WatchEvent::Pending) })
                .chain(stream::pending())
                .boxed(),
            WatchPlan::FlakyThenConfirm { failures } if subscription <= failures => {
                stream::iter(vec![
                    Ok(WatchEvent::Pending),
                    Err(SubmissionError::Network("subscription dropped".into())),
                ])
                .boxed()
            }
            WatchPlan::FlakyThenConfirm { .. } => stream::iter(vec![Ok(WatchEvent::Confirmed)]).boxed(),
        }
    }
}
