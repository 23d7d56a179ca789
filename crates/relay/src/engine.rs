//! The relay engine.
//!
//! [`TaskStateMachine`] owns every task from `open` to a terminal status.
//! Decisions come from the pure [`TaskMachine`] and are committed inside the
//! store's per-task update scope. Ledger IO runs on spawned tokio tasks that
//! rejoin through [`TaskStateMachine::deliver`]:
//!
//! ```text
//! open() ─► store.create ─► submit() ─► BeginAttempt (commit)
//!                                          │
//!                                          ▼ spawn
//!                                    ledger.submit ──┐
//!                                                    │ deliver()
//!               ┌──── per-sequence inbox ◄───────────┤
//!               ▼                                    │
//!          worker: advance() ─► commit ─► follow-up  │
//!                                   ├─ Approval(_) ─► retry timer ─► submit()
//!                                   ├─ Sent ───────► ledger.watch ─┘
//!                                   └─ Confirmed ──► Finalize (commit)
//! ```
//!
//! One worker drains each inbox, so ledger callbacks for a task are applied by
//! a single writer in arrival order. Stale and duplicate callbacks fail the
//! machine's attempt and status checks and are dropped.

use crate::config::{ConfigError, RelayConfig};
use crate::error::{RelayError, RelayResult, TransitionError};
use crate::ledger::{LedgerOutcome, LedgerSubmitter, OutcomeEnvelope, SubmitRequest, TxHandle};
use crate::machine::{TaskEvent, TaskMachine};
use crate::query::StatusQueryService;
use crate::status::{TaskStatus, Terminal};
use crate::store::{SequenceAllocator, TaskStore};
use crate::task::{CancelPayment, Sequence, Task, TaskKind, TaskPayload};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

/// Counts of the actions taken by one [`TaskStateMachine::recover`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Opened tasks that had never been submitted.
    pub dispatched: usize,
    /// In-flight attempts submitted again under their original idempotency key.
    pub replayed: usize,
    pub rescheduled: usize,
    pub rewatched: usize,
    pub finalized: usize,
}

pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    allocator: Arc<dyn SequenceAllocator>,
    ledger: Arc<dyn LedgerSubmitter>,
    config: RelayConfig,
}

impl EngineBuilder {
    /// Uses `store` for both persistence and sequence allocation.
    pub fn new<S>(store: Arc<S>, ledger: Arc<dyn LedgerSubmitter>) -> Self
    where
        S: TaskStore + SequenceAllocator + 'static,
    {
        Self {
            store: store.clone(),
            allocator: store,
            ledger,
            config: RelayConfig::default(),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn SequenceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TaskStateMachine, ConfigError> {
        self.config.validate()?;
        let machine = TaskMachine::new(self.config.retry.clone());
        Ok(TaskStateMachine {
            inner: Arc::new(Inner {
                store: self.store,
                allocator: self.allocator,
                ledger: self.ledger,
                config: self.config,
                machine,
                inboxes: DashMap::new(),
                watching: DashMap::new(),
                cancel_locks: DashMap::new(),
            }),
        })
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    allocator: Arc<dyn SequenceAllocator>,
    ledger: Arc<dyn LedgerSubmitter>,
    config: RelayConfig,
    machine: TaskMachine,
    inboxes: DashMap<Sequence, mpsc::UnboundedSender<OutcomeEnvelope>>,
    watching: DashMap<Sequence, AbortHandle>,
    cancel_locks: DashMap<Sequence, Arc<Mutex<()>>>,
}

/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct TaskStateMachine {
    inner: Arc<Inner>,
}

impl TaskStateMachine {
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.inner.store.clone()
    }

    pub fn query(&self) -> StatusQueryService {
        StatusQueryService::new(self.inner.store.clone(), self.inner.config.default_task)
    }

    /// Validates `payload`, persists an `Opened` task and returns its sequence.
    ///
    /// Cancellation payloads go through the same checks as [`Self::cancel`].
    pub async fn open(&self, payload: TaskPayload) -> RelayResult<Sequence> {
        if let TaskPayload::CancelPayment(cancel) = payload {
            return self.cancel(cancel.target, cancel.reason).await;
        }
        payload.validate()?;
        self.create(payload).await
    }

    /// Opens a cancellation of the completed payment `target`.
    pub async fn cancel(&self, target: Sequence, reason: Option<String>) -> RelayResult<Sequence> {
        let payload = TaskPayload::CancelPayment(CancelPayment { target, reason });
        payload.validate()?;

        let lock = self.inner.cancel_locks.entry(target).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.create_cancellation(target, payload).await
        };
        drop(lock);
        self.inner
            .cancel_locks
            .remove_if(&target, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn create_cancellation(
        &self,
        target: Sequence,
        payload: TaskPayload,
    ) -> RelayResult<Sequence> {
        let Some(original) = self.inner.store.get_by_sequence(target).await? else {
            return Err(RelayError::NotFound(format!("cancel target {target}")));
        };
        if original.kind() != TaskKind::NewPayment
            || original.status != TaskStatus::Finished(Terminal::Completed)
        {
            return Err(RelayError::NotFound(format!(
                "task {target} is not cancelable ({} in {})",
                original.kind(),
                original.status
            )));
        }

        let prior = self.inner.store.find_cancellations(target).await?;
        if let Some(existing) = prior.iter().find(|cancel| {
            !cancel.is_terminal() || cancel.status == TaskStatus::Finished(Terminal::Closed)
        }) {
            return Err(RelayError::NotFound(format!(
                "task {target} is not cancelable: cancellation {} is {}",
                existing.sequence, existing.status
            )));
        }

        self.create(payload).await
    }

    async fn create(&self, payload: TaskPayload) -> RelayResult<Sequence> {
        let sequence = self.inner.allocator.allocate().await?;
        let kind = payload.kind();
        self.inner
            .store
            .create(Task::opened(sequence, payload, Utc::now()))
            .await?;
        tracing::info!(sequence = %sequence, kind = %kind, "task opened");

        if self.inner.config.auto_submit {
            // The task exists either way; recovery re-dispatches it.
            if let Err(err) = self.submit(sequence).await {
                tracing::warn!(sequence = %sequence, error = %err, "initial submission not dispatched");
            }
        }
        Ok(sequence)
    }

    /// Claims the next attempt for `sequence` and dispatches it to the ledger.
    ///
    /// Fails with [`RelayError::AlreadyInFlight`] while an earlier attempt has
    /// not reported back.
    pub async fn submit(&self, sequence: Sequence) -> RelayResult<u32> {
        let task = self
            .commit(sequence, TaskEvent::BeginAttempt, Utc::now())
            .await?;
        self.spawn_submission(&task);
        Ok(task.attempts)
    }

    /// Applies one ledger outcome and runs its follow-up.
    ///
    /// Stale or duplicate outcomes fail with [`RelayError::InvalidTransition`]
    /// and leave the task untouched.
    pub async fn advance(&self, envelope: OutcomeEnvelope) -> RelayResult<Task> {
        let OutcomeEnvelope {
            sequence,
            attempt,
            outcome,
        } = envelope;
        let task = match self
            .commit(sequence, TaskEvent::Ledger { attempt, outcome }, Utc::now())
            .await
        {
            Ok(task) => task,
            Err(err @ RelayError::InvalidTransition { .. }) => {
                tracing::debug!(sequence = %sequence, attempt, error = %err, "ignored outcome");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.follow_up(task).await
    }

    /// Queues an outcome on the task's inbox.
    pub fn deliver(&self, envelope: OutcomeEnvelope) {
        let sequence = envelope.sequence;
        let mut pending = envelope;
        loop {
            let inbox = self
                .inner
                .inboxes
                .entry(sequence)
                .or_insert_with(|| self.spawn_worker(sequence))
                .clone();
            match inbox.send(pending) {
                Ok(()) => return,
                // The worker exited between lookup and send.
                Err(mpsc::error::SendError(returned)) => {
                    self.inner
                        .inboxes
                        .remove_if(&sequence, |_, current| current.same_channel(&inbox));
                    pending = returned;
                }
            }
        }
    }

    /// Moves every `Sent` task older than the confirmation window to `Timeout`.
    pub async fn timeout_sweep(&self, now: DateTime<Utc>) -> RelayResult<Vec<Sequence>> {
        let window = self.inner.config.confirmation_window();
        let limit = self.inner.config.scan_limit;
        let mut expired = Vec::new();
        let mut cursor = Sequence(0);

        loop {
            let page = self
                .inner
                .store
                .list_by_status(TaskStatus::Sent, cursor, limit)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence;
            let full = page.len() >= limit;

            for task in page {
                match self.commit(task.sequence, TaskEvent::Expire { window }, now).await {
                    Ok(_) => {
                        self.release(task.sequence);
                        expired.push(task.sequence);
                    }
                    // Not due yet, or settled since the listing.
                    Err(RelayError::InvalidTransition { .. }) => {}
                    Err(err) => {
                        tracing::warn!(sequence = %task.sequence, error = %err, "could not expire task");
                    }
                }
            }
            if !full {
                break;
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "timed out unconfirmed tasks");
        }
        Ok(expired)
    }

    pub fn spawn_timeout_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.timeout_sweep(Utc::now()).await {
                    tracing::warn!(error = %err, "timeout sweep failed");
                }
            }
        })
    }

    /// Re-drives unfinished tasks after a restart.
    pub async fn recover(&self) -> RelayResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let limit = self.inner.config.scan_limit;
        let mut cursor = Sequence(0);

        loop {
            let page = self.inner.store.list_unfinished(cursor, limit).await?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence;
            let full = page.len() >= limit;
            for task in page {
                self.recover_task(task, &mut report).await;
            }
            if !full {
                break;
            }
        }

        tracing::info!(
            dispatched = report.dispatched,
            replayed = report.replayed,
            rescheduled = report.rescheduled,
            rewatched = report.rewatched,
            finalized = report.finalized,
            "recovery pass finished"
        );
        Ok(report)
    }

    async fn recover_task(&self, task: Task, report: &mut RecoveryReport) {
        let sequence = task.sequence;
        match task.status {
            TaskStatus::Opened | TaskStatus::Approval(_) if task.in_flight => {
                self.spawn_submission(&task);
                report.replayed += 1;
            }
            TaskStatus::Opened if !self.inner.config.auto_submit => {}
            TaskStatus::Opened => match self.submit(sequence).await {
                Ok(_) => report.dispatched += 1,
                Err(err) => {
                    tracing::warn!(sequence = %sequence, error = %err, "could not dispatch task")
                }
            },
            TaskStatus::Approval(_) => {
                self.schedule_retry(sequence, task.next_attempt_at);
                report.rescheduled += 1;
            }
            TaskStatus::Sent => match task.transaction_handle.clone() {
                Some(handle) => {
                    self.spawn_watch(sequence, task.attempts, handle);
                    report.rewatched += 1;
                }
                None => tracing::error!(sequence = %sequence, "sent task has no transaction handle"),
            },
            TaskStatus::Confirmed => {
                match self.commit(sequence, TaskEvent::Finalize, Utc::now()).await {
                    Ok(_) => report.finalized += 1,
                    Err(err) => {
                        tracing::warn!(sequence = %sequence, error = %err, "could not finalize task")
                    }
                }
            }
            TaskStatus::Finished(_) => {}
        }
    }

    /// Runs `event` through the machine inside the task's update scope.
    async fn commit(
        &self,
        sequence: Sequence,
        event: TaskEvent,
        now: DateTime<Utc>,
    ) -> RelayResult<Task> {
        let machine = &self.inner.machine;
        let mut refused: Option<TransitionError> = None;
        let result = self
            .inner
            .store
            .update(
                sequence,
                Box::new(|task| match machine.apply(task, &event, now) {
                    Ok(next) => Some(next),
                    Err(err) => {
                        refused = Some(err);
                        None
                    }
                }),
            )
            .await?;

        if let Some(err) = refused {
            return Err(RelayError::transition(sequence, err));
        }
        if !result.applied {
            return Err(RelayError::transition(
                sequence,
                TransitionError::Inapplicable {
                    status: result.current.status,
                    event: event.name(),
                },
            ));
        }

        let task = result.current;
        match &task.terminal_reason {
            Some(reason) => tracing::warn!(
                sequence = %sequence,
                from = %result.previous.status,
                to = %task.status,
                event = event.name(),
                attempt = task.attempts,
                reason = %reason.message,
                "task failed"
            ),
            None => tracing::info!(
                sequence = %sequence,
                from = %result.previous.status,
                to = %task.status,
                event = event.name(),
                attempt = task.attempts,
                "task transition"
            ),
        }
        Ok(task)
    }

    async fn follow_up(&self, task: Task) -> RelayResult<Task> {
        match task.status {
            TaskStatus::Approval(_) => {
                self.schedule_retry(task.sequence, task.next_attempt_at);
                Ok(task)
            }
            TaskStatus::Sent => {
                if let Some(handle) = task.transaction_handle.clone() {
                    self.spawn_watch(task.sequence, task.attempts, handle);
                }
                Ok(task)
            }
            TaskStatus::Confirmed => {
                self.commit(task.sequence, TaskEvent::Finalize, Utc::now())
                    .await
            }
            TaskStatus::Opened | TaskStatus::Finished(_) => Ok(task),
        }
    }

    fn spawn_worker(&self, sequence: Sequence) -> mpsc::UnboundedSender<OutcomeEnvelope> {
        let (inbox, mut outcomes) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outcomes.recv().await {
                match engine.advance(envelope).await {
                    Ok(task) if task.is_terminal() => break,
                    // Late or duplicate outcome for a settled task.
                    Err(RelayError::InvalidTransition {
                        source: TransitionError::AlreadyTerminal(_),
                        ..
                    }) => break,
                    Ok(_) | Err(RelayError::InvalidTransition { .. }) => {}
                    Err(err @ RelayError::NotFound(_)) => {
                        tracing::warn!(sequence = %sequence, error = %err, "outcome for unknown task");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(sequence = %sequence, error = %err, "failed to apply outcome")
                    }
                }
            }
            outcomes.close();
            engine
                .inner
                .inboxes
                .remove_if(&sequence, |_, current| current.is_closed());
            tracing::debug!(sequence = %sequence, "task inbox closed");
        });
        inbox
    }

    fn spawn_submission(&self, task: &Task) {
        let engine = self.clone();
        let request = SubmitRequest::for_attempt(task);
        let kind = task.kind();
        tokio::spawn(async move {
            tracing::debug!(
                sequence = %request.sequence,
                attempt = request.attempt,
                method = %request.transaction.method,
                "submitting transaction"
            );
            let result = engine.inner.ledger.submit(&request).await;
            if let Err(err) = &result {
                tracing::warn!(
                    sequence = %request.sequence,
                    attempt = request.attempt,
                    error = %err,
                    permanent = err.is_permanent(),
                    "ledger submission failed"
                );
            }
            let outcome = match LedgerOutcome::from_submission(result) {
                LedgerOutcome::ApprovedRevertedTx { reason } if !kind.has_approval_step() => {
                    LedgerOutcome::ApprovedFailedTx { reason }
                }
                outcome => outcome,
            };
            engine.deliver(OutcomeEnvelope {
                sequence: request.sequence,
                attempt: request.attempt,
                outcome,
            });
        });
    }

    fn schedule_retry(&self, sequence: Sequence, at: Option<DateTime<Utc>>) {
        let delay = at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default();
        tracing::debug!(sequence = %sequence, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match engine.submit(sequence).await {
                Ok(attempt) => tracing::info!(sequence = %sequence, attempt, "retry dispatched"),
                Err(err) => tracing::debug!(sequence = %sequence, error = %err, "retry skipped"),
            }
        });
    }

    fn spawn_watch(&self, sequence: Sequence, attempt: u32, handle: TxHandle) {
        let Entry::Vacant(slot) = self.inner.watching.entry(sequence) else {
            return;
        };
        let engine = self.clone();
        let watch = tokio::spawn(async move {
            engine.watch_until_settled(sequence, attempt, &handle).await;
            let me = tokio::task::id();
            engine
                .inner
                .watching
                .remove_if(&sequence, |_, running| running.id() == me);
        });
        slot.insert(watch.abort_handle());
    }

    /// Drops the inbox and watch of a task that settled outside its worker.
    fn release(&self, sequence: Sequence) {
        self.inner.inboxes.remove(&sequence);
        if let Some((_, watch)) = self.inner.watching.remove(&sequence) {
            watch.abort();
        }
    }

    /// Feeds watch events into the inbox, re-subscribing until the task
    /// leaves `Sent` for `handle`.
    async fn watch_until_settled(&self, sequence: Sequence, attempt: u32, handle: &TxHandle) {
        loop {
            let mut events = self.inner.ledger.watch(handle);
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        let is_final = event.is_final();
                        if let Some(outcome) = LedgerOutcome::from_watch(handle, event) {
                            self.deliver(OutcomeEnvelope {
                                sequence,
                                attempt,
                                outcome,
                            });
                        }
                        if is_final {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(sequence = %sequence, handle = %handle, error = %err, "watch stream failed");
                        break;
                    }
                }
            }

            tokio::time::sleep(self.inner.config.watch_resubscribe_delay()).await;
            match self.inner.store.get_by_sequence(sequence).await {
                Ok(Some(task))
                    if task.status == TaskStatus::Sent
                        && task.transaction_handle.as_ref() == Some(handle) =>
                {
                    tracing::debug!(sequence = %sequence, handle = %handle, "re-subscribing to transaction");
                }
                Ok(_) => return,
                Err(err) => {
                    tracing::warn!(sequence = %sequence, error = %err, "could not read task while watching")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultCode;
    use crate::ledger::{Submission, SubmissionError, WatchEvent, WatchStream};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryTaskStore;
    use crate::task::{FailureCode, NewPayment};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` submissions, then sends. Watches confirm
    /// unless `confirm` is off, in which case they stay pending forever.
    struct FlakyLedger {
        failures: AtomicU32,
        submits: AtomicU32,
        confirm: bool,
    }

    impl FlakyLedger {
        fn new(failures: u32, confirm: bool) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                submits: AtomicU32::new(0),
                confirm,
            })
        }
    }

    #[async_trait]
    impl LedgerSubmitter for FlakyLedger {
        async fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmissionError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SubmissionError::Network("connection reset".into()));
            }
            Ok(Submission::Sent {
                handle: TxHandle(format!("0x{}", request.idempotency_key)),
            })
        }

        fn watch(&self, _handle: &TxHandle) -> WatchStream {
            if self.confirm {
                stream::iter(vec![Ok(WatchEvent::Pending), Ok(WatchEvent::Confirmed)]).boxed()
            } else {
                stream::pending().boxed()
            }
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
            },
            watch_resubscribe_ms: 10,
            ..RelayConfig::default()
        }
    }

    fn engine(store: &Arc<MemoryTaskStore>, ledger: Arc<FlakyLedger>, config: RelayConfig) -> TaskStateMachine {
        EngineBuilder::new(store.clone(), ledger)
            .with_config(config)
            .build()
            .unwrap()
    }

    fn payment(amount: i64) -> TaskPayload {
        TaskPayload::NewPayment(NewPayment {
            purchase_id: "P-1".into(),
            shop: "S1".into(),
            amount,
            account: None,
        })
    }

    async fn wait_for(
        store: &MemoryTaskStore,
        sequence: Sequence,
        done: impl Fn(&Task) -> bool,
    ) -> Task {
        for _ in 0..1_000 {
            if let Some(task) = store.get_by_sequence(sequence).await.unwrap() {
                if done(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {sequence} never reached the expected state");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_payload_creates_nothing() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, true), config());

        let err = engine.open(payment(-5)).await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ValidationFailed);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_retried_then_completes() {
        let store = Arc::new(MemoryTaskStore::starting_at(42));
        let ledger = FlakyLedger::new(1, true);
        let engine = engine(&store, ledger.clone(), config());

        let sequence = engine.open(payment(100)).await.unwrap();
        assert_eq!(sequence, Sequence(42));

        let task = wait_for(&store, sequence, Task::is_terminal).await;
        assert_eq!(task.status, TaskStatus::Finished(Terminal::Completed));
        assert_eq!(task.attempts, 2);
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 2);
        assert_eq!(task.last_error.as_deref(), Some("ledger network error: connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_stops_at_max_attempts() {
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = FlakyLedger::new(u32::MAX, true);
        let engine = engine(&store, ledger.clone(), config());

        let sequence = engine.open(payment(1)).await.unwrap();
        let task = wait_for(&store, sequence, Task::is_terminal).await;

        assert_eq!(task.status, TaskStatus::Finished(Terminal::Failed));
        assert_eq!(task.attempts, 3);
        assert_eq!(
            task.terminal_reason.map(|r| r.code),
            Some(FailureCode::ApprovalExhausted)
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submits_admit_one_attempt() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(
            &store,
            FlakyLedger::new(0, false),
            RelayConfig {
                auto_submit: false,
                ..config()
            },
        );
        let sequence = engine.open(payment(1)).await.unwrap();

        let (a, b) = tokio::join!(engine.submit(sequence), engine.submit(sequence));
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(1))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(RelayError::AlreadyInFlight(s)) if *s == sequence))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_outcomes_are_ignored() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, false), config());

        let sequence = engine.open(payment(1)).await.unwrap();
        let sent = wait_for(&store, sequence, |t| t.status == TaskStatus::Sent).await;
        let handle = sent.transaction_handle.clone().unwrap();

        let replay = OutcomeEnvelope {
            sequence,
            attempt: 1,
            outcome: LedgerOutcome::ApprovedSentTx {
                handle: handle.clone(),
            },
        };
        assert!(matches!(
            engine.advance(replay).await,
            Err(RelayError::InvalidTransition { .. })
        ));

        let confirmed = OutcomeEnvelope {
            sequence,
            attempt: 1,
            outcome: LedgerOutcome::ApprovedConfirmedTx { handle },
        };
        let done = engine.advance(confirmed.clone()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Finished(Terminal::Completed));

        assert!(engine.advance(confirmed).await.is_err());
        let after = store.get_by_sequence(sequence).await.unwrap().unwrap();
        assert_eq!(after, done);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_only_overdue_sent_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, false), config());

        let sequence = engine.open(payment(1)).await.unwrap();
        wait_for(&store, sequence, |t| t.status == TaskStatus::Sent).await;

        assert!(engine.timeout_sweep(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(engine.timeout_sweep(later).await.unwrap(), vec![sequence]);
        let task = store.get_by_sequence(sequence).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished(Terminal::Timeout));

        let much_later = later + chrono::Duration::seconds(601);
        assert!(engine.timeout_sweep(much_later).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_requires_a_completed_payment() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, true), config());

        let missing = engine.cancel(Sequence(77), None).await.unwrap_err();
        assert_eq!(missing.result_code(), ResultCode::NotFound);

        let payment_seq = engine.open(payment(10)).await.unwrap();
        let early = engine.cancel(payment_seq, None).await.unwrap_err();
        assert_eq!(early.result_code(), ResultCode::NotFound);

        wait_for(&store, payment_seq, Task::is_terminal).await;
        let cancel_seq = engine
            .cancel(payment_seq, Some("customer request".into()))
            .await
            .unwrap();
        let cancel = wait_for(&store, cancel_seq, Task::is_terminal).await;
        assert_eq!(cancel.status, TaskStatus::Finished(Terminal::Closed));

        let again = engine.cancel(payment_seq, None).await.unwrap_err();
        assert_eq!(again.result_code(), ResultCode::NotFound);

        let of_cancel = engine.cancel(cancel_seq, None).await.unwrap_err();
        assert_eq!(of_cancel.result_code(), ResultCode::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_resumes_every_unfinished_stage() {
        let store = Arc::new(MemoryTaskStore::starting_at(10));
        let now = Utc::now();

        let mut in_flight = Task::opened(Sequence(1), payment(1), now);
        in_flight.attempts = 1;
        in_flight.in_flight = true;

        let mut sent = Task::opened(Sequence(2), payment(2), now);
        sent.status = TaskStatus::Sent;
        sent.attempts = 1;
        sent.transaction_handle = Some(TxHandle("0xabc".into()));

        let mut confirmed = sent.clone();
        confirmed.sequence = Sequence(3);
        confirmed.status = TaskStatus::Confirmed;

        for task in [in_flight, sent, confirmed] {
            store.create(task).await.unwrap();
        }

        let ledger = FlakyLedger::new(0, true);
        let engine = engine(&store, ledger.clone(), config());
        let report = engine.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                replayed: 1,
                rewatched: 1,
                finalized: 1,
                ..RecoveryReport::default()
            }
        );

        for seq in 1..=3 {
            let task = wait_for(&store, Sequence(seq), Task::is_terminal).await;
            assert_eq!(task.status, TaskStatus::Finished(Terminal::Completed));
            assert_eq!(task.attempts, 1);
        }
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_outcomes_leave_no_worker_behind() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, true), config());

        let sequence = engine.open(payment(1)).await.unwrap();
        let done = wait_for(&store, sequence, Task::is_terminal).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.inner.inboxes.is_empty());

        let late = OutcomeEnvelope {
            sequence,
            attempt: done.attempts,
            outcome: LedgerOutcome::ApprovedConfirmedTx {
                handle: done.transaction_handle.clone().unwrap(),
            },
        };
        for _ in 0..3 {
            engine.deliver(late.clone());
        }
        tokio::time::sleep(Duration::from_secs(3_600)).await;

        assert!(engine.inner.inboxes.is_empty());
        assert_eq!(store.get_by_sequence(sequence).await.unwrap().unwrap(), done);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_releases_inbox_and_stalled_watch() {
        let store = Arc::new(MemoryTaskStore::new());
        let engine = engine(&store, FlakyLedger::new(0, false), config());

        let sequence = engine.open(payment(1)).await.unwrap();
        let sent = wait_for(&store, sequence, |t| t.status == TaskStatus::Sent).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.inner.watching.contains_key(&sequence));

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(engine.timeout_sweep(later).await.unwrap(), vec![sequence]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.inner.watching.is_empty());
        assert!(engine.inner.inboxes.is_empty());

        // A confirmation after the timeout is dropped without a lingering worker.
        engine.deliver(OutcomeEnvelope {
            sequence,
            attempt: sent.attempts,
            outcome: LedgerOutcome::ApprovedConfirmedTx {
                handle: sent.transaction_handle.unwrap(),
            },
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.inner.inboxes.is_empty());
        let task = store.get_by_sequence(sequence).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished(Terminal::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_pages_past_scan_limit() {
        let store = Arc::new(MemoryTaskStore::starting_at(10));
        let now = Utc::now();
        for seq in 1..=3 {
            store
                .create(Task::opened(Sequence(seq), payment(seq as i64), now))
                .await
                .unwrap();
        }

        let engine = engine(
            &store,
            FlakyLedger::new(0, true),
            RelayConfig {
                scan_limit: 1,
                ..config()
            },
        );
        let report = engine.recover().await.unwrap();
        assert_eq!(report.dispatched, 3);

        for seq in 1..=3 {
            let task = wait_for(&store, Sequence(seq), Task::is_terminal).await;
            assert_eq!(task.status, TaskStatus::Finished(Terminal::Completed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_pages_past_scan_limit() {
        let store = Arc::new(MemoryTaskStore::starting_at(10));
        let now = Utc::now();
        for seq in 1..=3 {
            let mut task = Task::opened(Sequence(seq), payment(seq as i64), now);
            task.status = TaskStatus::Sent;
            task.attempts = 1;
            task.transaction_handle = Some(TxHandle(format!("0x{seq}")));
            store.create(task).await.unwrap();
        }

        let engine = engine(
            &store,
            FlakyLedger::new(0, false),
            RelayConfig {
                scan_limit: 1,
                ..config()
            },
        );
        let later = now + chrono::Duration::seconds(601);
        let expired = engine.timeout_sweep(later).await.unwrap();
        assert_eq!(expired, vec![Sequence(1), Sequence(2), Sequence(3)]);
    }
}
