//! Restart recovery: a fresh engine over a store left behind by a previous one.

use chrono::{Duration as ChronoDuration, Utc};
use relay_core::{
    ApprovalFailure, MemoryTaskStore, RecoveryReport, RelayConfig, Sequence, Task, TaskPayload,
    TaskStatus, TaskStore, Terminal, TxHandle,
};
use relay_testing::{fast_config, new_payment, Harness, ScriptedLedger, WatchPlan};

const COMPLETED: TaskStatus = TaskStatus::Finished(Terminal::Completed);

fn task(sequence: u64, payload: TaskPayload) -> Task {
    Task::opened(Sequence(sequence), payload, Utc::now())
}

/// One task left in every unfinished state a crash can leave behind.
async fn crashed_store() -> MemoryTaskStore {
    let store = MemoryTaskStore::starting_at(100);

    // Opened, never submitted.
    store.create(task(1, new_payment("P-1", "S1", 10))).await.unwrap();

    // Submission in flight when the process died.
    let mut in_flight = task(2, new_payment("P-2", "S1", 20));
    in_flight.attempts = 1;
    in_flight.in_flight = true;
    store.create(in_flight).await.unwrap();

    // Waiting out a retry backoff.
    let mut backing_off = task(3, new_payment("P-3", "S1", 30));
    backing_off.status = TaskStatus::Approval(ApprovalFailure::Failed);
    backing_off.attempts = 1;
    backing_off.last_error = Some("connection reset".into());
    backing_off.next_attempt_at = Some(Utc::now() - ChronoDuration::seconds(5));
    store.create(backing_off).await.unwrap();

    // Sent, waiting for confirmation.
    let mut sent = task(4, new_payment("P-4", "S1", 40));
    sent.status = TaskStatus::Sent;
    sent.attempts = 1;
    sent.transaction_handle = Some(TxHandle("0xfeed".into()));
    store.create(sent).await.unwrap();

    // Confirmed but not yet finalized.
    let mut confirmed = task(5, new_payment("P-5", "S1", 50));
    confirmed.status = TaskStatus::Confirmed;
    confirmed.attempts = 1;
    confirmed.transaction_handle = Some(TxHandle("0xbeef".into()));
    store.create(confirmed).await.unwrap();

    // Already settled.
    let mut finished = task(6, new_payment("P-6", "S1", 60));
    finished.status = TaskStatus::Finished(Terminal::Denied);
    finished.attempts = 1;
    store.create(finished).await.unwrap();

    store
}

fn recovering(store: MemoryTaskStore, config: RelayConfig) -> Harness {
    let ledger = ScriptedLedger::new();
    ledger.register_handle(TxHandle("0xfeed".into()), Sequence(4));
    Harness::build(store, ledger, config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_recovery_drives_every_unfinished_task() {
    let harness = recovering(crashed_store().await, fast_config());

    let report = harness.engine.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            dispatched: 1,
            replayed: 1,
            rescheduled: 1,
            rewatched: 1,
            finalized: 1,
        }
    );

    for sequence in 1..=5 {
        let task = harness.wait_terminal(Sequence(sequence)).await.unwrap();
        assert_eq!(task.status, COMPLETED, "task {sequence}");
    }
    assert_eq!(
        harness.task(Sequence(6)).await.unwrap().status,
        TaskStatus::Finished(Terminal::Denied)
    );
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_attempt_is_replayed_under_its_key() {
    let harness = recovering(crashed_store().await, fast_config());
    harness.engine.recover().await.unwrap();

    let task = harness.wait_terminal(Sequence(2)).await.unwrap();
    assert_eq!(task.attempts, 1);
    let keys: Vec<_> = harness
        .ledger
        .submissions_for(Sequence(2))
        .into_iter()
        .map(|request| request.idempotency_key)
        .collect();
    assert_eq!(keys, ["2-1"]);

    // The backed-off task gets a fresh attempt instead.
    let retried = harness.wait_terminal(Sequence(3)).await.unwrap();
    assert_eq!(retried.attempts, 2);
    assert_eq!(harness.ledger.submissions_for(Sequence(3))[0].idempotency_key, "3-2");
}

#[tokio::test(start_paused = true)]
async fn test_recovery_leaves_opened_tasks_alone_without_auto_submit() {
    let config = RelayConfig {
        auto_submit: false,
        ..fast_config()
    };
    let harness = recovering(crashed_store().await, config);

    let report = harness.engine.recover().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(harness.task(Sequence(1)).await.unwrap().status, TaskStatus::Opened);
    assert!(harness.ledger.submissions_for(Sequence(1)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recovered_watch_can_still_be_denied() {
    let harness = recovering(crashed_store().await, fast_config());
    harness
        .ledger
        .script_watch(Sequence(4), WatchPlan::Deny("double spend".into()));

    harness.engine.recover().await.unwrap();
    let task = harness.wait_terminal(Sequence(4)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Finished(Terminal::Denied));
    assert_eq!(task.terminal_reason.unwrap().message, "double spend");
}

#[tokio::test(start_paused = true)]
async fn test_new_tasks_after_recovery_use_fresh_sequences() {
    let harness = recovering(crashed_store().await, fast_config());
    harness.engine.recover().await.unwrap();

    let sequence = harness
        .engine
        .open(new_payment("P-7", "S1", 70))
        .await
        .unwrap();
    assert_eq!(sequence, Sequence(100));
    assert_eq!(harness.wait_terminal(sequence).await.unwrap().status, COMPLETED);
}
