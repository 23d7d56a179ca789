//! Randomized transition tests.
//!
//! Each run throws a random stream of machine events (including stale
//! attempts, wrong handles and duplicate outcomes) at a task held in the
//! in-memory store, committing through the same update scope the engine uses.
//! Whatever the stream, every committed change must be an allowed edge and
//! the phase must never decrease.

use crate::error::TransitionError;
use crate::ledger::{LedgerOutcome, TxHandle};
use crate::machine::{is_allowed, TaskEvent, TaskMachine};
use crate::retry::RetryPolicy;
use crate::status::{TaskStatus, Terminal};
use crate::store::{MemoryTaskStore, TaskStore};
use crate::task::{
    CancelPayment, NewPayment, Sequence, ShopAction, ShopOp, Task, TaskKind, TaskPayload,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

const RUNS: u64 = 300;
const STEPS: usize = 40;

fn payload_for(kind: TaskKind) -> TaskPayload {
    match kind {
        TaskKind::NewPayment => TaskPayload::NewPayment(NewPayment {
            purchase_id: "P-1".into(),
            shop: "S1".into(),
            amount: 10,
            account: None,
        }),
        TaskKind::CancelPayment => TaskPayload::CancelPayment(CancelPayment {
            target: Sequence(1),
            reason: None,
        }),
        TaskKind::ShopAction => TaskPayload::ShopAction(ShopAction {
            shop: "S1".into(),
            action: ShopOp::Update,
            provider: None,
        }),
    }
}

fn random_event(rng: &mut fastrand::Rng, task: &Task) -> TaskEvent {
    // Mostly the current attempt, sometimes a stale or future one.
    let attempt = match rng.u8(0..10) {
        0 => task.attempts.saturating_sub(1),
        1 => task.attempts + 1,
        _ => task.attempts,
    };
    let handle = if rng.bool() {
        task.transaction_handle
            .clone()
            .unwrap_or_else(|| TxHandle(format!("0x{attempt}")))
    } else {
        TxHandle(format!("0x{attempt}"))
    };
    let outcome = match rng.u8(0..5) {
        0 => LedgerOutcome::ApprovedFailedTx {
            reason: "network".into(),
        },
        1 => LedgerOutcome::ApprovedRevertedTx {
            reason: "reverted".into(),
        },
        2 => LedgerOutcome::ApprovedSentTx { handle },
        3 => LedgerOutcome::ApprovedConfirmedTx { handle },
        _ => LedgerOutcome::Denied {
            reason: "denied".into(),
        },
    };
    match rng.u8(0..10) {
        0..=2 => TaskEvent::BeginAttempt,
        3 => TaskEvent::Finalize,
        4 => TaskEvent::Expire {
            window: Duration::from_secs(rng.u64(0..120)),
        },
        _ => TaskEvent::Ledger { attempt, outcome },
    }
}

async fn commit(
    store: &MemoryTaskStore,
    machine: &TaskMachine,
    sequence: Sequence,
    event: &TaskEvent,
    now: DateTime<Utc>,
) -> Result<Task, TransitionError> {
    let mut refused = None;
    let result = store
        .update(
            sequence,
            Box::new(|task| match machine.apply(task, event, now) {
                Ok(next) => Some(next),
                Err(err) => {
                    refused = Some(err);
                    None
                }
            }),
        )
        .await
        .unwrap();
    match refused {
        Some(err) => Err(err),
        None => Ok(result.current),
    }
}

#[tokio::test]
async fn test_random_outcome_streams_only_commit_allowed_edges() {
    for seed in 0..RUNS {
        let mut rng = fastrand::Rng::with_seed(seed);
        let kind = match rng.u8(0..3) {
            0 => TaskKind::NewPayment,
            1 => TaskKind::CancelPayment,
            _ => TaskKind::ShopAction,
        };
        let machine = TaskMachine::new(RetryPolicy {
            max_attempts: rng.u32(1..5),
            base_delay_ms: 1,
            max_delay_ms: 10,
        });
        let store = MemoryTaskStore::new();
        let sequence = Sequence(1);
        let start = Utc::now();
        store
            .create(Task::opened(sequence, payload_for(kind), start))
            .await
            .unwrap();

        let mut clock = start;
        let mut seen = vec![TaskStatus::Opened];
        for _ in 0..STEPS {
            clock += ChronoDuration::seconds(rng.i64(0..60));
            let before = store.get_by_sequence(sequence).await.unwrap().unwrap();
            let event = random_event(&mut rng, &before);

            let after = match commit(&store, &machine, sequence, &event, clock).await {
                Ok(after) => after,
                Err(_) => {
                    let unchanged = store.get_by_sequence(sequence).await.unwrap().unwrap();
                    assert_eq!(unchanged, before, "seed {seed}: refused event mutated the task");
                    continue;
                }
            };

            assert!(
                is_allowed(kind, before.status, after.status),
                "seed {seed}: committed {} -> {} on {}",
                before.status,
                after.status,
                event.name()
            );
            assert!(after.status.phase() >= before.status.phase(), "seed {seed}");
            assert!(after.attempts >= before.attempts, "seed {seed}");
            assert!(after.attempts <= machine.policy().max_attempts, "seed {seed}");
            if after.status == TaskStatus::Sent {
                assert!(after.transaction_handle.is_some(), "seed {seed}");
            }
            if after.is_terminal() && !matches!(after.status, TaskStatus::Finished(t) if t.is_success()) {
                assert!(after.terminal_reason.is_some(), "seed {seed}");
            }
            seen.push(after.status);
        }

        if kind == TaskKind::ShopAction {
            assert!(
                !seen.contains(&TaskStatus::Approval(crate::status::ApprovalFailure::Reverted)),
                "seed {seed}: shop action reverted"
            );
        }
        if let Some(terminal) = seen.iter().position(|s| s.is_terminal()) {
            assert!(
                seen[terminal..].iter().all(|s| *s == seen[terminal]),
                "seed {seed}: terminal status changed"
            );
        }
    }
}

#[tokio::test]
async fn test_duplicate_delivery_matches_single_delivery() {
    for seed in 0..RUNS {
        let mut rng = fastrand::Rng::with_seed(seed);
        let machine = TaskMachine::new(RetryPolicy::default());
        let now = Utc::now();

        let once = MemoryTaskStore::new();
        let twice = MemoryTaskStore::new();
        let sequence = Sequence(1);
        for store in [&once, &twice] {
            store
                .create(Task::opened(sequence, payload_for(TaskKind::NewPayment), now))
                .await
                .unwrap();
        }

        for _ in 0..STEPS {
            let current = once.get_by_sequence(sequence).await.unwrap().unwrap();
            let event = random_event(&mut rng, &current);
            if event == TaskEvent::BeginAttempt {
                // Claims are not outcome notifications; apply them once to both.
                let _ = commit(&once, &machine, sequence, &event, now).await;
                let _ = commit(&twice, &machine, sequence, &event, now).await;
                continue;
            }
            let _ = commit(&once, &machine, sequence, &event, now).await;
            let _ = commit(&twice, &machine, sequence, &event, now).await;
            let _ = commit(&twice, &machine, sequence, &event, now).await;
        }

        assert_eq!(
            once.get_by_sequence(sequence).await.unwrap(),
            twice.get_by_sequence(sequence).await.unwrap(),
            "seed {seed}"
        );
    }
}

#[test]
fn test_success_terminals_only_follow_confirmation() {
    for kind in [TaskKind::NewPayment, TaskKind::CancelPayment, TaskKind::ShopAction] {
        for from in TaskStatus::ALL {
            for terminal in [Terminal::Completed, Terminal::Closed] {
                if is_allowed(kind, from, TaskStatus::Finished(terminal)) {
                    assert_eq!(from, TaskStatus::Confirmed);
                }
            }
        }
    }
}
