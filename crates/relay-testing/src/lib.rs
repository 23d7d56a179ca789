//! Testing utilities for the ledger relay.
//!
//! - [`ScriptedLedger`]: per-task scripted submission and watch behaviour,
//!   with every request recorded.
//! - [`Harness`]: in-memory store + scripted ledger + engine, wired with
//!   millisecond-scale timings.
//! - [`wait_for`] / [`StatusRecorder`]: observe tasks from the outside the
//!   way a polling client does.

mod scripted;

pub use scripted::{ScriptedLedger, SubmitStep, WatchPlan};

use anyhow::{bail, Result};
use relay_core::{
    EngineBuilder, MemoryTaskStore, NewPayment, RelayConfig, RetryPolicy, Sequence, ShopAction,
    ShopOp, Task, TaskPayload, TaskStateMachine, TaskStatus, TaskStore,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Engine config with delays short enough for tests.
pub fn fast_config() -> RelayConfig {
    RelayConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
        },
        watch_resubscribe_ms: 5,
        ..RelayConfig::default()
    }
}

pub fn new_payment(purchase_id: &str, shop: &str, amount: i64) -> TaskPayload {
    TaskPayload::NewPayment(NewPayment {
        purchase_id: purchase_id.to_string(),
        shop: shop.to_string(),
        amount,
        account: None,
    })
}

pub fn shop_action(shop: &str, action: ShopOp) -> TaskPayload {
    TaskPayload::ShopAction(ShopAction {
        shop: shop.to_string(),
        action,
        provider: None,
    })
}

pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub ledger: Arc<ScriptedLedger>,
    pub engine: TaskStateMachine,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::build(MemoryTaskStore::new(), ScriptedLedger::new(), fast_config())
    }

    /// Harness whose first allocated sequence is `first`.
    pub fn starting_at(first: u64) -> Result<Self> {
        Self::build(MemoryTaskStore::starting_at(first), ScriptedLedger::new(), fast_config())
    }

    pub fn build(store: MemoryTaskStore, ledger: ScriptedLedger, config: RelayConfig) -> Result<Self> {
        let store = Arc::new(store);
        let ledger = Arc::new(ledger);
        let engine = EngineBuilder::new(store.clone(), ledger.clone())
            .with_config(config)
            .build()?;
        Ok(Self {
            store,
            ledger,
            engine,
        })
    }

    pub async fn task(&self, sequence: Sequence) -> Result<Task> {
        match self.store.get_by_sequence(sequence).await? {
            Some(task) => Ok(task),
            None => bail!("task {sequence} does not exist"),
        }
    }

    pub async fn wait_for(&self, sequence: Sequence, done: impl Fn(&Task) -> bool) -> Result<Task> {
        wait_for(self.store.as_ref(), sequence, done).await
    }

    pub async fn wait_terminal(&self, sequence: Sequence) -> Result<Task> {
        self.wait_for(sequence, Task::is_terminal).await
    }
}

/// Polls `store` until `done` holds for the task, for at most ten seconds.
pub async fn wait_for(
    store: &dyn TaskStore,
    sequence: Sequence,
    done: impl Fn(&Task) -> bool,
) -> Result<Task> {
    let poll = async {
        loop {
            if let Some(task) = store.get_by_sequence(sequence).await? {
                if done(&task) {
                    return Ok::<_, anyhow::Error>(task);
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    match tokio::time::timeout(Duration::from_secs(10), poll).await {
        Ok(result) => result,
        Err(_) => {
            let last = store.get_by_sequence(sequence).await?;
            bail!(
                "task {sequence} did not reach the expected state; last seen {:?}",
                last.map(|task| task.status)
            )
        }
    }
}

/// Records every status a polling client would observe for one task.
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<TaskStatus>>>,
    poller: JoinHandle<()>,
}

impl StatusRecorder {
    pub fn start(engine: &TaskStateMachine, sequence: Sequence) -> Self {
        let query = engine.query();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let poller = tokio::spawn(async move {
            loop {
                if let Ok(view) = query.by_sequence(sequence).await {
                    if let Ok(mut seen) = sink.lock() {
                        seen.push(view.status);
                    }
                    if view.status.is_terminal() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        Self { seen, poller }
    }

    /// Waits for the poller to see a terminal status and returns the history.
    pub async fn finish(self) -> Result<Vec<TaskStatus>> {
        tokio::time::timeout(Duration::from_secs(10), self.poller).await??;
        let seen = self
            .seen
            .lock()
            .map_err(|_| anyhow::anyhow!("status recorder poisoned"))?
            .clone();
        Ok(seen)
    }
}
