//! # Relay core
//!
//! The payment/task lifecycle state machine behind the ledger relay.
//!
//! Clients hand the relay a logical request (a payment, a cancellation, a
//! shop provisioning action). The relay records it as a [`Task`] under a
//! durable [`Sequence`], gets a ledger transaction submitted for it, follows
//! the transaction through the ledger's asynchronous pipeline and answers
//! status queries by sequence.
//!
//! ## Architecture
//!
//! ```text
//! request ─► TaskStateMachine::open ─► SequenceAllocator + TaskStore::create
//!                  │
//!                  ▼ spawn                         ┌─────────────────────┐
//!            LedgerSubmitter::submit / ::watch ───►│ per-sequence inbox  │
//!                                                  └──────────┬──────────┘
//!                                                             ▼
//!                              TaskMachine::apply inside TaskStore::update
//!
//! query ───► StatusQueryService ─► TaskStore (read only)
//! ```
//!
//! Machines decide, effects execute:
//!
//! - [`TaskMachine`] is pure. Given a task and an event it returns the next
//!   task or a [`TransitionError`].
//! - [`TaskStateMachine`] runs ledger IO on spawned tasks and commits every
//!   decision inside the store's per-task update scope.
//!
//! ## Key Invariants
//!
//! 1. **One task per sequence** - sequences are allocated once and never reused
//! 2. **Monotonic status** - a task's phase never decreases; stores refuse regressions
//! 3. **Terminal is final** - `Completed`, `Closed`, `Denied`, `Failed`, `Timeout` are frozen
//! 4. **At most one attempt in flight** - a second claim fails with `AlreadyInFlight`
//! 5. **Idempotent outcomes** - stale or duplicate ledger callbacks are dropped
//! 6. **Ledger errors are data** - they end up in task state, never in the caller's response
//!
//! ## Example
//!
//! ```ignore
//! use relay_core::{EngineBuilder, MemoryTaskStore, NewPayment, SimulatedLedger, TaskPayload};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryTaskStore::new());
//! let engine = EngineBuilder::new(store, Arc::new(SimulatedLedger::default())).build()?;
//! engine.spawn_timeout_sweeper();
//!
//! let sequence = engine
//!     .open(TaskPayload::NewPayment(NewPayment {
//!         purchase_id: "P-1".into(),
//!         shop: "S1".into(),
//!         amount: 100,
//!         account: None,
//!     }))
//!     .await?;
//!
//! let view = engine.query().by_sequence(sequence).await?;
//! ```

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod query;
pub mod retry;
pub mod status;
pub mod store;
pub mod task;

#[cfg(test)]
mod property_tests;


pub use config::{ConfigError, RelayConfig};
pub use engine::{EngineBuilder, RecoveryReport, TaskStateMachine};
pub use envelope::{ApiResponse, ResultCode};
pub use error::{
    RelayError, RelayResult, StoreError, StoreResult, TransitionError, ValidationError,
};
pub use ledger::{
    LedgerOutcome, LedgerSubmitter, OutcomeEnvelope, SimulatedLedger, SimulatedLedgerConfig,
    Submission, SubmissionError, SubmitRequest, TransactionFields, TxHandle, WatchEvent,
    WatchStream,
};
pub use machine::{TaskEvent, TaskMachine};
pub use query::{StatusQueryService, TaskSelector, TaskView};
pub use retry::RetryPolicy;
pub use status::{ApprovalFailure, Outcome, Phase, TaskStatus, Terminal};
pub use store::{
    DefaultTaskPolicy, MemoryTaskStore, Mutator, SequenceAllocator, TaskStore, UpdateResult,
};
pub use task::{
    CancelPayment, FailureCode, NewPayment, Sequence, ShopAction, ShopOp, Task, TaskKind,
    TaskPayload, TerminalReason,
};

#[cfg(feature = "ledger-http")]
pub use ledger::http::{HttpLedgerSubmitter, LedgerEndpoints, LedgerHttpConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
