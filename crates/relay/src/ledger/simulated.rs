//! Deterministic in-memory ledger for local runs and offline smoke paths.

use super::{
    LedgerSubmitter, Submission, SubmissionError, SubmitRequest, TxHandle, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedLedgerConfig {
    /// How long after submission a transaction reports `Confirmed`.
    #[serde(default = "default_confirm_after_ms")]
    pub confirm_after_ms: u64,
    /// Delay between `Pending` events on a watch stream.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_confirm_after_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            confirm_after_ms: default_confirm_after_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedLedger {
    config: SimulatedLedgerConfig,
    by_key: DashMap<String, TxHandle>,
    sent_at: DashMap<TxHandle, Instant>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        Self {
            config,
            by_key: DashMap::new(),
            sent_at: DashMap::new(),
        }
    }

    /// Number of distinct transactions accepted so far.
    pub fn submitted(&self) -> usize {
        self.sent_at.len()
    }

    fn make_handle() -> TxHandle {
        TxHandle(format!("0x{}", Uuid::new_v4().simple()))
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(SimulatedLedgerConfig::default())
    }
}

#[async_trait]
impl LedgerSubmitter for SimulatedLedger {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmissionError> {
        let handle = self
            .by_key
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| {
                let handle = Self::make_handle();
                self.sent_at.insert(handle.clone(), Instant::now());
                handle
            })
            .clone();

        tracing::debug!(
            sequence = %request.sequence,
            attempt = request.attempt,
            method = %request.transaction.method,
            handle = %handle,
            "simulated ledger accepted transaction"
        );
        Ok(Submission::Sent { handle })
    }

    fn watch(&self, handle: &TxHandle) -> WatchStream {
        let Some(sent_at) = self.sent_at.get(handle).map(|entry| *entry.value()) else {
            let message = format!("unknown transaction {handle}");
            return stream::once(async move { Err(SubmissionError::Protocol(message)) }).boxed();
        };

        let confirm_after = Duration::from_millis(self.config.confirm_after_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        stream::unfold(false, move |done| async move {
            if done {
                return None;
            }
            let elapsed = sent_at.elapsed();
            if elapsed >= confirm_after {
                return Some((Ok(WatchEvent::Confirmed), true));
            }
            tokio::time::sleep(poll.min(confirm_after - elapsed)).await;
            Some((Ok(WatchEvent::Pending), false))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransactionFields;
    use crate::task::Sequence;

    fn request(attempt: u32) -> SubmitRequest {
        SubmitRequest {
            sequence: Sequence(1),
            attempt,
            idempotency_key: format!("1-{attempt}"),
            transaction: TransactionFields {
                method: "openNewPayment".into(),
                args: serde_json::json!({}),
            },
        }
    }

    #[tokio::test]
    async fn replayed_attempt_returns_same_handle() {
        let ledger = SimulatedLedger::default();
        let first = ledger.submit(&request(1)).await.unwrap();
        let replay = ledger.submit(&request(1)).await.unwrap();
        let second = ledger.submit(&request(2)).await.unwrap();

        assert_eq!(first, replay);
        assert_ne!(first, second);
        assert_eq!(ledger.submitted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_ends_with_confirmation() {
        let ledger = SimulatedLedger::new(SimulatedLedgerConfig {
            confirm_after_ms: 1_000,
            poll_interval_ms: 300,
        });
        let Submission::Sent { handle } = ledger.submit(&request(1)).await.unwrap() else {
            panic!("expected a sent transaction");
        };

        let events: Vec<WatchEvent> = ledger
            .watch(&handle)
            .map(|event| event.unwrap())
            .collect()
            .await;
        assert_eq!(events.last(), Some(&WatchEvent::Confirmed));
        assert!(events[..events.len() - 1]
            .iter()
            .all(|event| *event == WatchEvent::Pending));
    }

    #[tokio::test]
    async fn unknown_handle_is_a_protocol_error() {
        let ledger = SimulatedLedger::default();
        let mut stream = ledger.watch(&TxHandle("0xmissing".into()));
        assert!(matches!(
            stream.next().await,
            Some(Err(SubmissionError::Protocol(_)))
        ));
        assert!(stream.next().await.is_none());
    }
}
