//! Read-only status façade over a [`TaskStore`].

use crate::error::{RelayError, RelayResult, ValidationError};
use crate::ledger::TxHandle;
use crate::status::{Outcome, Phase, TaskStatus};
use crate::store::{DefaultTaskPolicy, TaskStore};
use crate::task::{Sequence, Task, TaskKind, TerminalReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

/// Client-facing snapshot of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub sequence: Sequence,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub status_code: u16,
    pub phase: Phase,
    pub outcome: Outcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_handle: Option<TxHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            sequence: task.sequence,
            kind: task.kind(),
            status: task.status,
            status_code: task.status.legacy_code(),
            phase: task.status.phase(),
            outcome: task.status.outcome(),
            attempts: task.attempts,
            transaction_handle: task.transaction_handle.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            terminal_reason: task.terminal_reason.clone(),
        }
    }
}

/// Path selector of the task query: a sequence, `latest`, or `0` (default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSelector {
    Sequence(Sequence),
    Latest,
    Default,
}

impl FromStr for TaskSelector {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(TaskSelector::Latest);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::Selector(s.to_string()));
        }
        match s.parse::<u64>() {
            Ok(0) => Ok(TaskSelector::Default),
            Ok(n) => Ok(TaskSelector::Sequence(Sequence(n))),
            Err(_) => Err(ValidationError::Selector(s.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct StatusQueryService {
    store: Arc<dyn TaskStore>,
    default_policy: DefaultTaskPolicy,
}

impl StatusQueryService {
    pub fn new(store: Arc<dyn TaskStore>, default_policy: DefaultTaskPolicy) -> Self {
        Self {
            store,
            default_policy,
        }
    }

    pub fn default_policy(&self) -> DefaultTaskPolicy {
        self.default_policy
    }

    pub async fn by_sequence(&self, sequence: Sequence) -> RelayResult<TaskView> {
        let task = self.store.get_by_sequence(sequence).await?;
        task.as_ref()
            .map(TaskView::from)
            .ok_or_else(|| RelayError::NotFound(format!("task {sequence}")))
    }

    pub async fn latest(&self) -> RelayResult<TaskView> {
        let task = self.store.get_latest().await?;
        task.as_ref()
            .map(TaskView::from)
            .ok_or_else(|| RelayError::NotFound("no tasks recorded".to_string()))
    }

    pub async fn default(&self) -> RelayResult<TaskView> {
        let task = self.store.get_default(self.default_policy).await?;
        task.as_ref()
            .map(TaskView::from)
            .ok_or_else(|| RelayError::NotFound("no default task".to_string()))
    }

    pub async fn select(&self, selector: TaskSelector) -> RelayResult<TaskView> {
        match selector {
            TaskSelector::Sequence(sequence) => self.by_sequence(sequence).await,
            TaskSelector::Latest => self.latest().await,
            TaskSelector::Default => self.default().await,
        }
    }

    /// Parses a raw path segment and answers it.
    pub async fn resolve(&self, raw: &str) -> RelayResult<TaskView> {
        let selector: TaskSelector = raw.parse()?;
        self.select(selector).await
    }
}
