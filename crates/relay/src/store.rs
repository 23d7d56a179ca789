//! Task persistence contract and the in-memory store.
//!
//! A [`TaskStore`] is append/update only. `update` is the per-task exclusive
//! scope: the mutator sees the current record and its result is committed
//! atomically, or not at all. Stores refuse any successor that would regress
//! the record (see [`Task::admits`]) and report it as not applied instead of
//! failing.

use crate::error::{StoreError, StoreResult};
use crate::status::TaskStatus;
use crate::task::{Sequence, Task, TaskKind, TaskPayload};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-modify-write step run under the store's per-task lock.
///
/// Returning `None` leaves the record untouched.
pub type Mutator<'a> = Box<dyn FnOnce(&Task) -> Option<Task> + Send + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub previous: Task,
    pub current: Task,
    pub applied: bool,
}

impl UpdateResult {
    fn unchanged(task: Task) -> Self {
        Self {
            previous: task.clone(),
            current: task,
            applied: false,
        }
    }
}

/// Which task the `"0"` query path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", content = "kind", rename_all = "snake_case")]
pub enum DefaultTaskPolicy {
    /// Most recent task of the given kind.
    LatestOfKind(TaskKind),
    /// Lowest-sequence task that has not reached a terminal state.
    OldestUnfinished,
    /// Same as the `latest` path.
    Latest,
}

impl Default for DefaultTaskPolicy {
    fn default() -> Self {
        DefaultTaskPolicy::LatestOfKind(TaskKind::NewPayment)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateSequence`] if the sequence exists.
    async fn create(&self, task: Task) -> StoreResult<()>;

    /// Atomic read-modify-write; [`StoreError::NotFound`] if absent.
    async fn update(&self, sequence: Sequence, mutator: Mutator<'_>) -> StoreResult<UpdateResult>;

    async fn get_by_sequence(&self, sequence: Sequence) -> StoreResult<Option<Task>>;

    async fn get_latest(&self) -> StoreResult<Option<Task>>;

    async fn get_default(&self, policy: DefaultTaskPolicy) -> StoreResult<Option<Task>>;

    /// Non-terminal tasks with a sequence above `after`, in sequence order.
    ///
    /// Callers page by passing the last sequence of the previous page.
    async fn list_unfinished(&self, after: Sequence, limit: usize) -> StoreResult<Vec<Task>>;

    /// Tasks in `status` with a sequence above `after`, in sequence order.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        after: Sequence,
        limit: usize,
    ) -> StoreResult<Vec<Task>>;

    /// Cancellation tasks that target `target`, in sequence order.
    async fn find_cancellations(&self, target: Sequence) -> StoreResult<Vec<Task>>;
}

/// Issues unique, strictly increasing sequences.
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    async fn allocate(&self) -> StoreResult<Sequence>;
}

/// In-memory store. Each record lives in a `DashMap` shard, so the update
/// scope is the shard lock and unrelated tasks do not contend on one lock.
#[derive(Debug)]
pub struct MemoryTaskStore {
    tasks: DashMap<Sequence, Task>,
    next_sequence: AtomicU64,
    latest: AtomicU64,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Store whose allocator hands out `first` next. `0` is bumped to `1`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            next_sequence: AtomicU64::new(first.max(1)),
            latest: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn collect_sorted(&self, keep: impl Fn(&Task) -> bool, limit: usize) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|task| task.sequence);
        out.truncate(limit);
        out
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: Task) -> StoreResult<()> {
        let sequence = task.sequence;
        match self.tasks.entry(sequence) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::DuplicateSequence(sequence))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(task);
                self.latest.fetch_max(sequence.get(), Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn update(&self, sequence: Sequence, mutator: Mutator<'_>) -> StoreResult<UpdateResult> {
        let mut entry = self
            .tasks
            .get_mut(&sequence)
            .ok_or(StoreError::NotFound(sequence))?;
        let previous = entry.value().clone();

        match mutator(&previous) {
            Some(next) if previous.admits(&next) => {
                *entry.value_mut() = next.clone();
                Ok(UpdateResult {
                    previous,
                    current: next,
                    applied: true,
                })
            }
            Some(next) => {
                tracing::warn!(
                    sequence = %sequence,
                    from = %previous.status,
                    to = %next.status,
                    "refused non-monotonic task update"
                );
                Ok(UpdateResult::unchanged(previous))
            }
            None => Ok(UpdateResult::unchanged(previous)),
        }
    }

    async fn get_by_sequence(&self, sequence: Sequence) -> StoreResult<Option<Task>> {
        Ok(self.tasks.get(&sequence).map(|entry| entry.value().clone()))
    }

    async fn get_latest(&self) -> StoreResult<Option<Task>> {
        let latest = self.latest.load(Ordering::SeqCst);
        if latest == 0 {
            return Ok(None);
        }
        self.get_by_sequence(Sequence(latest)).await
    }

    async fn get_default(&self, policy: DefaultTaskPolicy) -> StoreResult<Option<Task>> {
        match policy {
            DefaultTaskPolicy::Latest => self.get_latest().await,
            DefaultTaskPolicy::LatestOfKind(kind) => Ok(self
                .tasks
                .iter()
                .filter(|entry| entry.value().kind() == kind)
                .max_by_key(|entry| *entry.key())
                .map(|entry| entry.value().clone())),
            DefaultTaskPolicy::OldestUnfinished => {
                Ok(self.collect_sorted(|task| !task.is_terminal(), 1).pop())
            }
        }
    }

    async fn list_unfinished(&self, after: Sequence, limit: usize) -> StoreResult<Vec<Task>> {
        Ok(self.collect_sorted(|task| task.sequence > after && !task.is_terminal(), limit))
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        after: Sequence,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        Ok(self.collect_sorted(|task| task.sequence > after && task.status == status, limit))
    }

    async fn find_cancellations(&self, target: Sequence) -> StoreResult<Vec<Task>> {
        Ok(self.collect_sorted(
            |task| matches!(&task.payload, TaskPayload::CancelPayment(c) if c.target == target),
            usize::MAX,
        ))
    }
}

#[async_trait]
impl SequenceAllocator for MemoryTaskStore {
    async fn allocate(&self) -> StoreResult<Sequence> {
        Ok(Sequence(self.next_sequence.fetch_add(1, Ordering::SeqCst)))
    }
}
