//! Pluggable storage for scheduled tasks.
//!
//! The [`TaskStore`] trait defines the persistence layer for the scheduler.
//!
//! ## Design Principles
//!
//! - **Exclusive claims**: `claim_ready_tasks` hands each ready task to
//!   exactly one caller, so concurrent agents never double-dispatch
//! - **Separation of concerns**: Storage knows nothing about controllers
//!   or the gateway
//! - **Testability**: In-memory implementation for testing; a durable
//!   backend can be swapped in without touching the components

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln_core::{ActivityId, ControllerId, RunId, TaskId};

use crate::error::Result;
use crate::task::{ScheduledTask, TaskPriority, TaskStatus};

/// Filter for task listing queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match tasks in this status.
    pub status: Option<TaskStatus>,
    /// Match tasks belonging to this run.
    pub run_id: Option<RunId>,
    /// Match tasks targeting this controller.
    pub controller_id: Option<ControllerId>,
    /// Match tasks at this priority.
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    /// Returns true when the task passes every set field.
    #[must_use]
    pub fn matches(&self, task: &ScheduledTask) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.run_id.as_ref().map_or(true, |r| &task.run_id == r)
            && self
                .controller_id
                .as_ref()
                .map_or(true, |c| &task.controller_id == c)
            && self.priority.map_or(true, |p| task.priority == p)
    }
}

/// Storage abstraction for scheduler state.
///
/// ## Claim Semantics
///
/// `claim_ready_tasks` is the core primitive for multi-agent correctness:
/// a claimed task is excluded from subsequent claims until its next
/// `update_task`, which releases the claim. Callers must update the task
/// after dispatching it (to `Running` on success, `Failed` otherwise).
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from agent
/// and supervisor tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task.
    ///
    /// # Errors
    ///
    /// Returns an error if a task with the same id already exists.
    async fn insert_task(&self, task: &ScheduledTask) -> Result<()>;

    /// Gets a task by id.
    ///
    /// Returns `None` if the task does not exist.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<ScheduledTask>>;

    /// Finds the task owning a remote activity id.
    ///
    /// Returns `None` when no dispatched task carries the given id.
    async fn find_by_activity(&self, activity_id: &ActivityId) -> Result<Option<ScheduledTask>>;

    /// Replaces the stored task state and releases any claim on it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::TaskNotFound`] if the task was never
    /// inserted.
    async fn update_task(&self, task: &ScheduledTask) -> Result<()>;

    /// Atomically claims up to `limit` ready tasks.
    ///
    /// A task is ready when [`ScheduledTask::is_ready_at`] holds at `now`
    /// and no other caller currently holds a claim on it. Returned tasks
    /// are ordered by priority (critical first), then by `scheduled_at`
    /// (oldest first).
    async fn claim_ready_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>>;

    /// Lists tasks matching a filter, newest first.
    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScheduledTask>>;

    /// Lists unclaimed ready-state tasks whose deadline has passed.
    async fn list_deadline_expired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>>;
}
