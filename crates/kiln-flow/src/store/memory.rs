//! In-memory task store implementation.
//!
//! This module provides [`InMemoryTaskStore`], a simple in-memory
//! implementation of the [`TaskStore`] trait suitable for testing,
//! development, and single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: Claim exclusivity holds only within this
//!   process; nothing is shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln_core::{ActivityId, TaskId};

use super::{TaskFilter, TaskStore};
use crate::error::{Error, Result};
use crate::task::ScheduledTask;

/// In-memory task store.
///
/// Thread-safe via a single `RwLock` so claims and task state never
/// diverge from each other.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, ScheduledTask>,
    claimed: HashSet<TaskId>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryTaskStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.tasks.len()
        };
        Ok(count)
    }
}

/// Priority first, oldest `scheduled_at` within a priority.
fn dispatch_order(a: &ScheduledTask, b: &ScheduledTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.tasks.contains_key(&task.id) {
            return Err(Error::storage(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<ScheduledTask>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.tasks.get(task_id).cloned()
        };
        Ok(result)
    }

    async fn find_by_activity(&self, activity_id: &ActivityId) -> Result<Option<ScheduledTask>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .find(|t| t.activity_id.as_ref() == Some(activity_id))
                .cloned()
        };
        Ok(result)
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.tasks.contains_key(&task.id) {
            return Err(Error::TaskNotFound { task_id: task.id });
        }
        state.tasks.insert(task.id, task.clone());
        state.claimed.remove(&task.id);
        Ok(())
    }

    async fn claim_ready_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>> {
        let mut state = self.state.write().map_err(poison_err)?;

        let mut ready: Vec<ScheduledTask> = state
            .tasks
            .values()
            .filter(|t| t.is_ready_at(now) && !state.claimed.contains(&t.id))
            .cloned()
            .collect();
        ready.sort_by(dispatch_order);
        ready.truncate(limit);

        for task in &ready {
            state.claimed.insert(task.id);
        }
        drop(state);
        Ok(ready)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScheduledTask>> {
        let mut result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect::<Vec<_>>()
        };
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn list_deadline_expired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| t.deadline_expired_at(now) && !state.claimed.contains(&t.id))
                .cloned()
                .collect()
        };
        Ok(result)
    }
}
