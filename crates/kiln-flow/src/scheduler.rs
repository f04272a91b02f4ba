//! Durable priority queue with the task retry/backoff/deadline state
//! machine.
//!
//! The scheduler is the sole mutator of [`ScheduledTask`] records. Every
//! other component goes through these methods, which load, transition,
//! and write back through the pluggable [`TaskStore`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use kiln_core::{ActivityId, CampaignId, ControllerId, RunId, TaskId};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::{TaskFilter, TaskStore};
use crate::task::{
    ActivityOption, ScheduledTask, TaskPriority, TaskStatus, TransitionReason,
};

/// Parameters for scheduling one task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Owning experiment run.
    pub run_id: RunId,
    /// Campaign grouping, when known.
    pub campaign_id: Option<CampaignId>,
    /// Controller the activity should run on.
    pub controller_id: ControllerId,
    /// Remote activity name.
    pub activity_name: String,
    /// Ordered activity options.
    pub options: Vec<ActivityOption>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Retry budget override. Defaults to the scheduler configuration.
    pub max_retries: Option<u32>,
    /// Hard deadline for starting the task.
    pub deadline: Option<DateTime<Utc>>,
    /// Free-form metadata attached by the workflow layer.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    /// Creates a request with default priority and no deadline.
    #[must_use]
    pub fn new(
        run_id: RunId,
        controller_id: ControllerId,
        activity_name: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            campaign_id: None,
            controller_id,
            activity_name: activity_name.into(),
            options: Vec::new(),
            priority: TaskPriority::Normal,
            max_retries: None,
            deadline: None,
            metadata: HashMap::new(),
        }
    }
}

/// Aggregate counters over the task population.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    /// Number of tasks per status.
    pub counts: HashMap<TaskStatus, usize>,
    /// Mean creation-to-completion time over completed tasks, in millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_completion_ms: Option<f64>,
    /// Mean retry count over completed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_retry_count: Option<f64>,
}

/// Priority-queue scheduler over a pluggable task store.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler over the given store.
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Creates a pending task from a request and persists it.
    ///
    /// # Errors
    ///
    /// Returns an error when the deadline already lies in the past or the
    /// store rejects the insert.
    #[tracing::instrument(skip(self, request), fields(run_id = %request.run_id, activity = %request.activity_name))]
    pub async fn schedule_task(&self, request: TaskRequest) -> Result<ScheduledTask> {
        if request.deadline.is_some_and(|d| d <= Utc::now()) {
            return Err(Error::configuration("deadline lies in the past"));
        }

        let mut task = ScheduledTask::new(
            request.run_id,
            request.controller_id,
            request.activity_name,
        )
        .with_options(request.options)
        .with_priority(request.priority)
        .with_max_retries(
            request
                .max_retries
                .unwrap_or(self.config.default_max_retries),
        )
        .with_metadata(request.metadata);
        if let Some(campaign_id) = request.campaign_id {
            task = task.with_campaign(campaign_id);
        }
        if let Some(deadline) = request.deadline {
            task = task.with_deadline(deadline);
        }

        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, priority = task.priority.as_label(), "task scheduled");
        Ok(task)
    }

    /// Claims up to `limit` ready tasks for dispatch.
    ///
    /// Ordering and exclusivity are delegated to the store.
    pub async fn get_ready_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        self.store.claim_ready_tasks(Utc::now(), limit).await
    }

    /// Gets one task by id.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<ScheduledTask>> {
        self.store.get_task(task_id).await
    }

    /// Finds the task owning a remote activity id.
    pub async fn find_by_activity(&self, activity_id: &ActivityId) -> Result<Option<ScheduledTask>> {
        self.store.find_by_activity(activity_id).await
    }

    /// Records that a task's remote activity has started.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tasks or invalid transitions.
    pub async fn mark_started(
        &self,
        task_id: &TaskId,
        activity_id: ActivityId,
    ) -> Result<ScheduledTask> {
        self.mutate(task_id, |task| {
            task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
            task.activity_id = Some(activity_id.clone());
            Ok(())
        })
        .await
    }

    /// Records successful completion.
    pub async fn mark_completed(&self, task_id: &TaskId) -> Result<ScheduledTask> {
        let task = self
            .mutate(task_id, |task| {
                task.transition_to(TaskStatus::Completed, TransitionReason::ActivityCompleted)
            })
            .await?;
        self.observe_terminal(&task);
        Ok(task)
    }

    /// Records a failure with its error text.
    pub async fn mark_failed(
        &self,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<ScheduledTask> {
        let error = error.into();
        let task = self
            .mutate(task_id, |task| {
                task.transition_to(TaskStatus::Failed, TransitionReason::ActivityFailed)?;
                task.error = Some(error.clone());
                Ok(())
            })
            .await?;
        self.observe_terminal(&task);
        Ok(task)
    }

    /// Revives a failed task for another attempt.
    ///
    /// Returns the time the retry becomes claimable, or `None` when the
    /// retry budget is exhausted and the caller must escalate instead.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tasks or when the task is not failed.
    pub async fn schedule_retry(&self, task_id: &TaskId) -> Result<Option<DateTime<Utc>>> {
        let mut task = self.load(task_id).await?;
        let from = task.status.as_label();
        let next = task.schedule_retry(&self.config.retry)?;
        if next.is_some() {
            self.store.update_task(&task).await?;
            self.metrics.record_retry(task.retry_count);
            self.record_transition(from, &task);
            info!(task_id = %task.id, retry_count = task.retry_count, "retry scheduled");
        }
        Ok(next)
    }

    /// Cancels a task at the caller's request.
    ///
    /// Idempotent for already-cancelled tasks. Rejected once a task has
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tasks, completed tasks, and other
    /// terminal states.
    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> Result<ScheduledTask> {
        self.cancel_with(task_id, reason, TransitionReason::UserCancelled)
            .await
    }

    /// Cancels a never-started task whose deadline has passed.
    pub async fn expire_deadline(&self, task_id: &TaskId) -> Result<ScheduledTask> {
        self.cancel_with(
            task_id,
            "deadline exceeded before execution",
            TransitionReason::DeadlineExpired,
        )
        .await
    }

    async fn cancel_with(
        &self,
        task_id: &TaskId,
        reason: &str,
        transition: TransitionReason,
    ) -> Result<ScheduledTask> {
        let mut task = self.load(task_id).await?;
        match task.status {
            TaskStatus::Cancelled => return Ok(task),
            TaskStatus::Completed => {
                return Err(Error::InvalidStateTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::Cancelled.to_string(),
                    reason: "completed tasks cannot be cancelled".to_string(),
                })
            }
            _ => {}
        }

        let from = task.status.as_label();
        task.transition_to(TaskStatus::Cancelled, transition)?;
        task.metadata.insert(
            "cancelReason".to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        self.store.update_task(&task).await?;
        self.record_transition(from, &task);
        info!(task_id = %task.id, reason, "task cancelled");
        Ok(task)
    }

    /// Force-expires a running task that exceeded the activity timeout.
    pub async fn mark_timed_out(&self, task_id: &TaskId) -> Result<ScheduledTask> {
        let task = self
            .mutate(task_id, |task| {
                task.transition_to(TaskStatus::TimedOut, TransitionReason::TimedOut)
            })
            .await?;
        self.observe_terminal(&task);
        Ok(task)
    }

    /// Lists tasks matching a filter.
    pub async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScheduledTask>> {
        self.store.query_tasks(filter).await
    }

    /// Lists never-started tasks whose deadline has passed.
    pub async fn list_deadline_expired(&self) -> Result<Vec<ScheduledTask>> {
        self.store.list_deadline_expired(Utc::now()).await
    }

    /// Computes aggregate counters over every stored task.
    pub async fn task_stats(&self) -> Result<TaskStats> {
        let tasks = self.store.query_tasks(&TaskFilter::default()).await?;

        let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
        for task in &tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }

        let completed: Vec<&ScheduledTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let (avg_completion_ms, avg_retry_count) = if completed.is_empty() {
            (None, None)
        } else {
            #[allow(clippy::cast_precision_loss)]
            let len = completed.len() as f64;
            let total_ms: i64 = completed
                .iter()
                .filter_map(|t| t.completed_at.map(|c| (c - t.created_at).num_milliseconds()))
                .sum();
            #[allow(clippy::cast_precision_loss)]
            let total_retries = completed.iter().map(|t| f64::from(t.retry_count)).sum::<f64>();
            #[allow(clippy::cast_precision_loss)]
            let avg_ms = total_ms as f64 / len;
            (Some(avg_ms), Some(total_retries / len))
        };

        Ok(TaskStats {
            counts,
            avg_completion_ms,
            avg_retry_count,
        })
    }

    async fn load(&self, task_id: &TaskId) -> Result<ScheduledTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound { task_id: *task_id })
    }

    async fn mutate<F>(&self, task_id: &TaskId, apply: F) -> Result<ScheduledTask>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<()>,
    {
        let mut task = self.load(task_id).await?;
        let from = task.status.as_label();
        apply(&mut task)?;
        self.store.update_task(&task).await?;
        self.record_transition(from, &task);
        Ok(task)
    }

    fn record_transition(&self, from: &'static str, task: &ScheduledTask) {
        let reason = task
            .last_transition_reason
            .map_or_else(String::new, |r| r.to_string());
        self.metrics
            .record_task_transition(from, task.status.as_label(), &reason);
    }

    fn observe_terminal(&self, task: &ScheduledTask) {
        if let Some(completed_at) = task.completed_at {
            let duration = (completed_at - task.created_at).num_milliseconds();
            #[allow(clippy::cast_precision_loss)]
            self.metrics.observe_task_duration(
                &task.activity_name,
                task.status.as_label(),
                duration as f64 / 1000.0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryTaskStore;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(InMemoryTaskStore::new()),
            SchedulerConfig::default(),
        )
    }

    fn request() -> TaskRequest {
        TaskRequest::new(
            RunId::new("run-1"),
            ControllerId::new("printer-a3"),
            "print_job",
        )
    }

    #[tokio::test]
    async fn schedule_creates_pending_task() -> Result<()> {
        let scheduler = scheduler();
        let task = scheduler.schedule_task(request()).await?;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        Ok(())
    }

    #[tokio::test]
    async fn past_deadline_is_rejected_at_scheduling() {
        let scheduler = scheduler();
        let mut req = request();
        req.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(scheduler.schedule_task(req).await.is_err());
    }

    #[tokio::test]
    async fn full_lifecycle_to_completed() -> Result<()> {
        let scheduler = scheduler();
        let task = scheduler.schedule_task(request()).await?;

        let claimed = scheduler.get_ready_tasks(10).await?;
        assert_eq!(claimed.len(), 1);

        let started = scheduler
            .mark_started(&task.id, ActivityId::new("act-1"))
            .await?;
        assert_eq!(started.status, TaskStatus::Running);
        assert_eq!(started.activity_id, Some(ActivityId::new("act-1")));

        let completed = scheduler.mark_completed(&task.id).await?;
        assert_eq!(completed.status, TaskStatus::Completed);

        // Terminal tasks never come back as ready.
        assert!(scheduler.get_ready_tasks(10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn retry_clears_error_and_requeues() -> Result<()> {
        let scheduler = scheduler();
        let task = scheduler.schedule_task(request()).await?;
        scheduler
            .mark_started(&task.id, ActivityId::new("act-1"))
            .await?;
        scheduler
            .mark_failed(&task.id, "controller_unavailable: connect refused")
            .await?;

        let next = scheduler.schedule_retry(&task.id).await?;
        assert!(next.is_some());

        let stored = scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn retry_at_limit_returns_none() -> Result<()> {
        let scheduler = scheduler();
        let mut req = request();
        req.max_retries = Some(0);
        let task = scheduler.schedule_task(req).await?;
        scheduler
            .mark_started(&task.id, ActivityId::new("act-1"))
            .await?;
        scheduler.mark_failed(&task.id, "boom").await?;

        assert!(scheduler.schedule_retry(&task.id).await?.is_none());
        let stored = scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_completed_task_is_rejected() -> Result<()> {
        let scheduler = scheduler();
        let task = scheduler.schedule_task(request()).await?;
        scheduler
            .mark_started(&task.id, ActivityId::new("act-1"))
            .await?;
        scheduler.mark_completed(&task.id).await?;

        let result = scheduler.cancel_task(&task.id, "changed my mind").await;
        assert!(matches!(
            result,
            Err(Error::InvalidStateTransition { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_is_idempotent() -> Result<()> {
        let scheduler = scheduler();
        let task = scheduler.schedule_task(request()).await?;
        scheduler.cancel_task(&task.id, "no longer needed").await?;
        let again = scheduler.cancel_task(&task.id, "no longer needed").await?;
        assert_eq!(again.status, TaskStatus::Cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn deadline_expiry_records_canonical_reason() -> Result<()> {
        let scheduler = scheduler();
        let mut req = request();
        req.deadline = Some(Utc::now() + chrono::Duration::milliseconds(10));
        let task = scheduler.schedule_task(req).await?;

        let expired = scheduler.expire_deadline(&task.id).await?;
        assert_eq!(expired.status, TaskStatus::Cancelled);
        assert_eq!(
            expired.metadata.get("cancelReason"),
            Some(&serde_json::Value::String(
                "deadline exceeded before execution".to_string()
            ))
        );
        Ok(())
    }

    #[tokio::test]
    async fn stats_average_over_completed_tasks() -> Result<()> {
        let scheduler = scheduler();
        let first = scheduler.schedule_task(request()).await?;
        scheduler
            .mark_started(&first.id, ActivityId::new("act-1"))
            .await?;
        scheduler.mark_completed(&first.id).await?;
        scheduler.schedule_task(request()).await?;

        let stats = scheduler.task_stats().await?;
        assert_eq!(stats.counts.get(&TaskStatus::Completed), Some(&1));
        assert_eq!(stats.counts.get(&TaskStatus::Pending), Some(&1));
        assert!(stats.avg_completion_ms.is_some());
        assert_eq!(stats.avg_retry_count, Some(0.0));
        Ok(())
    }

    #[tokio::test]
    async fn query_filters_by_run_and_status() -> Result<()> {
        let scheduler = scheduler();
        scheduler.schedule_task(request()).await?;
        let mut other = request();
        other.run_id = RunId::new("run-2");
        scheduler.schedule_task(other).await?;

        let filter = TaskFilter {
            run_id: Some(RunId::new("run-1")),
            ..TaskFilter::default()
        };
        assert_eq!(scheduler.query_tasks(&filter).await?.len(), 1);

        let filter = TaskFilter {
            status: Some(TaskStatus::Running),
            ..TaskFilter::default()
        };
        assert!(scheduler.query_tasks(&filter).await?.is_empty());
        Ok(())
    }
}
