//! Scheduled task state and lifecycle management.
//!
//! This module provides:
//! - `TaskStatus`: The state machine for task execution
//! - `TaskPriority`: Scheduling priority levels
//! - `ScheduledTask`: The durable record the scheduler tracks
//! - `TransitionReason`: Explicit reasons for all status transitions
//! - `RetryPolicy`: Exponential backoff with jitter

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiln_core::{ActivityId, CampaignId, ControllerId, RunId, TaskId};

use crate::error::{Error, Result};

/// Reason for a task status transition.
///
/// Every transition carries an explicit reason for auditing, metrics,
/// and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    // --- Happy path ---
    /// Task claimed by an agent and handed to the gateway.
    Claimed,
    /// Remote activity started, task is executing.
    ActivityStarted,
    /// Remote controller reported successful completion.
    ActivityCompleted,

    // --- Failure path ---
    /// Remote controller reported failure.
    ActivityFailed,
    /// The gateway could not start the activity.
    StartFailed,
    /// Task exceeded the activity timeout and was force-expired.
    TimedOut,

    // --- Recovery path ---
    /// Supervisor scheduled a retry after failure.
    RetryScheduled,
    /// Supervisor reconciled state from a direct controller query.
    Reconciled,

    // --- Cancellation path ---
    /// Caller requested cancellation.
    UserCancelled,
    /// Remote controller reported cancellation.
    ActivityCancelled,
    /// Deadline passed before the task ever started.
    DeadlineExpired,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claimed => write!(f, "claimed"),
            Self::ActivityStarted => write!(f, "activity_started"),
            Self::ActivityCompleted => write!(f, "activity_completed"),
            Self::ActivityFailed => write!(f, "activity_failed"),
            Self::StartFailed => write!(f, "start_failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::Reconciled => write!(f, "reconciled"),
            Self::UserCancelled => write!(f, "user_cancelled"),
            Self::ActivityCancelled => write!(f, "activity_cancelled"),
            Self::DeadlineExpired => write!(f, "deadline_expired"),
        }
    }
}

/// Task execution state machine.
///
/// ```text
/// ┌─────────┐ retry/claim ┌───────────┐  started   ┌─────────┐
/// │ PENDING │────────────►│ SCHEDULED │───────────►│ RUNNING │
/// └─────────┘             └───────────┘            └─────────┘
///      │                        │                       │
///      │ deadline               │ deadline        ┌─────┼───────────┐
///      ▼                        ▼                 ▼     ▼           ▼
/// ┌───────────┐          ┌───────────┐    ┌──────────┐ ┌────────┐ ┌─────────┐
/// │ CANCELLED │          │ CANCELLED │    │COMPLETED │ │ FAILED │ │ TIMEOUT │
/// └───────────┘          └───────────┘    └──────────┘ └────────┘ └─────────┘
///                                                           │
///                                                      retry (supervisor)
///                                                           │
///                                                           ▼
///                                                     ┌───────────┐
///                                                     │ SCHEDULED │
///                                                     └───────────┘
/// ```
///
/// `Completed`, `Cancelled`, and `TimedOut` are strictly final. `Failed` is
/// terminal for everyone except the Supervisor, which may revive it through
/// `schedule_retry` while the retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet claimed by an agent.
    Pending,
    /// Claimed or waiting for a retry timer.
    Scheduled,
    /// Remote activity in progress.
    Running,
    /// Remote activity completed successfully.
    Completed,
    /// Remote activity failed (may be revived by retry).
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Force-expired after exceeding the activity timeout.
    TimedOut,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Returns true if the task is eligible to be claimed by an agent.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Scheduled | Self::Running | Self::Cancelled),
            Self::Scheduled => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                target,
                Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
            ),
            // Retry revival is the one edge out of a terminal status.
            Self::Failed => matches!(target, Self::Scheduled),
            Self::Completed | Self::Cancelled | Self::TimedOut => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timeout",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Scheduling priority.
///
/// Ordered so that `Critical > High > Normal > Low` when compared directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work, dispatched last.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Preferred over normal work.
    High,
    /// Dispatched before everything else.
    Critical,
}

impl TaskPriority {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// An ordered activity option key/value pair.
///
/// Option order is preserved end-to-end: controllers may attach positional
/// meaning to repeated keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityOption {
    /// Option key.
    pub key: String,
    /// Option value, always transported as a string.
    pub value: String,
}

impl ActivityOption {
    /// Creates a new option pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Retry backoff policy.
///
/// Delay for attempt `n` is `min(2^n * base ± 30% jitter, max_delay)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum retry attempts before a task is escalated.
    pub max_retries: u32,
    /// Base delay for the exponential backoff.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Computes the backoff delay for the given retry count.
    ///
    /// The jitter spreads concurrent retries of many tasks over a ±30%
    /// window so a controller recovering from an outage is not stampeded.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let raw_ms = base_ms.saturating_mul(2_u64.saturating_pow(retry_count));

        // ±30% jitter: scale by a factor in [0.70, 1.30].
        let jitter_pct = 70 + (jitter_seed() % 61); // 70..=130
        let jittered_ms = raw_ms.saturating_mul(jitter_pct) / 100;

        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(jittered_ms.min(max_ms))
    }
}

/// Generates a jitter seed from the clock.
///
/// A full PRNG dependency is not warranted for spreading retry timers.
fn jitter_seed() -> u64 {
    use std::time::SystemTime;
    u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    )
}

/// The durable record for one unit of schedulable work.
///
/// Only the Scheduler mutates these fields; every other component goes
/// through its methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Unique task identifier.
    pub id: TaskId,
    /// Experiment run this task belongs to.
    pub run_id: RunId,
    /// Campaign grouping, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    /// Controller the activity will run on.
    pub controller_id: ControllerId,
    /// Remote activity name (e.g. `print_job`).
    pub activity_name: String,
    /// Ordered activity options.
    #[serde(default)]
    pub options: Vec<ActivityOption>,
    /// Current status.
    pub status: TaskStatus,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Retry attempts consumed so far.
    pub retry_count: u32,
    /// Maximum retry attempts.
    pub max_retries: u32,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last became eligible for dispatch.
    pub scheduled_at: DateTime<Utc>,
    /// When the remote activity started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the last dispatch attempt was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be claimed. Set only while `Scheduled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Hard deadline; tasks never started by this time are cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Remote activity id. Set iff the task has been dispatched at least once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<ActivityId>,
    /// Error text from the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reason for the most recent status transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// Free-form metadata attached by the workflow layer.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ScheduledTask {
    /// Creates a new pending task.
    #[must_use]
    pub fn new(
        run_id: RunId,
        controller_id: ControllerId,
        activity_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            run_id,
            campaign_id: None,
            controller_id,
            activity_name: activity_name.into(),
            options: Vec::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            retry_count: 0,
            max_retries: RetryPolicy::default().max_retries,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            last_attempt_at: None,
            next_retry_at: None,
            deadline: None,
            activity_id: None,
            error: None,
            last_transition_reason: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the campaign grouping.
    #[must_use]
    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    /// Sets the ordered option list.
    #[must_use]
    pub fn with_options(mut self, options: Vec<ActivityOption>) -> Self {
        self.options = options;
        self
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the maximum retry attempts.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the hard deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches workflow metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns true if the task is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the task is claimable at the given time.
    ///
    /// A task is claimable when its status is ready, its retry timer (if
    /// any) has elapsed, and its deadline (if any) has not passed.
    #[must_use]
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        if !self.status.is_ready() {
            return false;
        }
        if self.next_retry_at.is_some_and(|at| at > now) {
            return false;
        }
        if self.deadline.is_some_and(|at| at <= now) {
            return false;
        }
        true
    }

    /// Returns true if the deadline has passed without the task starting.
    #[must_use]
    pub fn deadline_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_ready() && self.deadline.is_some_and(|at| at <= now)
    }

    /// Returns true if the retry budget allows another attempt.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Transitions to a new status with an explicit reason.
    ///
    /// Timestamps are updated according to the target status. Terminal
    /// statuses other than `Failed` are final; attempting to leave one
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is not in
    /// the state machine.
    #[tracing::instrument(
        skip(self),
        fields(task_id = %self.id, from = %self.status, to = %target, reason = %reason)
    )]
    pub fn transition_to(&mut self, target: TaskStatus, reason: TransitionReason) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("not allowed for reason {reason}"),
            });
        }

        let now = Utc::now();
        match target {
            TaskStatus::Scheduled => {
                self.scheduled_at = now;
            }
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.last_attempt_at = Some(now);
                self.next_retry_at = None;
            }
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::TimedOut => {
                self.completed_at = Some(now);
                self.next_retry_at = None;
            }
            TaskStatus::Pending => {}
        }

        self.status = target;
        self.last_transition_reason = Some(reason);
        Ok(())
    }

    /// Revives a failed task for another attempt.
    ///
    /// Increments the retry counter, computes the next retry time from the
    /// policy, clears the previous error, and moves the task back to
    /// `Scheduled`. Returns the retry time, or `None` when the retry budget
    /// is exhausted (the caller must escalate instead).
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not in `Failed`.
    pub fn schedule_retry(&mut self, policy: &RetryPolicy) -> Result<Option<DateTime<Utc>>> {
        if self.status != TaskStatus::Failed {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: TaskStatus::Scheduled.to_string(),
                reason: "only failed tasks can be retried".to_string(),
            });
        }

        if !self.can_retry() {
            return Ok(None);
        }

        self.retry_count += 1;
        let delay = policy.backoff_delay(self.retry_count);
        let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);

        self.transition_to(TaskStatus::Scheduled, TransitionReason::RetryScheduled)?;
        self.next_retry_at = Some(next);
        self.error = None;
        self.completed_at = None;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> ScheduledTask {
        ScheduledTask::new(
            RunId::new("run-1"),
            ControllerId::new("printer-a3"),
            "print_job",
        )
    }

    #[test]
    fn status_happy_path_transitions() {
        let status = TaskStatus::Pending;
        assert!(status.can_transition_to(TaskStatus::Scheduled));
        assert!(status.can_transition_to(TaskStatus::Running));
        assert!(status.can_transition_to(TaskStatus::Cancelled));
        assert!(!status.can_transition_to(TaskStatus::Completed));

        let status = TaskStatus::Running;
        assert!(status.can_transition_to(TaskStatus::Completed));
        assert!(status.can_transition_to(TaskStatus::Failed));
        assert!(status.can_transition_to(TaskStatus::TimedOut));
        assert!(!status.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_statuses_are_final() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::TimedOut,
        ] {
            for target in [
                TaskStatus::Pending,
                TaskStatus::Scheduled,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                assert!(!status.can_transition_to(target), "{status} -> {target}");
            }
        }
        // Failed is revivable only toward Scheduled.
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Scheduled));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn transition_updates_timestamps() -> Result<()> {
        let mut task = make_task();
        assert_eq!(task.status, TaskStatus::Pending);

        task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
        assert!(task.started_at.is_some());
        assert!(task.last_attempt_at.is_some());

        task.transition_to(TaskStatus::Completed, TransitionReason::ActivityCompleted)?;
        assert!(task.completed_at.is_some());
        assert_eq!(
            task.last_transition_reason,
            Some(TransitionReason::ActivityCompleted)
        );
        Ok(())
    }

    #[test]
    fn invalid_transition_fails() {
        let mut task = make_task();
        let result = task.transition_to(TaskStatus::Completed, TransitionReason::ActivityCompleted);
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
    }

    #[test]
    fn schedule_retry_increments_and_clears_error() -> Result<()> {
        let mut task = make_task().with_max_retries(3);
        task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
        task.error = Some("controller_unavailable: connect refused".into());
        task.transition_to(TaskStatus::Failed, TransitionReason::ActivityFailed)?;

        let next = task.schedule_retry(&RetryPolicy::default())?;
        assert!(next.is_some());
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.error.is_none());
        assert!(task.next_retry_at.is_some());
        Ok(())
    }

    #[test]
    fn schedule_retry_exhausted_returns_none() -> Result<()> {
        let mut task = make_task().with_max_retries(1);
        task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
        task.transition_to(TaskStatus::Failed, TransitionReason::ActivityFailed)?;
        assert!(task.schedule_retry(&RetryPolicy::default())?.is_some());

        task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
        task.transition_to(TaskStatus::Failed, TransitionReason::ActivityFailed)?;
        assert!(task.schedule_retry(&RetryPolicy::default())?.is_none());
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, TaskStatus::Failed);
        Ok(())
    }

    #[test]
    fn retry_count_never_exceeds_max() -> Result<()> {
        let mut task = make_task().with_max_retries(2);
        let policy = RetryPolicy::default();

        for _ in 0..5 {
            task.transition_to(TaskStatus::Running, TransitionReason::ActivityStarted)?;
            task.transition_to(TaskStatus::Failed, TransitionReason::ActivityFailed)?;
            if task.schedule_retry(&policy)?.is_none() {
                break;
            }
        }

        assert!(task.retry_count <= task.max_retries);
        Ok(())
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        for retry_count in 0..=10 {
            let delay = policy.backoff_delay(retry_count);
            assert!(delay <= Duration::from_millis(30_000), "retry {retry_count}");
        }
    }

    #[test]
    fn backoff_grows_with_retry_count() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(3600),
        };
        // Even at minimum jitter (0.70), attempt 3 exceeds attempt 0's
        // maximum jitter (1.30).
        let early = policy.backoff_delay(0);
        let late = policy.backoff_delay(3);
        assert!(late > early);
    }

    #[test]
    fn is_ready_at_respects_retry_timer_and_deadline() {
        let now = Utc::now();
        let mut task = make_task();
        assert!(task.is_ready_at(now));

        task.next_retry_at = Some(now + chrono::Duration::seconds(60));
        task.status = TaskStatus::Scheduled;
        assert!(!task.is_ready_at(now));

        task.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(task.is_ready_at(now));

        task.deadline = Some(now - chrono::Duration::seconds(1));
        assert!(!task.is_ready_at(now));
        assert!(task.deadline_expired_at(now));
    }

    #[test]
    fn running_task_is_not_ready() {
        let now = Utc::now();
        let mut task = make_task();
        task.status = TaskStatus::Running;
        assert!(!task.is_ready_at(now));
        assert!(!task.deadline_expired_at(now));
    }
}
