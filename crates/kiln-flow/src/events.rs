//! Event envelopes crossing the controller and workflow boundaries.
//!
//! Controllers push [`ControllerEvent`] envelopes over the message
//! transport; the bridge normalizes them into [`FlowEvent`]s for
//! in-process subscribers. [`Escalation`] is the supervisor's channel to
//! the external workflow layer for conditions this core cannot resolve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiln_core::{ActivityId, CampaignId, ControllerId, EventId, RunId, TaskId};

use crate::correlation::ActivityStatus;

/// Topic strings published by the bridge.
pub mod topics {
    /// Raw envelope, republished under its own event type.
    pub const STATUS_CHANGE: &str = "activity.status_change";
    /// Raw progress envelope.
    pub const PROGRESS_UPDATE: &str = "activity.progress_update";
    /// Raw action completion envelope.
    pub const ACTION_COMPLETION: &str = "action.completion";
    /// Normalized status event, all statuses.
    pub const ACTIVITY_STATUS: &str = "activity.status";
    /// Normalized progress event.
    pub const ACTIVITY_PROGRESS: &str = "activity.progress";
    /// Terminal sub-event for completed activities.
    pub const ACTIVITY_COMPLETED: &str = "activity.completed";
    /// Terminal sub-event for failed activities.
    pub const ACTIVITY_FAILED: &str = "activity.failed";
    /// Terminal sub-event for cancelled activities.
    pub const ACTIVITY_CANCELLED: &str = "activity.cancelled";
    /// Normalized action outcome event.
    pub const ACTION_COMPLETED: &str = "action.completed";
}

/// Correlation hints a controller may echo back on a status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationHint {
    /// Owning experiment run.
    pub experiment_run_id: RunId,
    /// Campaign grouping, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

/// Payload of an `activity.status_change` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangePayload {
    /// Remote activity id.
    pub activity_id: ActivityId,
    /// Remote activity name.
    pub activity_name: String,
    /// New lifecycle status.
    pub activity_status: ActivityStatus,
    /// Completion fraction in `[0, 1]`, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Informational status text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    /// Error text accompanying a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Correlation hints, when the controller echoes them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationHint>,
}

/// Payload of an `activity.progress_update` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdatePayload {
    /// Remote activity id.
    pub activity_id: ActivityId,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Informational status text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
}

/// Payload of an `action.completion` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCompletionPayload {
    /// Remote action name.
    pub action_name: String,
    /// Idempotency key the action was dispatched with, when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Remote action status word (`ACTION_SUCCESS` / `ACTION_FAILURE`).
    pub action_status: String,
    /// Outcome text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
}

/// Typed body of a controller event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload")]
pub enum ControllerEventKind {
    /// Lifecycle status transition.
    #[serde(rename = "activity.status_change")]
    StatusChange(StatusChangePayload),
    /// Mid-flight progress report.
    #[serde(rename = "activity.progress_update")]
    ProgressUpdate(ProgressUpdatePayload),
    /// Discrete action finished.
    #[serde(rename = "action.completion")]
    ActionCompletion(ActionCompletionPayload),
}

impl ControllerEventKind {
    /// Returns the wire event-type string.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChange(_) => topics::STATUS_CHANGE,
            Self::ProgressUpdate(_) => topics::PROGRESS_UPDATE,
            Self::ActionCompletion(_) => topics::ACTION_COMPLETION,
        }
    }
}

/// Inbound event envelope from a remote controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerEvent {
    /// Typed event body.
    #[serde(flatten)]
    pub kind: ControllerEventKind,
    /// Controller that emitted the event.
    pub controller_id: ControllerId,
    /// When the controller emitted the event.
    pub timestamp: DateTime<Utc>,
}

impl ControllerEvent {
    /// Creates an envelope stamped with the current time.
    #[must_use]
    pub fn new(controller_id: ControllerId, kind: ControllerEventKind) -> Self {
        Self {
            kind,
            controller_id,
            timestamp: Utc::now(),
        }
    }
}

/// A normalized event published on the in-process bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowEvent {
    /// Raw controller envelope, republished unmodified.
    Raw(ControllerEvent),
    /// Normalized activity status transition.
    #[serde(rename_all = "camelCase")]
    ActivityStatus {
        /// Remote activity id.
        activity_id: ActivityId,
        /// Controller that ran the activity.
        controller_id: ControllerId,
        /// Owning run, when the correlation is known.
        run_id: Option<RunId>,
        /// New status.
        status: ActivityStatus,
        /// Informational or error text.
        message: Option<String>,
    },
    /// Normalized progress report.
    #[serde(rename_all = "camelCase")]
    ActivityProgress {
        /// Remote activity id.
        activity_id: ActivityId,
        /// Completion fraction in `[0, 1]`.
        progress: f64,
        /// Informational text.
        message: Option<String>,
    },
    /// Normalized discrete action outcome.
    #[serde(rename_all = "camelCase")]
    ActionOutcome {
        /// Remote action name.
        action_name: String,
        /// Controller that performed the action.
        controller_id: ControllerId,
        /// Whether the action succeeded.
        success: bool,
        /// Outcome text.
        message: Option<String>,
    },
}

/// Escalation kinds the supervisor can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A controller failed three consecutive health checks.
    ControllerOffline,
    /// A running activity exceeded the activity timeout.
    ActivityTimeout,
    /// A task failed with a non-retryable error.
    TaskFailed,
    /// A task exhausted its retry budget.
    RepeatedFailures,
}

impl EscalationKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::ControllerOffline => "controller_offline",
            Self::ActivityTimeout => "activity_timeout",
            Self::TaskFailed => "task_failed",
            Self::RepeatedFailures => "repeated_failures",
        }
    }
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// A condition handed to the external workflow layer for a decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    /// Unique escalation id.
    pub id: EventId,
    /// What went wrong.
    pub kind: EscalationKind,
    /// Task involved, when the condition is task-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Activity involved, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<ActivityId>,
    /// Controller involved, when the condition is controller-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<ControllerId>,
    /// Human-readable description.
    pub message: String,
    /// When the supervisor raised the escalation.
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    /// Creates an escalation stamped with the current time.
    #[must_use]
    pub fn new(kind: EscalationKind, message: impl Into<String>) -> Self {
        Self {
            id: EventId::generate(),
            kind,
            task_id: None,
            activity_id: None,
            controller_id: None,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    /// Scopes the escalation to a task.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Scopes the escalation to an activity.
    #[must_use]
    pub fn with_activity(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    /// Scopes the escalation to a controller.
    #[must_use]
    pub fn with_controller(mut self, controller_id: ControllerId) -> Self {
        self.controller_id = Some(controller_id);
        self
    }
}
