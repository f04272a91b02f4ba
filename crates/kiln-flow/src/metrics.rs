//! Observability metrics for the orchestration runtime.
//!
//! Metrics are exposed through the `metrics` crate facade and are
//! Prometheus-compatible when an exporter recorder is installed.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `kiln_flow_tasks_total` | Counter | `from_status`, `to_status`, `reason` | Task status transitions |
//! | `kiln_flow_task_duration_seconds` | Histogram | `activity`, `status` | Task wall-clock duration |
//! | `kiln_flow_agent_cycle_duration_seconds` | Histogram | - | Agent poll cycle time |
//! | `kiln_flow_supervisor_cycle_duration_seconds` | Histogram | `cycle` | Supervisor cycle time |
//! | `kiln_flow_tasks_in_flight` | Gauge | - | Tasks currently executing |
//! | `kiln_flow_gateway_requests_total` | Counter | `controller`, `result` | Gateway dispatch outcomes |
//! | `kiln_flow_retries_total` | Counter | `attempt` | Retry scheduling operations |
//! | `kiln_flow_escalations_total` | Counter | `kind` | Supervisor escalations emitted |
//! | `kiln_flow_controller_health` | Gauge | `controller` | 1 healthy, 0 offline |
//! | `kiln_flow_events_total` | Counter | `event_type` | Controller events handled |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total task status transitions.
    pub const TASKS_TOTAL: &str = "kiln_flow_tasks_total";
    /// Histogram: Task wall-clock duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "kiln_flow_task_duration_seconds";
    /// Histogram: Agent poll cycle processing time in seconds.
    pub const AGENT_CYCLE_DURATION_SECONDS: &str = "kiln_flow_agent_cycle_duration_seconds";
    /// Histogram: Supervisor cycle processing time in seconds.
    pub const SUPERVISOR_CYCLE_DURATION_SECONDS: &str =
        "kiln_flow_supervisor_cycle_duration_seconds";
    /// Gauge: Tasks currently executing on controllers.
    pub const TASKS_IN_FLIGHT: &str = "kiln_flow_tasks_in_flight";
    /// Counter: Gateway dispatch outcomes.
    pub const GATEWAY_REQUESTS_TOTAL: &str = "kiln_flow_gateway_requests_total";
    /// Counter: Total retry scheduling operations.
    pub const RETRIES_TOTAL: &str = "kiln_flow_retries_total";
    /// Counter: Supervisor escalations emitted.
    pub const ESCALATIONS_TOTAL: &str = "kiln_flow_escalations_total";
    /// Gauge: Controller health state.
    pub const CONTROLLER_HEALTH: &str = "kiln_flow_controller_health";
    /// Counter: Controller events handled by the bridge.
    pub const EVENTS_TOTAL: &str = "kiln_flow_events_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous task status (for transitions).
    pub const FROM_STATUS: &str = "from_status";
    /// Target task status (for transitions).
    pub const TO_STATUS: &str = "to_status";
    /// Transition reason.
    pub const REASON: &str = "reason";
    /// Remote activity name.
    pub const ACTIVITY: &str = "activity";
    /// Final task status.
    pub const STATUS: &str = "status";
    /// Controller identifier.
    pub const CONTROLLER: &str = "controller";
    /// Request result (started, failed, retried).
    pub const RESULT: &str = "result";
    /// Supervisor cycle name (monitor, health).
    pub const CYCLE: &str = "cycle";
    /// Escalation kind.
    pub const KIND: &str = "kind";
    /// Controller event type.
    pub const EVENT_TYPE: &str = "event_type";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task status transition.
    pub fn record_task_transition(&self, from_status: &str, to_status: &str, reason: &str) {
        counter!(
            names::TASKS_TOTAL,
            labels::FROM_STATUS => from_status.to_string(),
            labels::TO_STATUS => to_status.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Records task wall-clock duration.
    pub fn observe_task_duration(&self, activity: &str, final_status: &str, duration_secs: f64) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::ACTIVITY => activity.to_string(),
            labels::STATUS => final_status.to_string(),
        )
        .record(duration_secs);
    }

    /// Records agent poll cycle duration.
    pub fn observe_agent_cycle_duration(&self, duration: Duration) {
        histogram!(names::AGENT_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records supervisor cycle duration.
    pub fn observe_supervisor_cycle_duration(&self, cycle: &str, duration: Duration) {
        histogram!(
            names::SUPERVISOR_CYCLE_DURATION_SECONDS,
            labels::CYCLE => cycle.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the in-flight task gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_tasks_in_flight(&self, count: usize) {
        gauge!(names::TASKS_IN_FLIGHT).set(count as f64);
    }

    /// Records a gateway dispatch outcome.
    pub fn record_gateway_request(&self, controller: &str, result: &str) {
        counter!(
            names::GATEWAY_REQUESTS_TOTAL,
            labels::CONTROLLER => controller.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a retry scheduling operation.
    pub fn record_retry(&self, attempt: u32) {
        counter!(
            names::RETRIES_TOTAL,
            "attempt" => attempt.to_string(),
        )
        .increment(1);
    }

    /// Records a supervisor escalation.
    pub fn record_escalation(&self, kind: &str) {
        counter!(
            names::ESCALATIONS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Sets the health gauge for a controller.
    pub fn set_controller_health(&self, controller: &str, healthy: bool) {
        gauge!(
            names::CONTROLLER_HEALTH,
            labels::CONTROLLER => controller.to_string(),
        )
        .set(if healthy { 1.0 } else { 0.0 });
    }

    /// Records a handled controller event.
    pub fn record_event(&self, event_type: &str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::EVENT_TYPE => event_type.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for agent poll cycle metrics.
#[must_use]
pub fn time_agent_cycle() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::AGENT_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}

/// Creates a timing guard for supervisor cycle metrics.
#[must_use]
pub fn time_supervisor_cycle(cycle: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        histogram!(
            names::SUPERVISOR_CYCLE_DURATION_SECONDS,
            labels::CYCLE => cycle,
        )
        .record(duration.as_secs_f64());
    })
}
