//! Drift correction for the happy path.
//!
//! The supervisor runs two independent timer loops. The monitoring cycle
//! reconciles stale running tasks against the controller's own view,
//! enforces the activity timeout, classifies failed tasks into retries
//! and escalations, and expires missed deadlines. The health cycle probes
//! every registered controller and raises an offline escalation after
//! three consecutive failures.
//!
//! Escalations are handed to a caller-provided callback; the supervisor
//! itself never decides what an escalation means for the workflow.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use kiln_core::{ControllerId, TaskId};

use crate::config::SupervisorConfig;
use crate::correlation::{ActivityStatus, CorrelationStore};
use crate::error::{Error, Result};
use crate::events::{Escalation, EscalationKind};
use crate::gateway::GatewayService;
use crate::loops::{spawn_repeating, LoopHandle};
use crate::metrics::{time_supervisor_cycle, FlowMetrics};
use crate::scheduler::Scheduler;
use crate::store::TaskFilter;
use crate::task::{ScheduledTask, TaskStatus};

/// Consecutive health-check failures that flag a controller offline.
const OFFLINE_THRESHOLD: u32 = 3;

/// Error substrings that are never worth an automatic retry.
const NON_RETRYABLE: [&str; 4] = [
    "invalid_options",
    "unknown_activity",
    "authorization_failed",
    "resource_not_found",
];

/// Callback invoked for every escalation the supervisor raises.
pub type EscalationHandler = Arc<dyn Fn(Escalation) + Send + Sync>;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[derive(Default)]
struct SupervisorState {
    /// Consecutive health-check failures per controller.
    health_failures: HashMap<ControllerId, u32>,
    /// Controllers already escalated as offline. Cleared on recovery.
    offline_escalated: HashSet<ControllerId>,
    /// Failed tasks already escalated, to raise each at most once.
    escalated_tasks: HashSet<TaskId>,
}

/// Periodic reconciler for tasks and controllers.
pub struct Supervisor {
    scheduler: Arc<Scheduler>,
    gateway: Arc<GatewayService>,
    correlations: Arc<dyn CorrelationStore>,
    config: SupervisorConfig,
    handler: Option<EscalationHandler>,
    state: Mutex<SupervisorState>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor over the given scheduler and gateway.
    pub fn new(
        scheduler: Arc<Scheduler>,
        gateway: Arc<GatewayService>,
        correlations: Arc<dyn CorrelationStore>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            gateway,
            correlations,
            config,
            handler: None,
            state: Mutex::new(SupervisorState::default()),
            metrics: FlowMetrics::new(),
        })
    }

    /// Creates a supervisor that reports escalations to a callback.
    pub fn with_handler(
        scheduler: Arc<Scheduler>,
        gateway: Arc<GatewayService>,
        correlations: Arc<dyn CorrelationStore>,
        config: SupervisorConfig,
        handler: EscalationHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            gateway,
            correlations,
            config,
            handler: Some(handler),
            state: Mutex::new(SupervisorState::default()),
            metrics: FlowMetrics::new(),
        })
    }

    /// Runs one monitoring cycle.
    ///
    /// The four phases are independent; a storage error in one aborts the
    /// cycle, but per-task controller errors are contained to their task.
    #[tracing::instrument(skip(self))]
    pub async fn monitor_cycle(&self) -> Result<()> {
        let _guard = time_supervisor_cycle("monitor");
        self.reconcile_stale().await?;
        self.enforce_timeouts().await?;
        self.classify_failed().await?;
        self.expire_deadlines().await?;
        Ok(())
    }

    /// Reconciles running tasks whose correlation has gone quiet.
    ///
    /// A direct status query settles tasks whose terminal event was lost.
    /// When the query fails against a controller already known unhealthy,
    /// an offline escalation fires instead.
    async fn reconcile_stale(&self) -> Result<()> {
        let threshold = Utc::now()
            - ChronoDuration::from_std(self.config.stale_threshold)
                .map_err(|err| Error::configuration(err.to_string()))?;

        for task in self.running_tasks().await? {
            let Some(activity_id) = task.activity_id.clone() else {
                continue;
            };
            let stale = match self.correlations.get_correlation(&activity_id).await? {
                Some(correlation) => correlation.updated_at < threshold,
                None => task.started_at.is_some_and(|at| at < threshold),
            };
            if !stale {
                continue;
            }

            debug!(task_id = %task.id, "querying controller for stale task");
            match self
                .gateway
                .get_activity_status(&task.controller_id, &activity_id)
                .await
            {
                Ok(report) => {
                    self.reconcile_report(&task, report.status, report.status_msg)
                        .await?;
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "stale status query failed");
                    let unreachable = matches!(
                        &err,
                        Error::Gateway(gateway_err) if gateway_err.is_transient()
                    );
                    if unreachable && self.is_marked_unhealthy(&task.controller_id)? {
                        self.escalate_offline(&task.controller_id, "status query failed")?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a directly queried controller status to the local task.
    async fn reconcile_report(
        &self,
        task: &ScheduledTask,
        status: ActivityStatus,
        message: Option<String>,
    ) -> Result<()> {
        if let Some(activity_id) = &task.activity_id {
            self.correlations.update_status(activity_id, status).await?;
        }
        match status {
            ActivityStatus::Completed => {
                info!(task_id = %task.id, "reconciled late completion");
                self.scheduler.mark_completed(&task.id).await?;
            }
            ActivityStatus::Failed => {
                let error = message.unwrap_or_else(|| "activity failed".to_string());
                info!(task_id = %task.id, "reconciled late failure");
                self.scheduler.mark_failed(&task.id, error).await?;
            }
            ActivityStatus::Cancelled => {
                info!(task_id = %task.id, "reconciled remote cancellation");
                self.scheduler
                    .cancel_task(&task.id, "cancelled by controller")
                    .await?;
            }
            ActivityStatus::Pending | ActivityStatus::Running => {}
        }
        Ok(())
    }

    /// Forces tasks past the activity timeout into `TimedOut`.
    ///
    /// The remote cancel is best-effort; the local transition happens
    /// whether or not the controller acknowledges.
    async fn enforce_timeouts(&self) -> Result<()> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.activity_timeout)
                .map_err(|err| Error::configuration(err.to_string()))?;

        for task in self.running_tasks().await? {
            if !task.started_at.is_some_and(|at| at < cutoff) {
                continue;
            }

            if let Some(activity_id) = &task.activity_id {
                if let Err(err) = self
                    .gateway
                    .cancel_activity(&task.controller_id, activity_id, "activity timeout")
                    .await
                {
                    debug!(task_id = %task.id, error = %err, "timeout cancel not acknowledged");
                }
            }

            warn!(task_id = %task.id, "activity exceeded timeout");
            self.scheduler.mark_timed_out(&task.id).await?;
            let escalation = Escalation::new(
                EscalationKind::ActivityTimeout,
                format!("activity exceeded {:?} timeout", self.config.activity_timeout),
            )
            .with_task(task.id)
            .with_controller(task.controller_id.clone());
            let escalation = match &task.activity_id {
                Some(activity_id) => escalation.with_activity(activity_id.clone()),
                None => escalation,
            };
            self.raise(escalation);
        }
        Ok(())
    }

    /// Retries or escalates failed tasks.
    async fn classify_failed(&self) -> Result<()> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Failed),
            ..TaskFilter::default()
        };
        let now = Utc::now();

        for task in self.scheduler.query_tasks(&filter).await? {
            let retryable = self.config.auto_retry_enabled
                && task.can_retry()
                && !task.deadline.is_some_and(|at| at <= now)
                && !is_non_retryable(task.error.as_deref());

            if retryable {
                let next = self.scheduler.schedule_retry(&task.id).await?;
                if let Some(next_retry_at) = next {
                    info!(
                        task_id = %task.id,
                        attempt = task.retry_count + 1,
                        next_retry_at = %next_retry_at,
                        "task retry scheduled"
                    );
                    continue;
                }
            }

            let already = {
                let mut state = self.state.lock().map_err(poison_err)?;
                !state.escalated_tasks.insert(task.id)
            };
            if already {
                continue;
            }

            let kind = if task.retry_count >= task.max_retries {
                EscalationKind::RepeatedFailures
            } else {
                EscalationKind::TaskFailed
            };
            let message = task
                .error
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            self.raise(
                Escalation::new(kind, message)
                    .with_task(task.id)
                    .with_controller(task.controller_id.clone()),
            );
        }
        Ok(())
    }

    /// Cancels never-started tasks whose deadline has passed.
    ///
    /// This is a planning outcome, not a fault, so no escalation is
    /// raised.
    async fn expire_deadlines(&self) -> Result<()> {
        for task in self.scheduler.list_deadline_expired().await? {
            info!(task_id = %task.id, "deadline passed before execution");
            self.scheduler.expire_deadline(&task.id).await?;
        }
        Ok(())
    }

    /// Runs one health-check cycle over every registered controller.
    #[tracing::instrument(skip(self))]
    pub async fn health_cycle(&self) -> Result<()> {
        let _guard = time_supervisor_cycle("health");
        for controller_id in self.gateway.list_controllers() {
            let healthy = self
                .gateway
                .controller_health(&controller_id)
                .await
                .unwrap_or(false);
            self.metrics
                .set_controller_health(controller_id.as_str(), healthy);
            self.record_health(&controller_id, healthy)?;
        }
        Ok(())
    }

    /// Tracks consecutive failures and raises the offline escalation
    /// exactly once per outage.
    fn record_health(&self, controller_id: &ControllerId, healthy: bool) -> Result<()> {
        let newly_offline = {
            let mut state = self.state.lock().map_err(poison_err)?;
            if healthy {
                if state.health_failures.remove(controller_id).is_some() {
                    debug!(controller_id = %controller_id, "controller recovered");
                }
                state.offline_escalated.remove(controller_id);
                false
            } else {
                let failures = state
                    .health_failures
                    .entry(controller_id.clone())
                    .or_insert(0);
                *failures += 1;
                *failures >= OFFLINE_THRESHOLD
                    && state.offline_escalated.insert(controller_id.clone())
            }
        };

        if newly_offline {
            warn!(controller_id = %controller_id, "controller offline");
            self.raise(
                Escalation::new(
                    EscalationKind::ControllerOffline,
                    format!("{OFFLINE_THRESHOLD} consecutive health checks failed"),
                )
                .with_controller(controller_id.clone()),
            );
        }
        Ok(())
    }

    /// Number of consecutive health failures currently recorded.
    pub fn consecutive_failures(&self, controller_id: &ControllerId) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.health_failures.get(controller_id).copied())
            .unwrap_or(0)
    }

    fn is_marked_unhealthy(&self, controller_id: &ControllerId) -> Result<bool> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .health_failures
            .get(controller_id)
            .is_some_and(|failures| *failures > 0))
    }

    fn escalate_offline(&self, controller_id: &ControllerId, reason: &str) -> Result<()> {
        let newly = {
            let mut state = self.state.lock().map_err(poison_err)?;
            state.offline_escalated.insert(controller_id.clone())
        };
        if newly {
            self.raise(
                Escalation::new(EscalationKind::ControllerOffline, reason)
                    .with_controller(controller_id.clone()),
            );
        }
        Ok(())
    }

    fn raise(&self, escalation: Escalation) {
        self.metrics.record_escalation(escalation.kind.as_label());
        if !self.config.escalation_enabled {
            debug!(kind = %escalation.kind, "escalation suppressed by configuration");
            return;
        }
        info!(kind = %escalation.kind, message = %escalation.message, "escalation raised");
        if let Some(handler) = &self.handler {
            handler(escalation);
        }
    }

    async fn running_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Running),
            ..TaskFilter::default()
        };
        self.scheduler.query_tasks(&filter).await
    }

    /// Starts the monitoring and health-check loops.
    pub fn start(self: &Arc<Self>) -> (LoopHandle, LoopHandle) {
        let monitor = {
            let supervisor = Arc::clone(self);
            spawn_repeating(
                "supervisor_monitor",
                self.config.monitor_interval,
                move || {
                    let supervisor = Arc::clone(&supervisor);
                    async move {
                        if let Err(err) = supervisor.monitor_cycle().await {
                            warn!(error = %err, "monitor cycle failed");
                        }
                    }
                },
            )
        };
        let health = {
            let supervisor = Arc::clone(self);
            spawn_repeating(
                "supervisor_health",
                self.config.health_check_interval,
                move || {
                    let supervisor = Arc::clone(&supervisor);
                    async move {
                        if let Err(err) = supervisor.health_cycle().await {
                            warn!(error = %err, "health cycle failed");
                        }
                    }
                },
            )
        };
        (monitor, health)
    }
}

/// Returns true when the error text matches the fixed deny-list.
fn is_non_retryable(error: Option<&str>) -> bool {
    error.is_some_and(|text| NON_RETRYABLE.iter().any(|tag| text.contains(tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::correlation::memory::InMemoryCorrelationStore;
    use crate::gateway::SimulatedControllerClient;
    use crate::scheduler::TaskRequest;
    use crate::store::memory::InMemoryTaskStore;
    use crate::task::ActivityOption;
    use chrono::Duration as ChronoDuration;
    use kiln_core::RunId;
    use std::time::Duration;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        scheduler: Arc<Scheduler>,
        gateway: Arc<GatewayService>,
        sim: Arc<SimulatedControllerClient>,
        escalations: Arc<Mutex<Vec<Escalation>>>,
    }

    fn fixture(config: SupervisorConfig) -> Fixture {
        let correlations = Arc::new(InMemoryCorrelationStore::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(InMemoryTaskStore::new()),
            SchedulerConfig::default(),
        ));
        let sim = Arc::new(SimulatedControllerClient::new(ControllerId::new(
            "printer-a3",
        )));
        let mut gateway = GatewayService::new(
            Arc::clone(&correlations) as _,
            ControllerId::new("simulated"),
        );
        gateway.register_client(Arc::clone(&sim) as _);
        let gateway = Arc::new(gateway);

        let escalations = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&escalations);
        let supervisor = Supervisor::with_handler(
            Arc::clone(&scheduler),
            Arc::clone(&gateway),
            correlations,
            config,
            Arc::new(move |escalation| {
                sink.lock().unwrap().push(escalation);
            }),
        );

        Fixture {
            supervisor,
            scheduler,
            gateway,
            sim,
            escalations,
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            monitor_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            activity_timeout: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            auto_retry_enabled: true,
            escalation_enabled: true,
        }
    }

    fn request() -> TaskRequest {
        let mut request = TaskRequest::new(
            RunId::new("run-1"),
            ControllerId::new("printer-a3"),
            "print_job",
        );
        request.options = vec![
            ActivityOption::new("file", "bucket/part.stl"),
            ActivityOption::new("material", "ti64"),
        ];
        request
    }

    fn escalation_kinds(fx: &Fixture) -> Vec<EscalationKind> {
        fx.escalations.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    async fn running_task(fx: &Fixture) -> ScheduledTask {
        let task = fx.scheduler.schedule_task(request()).await.unwrap();
        let activity_id = fx
            .gateway
            .start_activity(&crate::gateway::ActivityRequest {
                controller_id: task.controller_id.clone(),
                run_id: task.run_id.clone(),
                campaign_id: None,
                activity_name: task.activity_name.clone(),
                options: task.options.clone(),
                deadline: None,
            })
            .await
            .unwrap();
        fx.scheduler.mark_started(&task.id, activity_id).await.unwrap()
    }

    #[tokio::test]
    async fn retryable_failure_is_rescheduled() {
        let fx = fixture(config());
        let task = fx.scheduler.schedule_task(request()).await.unwrap();
        let task = fx
            .scheduler
            .mark_started(&task.id, kiln_core::ActivityId::new("act-1"))
            .await
            .unwrap();
        fx.scheduler
            .mark_failed(&task.id, "controller_unavailable: connect refused")
            .await
            .unwrap();

        fx.supervisor.monitor_cycle().await.unwrap();

        let stored = fx.scheduler.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.retry_count, 1);
        assert!(escalation_kinds(&fx).is_empty());
    }

    #[tokio::test]
    async fn deny_listed_failure_escalates_once() {
        let fx = fixture(config());
        let task = fx.scheduler.schedule_task(request()).await.unwrap();
        let task = fx
            .scheduler
            .mark_started(&task.id, kiln_core::ActivityId::new("act-2"))
            .await
            .unwrap();
        fx.scheduler
            .mark_failed(&task.id, "invalid_options: missing required option material")
            .await
            .unwrap();

        fx.supervisor.monitor_cycle().await.unwrap();
        fx.supervisor.monitor_cycle().await.unwrap();

        let stored = fx.scheduler.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(escalation_kinds(&fx), vec![EscalationKind::TaskFailed]);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate_repeated_failures() {
        let fx = fixture(config());
        let mut req = request();
        req.max_retries = Some(0);
        let task = fx.scheduler.schedule_task(req).await.unwrap();
        let task = fx
            .scheduler
            .mark_started(&task.id, kiln_core::ActivityId::new("act-3"))
            .await
            .unwrap();
        fx.scheduler
            .mark_failed(&task.id, "controller_unavailable: timeout")
            .await
            .unwrap();

        fx.supervisor.monitor_cycle().await.unwrap();

        assert_eq!(
            escalation_kinds(&fx),
            vec![EscalationKind::RepeatedFailures]
        );
    }

    #[tokio::test]
    async fn timeout_forces_timed_out_and_escalates() {
        let mut cfg = config();
        cfg.activity_timeout = Duration::from_millis(20);
        let fx = fixture(cfg);
        let task = running_task(&fx).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.supervisor.monitor_cycle().await.unwrap();

        let stored = fx.scheduler.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::TimedOut);
        assert_eq!(
            escalation_kinds(&fx),
            vec![EscalationKind::ActivityTimeout]
        );
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_without_escalation() {
        let fx = fixture(config());
        let mut req = request();
        req.deadline = Some(Utc::now() + ChronoDuration::milliseconds(20));
        let task = fx.scheduler.schedule_task(req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        fx.supervisor.monitor_cycle().await.unwrap();

        let stored = fx.scheduler.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(
            stored.metadata.get("cancelReason").and_then(|v| v.as_str()),
            Some("deadline exceeded before execution")
        );
        assert!(escalation_kinds(&fx).is_empty());
    }

    #[tokio::test]
    async fn three_health_failures_escalate_exactly_once() {
        let fx = fixture(config());
        fx.sim.set_healthy(false);

        for _ in 0..5 {
            fx.supervisor.health_cycle().await.unwrap();
        }
        assert_eq!(
            escalation_kinds(&fx),
            vec![EscalationKind::ControllerOffline]
        );

        // Recovery resets the counter and re-arms the escalation.
        fx.sim.set_healthy(true);
        fx.supervisor.health_cycle().await.unwrap();
        assert_eq!(
            fx.supervisor
                .consecutive_failures(&ControllerId::new("printer-a3")),
            0
        );

        fx.sim.set_healthy(false);
        for _ in 0..3 {
            fx.supervisor.health_cycle().await.unwrap();
        }
        assert_eq!(escalation_kinds(&fx).len(), 2);
    }

    #[tokio::test]
    async fn stale_running_task_reconciles_late_completion() {
        let mut cfg = config();
        cfg.stale_threshold = Duration::from_millis(10);
        let fx = fixture(cfg);
        let task = running_task(&fx).await;
        let activity_id = task.activity_id.clone().unwrap();

        // The controller finished but the terminal event was lost.
        fx.sim
            .advance_activity(&activity_id, ActivityStatus::Completed, Vec::new());
        tokio::time::sleep(Duration::from_millis(30)).await;

        fx.supervisor.monitor_cycle().await.unwrap();

        let stored = fx.scheduler.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn unreachable_unhealthy_controller_escalates_offline_once() {
        let mut cfg = config();
        cfg.stale_threshold = Duration::from_millis(10);
        let fx = fixture(cfg);
        running_task(&fx).await;

        // One failed health check marks the controller unhealthy.
        fx.sim.set_healthy(false);
        fx.supervisor.health_cycle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        fx.supervisor.monitor_cycle().await.unwrap();
        fx.supervisor.monitor_cycle().await.unwrap();

        assert_eq!(
            escalation_kinds(&fx),
            vec![EscalationKind::ControllerOffline]
        );
    }

    #[tokio::test]
    async fn non_transient_stale_query_failure_does_not_escalate() {
        let mut cfg = config();
        cfg.stale_threshold = Duration::from_millis(10);
        let fx = fixture(cfg);
        let task = fx.scheduler.schedule_task(request()).await.unwrap();
        // An activity id the controller has no record of.
        fx.scheduler
            .mark_started(&task.id, kiln_core::ActivityId::new("act-ghost"))
            .await
            .unwrap();

        // Mark the controller unhealthy, then let it answer again.
        fx.sim.set_healthy(false);
        fx.supervisor.health_cycle().await.unwrap();
        fx.sim.set_healthy(true);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The query fails with unknown_activity_id, which is not an
        // unreachable controller.
        fx.supervisor.monitor_cycle().await.unwrap();
        assert!(escalation_kinds(&fx).is_empty());
    }

    #[tokio::test]
    async fn escalations_disabled_suppresses_handler() {
        let mut cfg = config();
        cfg.escalation_enabled = false;
        cfg.auto_retry_enabled = false;
        let fx = fixture(cfg);
        let task = fx.scheduler.schedule_task(request()).await.unwrap();
        let task = fx
            .scheduler
            .mark_started(&task.id, kiln_core::ActivityId::new("act-4"))
            .await
            .unwrap();
        fx.scheduler
            .mark_failed(&task.id, "invalid_options: bad value")
            .await
            .unwrap();

        fx.supervisor.monitor_cycle().await.unwrap();
        assert!(escalation_kinds(&fx).is_empty());
    }

    #[test]
    fn deny_list_matching() {
        assert!(is_non_retryable(Some("invalid_options: missing file")));
        assert!(is_non_retryable(Some("authorization_failed: bad token")));
        assert!(!is_non_retryable(Some("controller_unavailable: refused")));
        assert!(!is_non_retryable(None));
    }
}
