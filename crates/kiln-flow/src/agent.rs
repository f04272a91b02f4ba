//! Polling worker that dispatches ready tasks and finalizes them on
//! terminal events.
//!
//! Each poll cycle claims as many ready tasks as free slots allow and
//! starts them through the gateway. Completion is never polled for:
//! terminal bus events matched by activity id finalize the in-flight
//! task, update the correlation directory, persist reported data
//! products, and free the slot. Start failures are recorded as task
//! failures; retrying them is the supervisor's decision.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kiln_core::{ActivityId, TaskId};

use crate::bridge::EventBus;
use crate::config::AgentConfig;
use crate::correlation::ActivityStatus;
use crate::error::{Error, Result};
use crate::events::{topics, FlowEvent};
use crate::gateway::{ActivityRequest, GatewayService};
use crate::loops::{spawn_repeating, LoopHandle};
use crate::metrics::{time_agent_cycle, FlowMetrics};
use crate::scheduler::Scheduler;
use crate::task::ScheduledTask;

/// A terminal event waiting to be applied to an in-flight task.
#[derive(Debug, Clone)]
struct TerminalEvent {
    activity_id: ActivityId,
    status: ActivityStatus,
    message: Option<String>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Polling dispatch worker with bounded concurrency.
pub struct Agent {
    scheduler: Arc<Scheduler>,
    gateway: Arc<GatewayService>,
    config: AgentConfig,
    in_flight: Mutex<HashMap<ActivityId, TaskId>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TerminalEvent>>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Creates an agent and subscribes it to terminal activity events.
    ///
    /// # Errors
    ///
    /// Returns an error when the bus rejects the subscriptions.
    pub fn new(
        scheduler: Arc<Scheduler>,
        gateway: Arc<GatewayService>,
        bus: &dyn EventBus,
        config: AgentConfig,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        for topic in [
            topics::ACTIVITY_COMPLETED,
            topics::ACTIVITY_FAILED,
            topics::ACTIVITY_CANCELLED,
        ] {
            let tx = events_tx.clone();
            bus.subscribe(
                topic,
                Arc::new(move |_topic, event| {
                    if let FlowEvent::ActivityStatus {
                        activity_id,
                        status,
                        message,
                        ..
                    } = event
                    {
                        let _ = tx.send(TerminalEvent {
                            activity_id: activity_id.clone(),
                            status: *status,
                            message: message.clone(),
                        });
                    }
                }),
            )?;
        }

        Ok(Arc::new(Self {
            scheduler,
            gateway,
            config,
            in_flight: Mutex::new(HashMap::new()),
            events_rx: tokio::sync::Mutex::new(events_rx),
            metrics: FlowMetrics::new(),
        }))
    }

    /// Number of activities currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Runs one full cycle: apply pending terminal events, then dispatch
    /// into the freed slots.
    pub async fn run_cycle(&self) -> Result<()> {
        let _guard = time_agent_cycle();
        self.drain_events().await?;
        self.poll_cycle().await?;
        Ok(())
    }

    /// Claims and starts ready tasks up to the free slot count.
    ///
    /// Individual start failures are recorded on their task and do not
    /// abort the cycle. Returns the number of activities started.
    #[tracing::instrument(skip(self))]
    pub async fn poll_cycle(&self) -> Result<usize> {
        let executing = self.in_flight_count();
        let available = self.config.max_concurrent.saturating_sub(executing);
        if available == 0 {
            debug!(executing, "all slots busy");
            return Ok(0);
        }

        let tasks = self.scheduler.get_ready_tasks(available).await?;
        let outcomes =
            futures::future::join_all(tasks.iter().map(|task| self.start_task(task))).await;

        let mut started = 0_usize;
        for (task, outcome) in tasks.iter().zip(outcomes) {
            match outcome {
                Ok(()) => started += 1,
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "task failed to start");
                    self.scheduler.mark_failed(&task.id, err.to_string()).await?;
                }
            }
        }
        self.metrics.set_tasks_in_flight(self.in_flight_count());
        Ok(started)
    }

    async fn start_task(&self, task: &ScheduledTask) -> Result<()> {
        let request = ActivityRequest {
            controller_id: task.controller_id.clone(),
            run_id: task.run_id.clone(),
            campaign_id: task.campaign_id.clone(),
            activity_name: task.activity_name.clone(),
            options: task.options.clone(),
            deadline: task.deadline,
        };
        let activity_id = self.gateway.start_activity(&request).await?;
        self.scheduler
            .mark_started(&task.id, activity_id.clone())
            .await?;
        self.in_flight
            .lock()
            .map_err(poison_err)?
            .insert(activity_id, task.id);
        info!(task_id = %task.id, "task dispatched");
        Ok(())
    }

    /// Applies every queued terminal event. Returns the number of tasks
    /// finalized.
    pub async fn drain_events(&self) -> Result<usize> {
        let mut finalized = 0_usize;
        loop {
            let event = {
                let mut rx = self.events_rx.lock().await;
                match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };
            if self.finalize(event).await? {
                finalized += 1;
            }
        }
        if finalized > 0 {
            self.metrics.set_tasks_in_flight(self.in_flight_count());
        }
        Ok(finalized)
    }

    /// Finalizes the in-flight task owning the event's activity id.
    ///
    /// Events for unknown activity ids are ignored, which makes repeated
    /// terminal events for an already finalized task harmless.
    async fn finalize(&self, event: TerminalEvent) -> Result<bool> {
        let task_id = {
            let mut in_flight = self.in_flight.lock().map_err(poison_err)?;
            in_flight.remove(&event.activity_id)
        };
        let Some(task_id) = task_id else {
            debug!(activity_id = %event.activity_id, "terminal event for unmatched activity");
            return Ok(false);
        };

        match event.status {
            ActivityStatus::Completed => {
                self.persist_products(&task_id, &event.activity_id).await;
                self.scheduler.mark_completed(&task_id).await?;
            }
            ActivityStatus::Failed => {
                let error = event
                    .message
                    .unwrap_or_else(|| "activity failed".to_string());
                self.scheduler.mark_failed(&task_id, error).await?;
            }
            ActivityStatus::Cancelled => {
                let reason = event
                    .message
                    .unwrap_or_else(|| "cancelled by controller".to_string());
                self.scheduler.cancel_task(&task_id, &reason).await?;
            }
            ActivityStatus::Pending | ActivityStatus::Running => {
                return Ok(false);
            }
        }
        info!(task_id = %task_id, status = event.status.as_label(), "task finalized");
        Ok(true)
    }

    /// Best-effort fetch of reported data products.
    ///
    /// Products may lag the completion event; a not-ready answer is not a
    /// task failure.
    async fn persist_products(&self, task_id: &TaskId, activity_id: &ActivityId) {
        let Ok(Some(task)) = self.scheduler.get_task(task_id).await else {
            return;
        };
        match self
            .gateway
            .get_activity_data(&task.controller_id, activity_id)
            .await
        {
            Ok(products) => {
                debug!(task_id = %task_id, count = products.len(), "data products recorded");
            }
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "data products unavailable");
            }
        }
    }

    /// Starts the poll loop.
    pub fn start(self: &Arc<Self>) -> LoopHandle {
        let agent = Arc::clone(self);
        spawn_repeating("agent_poll", self.config.poll_interval, move || {
            let agent = Arc::clone(&agent);
            async move {
                if let Err(err) = agent.run_cycle().await {
                    warn!(error = %err, "agent cycle failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EventBridge, InMemoryEventBus};
    use crate::config::SchedulerConfig;
    use crate::correlation::memory::InMemoryCorrelationStore;
    use crate::events::{ControllerEvent, ControllerEventKind, StatusChangePayload};
    use crate::gateway::SimulatedControllerClient;
    use crate::scheduler::TaskRequest;
    use crate::store::memory::InMemoryTaskStore;
    use crate::task::TaskStatus;
    use kiln_core::{ControllerId, RunId};

    struct Fixture {
        agent: Arc<Agent>,
        scheduler: Arc<Scheduler>,
        bridge: EventBridge,
        sim: Arc<SimulatedControllerClient>,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
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

        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = EventBridge::new(Arc::clone(&correlations) as _, Arc::clone(&bus) as _);
        let agent = Agent::new(
            Arc::clone(&scheduler),
            gateway,
            bus.as_ref(),
            AgentConfig {
                poll_interval: std::time::Duration::from_millis(10),
                max_concurrent,
            },
        )
        .unwrap();

        Fixture {
            agent,
            scheduler,
            bridge,
            sim,
        }
    }

    fn request() -> TaskRequest {
        let mut request = TaskRequest::new(
            RunId::new("run-1"),
            ControllerId::new("printer-a3"),
            "print_job",
        );
        request.options = vec![
            crate::task::ActivityOption::new("file", "bucket/part.stl"),
            crate::task::ActivityOption::new("material", "ti64"),
        ];
        request
    }

    fn terminal_event(activity_id: &ActivityId, status: ActivityStatus) -> ControllerEvent {
        ControllerEvent::new(
            ControllerId::new("printer-a3"),
            ControllerEventKind::StatusChange(StatusChangePayload {
                activity_id: activity_id.clone(),
                activity_name: "print_job".to_string(),
                activity_status: status,
                progress: None,
                status_msg: None,
                error_msg: (status == ActivityStatus::Failed)
                    .then(|| "nozzle jam".to_string()),
                correlation: None,
            }),
        )
    }

    #[tokio::test]
    async fn poll_dispatches_and_event_finalizes() -> Result<()> {
        let fx = fixture(4);
        let task = fx.scheduler.schedule_task(request()).await?;

        assert_eq!(fx.agent.poll_cycle().await?, 1);
        assert_eq!(fx.agent.in_flight_count(), 1);

        let stored = fx.scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        let activity_id = stored.activity_id.unwrap();

        fx.sim
            .advance_activity(&activity_id, ActivityStatus::Completed, Vec::new());
        fx.bridge
            .handle_event(terminal_event(&activity_id, ActivityStatus::Completed))
            .await?;
        assert_eq!(fx.agent.drain_events().await?, 1);

        let stored = fx.scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(fx.agent.in_flight_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_is_bounded() -> Result<()> {
        let fx = fixture(2);
        for _ in 0..5 {
            fx.scheduler.schedule_task(request()).await?;
        }

        assert_eq!(fx.agent.poll_cycle().await?, 2);
        assert_eq!(fx.agent.in_flight_count(), 2);
        // No free slots, nothing more starts.
        assert_eq!(fx.agent.poll_cycle().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failure_event_records_error() -> Result<()> {
        let fx = fixture(4);
        let task = fx.scheduler.schedule_task(request()).await?;
        fx.agent.poll_cycle().await?;

        let activity_id = fx
            .scheduler
            .get_task(&task.id)
            .await?
            .unwrap()
            .activity_id
            .unwrap();
        fx.bridge
            .handle_event(terminal_event(&activity_id, ActivityStatus::Failed))
            .await?;
        fx.agent.drain_events().await?;

        let stored = fx.scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("nozzle jam"));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_terminal_events_are_idempotent() -> Result<()> {
        let fx = fixture(4);
        let task = fx.scheduler.schedule_task(request()).await?;
        fx.agent.poll_cycle().await?;
        let activity_id = fx
            .scheduler
            .get_task(&task.id)
            .await?
            .unwrap()
            .activity_id
            .unwrap();

        fx.bridge
            .handle_event(terminal_event(&activity_id, ActivityStatus::Completed))
            .await?;
        fx.bridge
            .handle_event(terminal_event(&activity_id, ActivityStatus::Completed))
            .await?;

        assert_eq!(fx.agent.drain_events().await?, 1);
        let stored = fx.scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn start_failure_marks_task_failed() -> Result<()> {
        let fx = fixture(4);
        let mut bad = request();
        bad.activity_name = "teleport".to_string();
        let task = fx.scheduler.schedule_task(bad).await?;

        assert_eq!(fx.agent.poll_cycle().await?, 0);
        let stored = fx.scheduler.get_task(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("unknown_activity"));
        assert_eq!(fx.agent.in_flight_count(), 0);
        Ok(())
    }
}
