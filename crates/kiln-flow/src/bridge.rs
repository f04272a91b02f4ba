//! Remote event ingestion and in-process fan-out.
//!
//! [`EventBus`] is the typed publish/subscribe seam between this core and
//! the workflow layer: subscribers register by exact topic or `prefix.*`
//! pattern and the bus knows nothing about who is listening. A broker
//!-backed implementation can stand in behind the same trait.
//!
//! [`EventBridge`] is the single entry point for controller envelopes. It
//! updates the correlation directory and republishes both the raw
//! envelope and normalized [`FlowEvent`]s.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::correlation::{ActivityCorrelation, ActivityStatus, CorrelationStore};
use crate::error::{Error, Result};
use crate::events::{
    topics, ActionCompletionPayload, ControllerEvent, ControllerEventKind, FlowEvent,
    ProgressUpdatePayload, StatusChangePayload,
};
use crate::metrics::FlowMetrics;
use crate::schema::SchemaMapper;

/// Callback invoked for each matching published event.
pub type EventHandler = Arc<dyn Fn(&str, &FlowEvent) + Send + Sync>;

/// Topic selector for subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    /// Matches one topic exactly.
    Exact(String),
    /// Matches every topic under a dotted prefix (`activity.*`).
    Prefix(String),
}

impl TopicPattern {
    /// Parses a pattern string. `prefix.*` selects a prefix match,
    /// anything else is an exact match.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        pattern.strip_suffix(".*").map_or_else(
            || Self::Exact(pattern.to_string()),
            |prefix| Self::Prefix(format!("{prefix}.")),
        )
    }

    /// Returns true if the topic matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(exact) => topic == exact,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

/// In-process publish/subscribe interface.
pub trait EventBus: Send + Sync {
    /// Registers a handler for topics matching the pattern.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry is unavailable.
    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<()>;

    /// Delivers an event to every handler whose pattern matches the topic.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry is unavailable. Handler panics
    /// are not caught.
    fn publish(&self, topic: &str, event: &FlowEvent) -> Result<()>;
}

/// In-memory event bus backed by a subscription list.
#[derive(Default)]
pub struct InMemoryEventBus {
    subscriptions: RwLock<Vec<(TopicPattern, EventHandler)>>,
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.subscriptions.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("InMemoryEventBus")
            .field("subscriptions", &count)
            .finish()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().map_err(poison_err)?;
        subscriptions.push((TopicPattern::parse(pattern), handler));
        Ok(())
    }

    fn publish(&self, topic: &str, event: &FlowEvent) -> Result<()> {
        let subscriptions = self.subscriptions.read().map_err(poison_err)?;
        for (pattern, handler) in subscriptions.iter() {
            if pattern.matches(topic) {
                handler(topic, event);
            }
        }
        Ok(())
    }
}

/// Normalizes controller envelopes into correlation updates and bus events.
pub struct EventBridge {
    correlations: Arc<dyn CorrelationStore>,
    bus: Arc<dyn EventBus>,
    mapper: SchemaMapper,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge").finish_non_exhaustive()
    }
}

impl EventBridge {
    /// Creates a bridge over the given correlation store and bus.
    pub fn new(correlations: Arc<dyn CorrelationStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            correlations,
            bus,
            mapper: SchemaMapper::new(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Handles one inbound controller envelope.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage or bus faults; malformed or
    /// unknown event content is normalized as far as possible and logged.
    #[tracing::instrument(skip(self, event), fields(event_type = event.kind.event_type(), controller_id = %event.controller_id))]
    pub async fn handle_event(&self, event: ControllerEvent) -> Result<()> {
        self.metrics.record_event(event.kind.event_type());
        match &event.kind {
            ControllerEventKind::StatusChange(payload) => {
                self.handle_status_change(&event, payload.clone()).await
            }
            ControllerEventKind::ProgressUpdate(payload) => {
                self.handle_progress_update(&event, payload)
            }
            ControllerEventKind::ActionCompletion(payload) => {
                self.handle_action_completion(&event, payload)
            }
        }
    }

    async fn handle_status_change(
        &self,
        event: &ControllerEvent,
        payload: StatusChangePayload,
    ) -> Result<()> {
        let run_id = self.record_status(event, &payload).await?;

        self.bus
            .publish(topics::STATUS_CHANGE, &FlowEvent::Raw(event.clone()))?;

        let message = payload.error_msg.clone().or_else(|| payload.status_msg.clone());
        let normalized = FlowEvent::ActivityStatus {
            activity_id: payload.activity_id.clone(),
            controller_id: event.controller_id.clone(),
            run_id,
            status: payload.activity_status,
            message,
        };
        self.bus.publish(topics::ACTIVITY_STATUS, &normalized)?;

        if let Some(topic) = terminal_topic(payload.activity_status) {
            self.bus.publish(topic, &normalized)?;
        }
        Ok(())
    }

    /// Creates or updates the correlation record and returns the owning
    /// run id, when one is known.
    async fn record_status(
        &self,
        event: &ControllerEvent,
        payload: &StatusChangePayload,
    ) -> Result<Option<kiln_core::RunId>> {
        let existing = self.correlations.get_correlation(&payload.activity_id).await?;
        if let Some(correlation) = existing {
            let stored = self
                .correlations
                .update_status(&payload.activity_id, payload.activity_status)
                .await?;
            if stored != Some(payload.activity_status) {
                debug!(
                    activity_id = %payload.activity_id,
                    reported = %payload.activity_status,
                    "late status event ignored by downgrade policy"
                );
            }
            return Ok(Some(correlation.run_id));
        }

        // First observation of an unknown activity. The correlation hint
        // lets us build the directory entry; without it there is nothing
        // to record.
        let Some(hint) = &payload.correlation else {
            warn!(activity_id = %payload.activity_id, "status event for unknown activity");
            return Ok(None);
        };

        let mut correlation = ActivityCorrelation::new(
            payload.activity_id.clone(),
            hint.experiment_run_id.clone(),
            event.controller_id.clone(),
            payload.activity_name.clone(),
        );
        if let Some(campaign_id) = &hint.campaign_id {
            correlation = correlation.with_campaign(campaign_id.clone());
        }
        correlation.status = payload.activity_status;
        self.correlations.save_correlation(&correlation).await?;
        Ok(Some(correlation.run_id))
    }

    fn handle_progress_update(
        &self,
        event: &ControllerEvent,
        payload: &ProgressUpdatePayload,
    ) -> Result<()> {
        self.bus
            .publish(topics::PROGRESS_UPDATE, &FlowEvent::Raw(event.clone()))?;
        self.bus.publish(
            topics::ACTIVITY_PROGRESS,
            &FlowEvent::ActivityProgress {
                activity_id: payload.activity_id.clone(),
                progress: payload.progress,
                message: payload.status_msg.clone(),
            },
        )
    }

    fn handle_action_completion(
        &self,
        event: &ControllerEvent,
        payload: &ActionCompletionPayload,
    ) -> Result<()> {
        self.bus
            .publish(topics::ACTION_COMPLETION, &FlowEvent::Raw(event.clone()))?;

        let success = self
            .mapper
            .map_action_status(&payload.action_status)
            .unwrap_or_else(|| {
                warn!(word = %payload.action_status, "unknown action status word");
                false
            });
        self.bus.publish(
            topics::ACTION_COMPLETED,
            &FlowEvent::ActionOutcome {
                action_name: payload.action_name.clone(),
                controller_id: event.controller_id.clone(),
                success,
                message: payload.status_msg.clone(),
            },
        )
    }
}

/// Maps a terminal status to its dedicated sub-topic.
fn terminal_topic(status: ActivityStatus) -> Option<&'static str> {
    match status {
        ActivityStatus::Completed => Some(topics::ACTIVITY_COMPLETED),
        ActivityStatus::Failed => Some(topics::ACTIVITY_FAILED),
        ActivityStatus::Cancelled => Some(topics::ACTIVITY_CANCELLED),
        ActivityStatus::Pending | ActivityStatus::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::correlation::memory::InMemoryCorrelationStore;
    use crate::events::CorrelationHint;
    use kiln_core::{ActivityId, ControllerId, RunId};

    fn collecting_bus() -> (Arc<InMemoryEventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "activity.*",
            Arc::new(move |topic, _event| {
                sink.lock().unwrap().push(topic.to_string());
            }),
        )
        .unwrap();
        (bus, seen)
    }

    fn status_event(activity: &str, status: ActivityStatus, hint: bool) -> ControllerEvent {
        ControllerEvent::new(
            ControllerId::new("printer-a3"),
            ControllerEventKind::StatusChange(StatusChangePayload {
                activity_id: ActivityId::new(activity),
                activity_name: "print_job".to_string(),
                activity_status: status,
                progress: None,
                status_msg: None,
                error_msg: None,
                correlation: hint.then(|| CorrelationHint {
                    experiment_run_id: RunId::new("run-1"),
                    campaign_id: None,
                }),
            }),
        )
    }

    #[test]
    fn pattern_matching_exact_and_prefix() {
        let exact = TopicPattern::parse("activity.completed");
        assert!(exact.matches("activity.completed"));
        assert!(!exact.matches("activity.completed.extra"));

        let prefix = TopicPattern::parse("activity.*");
        assert!(prefix.matches("activity.completed"));
        assert!(prefix.matches("activity.status"));
        assert!(!prefix.matches("action.completed"));
        assert!(!prefix.matches("activity"));
    }

    #[test]
    fn bus_delivers_only_to_matching_subscribers() {
        let bus = InMemoryEventBus::new();
        let hits = Arc::new(Mutex::new(0_u32));

        let counter = Arc::clone(&hits);
        bus.subscribe(
            "action.completed",
            Arc::new(move |_, _| *counter.lock().unwrap() += 1),
        )
        .unwrap();

        let event = FlowEvent::ActionOutcome {
            action_name: "calibrate".to_string(),
            controller_id: ControllerId::new("printer-a3"),
            success: true,
            message: None,
        };
        bus.publish("action.completed", &event).unwrap();
        bus.publish("activity.status", &event).unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn status_change_updates_store_and_publishes_terminal_sub_event() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let (bus, seen) = collecting_bus();
        let bridge = EventBridge::new(Arc::clone(&store) as _, bus);

        bridge
            .handle_event(status_event("act-1", ActivityStatus::Completed, true))
            .await?;

        let correlation = store.get_correlation(&ActivityId::new("act-1")).await?;
        assert_eq!(
            correlation.map(|c| c.status),
            Some(ActivityStatus::Completed)
        );

        let topics_seen = seen.lock().unwrap().clone();
        assert_eq!(
            topics_seen,
            vec![
                "activity.status_change",
                "activity.status",
                "activity.completed"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn non_terminal_status_has_no_sub_event() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let (bus, seen) = collecting_bus();
        let bridge = EventBridge::new(store as _, bus);

        bridge
            .handle_event(status_event("act-1", ActivityStatus::Running, true))
            .await?;

        let topics_seen = seen.lock().unwrap().clone();
        assert_eq!(topics_seen, vec!["activity.status_change", "activity.status"]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_activity_without_hint_publishes_but_records_nothing() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let (bus, seen) = collecting_bus();
        let bridge = EventBridge::new(Arc::clone(&store) as _, bus);

        bridge
            .handle_event(status_event("act-9", ActivityStatus::Running, false))
            .await?;

        assert!(store.get_correlation(&ActivityId::new("act-9")).await?.is_none());
        assert_eq!(seen.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn progress_update_does_not_touch_store() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let (bus, seen) = collecting_bus();
        let bridge = EventBridge::new(Arc::clone(&store) as _, bus);

        let event = ControllerEvent::new(
            ControllerId::new("printer-a3"),
            ControllerEventKind::ProgressUpdate(ProgressUpdatePayload {
                activity_id: ActivityId::new("act-1"),
                progress: 0.4,
                status_msg: Some("layer 120/300".to_string()),
            }),
        );
        bridge.handle_event(event).await?;

        assert!(store.get_correlation(&ActivityId::new("act-1")).await?.is_none());
        let topics_seen = seen.lock().unwrap().clone();
        assert_eq!(
            topics_seen,
            vec!["activity.progress_update", "activity.progress"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn action_completion_maps_status_word() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&outcomes);
        bus.subscribe(
            "action.completed",
            Arc::new(move |_, event| {
                if let FlowEvent::ActionOutcome { success, .. } = event {
                    sink.lock().unwrap().push(*success);
                }
            }),
        )?;

        let bridge = EventBridge::new(store as _, Arc::clone(&bus) as _);
        for word in ["ACTION_SUCCESS", "ACTION_FAILURE"] {
            let event = ControllerEvent::new(
                ControllerId::new("printer-a3"),
                ControllerEventKind::ActionCompletion(ActionCompletionPayload {
                    action_name: "calibrate".to_string(),
                    idempotency_key: Some("key-1".to_string()),
                    action_status: word.to_string(),
                    status_msg: None,
                }),
            );
            bridge.handle_event(event).await?;
        }

        assert_eq!(*outcomes.lock().unwrap(), vec![true, false]);
        Ok(())
    }

    #[tokio::test]
    async fn late_running_event_never_downgrades_terminal_correlation() -> Result<()> {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = EventBridge::new(Arc::clone(&store) as _, bus);

        bridge
            .handle_event(status_event("act-1", ActivityStatus::Completed, true))
            .await?;
        bridge
            .handle_event(status_event("act-1", ActivityStatus::Running, true))
            .await?;

        let correlation = store.get_correlation(&ActivityId::new("act-1")).await?;
        assert_eq!(
            correlation.map(|c| c.status),
            Some(ActivityStatus::Completed)
        );
        Ok(())
    }
}
