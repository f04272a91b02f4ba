//! In-process simulated controller.
//!
//! Stands in for a real instrument when no hardware endpoint is
//! registered, and doubles as the test double for the gateway and agent.
//! Behavior mirrors the reference controller simulator: activities start
//! pending, advance only when told to, and data is refused until
//! completion.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use kiln_core::{ActivityId, ControllerId, ProductId};

use super::client::{ActivityStatusReport, ControllerClient, PerformAction, StartActivity};
use crate::correlation::ActivityStatus;
use crate::error::{GatewayError, GatewayResult};

const KNOWN_ACTIVITIES: &[&str] = &["print_job", "sinter_cycle", "quality_inspection"];
const KNOWN_ACTIONS: &[&str] = &["calibrate", "home_axes", "purge_nozzle"];

#[derive(Debug, Clone)]
struct SimulatedActivity {
    status: ActivityStatus,
    status_msg: Option<String>,
    products: Vec<ProductId>,
}

/// A controller that lives inside the process.
#[derive(Debug)]
pub struct SimulatedControllerClient {
    controller_id: ControllerId,
    state: Mutex<SimulatedState>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    activities: HashMap<ActivityId, SimulatedActivity>,
    healthy: bool,
    counter: u64,
}

fn poison_err<T>(_: PoisonError<T>) -> GatewayError {
    GatewayError::internal("simulated controller lock poisoned")
}

impl SimulatedControllerClient {
    /// Creates a healthy simulated controller.
    #[must_use]
    pub fn new(controller_id: ControllerId) -> Self {
        Self {
            controller_id,
            state: Mutex::new(SimulatedState {
                healthy: true,
                ..SimulatedState::default()
            }),
        }
    }

    /// Toggles the health probe outcome.
    pub fn set_healthy(&self, healthy: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.healthy = healthy;
        }
    }

    /// Drives an activity to a new status, attaching products on
    /// completion.
    pub fn advance_activity(
        &self,
        activity_id: &ActivityId,
        status: ActivityStatus,
        products: Vec<ProductId>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(activity) = state.activities.get_mut(activity_id) {
                activity.status = status;
                activity.products = products;
            }
        }
    }
}

#[async_trait]
impl ControllerClient for SimulatedControllerClient {
    fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    async fn start_activity(&self, request: &StartActivity) -> GatewayResult<ActivityId> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.healthy {
            return Err(GatewayError::unavailable("simulated controller offline"));
        }
        if !KNOWN_ACTIVITIES.contains(&request.activity_name.as_str()) {
            return Err(GatewayError::UnknownActivity {
                name: request.activity_name.clone(),
            });
        }
        if request
            .activity_deadline
            .is_some_and(|d| d <= chrono::Utc::now())
        {
            return Err(GatewayError::DeadlineInvalid {
                message: "activity deadline already passed".to_string(),
            });
        }

        state.counter += 1;
        let activity_id = ActivityId::new(format!("sim-{:06}", state.counter));
        state.activities.insert(
            activity_id.clone(),
            SimulatedActivity {
                status: ActivityStatus::Pending,
                status_msg: None,
                products: Vec::new(),
            },
        );
        Ok(activity_id)
    }

    async fn activity_status(
        &self,
        activity_id: &ActivityId,
    ) -> GatewayResult<ActivityStatusReport> {
        let state = self.state.lock().map_err(poison_err)?;
        if !state.healthy {
            return Err(GatewayError::unavailable("simulated controller offline"));
        }
        let activity =
            state
                .activities
                .get(activity_id)
                .ok_or_else(|| GatewayError::UnknownActivityId {
                    id: activity_id.to_string(),
                })?;
        Ok(ActivityStatusReport {
            status: activity.status,
            time_begin: None,
            time_end: None,
            status_msg: activity.status_msg.clone(),
        })
    }

    async fn activity_data(&self, activity_id: &ActivityId) -> GatewayResult<Vec<ProductId>> {
        let state = self.state.lock().map_err(poison_err)?;
        let activity =
            state
                .activities
                .get(activity_id)
                .ok_or_else(|| GatewayError::UnknownActivityId {
                    id: activity_id.to_string(),
                })?;
        if activity.status != ActivityStatus::Completed {
            return Err(GatewayError::DataNotReady {
                message: "Data not ready".to_string(),
            });
        }
        Ok(activity.products.clone())
    }

    async fn cancel_activity(&self, activity_id: &ActivityId, reason: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let activity = state.activities.get_mut(activity_id).ok_or_else(|| {
            GatewayError::UnknownActivityId {
                id: activity_id.to_string(),
            }
        })?;
        if !activity.status.is_terminal() {
            activity.status = ActivityStatus::Cancelled;
            activity.status_msg = Some(reason.to_string());
        }
        Ok(())
    }

    async fn perform_action(&self, request: &PerformAction) -> GatewayResult<()> {
        let state = self.state.lock().map_err(poison_err)?;
        if !state.healthy {
            return Err(GatewayError::unavailable("simulated controller offline"));
        }
        if !KNOWN_ACTIONS.contains(&request.action_name.as_str()) {
            return Err(GatewayError::UnknownAction {
                name: request.action_name.clone(),
            });
        }
        Ok(())
    }

    async fn list_actions(&self) -> GatewayResult<Vec<String>> {
        Ok(KNOWN_ACTIONS.iter().map(ToString::to_string).collect())
    }

    async fn list_activities(&self) -> GatewayResult<Vec<String>> {
        Ok(KNOWN_ACTIVITIES.iter().map(ToString::to_string).collect())
    }

    async fn health(&self) -> GatewayResult<()> {
        let state = self.state.lock().map_err(poison_err)?;
        if state.healthy {
            Ok(())
        } else {
            Err(GatewayError::unavailable("simulated controller offline"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SimulatedControllerClient {
        SimulatedControllerClient::new(ControllerId::new("simulated"))
    }

    fn start_request(name: &str) -> StartActivity {
        StartActivity {
            activity_name: name.to_string(),
            activity_options: Vec::new(),
            activity_deadline: None,
        }
    }

    #[tokio::test]
    async fn activity_lifecycle() -> GatewayResult<()> {
        let sim = client();
        let id = sim.start_activity(&start_request("print_job")).await?;

        let report = sim.activity_status(&id).await?;
        assert_eq!(report.status, ActivityStatus::Pending);

        // Data before completion is refused.
        assert!(matches!(
            sim.activity_data(&id).await,
            Err(GatewayError::DataNotReady { .. })
        ));

        sim.advance_activity(
            &id,
            ActivityStatus::Completed,
            vec![ProductId::new("prod-1")],
        );
        let products = sim.activity_data(&id).await?;
        assert_eq!(products, vec![ProductId::new("prod-1")]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_activity_name_is_rejected() {
        let sim = client();
        let result = sim.start_activity(&start_request("teleport")).await;
        assert!(matches!(result, Err(GatewayError::UnknownActivity { .. })));
    }

    #[tokio::test]
    async fn past_deadline_is_rejected() {
        let sim = client();
        let mut request = start_request("print_job");
        request.activity_deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let result = sim.start_activity(&request).await;
        assert!(matches!(result, Err(GatewayError::DeadlineInvalid { .. })));
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_an_error() {
        let sim = client();
        let result = sim
            .cancel_activity(&ActivityId::new("sim-999999"), "test")
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::UnknownActivityId { .. })
        ));
    }

    #[tokio::test]
    async fn unhealthy_controller_refuses_work() {
        let sim = client();
        sim.set_healthy(false);
        assert!(sim.health().await.is_err());
        assert!(matches!(
            sim.start_activity(&start_request("print_job")).await,
            Err(GatewayError::ControllerUnavailable { .. })
        ));
    }
}
