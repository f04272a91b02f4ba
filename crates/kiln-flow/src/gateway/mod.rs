//! Synchronous RPC façade over the registered controllers.
//!
//! One [`GatewayService`] fronts every controller in the deployment. It
//! validates options before dispatch, persists correlation and product
//! records on success, enforces action idempotency, and resolves
//! execution plans to controllers by equipment-id prefix.
//!
//! Transparent retry on transport faults lives in the clients; this
//! layer never retries a task, that decision belongs to the supervisor.

pub mod client;
pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use kiln_core::{ActivityId, CampaignId, ControllerId, RunId};

use crate::config::GatewayConfig;
use crate::correlation::{
    ActivityCorrelation, ActivityStatus, CorrelationStore, DataProductMapping,
};
use crate::error::{Error, GatewayError, Result};
use crate::metrics::FlowMetrics;
use crate::schema::{ExecutionPlan, SchemaMapper};
use crate::task::ActivityOption;

pub use client::{
    ActivityStatusReport, ControllerClient, HttpControllerClient, PerformAction, StartActivity,
};
pub use simulated::SimulatedControllerClient;

/// Content type recorded for products until the controller reports one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Parameters for starting one activity through the gateway.
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    /// Controller to run on.
    pub controller_id: ControllerId,
    /// Owning experiment run.
    pub run_id: RunId,
    /// Campaign grouping, when known.
    pub campaign_id: Option<CampaignId>,
    /// Remote activity name.
    pub activity_name: String,
    /// Ordered activity options.
    pub options: Vec<ActivityOption>,
    /// Deadline forwarded to the controller.
    pub deadline: Option<DateTime<Utc>>,
}

/// Acknowledgment for an action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAck {
    /// The action was dispatched to the controller.
    Dispatched,
    /// The idempotency key was already consumed; nothing was re-invoked.
    AlreadyPerformed,
}

/// RPC façade over every registered controller.
pub struct GatewayService {
    clients: HashMap<ControllerId, Arc<dyn ControllerClient>>,
    correlations: Arc<dyn CorrelationStore>,
    mapper: SchemaMapper,
    fallback_controller_id: ControllerId,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("controllers", &self.clients.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl GatewayService {
    /// Creates an empty gateway over the given correlation store.
    pub fn new(
        correlations: Arc<dyn CorrelationStore>,
        fallback_controller_id: ControllerId,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            correlations,
            mapper: SchemaMapper::new(),
            fallback_controller_id,
            metrics: FlowMetrics::new(),
        }
    }

    /// Builds a gateway from configuration.
    ///
    /// Each configured controller gets an independent HTTP client. A
    /// simulated controller is registered under the fallback id when no
    /// real controller claims it.
    ///
    /// # Errors
    ///
    /// Returns an error when an HTTP client cannot be constructed.
    pub fn from_config(
        config: &GatewayConfig,
        correlations: Arc<dyn CorrelationStore>,
    ) -> Result<Self> {
        let mut gateway = Self::new(correlations, config.fallback_controller_id.clone());
        for controller in &config.controllers {
            let client = HttpControllerClient::new(
                controller.controller_id.clone(),
                &controller.endpoint,
                &controller.health_endpoint,
                config.default_timeout,
                config.retry,
            )?;
            gateway.register_client(Arc::new(client));
        }
        if !gateway.clients.contains_key(&config.fallback_controller_id) {
            gateway.register_client(Arc::new(SimulatedControllerClient::new(
                config.fallback_controller_id.clone(),
            )));
        }
        Ok(gateway)
    }

    /// Registers a controller client, replacing any client with the same id.
    pub fn register_client(&mut self, client: Arc<dyn ControllerClient>) {
        self.clients.insert(client.controller_id().clone(), client);
    }

    fn client(&self, controller_id: &ControllerId) -> Result<&Arc<dyn ControllerClient>> {
        self.clients
            .get(controller_id)
            .ok_or_else(|| Error::UnknownController {
                controller_id: controller_id.to_string(),
            })
    }

    /// Starts a remote activity and records its correlation.
    ///
    /// Options are validated against the activity schema before any RPC
    /// is made; validation failures propagate as `invalid_options`.
    #[tracing::instrument(skip(self, request), fields(controller_id = %request.controller_id, activity = %request.activity_name))]
    pub async fn start_activity(&self, request: &ActivityRequest) -> Result<ActivityId> {
        let report = self
            .mapper
            .validate_options(&request.activity_name, &request.options);
        if !report.valid {
            self.metrics
                .record_gateway_request(request.controller_id.as_str(), "rejected");
            return Err(GatewayError::InvalidOptions {
                errors: report.errors,
            }
            .into());
        }

        let client = self.client(&request.controller_id)?;
        let start = StartActivity {
            activity_name: request.activity_name.clone(),
            activity_options: request.options.clone(),
            activity_deadline: request.deadline,
        };
        let result = client.start_activity(&start).await;
        self.metrics.record_gateway_request(
            request.controller_id.as_str(),
            if result.is_ok() { "started" } else { "failed" },
        );
        let activity_id = result?;

        let mut correlation = ActivityCorrelation::new(
            activity_id.clone(),
            request.run_id.clone(),
            request.controller_id.clone(),
            request.activity_name.clone(),
        );
        if let Some(campaign_id) = &request.campaign_id {
            correlation = correlation.with_campaign(campaign_id.clone());
        }
        self.correlations.save_correlation(&correlation).await?;
        info!(activity_id = %activity_id, "activity started");
        Ok(activity_id)
    }

    /// Queries a controller directly for an activity's status.
    pub async fn get_activity_status(
        &self,
        controller_id: &ControllerId,
        activity_id: &ActivityId,
    ) -> Result<ActivityStatusReport> {
        let client = self.client(controller_id)?;
        Ok(client.activity_status(activity_id).await?)
    }

    /// Fetches and persists the data products of a completed activity.
    pub async fn get_activity_data(
        &self,
        controller_id: &ControllerId,
        activity_id: &ActivityId,
    ) -> Result<Vec<DataProductMapping>> {
        let client = self.client(controller_id)?;
        let products = client.activity_data(activity_id).await?;

        let mut mappings = Vec::with_capacity(products.len());
        for product_id in products {
            let mapping =
                DataProductMapping::new(product_id, activity_id.clone(), DEFAULT_CONTENT_TYPE);
            self.correlations.save_product(&mapping).await?;
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    /// Requests cancellation of a remote activity and mirrors it in the
    /// correlation directory.
    pub async fn cancel_activity(
        &self,
        controller_id: &ControllerId,
        activity_id: &ActivityId,
        reason: &str,
    ) -> Result<()> {
        let client = self.client(controller_id)?;
        client.cancel_activity(activity_id, reason).await?;
        self.correlations
            .update_status(activity_id, ActivityStatus::Cancelled)
            .await?;
        Ok(())
    }

    /// Dispatches a discrete action exactly once per idempotency key.
    ///
    /// A key that was already consumed acknowledges without re-invoking
    /// the controller.
    #[tracing::instrument(skip(self, action), fields(controller_id = %controller_id, action = %action.action_name))]
    pub async fn perform_action(
        &self,
        controller_id: &ControllerId,
        action: &PerformAction,
        idempotency_key: Option<&str>,
    ) -> Result<ActionAck> {
        if let Some(key) = idempotency_key {
            if self.correlations.is_key_used(key).await? {
                info!(key, "action already performed");
                return Ok(ActionAck::AlreadyPerformed);
            }
        }

        let client = self.client(controller_id)?;
        client.perform_action(action).await?;

        if let Some(key) = idempotency_key {
            self.correlations.mark_key_used(key).await?;
        }
        Ok(ActionAck::Dispatched)
    }

    /// Lists the registered controller ids.
    #[must_use]
    pub fn list_controllers(&self) -> Vec<ControllerId> {
        let mut ids: Vec<ControllerId> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Lists the action names a controller supports.
    pub async fn list_actions(&self, controller_id: &ControllerId) -> Result<Vec<String>> {
        Ok(self.client(controller_id)?.list_actions().await?)
    }

    /// Lists the activity names a controller supports.
    pub async fn list_activities(&self, controller_id: &ControllerId) -> Result<Vec<String>> {
        Ok(self.client(controller_id)?.list_activities().await?)
    }

    /// Probes a controller's health endpoint.
    ///
    /// Returns `Ok(false)` for an unhealthy or unreachable controller;
    /// errors are reserved for unknown controller ids.
    pub async fn controller_health(&self, controller_id: &ControllerId) -> Result<bool> {
        let client = self.client(controller_id)?;
        Ok(client.health().await.is_ok())
    }

    /// Resolves a plan's equipment id to a registered controller.
    ///
    /// The first registered controller whose id shares the equipment id's
    /// dashed prefix wins; unmatched equipment falls back to the default
    /// simulated controller.
    #[must_use]
    pub fn resolve_controller(&self, equipment_id: &str) -> ControllerId {
        let family = equipment_id.split('-').next().unwrap_or(equipment_id);
        let mut candidates: Vec<&ControllerId> = self
            .clients
            .keys()
            .filter(|id| id.as_str().starts_with(family))
            .collect();
        candidates.sort();
        candidates
            .first()
            .map_or_else(|| self.fallback_controller_id.clone(), |id| (*id).clone())
    }

    /// Maps, resolves, and starts a domain execution plan.
    ///
    /// Returns the controller chosen and the activity id started on it.
    pub async fn execute_experiment_plan(
        &self,
        plan: &ExecutionPlan,
        run_id: RunId,
        campaign_id: Option<CampaignId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(ControllerId, ActivityId)> {
        let activity_name = self
            .mapper
            .activity_name_for_job(&plan.job_type)
            .ok_or_else(|| GatewayError::UnknownActivity {
                name: plan.job_type.clone(),
            })?;
        let options = self.mapper.plan_to_options(plan);
        let controller_id = self.resolve_controller(&plan.equipment_id);

        let request = ActivityRequest {
            controller_id: controller_id.clone(),
            run_id,
            campaign_id,
            activity_name: activity_name.to_string(),
            options,
            deadline,
        };
        let activity_id = self.start_activity(&request).await?;
        Ok((controller_id, activity_id))
    }
}
