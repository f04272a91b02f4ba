//! Orchestration runtime configuration.
//!
//! Every tunable carries a serde default so a deployment can configure
//! only what it changes. Durations are written in humantime form
//! (`"30s"`, `"5m"`) in config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kiln_core::ControllerId;

use crate::error::{Error, Result};
use crate::task::RetryPolicy;

/// One registered remote controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Controller identifier, matched against equipment-id prefixes.
    pub controller_id: ControllerId,
    /// Base URL of the controller's HTTP surface.
    pub endpoint: String,
    /// Health endpoint path. Defaults to `/healthz`.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
}

fn default_health_endpoint() -> String {
    "/healthz".to_string()
}

/// Gateway transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Registered controllers.
    pub controllers: Vec<ControllerConfig>,
    /// Per-request timeout for controller RPCs.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Transparent retry policy for connection errors and 5xx responses.
    pub retry: RetryPolicy,
    /// Controller id used when no equipment-id prefix matches.
    pub fallback_controller_id: ControllerId,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            controllers: Vec::new(),
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
            },
            fallback_controller_id: ControllerId::new("simulated"),
        }
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Retry budget applied to tasks that do not specify their own.
    pub default_max_retries: u32,
    /// Backoff policy for task retries.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

/// Agent tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Interval between poll cycles.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum activities executing concurrently.
    pub max_concurrent: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent: 4,
        }
    }
}

/// Supervisor tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Interval between monitoring cycles.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Age after which a running task's correlation is considered stale.
    #[serde(with = "humantime_serde")]
    pub stale_threshold: Duration,
    /// Hard ceiling on how long one activity may run.
    #[serde(with = "humantime_serde")]
    pub activity_timeout: Duration,
    /// Interval between controller health-check cycles.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// When false, failed tasks are escalated without retry.
    pub auto_retry_enabled: bool,
    /// When false, escalations are logged but not delivered.
    pub escalation_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            activity_timeout: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            auto_retry_enabled: true,
            escalation_enabled: true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    /// Gateway transport configuration.
    pub gateway: GatewayConfig,
    /// Scheduler tunables.
    pub scheduler: SchedulerConfig,
    /// Agent tunables.
    pub agent: AgentConfig,
    /// Supervisor tunables.
    pub supervisor: SupervisorConfig,
}

impl FlowConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a controller entry is unusable
    /// or a tunable is degenerate.
    pub fn validate(&self) -> Result<()> {
        for controller in &self.gateway.controllers {
            if controller.controller_id.is_empty() {
                return Err(Error::configuration("controller entry with empty id"));
            }
            if controller.endpoint.is_empty() {
                return Err(Error::configuration(format!(
                    "controller {} has an empty endpoint",
                    controller.controller_id
                )));
            }
        }
        if self.agent.max_concurrent == 0 {
            return Err(Error::configuration("agent.maxConcurrent must be positive"));
        }
        if self.supervisor.activity_timeout.is_zero() {
            return Err(Error::configuration(
                "supervisor.activityTimeout must be positive",
            ));
        }
        Ok(())
    }
}
