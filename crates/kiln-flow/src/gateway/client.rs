//! Controller capability interface and its HTTP implementation.
//!
//! [`ControllerClient`] is the seam between the gateway and a controller
//! family: new controller types implement the trait instead of being
//! branched on. [`HttpControllerClient`] speaks the versioned JSON
//! contract real controllers expose. Transport faults and 5xx responses
//! are retried here with capped exponential backoff; every other failure
//! is mapped into the gateway error taxonomy and propagated immediately.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kiln_core::{ActivityId, ControllerId, ProductId};

use crate::correlation::ActivityStatus;
use crate::error::{GatewayError, GatewayResult};
use crate::schema::SchemaMapper;
use crate::task::{ActivityOption, RetryPolicy};

/// API version prefix of the controller contract.
const API_PREFIX: &str = "/v0.1";

/// Parameters for starting a remote activity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartActivity {
    /// Remote activity name.
    pub activity_name: String,
    /// Ordered activity options.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub activity_options: Vec<ActivityOption>,
    /// RFC3339 deadline forwarded to the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_deadline: Option<DateTime<Utc>>,
}

/// Parameters for performing a discrete action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformAction {
    /// Remote action name.
    pub action_name: String,
    /// Ordered action options.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_options: Vec<ActivityOption>,
}

/// Status report for one remote activity.
#[derive(Debug, Clone)]
pub struct ActivityStatusReport {
    /// Mapped lifecycle status.
    pub status: ActivityStatus,
    /// When the activity began.
    pub time_begin: Option<DateTime<Utc>>,
    /// When the activity reached a terminal status.
    pub time_end: Option<DateTime<Utc>>,
    /// Informational status text.
    pub status_msg: Option<String>,
}

/// Capability interface every controller family implements.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Identifier of the controller this client talks to.
    fn controller_id(&self) -> &ControllerId;

    /// Starts a remote activity and returns its id.
    async fn start_activity(&self, request: &StartActivity) -> GatewayResult<ActivityId>;

    /// Queries the status of a remote activity.
    async fn activity_status(&self, activity_id: &ActivityId)
        -> GatewayResult<ActivityStatusReport>;

    /// Fetches the data product ids of a completed activity.
    async fn activity_data(&self, activity_id: &ActivityId) -> GatewayResult<Vec<ProductId>>;

    /// Requests cancellation of a remote activity.
    async fn cancel_activity(&self, activity_id: &ActivityId, reason: &str) -> GatewayResult<()>;

    /// Dispatches a discrete action. Completion arrives asynchronously.
    async fn perform_action(&self, request: &PerformAction) -> GatewayResult<()>;

    /// Lists the action names the controller supports.
    async fn list_actions(&self) -> GatewayResult<Vec<String>>;

    /// Lists the activity names the controller supports.
    async fn list_activities(&self) -> GatewayResult<Vec<String>>;

    /// Probes the controller's health endpoint.
    async fn health(&self) -> GatewayResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartActivityResponse {
    activity_id: String,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityStatusResponse {
    activity_status: String,
    #[serde(default)]
    time_begin: Option<DateTime<Utc>>,
    #[serde(default)]
    time_end: Option<DateTime<Utc>>,
    #[serde(default)]
    status_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityDataResponse {
    #[serde(default)]
    products: Vec<String>,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionListResponse {
    action_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityListResponse {
    activity_names: Vec<String>,
}

/// HTTP client for one registered controller.
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    controller_id: ControllerId,
    base_url: String,
    health_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    mapper: SchemaMapper,
}

impl HttpControllerClient {
    /// Builds a client for a controller endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS backend cannot be initialized.
    pub fn new(
        controller_id: ControllerId,
        endpoint: &str,
        health_endpoint: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;
        let base_url = endpoint.trim_end_matches('/').to_string();
        let health_url = format!("{base_url}{health_endpoint}");
        Ok(Self {
            controller_id,
            base_url,
            health_url,
            client,
            retry,
            mapper: SchemaMapper::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    /// Sends a request, retrying connection failures, 429s, and 5xx
    /// responses with capped exponential backoff.
    ///
    /// Timeouts are not retried: a wedged controller should fail fast and
    /// let the supervisor reconcile.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> GatewayResult<reqwest::Response> {
        let mut attempt = 0_u32;
        loop {
            let response = build().send().await;
            match response {
                Ok(resp)
                    if resp.status().is_server_error()
                        || resp.status() == StatusCode::TOO_MANY_REQUESTS =>
                {
                    if attempt >= self.retry.max_retries {
                        let status = resp.status();
                        return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                            GatewayError::ControllerBusy {
                                message: format!(
                                    "controller {} still busy after {attempt} retries",
                                    self.controller_id
                                ),
                            }
                        } else {
                            GatewayError::unavailable(format!(
                                "controller {} returned {status} after {attempt} retries",
                                self.controller_id
                            ))
                        });
                    }
                    debug!(
                        controller_id = %self.controller_id,
                        status = %resp.status(),
                        attempt,
                        "retrying controller request"
                    );
                }
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_timeout() => {
                    return Err(GatewayError::unavailable(format!(
                        "controller {} request timed out: {err}",
                        self.controller_id
                    )));
                }
                Err(err) => {
                    if attempt >= self.retry.max_retries {
                        return Err(GatewayError::unavailable(format!(
                            "controller {} unreachable: {err}",
                            self.controller_id
                        )));
                    }
                    debug!(controller_id = %self.controller_id, attempt, "retrying after connect error");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
        }
    }

    /// Maps a non-success response into the gateway taxonomy.
    async fn fail(&self, resp: reqwest::Response, context: FailContext) -> GatewayError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match (status, context) {
            (StatusCode::NOT_FOUND, FailContext::Activity(id)) => GatewayError::UnknownActivityId {
                id: id.to_string(),
            },
            (StatusCode::NOT_FOUND, FailContext::Action(name)) => {
                GatewayError::UnknownAction { name }
            }
            (StatusCode::NOT_FOUND, FailContext::ActivityName(name)) => {
                GatewayError::UnknownActivity { name }
            }
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
                GatewayError::AuthorizationFailed { message: body }
            }
            (StatusCode::CONFLICT, _) => GatewayError::ControllerBusy { message: body },
            (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _)
                if body.to_ascii_lowercase().contains("deadline") =>
            {
                GatewayError::DeadlineInvalid { message: body }
            }
            (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _) => {
                GatewayError::InvalidOptions {
                    errors: vec![body],
                }
            }
            _ => GatewayError::internal(format!(
                "controller {} returned {status}: {body}",
                self.controller_id
            )),
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> GatewayResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::internal(format!("malformed controller response: {e}")))
    }
}

enum FailContext {
    Activity(ActivityId),
    ActivityName(String),
    Action(String),
    None,
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    async fn start_activity(&self, request: &StartActivity) -> GatewayResult<ActivityId> {
        let url = self.url("/activities/start");
        let resp = self
            .send_with_retry(|| self.client.post(&url).json(request))
            .await?;
        if !resp.status().is_success() {
            return Err(self
                .fail(resp, FailContext::ActivityName(request.activity_name.clone()))
                .await);
        }

        let body: StartActivityResponse = Self::parse(resp).await?;
        if body.activity_id.is_empty() {
            let msg = body.error_msg.unwrap_or_default();
            warn!(controller_id = %self.controller_id, msg, "controller refused activity start");
            return Err(if msg.to_ascii_lowercase().contains("deadline") {
                GatewayError::DeadlineInvalid { message: msg }
            } else {
                GatewayError::UnknownActivity {
                    name: request.activity_name.clone(),
                }
            });
        }
        Ok(ActivityId::new(body.activity_id))
    }

    async fn activity_status(
        &self,
        activity_id: &ActivityId,
    ) -> GatewayResult<ActivityStatusReport> {
        let url = self.url(&format!("/activities/{activity_id}/status"));
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(self
                .fail(resp, FailContext::Activity(activity_id.clone()))
                .await);
        }

        let body: ActivityStatusResponse = Self::parse(resp).await?;
        let status = self
            .mapper
            .map_remote_status(&body.activity_status)
            .ok_or_else(|| {
                GatewayError::internal(format!(
                    "unknown remote status word '{}'",
                    body.activity_status
                ))
            })?;
        Ok(ActivityStatusReport {
            status,
            time_begin: body.time_begin,
            time_end: body.time_end,
            status_msg: body.status_msg,
        })
    }

    async fn activity_data(&self, activity_id: &ActivityId) -> GatewayResult<Vec<ProductId>> {
        let url = self.url(&format!("/activities/{activity_id}/data"));
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(self
                .fail(resp, FailContext::Activity(activity_id.clone()))
                .await);
        }

        let body: ActivityDataResponse = Self::parse(resp).await?;
        if let Some(msg) = body.error_msg {
            if body.products.is_empty() {
                debug!(activity_id = %activity_id, msg, "activity data not ready");
                return Err(GatewayError::DataNotReady { message: msg });
            }
        }
        Ok(body.products.into_iter().map(ProductId::new).collect())
    }

    async fn cancel_activity(&self, activity_id: &ActivityId, reason: &str) -> GatewayResult<()> {
        let url = self.url("/activities/cancel");
        let payload = serde_json::json!({
            "activityId": activity_id,
            "reason": reason,
        });
        let resp = self
            .send_with_retry(|| self.client.post(&url).json(&payload))
            .await?;
        if !resp.status().is_success() {
            return Err(self
                .fail(resp, FailContext::Activity(activity_id.clone()))
                .await);
        }
        Ok(())
    }

    async fn perform_action(&self, request: &PerformAction) -> GatewayResult<()> {
        let url = self.url("/actions/perform");
        let resp = self
            .send_with_retry(|| self.client.post(&url).json(request))
            .await?;
        if !resp.status().is_success() {
            return Err(self
                .fail(resp, FailContext::Action(request.action_name.clone()))
                .await);
        }
        Ok(())
    }

    async fn list_actions(&self) -> GatewayResult<Vec<String>> {
        let url = self.url("/actions");
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(self.fail(resp, FailContext::None).await);
        }
        let body: ActionListResponse = Self::parse(resp).await?;
        Ok(body.action_names)
    }

    async fn list_activities(&self) -> GatewayResult<Vec<String>> {
        let url = self.url("/activities");
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(self.fail(resp, FailContext::None).await);
        }
        let body: ActivityListResponse = Self::parse(resp).await?;
        Ok(body.activity_names)
    }

    async fn health(&self) -> GatewayResult<()> {
        // Health probes use the raw health path, not the versioned API.
        let resp = self
            .send_with_retry(|| self.client.get(&self.health_url))
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::unavailable(format!(
                "controller {} health check returned {}",
                self.controller_id,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_serializes_to_wire_shape() {
        let request = StartActivity {
            activity_name: "print_job".to_string(),
            activity_options: vec![ActivityOption::new("file", "bucket/part.stl")],
            activity_deadline: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["activityName"], "print_job");
        assert_eq!(json["activityOptions"][0]["key"], "file");
        assert!(json.get("activityDeadline").is_none());
    }

    #[test]
    fn status_response_parses_contract_payload() {
        let body: ActivityStatusResponse = serde_json::from_str(
            r#"{
                "activityStatus": "ACTIVITY_COMPLETED",
                "timeBegin": "2026-08-28T10:00:00Z",
                "timeEnd": "2026-08-28T10:42:00Z",
                "statusMsg": "done"
            }"#,
        )
        .unwrap();
        assert_eq!(body.activity_status, "ACTIVITY_COMPLETED");
        assert!(body.time_begin.is_some());
        assert_eq!(body.status_msg.as_deref(), Some("done"));
    }

    #[test]
    fn name_list_responses_parse_contract_payloads() {
        let actions: ActionListResponse =
            serde_json::from_str(r#"{"actionNames": ["HOME", "MOVE", "CALIBRATE"]}"#).unwrap();
        assert_eq!(actions.action_names, ["HOME", "MOVE", "CALIBRATE"]);

        let activities: ActivityListResponse =
            serde_json::from_str(r#"{"activityNames": ["print_job"]}"#).unwrap();
        assert_eq!(activities.activity_names, ["print_job"]);

        // A shape mismatch is an error, not an empty list.
        assert!(serde_json::from_str::<ActionListResponse>(r#"{"names": []}"#).is_err());
    }

    #[test]
    fn client_builds_versioned_urls() {
        let client = HttpControllerClient::new(
            ControllerId::new("printer-a3"),
            "http://localhost:8070/",
            "/healthz",
            Duration::from_secs(5),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            client.url("/activities/start"),
            "http://localhost:8070/v0.1/activities/start"
        );
        assert_eq!(client.health_url, "http://localhost:8070/healthz");
    }
}
