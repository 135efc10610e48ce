use crate::shared::config::PlaneConfig;
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::InstanceAction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Client for the execution plane, the external system that actually
/// manipulates containers. Transport failures surface as
/// `UpstreamFailure` carrying the remote message largely verbatim; the
/// orchestrator's retry heuristic inspects that text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionPlaneClient: Send + Sync {
    async fn reconcile(
        &self,
        instance_id: Uuid,
        action: InstanceAction,
        image: &str,
        gateway_host_port: Option<u16>,
    ) -> ControlPlaneResult<PlaneExecutionRecord>;

    async fn delete_instance(&self, instance_id: Uuid) -> ControlPlaneResult<()>;
}

/// Reconcile command sent to the plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneReconcileRequest {
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub command_type: String,
    pub action: String,
    pub requested_by: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Execution record returned by the plane. Transient; on failure the
/// message is folded into the action audit reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneExecutionRecord {
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    #[serde(default)]
    pub command_type: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub executed_at: Option<String>,
}

impl PlaneExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.status.eq_ignore_ascii_case("SUCCEEDED")
    }
}

/// HTTP implementation of the plane client.
pub struct HttpExecutionPlaneClient {
    http: reqwest::Client,
    base_url: String,
    requested_by: String,
}

impl HttpExecutionPlaneClient {
    pub fn new(config: &PlaneConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            requested_by: config.requested_by.clone(),
        }
    }
}

pub(crate) fn reconcile_payload(
    image: &str,
    gateway_host_port: Option<u16>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut payload = serde_json::Map::new();
    let image = image.trim();
    if !image.is_empty() {
        payload.insert("image".to_string(), json!(image));
    }
    if let Some(port) = gateway_host_port {
        payload.insert("gatewayHostPort".to_string(), json!(port));
    }
    payload
}

fn upstream_http_failure(prefix: &str, status: reqwest::StatusCode, body: &str) -> ControlPlaneError {
    let details = body.trim();
    let message = if details.is_empty() {
        format!("{prefix}: HTTP {}", status.as_u16())
    } else {
        format!("{prefix}: HTTP {} {details}", status.as_u16())
    };
    ControlPlaneError::UpstreamFailure(message)
}

#[async_trait]
impl ExecutionPlaneClient for HttpExecutionPlaneClient {
    async fn reconcile(
        &self,
        instance_id: Uuid,
        action: InstanceAction,
        image: &str,
        gateway_host_port: Option<u16>,
    ) -> ControlPlaneResult<PlaneExecutionRecord> {
        let request = PlaneReconcileRequest {
            task_id: Uuid::new_v4(),
            instance_id,
            command_type: "INSTANCE_ACTION".to_string(),
            action: action.as_str().to_string(),
            requested_by: self.requested_by.clone(),
            payload: reconcile_payload(image, gateway_host_port),
        };

        let response = self
            .http
            .post(format!("{}/reconcile", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                ControlPlaneError::UpstreamFailure(format!("plane call failed: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_http_failure("plane call failed", status, &body));
        }

        response
            .json::<PlaneExecutionRecord>()
            .await
            .map_err(|error| {
                ControlPlaneError::UpstreamFailure(format!(
                    "plane returned malformed response: {error}"
                ))
            })
    }

    async fn delete_instance(&self, instance_id: Uuid) -> ControlPlaneResult<()> {
        let response = self
            .http
            .delete(format!("{}/instances/{instance_id}", self.base_url))
            .send()
            .await
            .map_err(|error| {
                ControlPlaneError::UpstreamFailure(format!("plane delete failed: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_http_failure("plane delete failed", status, &body));
        }

        Ok(())
    }
}
