pub use clawplane_core::{
    AcceptedAction, ActionRecord, ClawInstance, DesiredState, ImagePreset, InstanceAction,
    InstanceRuntime, InstanceStatus,
};

use serde::{Deserialize, Serialize};

/// Request body for `POST /v1/instances`. The host id arrives as a string
/// and is parsed by the orchestrator so a malformed value maps to a
/// validation error rather than a deserialization rejection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub host_id: String,
    pub image: String,
    #[serde(default)]
    pub desired_state: Option<DesiredState>,
}

/// Request body for `POST /v1/instances/{id}/actions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceActionRequest {
    pub action: InstanceAction,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Uniform list envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}
