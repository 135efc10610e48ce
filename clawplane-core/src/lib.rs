use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Runtime flavor backing an instance. A single variant today; the tag is
/// persisted so that future runtimes can coexist in one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRuntime {
    Zeroclaw,
}

/// Observed instance state, including the transient creation and failure
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

/// Caller-intended steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Lifecycle command submitted against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
    Rollback,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Start => "START",
            InstanceAction::Stop => "STOP",
            InstanceAction::Restart => "RESTART",
            InstanceAction::Rollback => "ROLLBACK",
        }
    }

    /// Desired state implied by submitting this action.
    pub fn desired_state(&self) -> DesiredState {
        match self {
            InstanceAction::Stop => DesiredState::Stopped,
            InstanceAction::Start | InstanceAction::Restart | InstanceAction::Rollback => {
                DesiredState::Running
            }
        }
    }

    /// Status to persist once the execution plane reports success.
    pub fn status_on_success(&self) -> InstanceStatus {
        match self {
            InstanceAction::Stop => InstanceStatus::Stopped,
            InstanceAction::Start | InstanceAction::Restart | InstanceAction::Rollback => {
                InstanceStatus::Running
            }
        }
    }

    /// Whether reconciling this action needs a gateway host port bound.
    pub fn requires_gateway_port(&self) -> bool {
        matches!(
            self,
            InstanceAction::Start | InstanceAction::Restart | InstanceAction::Rollback
        )
    }
}

/// A claw instance: a container on a remote host addressed through an
/// allocated gateway port. `gateway_url` is derived from configuration and
/// never treated as a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClawInstance {
    pub id: Uuid,
    pub name: String,
    pub host_id: Uuid,
    pub image: String,
    pub gateway_host_port: Option<u16>,
    pub gateway_url: Option<String>,
    pub runtime: InstanceRuntime,
    pub status: InstanceStatus,
    pub desired_state: DesiredState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClawInstance {
    pub fn new(
        name: String,
        host_id: Uuid,
        image: String,
        gateway_host_port: Option<u16>,
        status: InstanceStatus,
        desired_state: DesiredState,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            host_id,
            image,
            gateway_host_port,
            gateway_url: None,
            runtime: InstanceRuntime::Zeroclaw,
            status,
            desired_state,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Append-only audit record for a submitted action. One record per
/// submission regardless of outcome; failed submissions carry an annotated
/// reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub action: InstanceAction,
    pub reason: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Returned when an action submission is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedAction {
    pub task_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

/// An entry of the configured image catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePreset {
    pub id: String,
    pub name: String,
    pub image: String,
    pub runtime: InstanceRuntime,
    pub description: Option<String>,
    pub recommended: bool,
}

/// Error envelope returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub details: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_desired_state_mapping() {
        assert_eq!(InstanceAction::Stop.desired_state(), DesiredState::Stopped);
        assert_eq!(InstanceAction::Start.desired_state(), DesiredState::Running);
        assert_eq!(
            InstanceAction::Restart.desired_state(),
            DesiredState::Running
        );
        assert_eq!(
            InstanceAction::Rollback.desired_state(),
            DesiredState::Running
        );
    }

    #[test]
    fn test_action_status_on_success() {
        assert_eq!(
            InstanceAction::Stop.status_on_success(),
            InstanceStatus::Stopped
        );
        assert_eq!(
            InstanceAction::Start.status_on_success(),
            InstanceStatus::Running
        );
        assert_eq!(
            InstanceAction::Rollback.status_on_success(),
            InstanceStatus::Running
        );
    }

    #[test]
    fn test_gateway_port_requirement() {
        assert!(InstanceAction::Start.requires_gateway_port());
        assert!(InstanceAction::Restart.requires_gateway_port());
        assert!(InstanceAction::Rollback.requires_gateway_port());
        assert!(!InstanceAction::Stop.requires_gateway_port());
    }

    #[test]
    fn test_action_wire_casing() {
        assert_eq!(
            serde_json::to_string(&InstanceAction::Rollback).unwrap(),
            "\"ROLLBACK\""
        );
        let parsed: InstanceAction = serde_json::from_str("\"START\"").unwrap();
        assert_eq!(parsed, InstanceAction::Start);
    }

    #[test]
    fn test_instance_new_defaults() {
        let now = Utc::now();
        let instance = ClawInstance::new(
            "demo".to_string(),
            Uuid::new_v4(),
            "registry.local/claw:1".to_string(),
            Some(42617),
            InstanceStatus::Creating,
            DesiredState::Running,
            now,
        );

        assert_eq!(instance.runtime, InstanceRuntime::Zeroclaw);
        assert_eq!(instance.status, InstanceStatus::Creating);
        assert_eq!(instance.gateway_host_port, Some(42617));
        assert!(instance.gateway_url.is_none());
        assert_eq!(instance.created_at, instance.updated_at);
    }

    #[test]
    fn test_instance_serialization_round_trip() {
        let instance = ClawInstance::new(
            "demo".to_string(),
            Uuid::new_v4(),
            "registry.local/claw:1".to_string(),
            None,
            InstanceStatus::Stopped,
            DesiredState::Stopped,
            Utc::now(),
        );

        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"gatewayHostPort\":null"));
        assert!(json.contains("\"ZEROCLAW\""));
        assert!(json.contains("\"STOPPED\""));

        let deserialized: ClawInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, instance.id);
        assert_eq!(deserialized.name, instance.name);
        assert_eq!(deserialized.status, instance.status);
    }

    #[test]
    fn test_error_response_with_details() {
        let mut details = HashMap::new();
        details.insert("field".to_string(), "name".to_string());

        let response = ErrorResponse::new("VALIDATION_ERROR", "name must not be blank")
            .with_details(details);

        assert_eq!(response.error_code, "VALIDATION_ERROR");
        assert_eq!(
            response.details.as_ref().and_then(|d| d.get("field")),
            Some(&"name".to_string())
        );
    }
}
