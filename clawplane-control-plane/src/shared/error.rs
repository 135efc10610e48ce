use thiserror::Error;

/// Control plane specific errors. The variant is the error kind the
/// transport layer maps to a protocol status; the payload is the
/// caller-facing detail message.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// A store-level uniqueness rejection. Distinguishable so the
    /// orchestrator can translate it (insert) or retry past it (optimistic
    /// port assignment); it is never surfaced to callers as-is.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),
}

impl ControlPlaneError {
    /// Detail message without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            ControlPlaneError::Validation(msg)
            | ControlPlaneError::Conflict(msg)
            | ControlPlaneError::NotFound(msg)
            | ControlPlaneError::UpstreamFailure(msg)
            | ControlPlaneError::InvalidConfig(msg)
            | ControlPlaneError::Storage(msg)
            | ControlPlaneError::UniqueViolation(msg) => msg,
        }
    }
}

impl From<ControlPlaneError> for clawplane_core::ErrorResponse {
    fn from(err: ControlPlaneError) -> Self {
        let (code, message) = match &err {
            ControlPlaneError::Validation(msg) => ("VALIDATION_ERROR", msg.clone()),
            ControlPlaneError::Conflict(msg) => ("CONFLICT", msg.clone()),
            ControlPlaneError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
            ControlPlaneError::UpstreamFailure(msg) => ("UPSTREAM_FAILURE", msg.clone()),
            ControlPlaneError::InvalidConfig(msg) => ("INVALID_CONFIG", msg.clone()),
            ControlPlaneError::Storage(msg) => ("STORAGE_ERROR", msg.clone()),
            ControlPlaneError::UniqueViolation(msg) => ("UNIQUE_VIOLATION", msg.clone()),
        };

        clawplane_core::ErrorResponse::new(code, message)
    }
}

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;
