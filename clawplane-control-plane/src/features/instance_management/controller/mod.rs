use crate::server::AppState;
use crate::shared::error::ControlPlaneError;
use crate::shared::types::{
    AcceptedAction, ClawInstance, CreateInstanceRequest, HealthResponse, ImagePreset,
    InstanceActionRequest, ListResponse,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;
use uuid::Uuid;

/// The transport layer alone maps error kinds to protocol statuses.
impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::Conflict(_) => StatusCode::CONFLICT,
            ControlPlaneError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlPlaneError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            ControlPlaneError::InvalidConfig(_)
            | ControlPlaneError::Storage(_)
            | ControlPlaneError::UniqueViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(clawplane_core::ErrorResponse::from(self))).into_response()
    }
}

pub async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        service: "clawplane-control-plane",
    })
}

pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ClawInstance>>, ControlPlaneError> {
    let instances = state.instances.list_instances().await?;
    Ok(Json(ListResponse::new(instances)))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<ClawInstance>), ControlPlaneError> {
    info!(name = %request.name, "received create instance request");
    let instance = state.instances.create_instance(request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn submit_instance_action(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(request): Json<InstanceActionRequest>,
) -> Result<(StatusCode, Json<AcceptedAction>), ControlPlaneError> {
    info!(%instance_id, action = request.action.as_str(), "received instance action request");
    let accepted = state
        .instances
        .submit_instance_action(instance_id, request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<StatusCode, ControlPlaneError> {
    info!(%instance_id, "received delete instance request");
    state.instances.delete_instance(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_images(State(state): State<AppState>) -> Json<ListResponse<ImagePreset>> {
    Json(ListResponse::new(state.instances.list_image_presets()))
}
