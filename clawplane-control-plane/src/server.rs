use crate::features::instance_management::controller as instances;
use crate::features::instance_management::service::InstanceService;
use crate::features::terminal_bridge::controller as terminal;
use crate::features::terminal_bridge::service::TerminalSessionManager;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub instances: Arc<InstanceService>,
    pub terminal: Arc<TerminalSessionManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(instances::get_health))
        .route(
            "/v1/instances",
            get(instances::list_instances).post(instances::create_instance),
        )
        .route(
            "/v1/instances/:instance_id/actions",
            post(instances::submit_instance_action),
        )
        .route(
            "/v1/instances/:instance_id",
            delete(instances::delete_instance),
        )
        .route("/v1/images", get(instances::list_images))
        .route("/v1/terminal/ws", get(terminal::terminal_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
