use clawplane_control_plane::features::instance_management::plane::{
    ExecutionPlaneClient, HttpExecutionPlaneClient,
};
use clawplane_control_plane::features::instance_management::repo::{
    InMemoryInstanceStore, InstanceStore,
};
use clawplane_control_plane::features::instance_management::service::InstanceService;
use clawplane_control_plane::features::terminal_bridge::service::TerminalSessionManager;
use clawplane_control_plane::server::{build_router, AppState};
use clawplane_control_plane::shared::config::ControlPlaneConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ControlPlaneConfig::from_env();
    let listen_addr = config.listen_addr.parse::<SocketAddr>()?;

    info!("Starting Clawplane Control Plane");

    let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
    let plane: Arc<dyn ExecutionPlaneClient> =
        Arc::new(HttpExecutionPlaneClient::new(&config.plane));

    let instances = Arc::new(InstanceService::new(
        store.clone(),
        plane,
        config.gateway.clone(),
        config.images.clone(),
    ));
    let terminal = Arc::new(TerminalSessionManager::new(
        store,
        config.terminal.clone(),
    )?);

    let app = build_router(AppState {
        instances,
        terminal: terminal.clone(),
    });

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, plane_base_url = %config.plane.base_url, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    terminal.shutdown().await;
    info!("control plane stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for shutdown signal");
    }
}
