use crate::server::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalWsQuery {
    #[serde(rename = "instanceId")]
    pub instance_id: Option<String>,
}

/// Upgrade handler for the terminal bridge. Admission decisions happen
/// after the upgrade so rejections arrive as in-band system notices.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalWsQuery>,
    State(state): State<AppState>,
) -> Response {
    let manager = state.terminal.clone();
    ws.on_upgrade(move |socket| manager.handle_connection(socket, query.instance_id))
}
