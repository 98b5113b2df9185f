//! WebSocket upgrade handler

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};
use tracing::info;

use crate::app::{run_session, AppState};
use crate::ws::transport::WsTransport;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        info!("New WebSocket connection");
        let (transport, events) = WsTransport::start(socket);
        run_session(state, transport, events).await;
    })
}
