//! One client session over any transport

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::net::pool::ConnectionId;
use crate::net::request::{self, ResponderHandle};
use crate::net::transport::{Transport, TransportEvent};
use crate::net::Packet;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::world::{InputKind, WorldInput, WorldServices};
use crate::ws::protocol::{
    ClientMsg, CorrectionAck, CorrectionReport, ErrorMsg, Pong, Welcome, ERROR, PONG,
    REPORT_CORRECTION, WELCOME,
};

use super::AppState;

/// Run a session until the transport goes away.
///
/// `events` must have been subscribed before the transport started reading so
/// the client's first packets are not lost.
pub async fn run_session(
    state: AppState,
    transport: Arc<dyn Transport>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    let conn_id = ConnectionId::generate();

    if !state.pool.add(conn_id.clone(), transport.clone()) {
        send_error(&transport, "server_full", "connection limit reached").await;
        transport.disconnect().await;
        return;
    }
    info!(conn_id = %conn_id, "Session started");

    // Listening before the welcome goes out, clients may report right away
    let _corrections = serve_corrections(transport.clone(), state.services.clone());

    let welcome = Welcome {
        connection_id: conn_id.clone(),
        server_time: unix_millis(),
        tick_rate: state.config.tick_rate,
    };
    match Packet::message(WELCOME, &welcome) {
        Ok(packet) => {
            if !transport.send(packet).await {
                debug!(conn_id = %conn_id, "Failed to send welcome");
            }
        }
        Err(e) => warn!(conn_id = %conn_id, error = %e, "Failed to encode welcome"),
    }

    if forward(&state, &conn_id, InputKind::Joined).await {
        read_loop(&state, &conn_id, &transport, &mut events).await;
    }

    // Cleanup on disconnect
    state.pool.remove(&conn_id);
    forward(&state, &conn_id, InputKind::Left).await;
    if transport.is_connected() {
        transport.disconnect().await;
    }
    info!(conn_id = %conn_id, "Session closed");
}

async fn read_loop(
    state: &AppState,
    conn_id: &ConnectionId,
    transport: &Arc<dyn Transport>,
    events: &mut broadcast::Receiver<TransportEvent>,
) {
    let rate_limiter = ConnectionRateLimiter::new();

    loop {
        let packet = match events.recv().await {
            // Requests and responses belong to the request layer
            Ok(TransportEvent::Message(packet @ Packet::Message { .. })) => packet,
            Ok(TransportEvent::Message(_)) | Ok(TransportEvent::Connected) => continue,
            Ok(TransportEvent::Error(e)) => {
                debug!(conn_id = %conn_id, error = %e, "Transport error");
                continue;
            }
            Ok(TransportEvent::Disconnected) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(conn_id = %conn_id, lagged_count = n, "Session lagged behind its transport");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if !rate_limiter.check_packet() {
            warn!(conn_id = %conn_id, "Rate limited client message");
            continue;
        }

        match ClientMsg::from_packet(&packet) {
            Ok(Some(ClientMsg::Ack { tick })) => {
                if !forward(state, conn_id, InputKind::Ack { tick }).await {
                    break;
                }
            }
            Ok(Some(ClientMsg::InputBuffer { depth })) => {
                if !forward(state, conn_id, InputKind::InputBufferDepth { depth }).await {
                    break;
                }
            }
            Ok(Some(ClientMsg::Ping { t })) => {
                if let Ok(pong) = Packet::message(PONG, &Pong { t }) {
                    transport.send(pong).await;
                }
            }
            Ok(None) => {
                debug!(conn_id = %conn_id, name = ?packet.name(), "Ignoring unknown message");
            }
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "Failed to parse client message");
                send_error(transport, "bad_message", &e.to_string()).await;
            }
        }
    }
}

/// Hand an input to the tick loop. False once the world has shut down.
async fn forward(state: &AppState, conn_id: &ConnectionId, kind: InputKind) -> bool {
    let input = WorldInput {
        conn_id: conn_id.clone(),
        kind,
    };
    if state.world_tx.send(input).await.is_err() {
        debug!(conn_id = %conn_id, "World input channel closed");
        return false;
    }
    true
}

/// Answer `report_correction` requests by recording them in the inspector
fn serve_corrections(transport: Arc<dyn Transport>, services: Arc<WorldServices>) -> ResponderHandle {
    request::handle(
        transport,
        REPORT_CORRECTION,
        move |report: CorrectionReport, _envelope| {
            let services = services.clone();
            async move {
                if report.predicted.len() != report.actual.len() {
                    return Err("predicted and actual must have the same length");
                }

                let divergence = distance(&report.predicted, &report.actual);
                {
                    let mut inspector = services.inspector.lock();
                    inspector.record_correction(
                        report.player_id.clone(),
                        &report.predicted,
                        &report.actual,
                        report.magnitude,
                    );
                    inspector.record_divergence(report.player_id, divergence);
                }

                Ok(CorrectionAck {
                    server_tick: services.current_tick(),
                    accepted: true,
                })
            }
        },
    )
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

async fn send_error(transport: &Arc<dyn Transport>, code: &str, message: &str) {
    if let Ok(packet) = Packet::message(ERROR, &ErrorMsg::new(code, message)) {
        transport.send(packet).await;
    }
}
