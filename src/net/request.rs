//! Request/response correlation over any transport

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::{Transport, TransportEvent};
use super::{Packet, RequestEnvelope, ResponseEnvelope};

/// Why a request produced no usable response
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request {request_type} timed out after {timeout_ms}ms")]
    Timeout {
        request_type: String,
        timeout_ms: u64,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport refused the request")]
    SendFailed,

    #[error("response channel closed")]
    Closed,

    #[error("could not encode or decode payload: {0}")]
    Codec(#[from] serde_json::Error),
}

type PendingTable = DashMap<Uuid, oneshot::Sender<ResponseEnvelope>>;

/// Removes a pending entry on every exit path, including cancellation
struct PendingGuard {
    table: Arc<PendingTable>,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Issues requests over one transport and matches responses by id
pub struct Requester {
    transport: Arc<dyn Transport>,
    local_id: String,
    pending: Arc<PendingTable>,
    router: JoinHandle<()>,
}

impl Requester {
    pub fn new(transport: Arc<dyn Transport>, local_id: impl Into<String>) -> Self {
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        // Subscribe before spawning so no response can slip past
        let rx = transport.subscribe();
        let router = tokio::spawn(route_responses(rx, pending.clone()));

        Self {
            transport,
            local_id: local_id.into(),
            pending,
            router,
        }
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn send<Req, Resp>(
        &self,
        dst: &str,
        request_type: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp, RequestError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let id = Uuid::new_v4();
        let timeout_ms = timeout.as_millis() as u64;
        let envelope = RequestEnvelope {
            id,
            src: self.local_id.clone(),
            dst: dst.to_string(),
            request_type: request_type.to_string(),
            timeout_ms,
            payload: serde_json::to_value(payload)?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            table: self.pending.clone(),
            id,
        };

        if !self.transport.send(Packet::Request(envelope)).await {
            return Err(RequestError::SendFailed);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RequestError::Closed),
            Err(_) => {
                debug!(%id, request_type, timeout_ms, "Request timed out");
                return Err(RequestError::Timeout {
                    request_type: request_type.to_string(),
                    timeout_ms,
                });
            }
        };

        if let Some(message) = response.error {
            return Err(RequestError::Remote(message));
        }
        Ok(serde_json::from_value(
            response.data.unwrap_or(serde_json::Value::Null),
        )?)
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_responses(
    mut rx: broadcast::Receiver<TransportEvent>,
    pending: Arc<PendingTable>,
) {
    loop {
        match rx.recv().await {
            Ok(TransportEvent::Message(Packet::Response(response))) => {
                match pending.remove(&response.id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(id = %response.id, "Response for unknown or expired request"),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Response router lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Registration of a request handler; dropping it unregisters the handler
pub struct ResponderHandle {
    task: JoinHandle<()>,
}

impl ResponderHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answer every inbound request of `request_type` with `handler`.
///
/// Handler errors, panics and undecodable payloads all become error responses,
/// so a request never goes unanswered because of the handler.
pub fn handle<Req, Resp, E, F, Fut>(
    transport: Arc<dyn Transport>,
    request_type: impl Into<String>,
    handler: F,
) -> ResponderHandle
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(Req, RequestEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
{
    let request_type = request_type.into();
    let handler = Arc::new(handler);
    let mut rx = transport.subscribe();

    let task = tokio::spawn(async move {
        loop {
            let request = match rx.recv().await {
                Ok(TransportEvent::Message(Packet::Request(req)))
                    if req.request_type == request_type =>
                {
                    req
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, request_type = %request_type, "Responder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let handler = handler.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                let id = request.id;
                let response = answer(handler.as_ref(), request).await;
                if !transport.send(Packet::Response(response)).await {
                    warn!(%id, "Could not deliver response");
                }
            });
        }
    });

    ResponderHandle { task }
}

async fn answer<Req, Resp, E, F, Fut>(handler: &F, request: RequestEnvelope) -> ResponseEnvelope
where
    Req: DeserializeOwned,
    Resp: Serialize,
    E: Display,
    F: Fn(Req, RequestEnvelope) -> Fut,
    Fut: Future<Output = Result<Resp, E>>,
{
    let id = request.id;
    let payload: Req = match serde_json::from_value(request.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => return ResponseEnvelope::err(id, format!("invalid payload: {e}")),
    };

    let outcome = AssertUnwindSafe(handler(payload, request)).catch_unwind().await;
    match outcome {
        Ok(Ok(data)) => match serde_json::to_value(data) {
            Ok(value) => ResponseEnvelope::ok(id, value),
            Err(e) => ResponseEnvelope::err(id, format!("invalid response: {e}")),
        },
        Ok(Err(e)) => ResponseEnvelope::err(id, e.to_string()),
        Err(_) => {
            warn!(%id, "Request handler panicked");
            ResponseEnvelope::err(id, "handler panicked")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::ChannelTransport;
    use serde::Deserialize;
    use std::time::Instant;
    use tokio_test::assert_ok;

    #[derive(Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn linked() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let (client, server) = ChannelTransport::pair();
        (Arc::new(client), Arc::new(server))
    }

    #[tokio::test]
    async fn request_gets_matching_response() {
        let (client, server) = linked();
        let _responder = handle(server, "add", |req: Add, _env| async move {
            Ok::<_, String>(req.a + req.b)
        });
        let requester = Requester::new(client, "client-1");

        let sum: i64 = assert_ok!(
            requester
                .send("server", "add", &Add { a: 2, b: 3 }, Duration::from_secs(1))
                .await
        );
        assert_eq!(sum, 5);
        assert_eq!(requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (client, _server) = linked();
        let requester = Requester::new(client, "client-1");

        let started = Instant::now();
        let result: Result<i64, _> = requester
            .send("server", "nobody_home", &(), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(RequestError::Timeout { timeout_ms: 50, .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_becomes_remote_error() {
        let (client, server) = linked();
        let _responder = handle(server, "fail", |_: (), _env| async move {
            Err::<(), _>("nope")
        });
        let requester = Requester::new(client, "c");

        let result: Result<(), _> = requester
            .send("s", "fail", &(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RequestError::Remote(msg)) if msg == "nope"));
    }

    #[tokio::test]
    async fn handler_panic_is_answered() {
        let (client, server) = linked();
        let _responder = handle(server, "boom", |_: (), _env| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<(), String>(())
        });
        let requester = Requester::new(client, "c");

        let result: Result<(), _> = requester
            .send("s", "boom", &(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RequestError::Remote(msg)) if msg == "handler panicked"));
    }

    #[tokio::test]
    async fn bad_payload_is_answered() {
        let (client, server) = linked();
        let _responder = handle(server, "add", |req: Add, _env| async move {
            Ok::<_, String>(req.a + req.b)
        });
        let requester = Requester::new(client, "c");

        let result: Result<i64, _> = requester
            .send("s", "add", &"not numbers", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RequestError::Remote(msg)) if msg.starts_with("invalid payload")));
    }

    #[tokio::test]
    async fn stopped_responder_no_longer_answers() {
        let (client, server) = linked();
        let responder = handle(server, "add", |req: Add, _env| async move {
            Ok::<_, String>(req.a + req.b)
        });
        responder.stop();
        tokio::task::yield_now().await;

        let requester = Requester::new(client, "c");
        let result: Result<i64, _> = requester
            .send("s", "add", &Add { a: 1, b: 1 }, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
    }

    #[tokio::test]
    async fn disconnected_transport_fails_fast() {
        let (client, server) = linked();
        server.disconnect().await;
        let requester = Requester::new(client, "c");

        let result: Result<(), _> = requester
            .send("s", "anything", &(), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RequestError::SendFailed)));
        assert_eq!(requester.pending_count(), 0);
    }
}
