//! WebSocket transport for upgraded axum sockets

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::future::{self, BoxFuture};
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::net::transport::{EventHub, Transport, TransportEvent};
use crate::net::{Packet, TransportError};

/// Outbound frames buffered per socket; beyond this `send` drops the frame
const OUTBOUND_CAPACITY: usize = 256;

struct Shared {
    hub: EventHub,
    connected: AtomicBool,
}

impl Shared {
    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.emit(TransportEvent::Disconnected);
        }
    }
}

/// Server side of an upgraded WebSocket.
///
/// Reads and writes run on their own tasks; `send` only queues a frame.
/// Text frames carry one JSON packet each.
pub struct WsTransport {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Take over an upgraded socket. The receiver is subscribed before the
    /// reader starts, so the first client packet is never missed.
    pub fn start(socket: WebSocket) -> (Arc<Self>, broadcast::Receiver<TransportEvent>) {
        let shared = Arc::new(Shared {
            hub: EventHub::new(),
            connected: AtomicBool::new(true),
        });
        let rx = shared.hub.subscribe();

        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        let transport = Arc::new(Self {
            shared,
            outbound,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        });
        (transport, rx)
    }

    fn queue(&self, packet: Packet) -> bool {
        if !self.is_connected() {
            self.shared
                .hub
                .emit(TransportEvent::Error(TransportError::NotConnected.to_string()));
            return false;
        }

        let text = match packet.encode() {
            Ok(text) => text,
            Err(e) => {
                self.shared.hub.emit(TransportEvent::Error(e.to_string()));
                return false;
            }
        };

        match self.outbound.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Peer is not draining its socket
                self.shared
                    .hub
                    .emit(TransportEvent::Error(TransportError::Backpressure.to_string()));
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.mark_closed();
                false
            }
        }
    }

    fn close(&self) {
        if self.is_connected() {
            // Best effort close frame, skipped when the queue is already full
            let _ = self.outbound.try_send(Message::Close(None));
        }
        self.shared.mark_closed();

        // The writer exits on its own after flushing the close frame
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotReconnectable)
        };
        future::ready(result).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        self.close();
        future::ready(()).boxed()
    }

    fn send(&self, packet: Packet) -> BoxFuture<'_, bool> {
        future::ready(self.queue(packet)).boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.hub.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket send failed");
            shared.hub.emit(TransportEvent::Error(e.to_string()));
            break;
        }
        if closing {
            break;
        }
    }
    shared.mark_closed();
}

async fn read_loop(mut stream: SplitStream<WebSocket>, shared: Arc<Shared>) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match Packet::decode(&text) {
                Ok(packet) => shared.hub.emit(TransportEvent::Message(packet)),
                Err(e) => {
                    warn!(error = %e, "Failed to parse client packet");
                    shared.hub.emit(TransportEvent::Error(e.to_string()));
                }
            },
            Ok(Message::Binary(_)) => {
                warn!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Client initiated close");
                break;
            }
            Err(e) => {
                shared.hub.emit(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }
    shared.mark_closed();
}
