//! Transport abstraction and an in-process implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Packet, TransportError};

/// Capacity of each transport's event channel
pub const EVENT_CAPACITY: usize = 256;

/// Something that happened on a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Message(Packet),
    Error(String),
    Disconnected,
}

/// A bidirectional packet channel to one peer.
///
/// `subscribe` is the listener surface: every receiver sees every event from
/// the moment it subscribed, dropping the receiver unregisters it, and
/// [`next_event`] waits for a single matching event.
pub trait Transport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Queue a packet for the peer. Never errors: failure is `false` plus an
    /// `Error` or `Disconnected` event.
    fn send(&self, packet: Packet) -> BoxFuture<'_, bool>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_connected(&self) -> bool;
}

/// Fan-out point for a transport's events
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<TransportEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: TransportEvent) {
        // Nobody listening is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    /// Receivers currently subscribed
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the first event matching `pred`, or `None` on timeout or close
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<TransportEvent>,
    wait: Duration,
    mut pred: F,
) -> Option<TransportEvent>
where
    F: FnMut(&TransportEvent) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(wait, search).await.ok().flatten()
}

struct Endpoint {
    hub: EventHub,
}

struct Link {
    up: AtomicBool,
}

/// In-process transport. Endpoints come in connected pairs.
pub struct ChannelTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    link: Arc<Link>,
}

impl ChannelTransport {
    /// Two linked endpoints; whatever one sends, the other receives
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Endpoint {
            hub: EventHub::new(),
        });
        let b = Arc::new(Endpoint {
            hub: EventHub::new(),
        });
        let link = Arc::new(Link {
            up: AtomicBool::new(true),
        });

        (
            Self {
                local: a.clone(),
                remote: b.clone(),
                link: link.clone(),
            },
            Self {
                local: b,
                remote: a,
                link,
            },
        )
    }

    /// Receivers subscribed to this endpoint's events
    pub fn listener_count(&self) -> usize {
        self.local.hub.listener_count()
    }
}

impl Transport for ChannelTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        if !self.link.up.swap(true, Ordering::SeqCst) {
            self.local.hub.emit(TransportEvent::Connected);
            self.remote.hub.emit(TransportEvent::Connected);
        }
        future::ready(Ok(())).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        if self.link.up.swap(false, Ordering::SeqCst) {
            self.local.hub.emit(TransportEvent::Disconnected);
            self.remote.hub.emit(TransportEvent::Disconnected);
        }
        future::ready(()).boxed()
    }

    fn send(&self, packet: Packet) -> BoxFuture<'_, bool> {
        let sent = if self.link.up.load(Ordering::SeqCst) {
            self.remote.hub.emit(TransportEvent::Message(packet));
            true
        } else {
            self.local
                .hub
                .emit(TransportEvent::Error(TransportError::NotConnected.to_string()));
            false
        };
        future::ready(sent).boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.local.hub.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.link.up.load(Ordering::SeqCst)
    }
}

/// Peer whose sends never resolve, for exercising send deadlines
#[cfg(test)]
pub(crate) struct StalledTransport;

#[cfg(test)]
impl Transport for StalledTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        future::ready(Ok(())).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        future::ready(()).boxed()
    }

    fn send(&self, _packet: Packet) -> BoxFuture<'_, bool> {
        future::pending().boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        EventHub::new().subscribe()
    }

    fn is_connected(&self) -> bool {
        true
    }
}
