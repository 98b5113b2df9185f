//! Raw TCP transport, one JSON packet per line

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{EventHub, Transport, TransportEvent};
use super::{Packet, TransportError};

/// Lines buffered per socket; beyond this `send` drops the packet
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

/// Line-delimited JSON over a TCP stream.
///
/// Client side is created with [`TcpTransport::new`] and dials on `connect`;
/// server side wraps an accepted stream with [`TcpTransport::accept`].
/// A writer task owns the socket's write half; `send` only queues a line.
pub struct TcpTransport {
    addr: Option<SocketAddr>,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            shared: Arc::new(Shared {
                hub: EventHub::new(),
                connected: AtomicBool::new(false),
            }),
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Wrap an accepted stream. The returned receiver is subscribed before the
    /// read loop starts, so no early packet is missed.
    pub fn accept(stream: TcpStream) -> (Arc<Self>, broadcast::Receiver<TransportEvent>) {
        let shared = Arc::new(Shared {
            hub: EventHub::new(),
            connected: AtomicBool::new(true),
        });
        let rx = shared.hub.subscribe();

        let (read_half, write_half) = stream.into_split();
        let reader = spawn_reader(read_half, shared.clone());
        let outbound = spawn_writer(write_half, shared.clone());

        let transport = Arc::new(Self {
            addr: None,
            shared,
            outbound: Mutex::new(Some(outbound)),
            reader: Mutex::new(Some(reader)),
        });
        (transport, rx)
    }

    async fn dial(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let addr = self.addr.ok_or(TransportError::NotReconnectable)?;

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            self.shared.hub.emit(TransportEvent::Error(e.to_string()));
            TransportError::Io(e)
        })?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;

        let (read_half, write_half) = stream.into_split();
        *self.outbound.lock() = Some(spawn_writer(write_half, self.shared.clone()));
        self.shared.connected.store(true, Ordering::SeqCst);

        let reader = spawn_reader(read_half, self.shared.clone());
        let previous = self.reader.lock().replace(reader);
        if let Some(old) = previous {
            old.abort();
        }

        debug!(%addr, "TCP transport connected");
        self.shared.hub.emit(TransportEvent::Connected);
        Ok(())
    }

    fn close(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        // Dropping the sender lets the writer flush what is queued, then shut down
        self.outbound.lock().take();
        self.shared.mark_closed();
    }

    fn queue(&self, packet: Packet) -> bool {
        let line = match packet.encode() {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                self.shared.hub.emit(TransportEvent::Error(e.to_string()));
                return false;
            }
        };

        let mut outbound = self.outbound.lock();
        let Some(sender) = outbound.as_ref() else {
            self.shared
                .hub
                .emit(TransportEvent::Error(TransportError::NotConnected.to_string()));
            return false;
        };

        match sender.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared
                    .hub
                    .emit(TransportEvent::Error(TransportError::Backpressure.to_string()));
                false
            }
            Err(TrySendError::Closed(_)) => {
                outbound.take();
                self.shared.mark_closed();
                false
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.dial().boxed()
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

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

fn spawn_writer(mut write_half: OwnedWriteHalf, shared: Arc<Shared>) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                warn!(error = %e, "TCP write failed");
                shared.hub.emit(TransportEvent::Error(e.to_string()));
                shared.mark_closed();
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });
    tx
}

fn spawn_reader(read_half: OwnedReadHalf, shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match Packet::decode(&line) {
                    Ok(packet) => shared.hub.emit(TransportEvent::Message(packet)),
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable TCP packet");
                        shared.hub.emit(TransportEvent::Error(e.to_string()));
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    shared.hub.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        shared.mark_closed();
    })
}

/// Accept raw TCP clients forever, handing each to `on_accept`
pub async fn serve<F>(listener: TcpListener, on_accept: F)
where
    F: Fn(Arc<TcpTransport>, broadcast::Receiver<TransportEvent>, SocketAddr) + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "Could not disable Nagle");
                }
                info!(%peer, "Raw TCP client connected");
                let (transport, rx) = TcpTransport::accept(stream);
                on_accept(transport, rx, peer);
            }
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::next_event;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn packets_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpTransport::new(addr);
        let mut client_rx = client.subscribe();
        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let (server, mut server_rx) = TcpTransport::accept(accepted.unwrap().0);

        assert!(client.send(Packet::message("hello", &json!({"n": 1})).unwrap()).await);
        let got = next_event(&mut server_rx, Duration::from_secs(1), |e| {
            matches!(e, TransportEvent::Message(_))
        })
        .await;
        assert!(matches!(got, Some(TransportEvent::Message(p)) if p.name() == Some("hello")));

        assert!(server.send(Packet::message("back", &json!(null)).unwrap()).await);
        let got = next_event(&mut client_rx, Duration::from_secs(1), |e| {
            matches!(e, TransportEvent::Message(_))
        })
        .await;
        assert!(matches!(got, Some(TransportEvent::Message(p)) if p.name() == Some("back")));

        client.disconnect().await;
        assert!(!client.is_connected());
        let gone = next_event(&mut server_rx, Duration::from_secs(1), |e| {
            *e == TransportEvent::Disconnected
        })
        .await;
        assert!(gone.is_some());
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn accepted_stream_cannot_redial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpTransport::new(addr);
        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();

        let (server, _rx) = TcpTransport::accept(accepted.unwrap().0);
        server.disconnect().await;
        assert!(matches!(
            server.connect().await,
            Err(TransportError::NotReconnectable)
        ));
    }

    #[tokio::test]
    async fn peer_that_never_reads_gets_backpressure_not_a_hang() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Raw socket that is never read from
        let (_silent, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, mut server_rx) = TcpTransport::accept(accepted.unwrap().0);

        let payload = "x".repeat(64 * 1024);
        let mut refused = false;
        for _ in 0..5_000 {
            let send = server.send(Packet::message("bulk", &payload).unwrap());
            let ok = tokio::time::timeout(Duration::from_millis(100), send)
                .await
                .expect("send must not wait on the peer");
            if !ok {
                refused = true;
                break;
            }
        }
        assert!(refused);
        assert!(server.is_connected());

        let error = next_event(&mut server_rx, Duration::from_secs(1), |e| {
            matches!(e, TransportEvent::Error(_))
        })
        .await;
        assert!(error.is_some());
    }
}
