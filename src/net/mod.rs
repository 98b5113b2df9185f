//! Transport layer: packets, transports, connection pool and request/response

pub mod packet;
pub mod pool;
pub mod request;
pub mod tcp;
pub mod transport;

pub use packet::{Packet, RequestEnvelope, ResponseEnvelope};
pub use pool::{BroadcastOptions, ConnectionId, ConnectionPool, FanOutReport, PoolEvent};
pub use request::{RequestError, Requester, ResponderHandle};
pub use tcp::TcpTransport;
pub use transport::{ChannelTransport, Transport, TransportEvent};

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("outbound queue is full, peer is not reading")]
    Backpressure,

    #[error("transport was accepted from a listener and cannot redial")]
    NotReconnectable,

    #[error("packet codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("expected a named message")]
    UnexpectedPacket,
}
