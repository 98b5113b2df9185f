//! Browser-socket transport and the client protocol

pub mod handler;
pub mod protocol;
pub mod transport;

pub use transport::WsTransport;
