//! HTTP surface: health, WebSocket upgrade and replication diagnostics

pub mod routes;

pub use routes::build_router;
