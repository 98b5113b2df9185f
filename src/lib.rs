//! World Sync Server - authoritative world host
//!
//! Simulates a shared entity world at a fixed tick rate and keeps remote
//! clients in sync with it:
//! - Per-client snapshot delta encoding against acknowledged baselines
//! - Causal event log with query, persistence and replay
//! - Rolling snapshot recording, bandwidth sampling and prediction diagnostics
//! - Transports over WebSocket, raw TCP and in-process channels

pub mod app;
pub mod config;
pub mod http;
pub mod net;
pub mod replication;
pub mod util;
pub mod world;
pub mod ws;
