//! Shared state and per-client sessions

pub mod session;
pub mod state;

pub use session::run_session;
pub use state::AppState;
