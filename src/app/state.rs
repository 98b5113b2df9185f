//! Application state shared across routes and sessions

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::net::pool::ConnectionPool;
use crate::world::{WorldInput, WorldServices};

/// Buffered session -> tick loop inputs before senders wait
const WORLD_INPUT_CAPACITY: usize = 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
    pub services: Arc<WorldServices>,
    pub world_tx: mpsc::Sender<WorldInput>,
}

impl AppState {
    /// Build the shared state. The returned receiver feeds the world host.
    pub fn new(config: Config) -> (Self, mpsc::Receiver<WorldInput>) {
        let config = Arc::new(config);

        let pool = Arc::new(
            ConnectionPool::new(config.max_connections).with_send_timeout(config.send_timeout),
        );
        let services = Arc::new(WorldServices::new(&config));
        let (world_tx, world_rx) = mpsc::channel(WORLD_INPUT_CAPACITY);

        let state = Self {
            config,
            pool,
            services,
            world_tx,
        };
        (state, world_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_follows_config() {
        let config = Config {
            max_connections: 3,
            send_timeout: Duration::from_millis(40),
            ..Config::default()
        };
        let (state, _rx) = AppState::new(config);
        assert_eq!(state.pool.max_connections(), 3);
        assert_eq!(state.pool.send_timeout(), Duration::from_millis(40));
    }
}
