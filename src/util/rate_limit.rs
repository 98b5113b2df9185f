//! Rate limiting for inbound client traffic

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max inbound packets per second from one connection (acks, reports, requests)
pub const CLIENT_PACKET_RATE_LIMIT: u32 = 120;

/// Per-connection limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    packet_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self::with_rate(CLIENT_PACKET_RATE_LIMIT)
    }

    pub fn with_rate(packets_per_second: u32) -> Self {
        Self {
            packet_limiter: create_limiter(packets_per_second),
        }
    }

    /// Check if an inbound packet is allowed (returns true if allowed)
    pub fn check_packet(&self) -> bool {
        self.packet_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_beyond_quota_is_rejected() {
        let limiter = ConnectionRateLimiter::with_rate(2);
        assert!(limiter.check_packet());
        assert!(limiter.check_packet());
        assert!(!limiter.check_packet());
    }
}
