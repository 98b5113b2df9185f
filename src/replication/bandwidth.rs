//! Outbound bandwidth sampling

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, warn};

use crate::util::time::unix_millis;

use super::record::Snapshot;

/// One minute of per-second samples
pub const SAMPLE_WINDOW: usize = 60;

/// Number of leading vector components checked for quantization loss
const QUANTIZED_COMPONENTS: usize = 3;

/// One second of outbound traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthSample {
    pub timestamp: u64,
    pub bytes_per_second: u64,
    pub bytes_per_player: u64,
    pub quantization_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthStats {
    pub avg_bytes_per_second: u64,
    pub peak_bytes_per_second: u64,
    pub estimated_bytes_per_player: u64,
    pub within_budget: bool,
    pub budget_bytes_per_second: u64,
    pub sample_count: usize,
}

/// Accumulates bytes per tick and emits one sample per second of ticks.
///
/// Reports only; throttling is up to whoever reads the stats.
pub struct BandwidthMonitor {
    tick_rate: u32,
    budget_bytes_per_second: u64,
    accumulated_bytes: u64,
    accumulated_loss: f64,
    ticks: u32,
    active_players: usize,
    samples: VecDeque<BandwidthSample>,
}

impl BandwidthMonitor {
    pub fn new(tick_rate: u32, budget_bytes_per_second: u64) -> Self {
        Self {
            tick_rate: tick_rate.max(1),
            budget_bytes_per_second,
            accumulated_bytes: 0,
            accumulated_loss: 0.0,
            ticks: 0,
            active_players: 0,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    /// Number of connected players the per-player share is split across
    pub fn set_active_players(&mut self, players: usize) {
        self.active_players = players;
    }

    /// Account one tick using the snapshot's serialized size
    pub fn record_snapshot(&mut self, snapshot: &Snapshot) -> Option<BandwidthSample> {
        let loss = Self::estimate_quantization_loss(snapshot);
        self.record_tick(snapshot.encoded_len() as u64, loss)
    }

    /// Account one tick using the bytes actually written to clients
    pub fn record_sent(&mut self, bytes: u64, snapshot: &Snapshot) -> Option<BandwidthSample> {
        let loss = Self::estimate_quantization_loss(snapshot);
        self.record_tick(bytes, loss)
    }

    fn record_tick(&mut self, bytes: u64, loss: f64) -> Option<BandwidthSample> {
        self.accumulated_bytes += bytes;
        self.accumulated_loss += loss;
        self.ticks += 1;

        if self.ticks < self.tick_rate {
            return None;
        }

        let sample = BandwidthSample {
            timestamp: unix_millis(),
            bytes_per_second: self.accumulated_bytes,
            bytes_per_player: self.accumulated_bytes / self.player_divisor(),
            quantization_loss: self.accumulated_loss,
        };
        self.accumulated_bytes = 0;
        self.accumulated_loss = 0.0;
        self.ticks = 0;

        if sample.bytes_per_second > self.budget_bytes_per_second {
            warn!(
                bytes_per_second = sample.bytes_per_second,
                budget = self.budget_bytes_per_second,
                "Outbound bandwidth over budget"
            );
        } else {
            debug!(bytes_per_second = sample.bytes_per_second, "Bandwidth sample");
        }

        self.samples.push_back(sample.clone());
        while self.samples.len() > SAMPLE_WINDOW {
            self.samples.pop_front();
        }

        Some(sample)
    }

    fn player_divisor(&self) -> u64 {
        self.active_players.max(1) as u64
    }

    /// Squared error from rounding each player's leading vector components to
    /// two decimals. Cheap proxy for what a fixed-point wire format would lose.
    pub fn estimate_quantization_loss(snapshot: &Snapshot) -> f64 {
        snapshot
            .players
            .iter()
            .flat_map(|p| p.encoded_vector().into_iter().take(QUANTIZED_COMPONENTS))
            .map(|v| {
                let err = v - (v * 100.0).round() / 100.0;
                err * err
            })
            .sum()
    }

    pub fn samples(&self) -> impl Iterator<Item = &BandwidthSample> {
        self.samples.iter()
    }

    pub fn get_stats(&self) -> BandwidthStats {
        let count = self.samples.len() as u64;
        let total: u64 = self.samples.iter().map(|s| s.bytes_per_second).sum();
        let avg = if count == 0 { 0 } else { total / count };
        let peak = self
            .samples
            .iter()
            .map(|s| s.bytes_per_second)
            .max()
            .unwrap_or(0);

        BandwidthStats {
            avg_bytes_per_second: avg,
            peak_bytes_per_second: peak,
            estimated_bytes_per_player: avg / self.player_divisor(),
            within_budget: avg <= self.budget_bytes_per_second,
            budget_bytes_per_second: self.budget_bytes_per_second,
            sample_count: self.samples.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::record::{StateRecord, POSITION_FIELD};

    fn snapshot_with(positions: &[[f64; 3]]) -> Snapshot {
        let mut s = Snapshot::new(1);
        for (i, pos) in positions.iter().enumerate() {
            s.players
                .push(StateRecord::new(format!("p{i}")).with(POSITION_FIELD, *pos));
        }
        s
    }

    #[test]
    fn one_sample_per_second_of_ticks() {
        let mut monitor = BandwidthMonitor::new(4, 1_000_000);
        let mut emitted = 0;
        for _ in 0..12 {
            if monitor.record_sent(100, &Snapshot::default()).is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 3);
        assert!(monitor.samples().all(|s| s.bytes_per_second == 400));
    }

    #[test]
    fn window_holds_a_minute() {
        let mut monitor = BandwidthMonitor::new(1, 1_000_000);
        for _ in 0..(SAMPLE_WINDOW + 10) {
            monitor.record_sent(10, &Snapshot::default());
        }
        assert_eq!(monitor.get_stats().sample_count, SAMPLE_WINDOW);
    }

    #[test]
    fn per_player_uses_active_count() {
        let mut monitor = BandwidthMonitor::new(1, 1_000_000);
        monitor.set_active_players(4);
        let sample = monitor.record_sent(1000, &Snapshot::default()).unwrap();
        assert_eq!(sample.bytes_per_player, 250);

        monitor.set_active_players(0);
        let sample = monitor.record_sent(1000, &Snapshot::default()).unwrap();
        assert_eq!(sample.bytes_per_player, 1000);
    }

    #[test]
    fn stats_report_budget() {
        let mut monitor = BandwidthMonitor::new(1, 150);
        monitor.record_sent(100, &Snapshot::default());
        monitor.record_sent(300, &Snapshot::default());
        let stats = monitor.get_stats();
        assert_eq!(stats.avg_bytes_per_second, 200);
        assert_eq!(stats.peak_bytes_per_second, 300);
        assert!(!stats.within_budget);

        let empty = BandwidthMonitor::new(30, 150).get_stats();
        assert_eq!(empty.avg_bytes_per_second, 0);
        assert!(empty.within_budget);
    }

    #[test]
    fn quantization_loss_of_exact_values_is_zero() {
        let exact = snapshot_with(&[[1.25, 2.5, 3.0]]);
        assert_eq!(BandwidthMonitor::estimate_quantization_loss(&exact), 0.0);

        let lossy = snapshot_with(&[[1.004, 0.0, 0.0], [0.0, 0.0, 2.003]]);
        let loss = BandwidthMonitor::estimate_quantization_loss(&lossy);
        let expected = 0.004f64.powi(2) + 0.003f64.powi(2);
        assert!((loss - expected).abs() < 1e-9);
    }

    #[test]
    fn snapshot_bytes_are_counted() {
        let mut monitor = BandwidthMonitor::new(1, 1_000_000);
        let snapshot = snapshot_with(&[[1.0, 2.0, 3.0]]);
        let sample = monitor.record_snapshot(&snapshot).unwrap();
        assert_eq!(sample.bytes_per_second, snapshot.encoded_len() as u64);
    }
}
