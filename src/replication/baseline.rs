//! Per-client acknowledged snapshot tracking

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use tracing::debug;

use super::delta::{encode_snapshot, SnapshotDelta};
use super::record::Snapshot;

struct SentSnapshot {
    snapshot: Snapshot,
    sent_at: u64,
}

/// Keeps recently sent snapshots and which one each client has acknowledged.
///
/// A client's base is the newest snapshot it acked that is still in history.
/// Once that snapshot falls out of history the client gets a full snapshot.
pub struct ClientBaselines<K> {
    history: VecDeque<SentSnapshot>,
    capacity: usize,
    acked: HashMap<K, u64>,
}

impl<K: Eq + Hash + Clone> ClientBaselines<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            acked: HashMap::new(),
        }
    }

    /// Remember a snapshot that went out at `sent_at` (unix ms)
    pub fn push_sent(&mut self, snapshot: &Snapshot, sent_at: u64) {
        self.history.push_back(SentSnapshot {
            snapshot: snapshot.clone(),
            sent_at,
        });
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// Record a client's ack and return when the acked snapshot was sent.
    /// `None` when the tick is no longer in history.
    pub fn ack(&mut self, client: &K, tick: u64) -> Option<u64> {
        let sent_at = self.find(tick)?.sent_at;

        match self.acked.get_mut(client) {
            Some(current) if *current >= tick => {
                debug!(tick, current = *current, "Ignoring stale ack");
            }
            Some(current) => *current = tick,
            None => {
                self.acked.insert(client.clone(), tick);
            }
        }
        Some(sent_at)
    }

    /// Last acknowledged tick for a client, if any
    pub fn acked_tick(&self, client: &K) -> Option<u64> {
        self.acked.get(client).copied()
    }

    /// Snapshot to diff against for a client
    pub fn base_for(&self, client: &K) -> Option<&Snapshot> {
        self.acked
            .get(client)
            .and_then(|tick| self.find(*tick))
            .map(|sent| &sent.snapshot)
    }

    /// Encode `current` for one client against its acknowledged base
    pub fn encode_for(&self, client: &K, current: &Snapshot) -> SnapshotDelta {
        encode_snapshot(current, self.base_for(client))
    }

    /// Drop everything known about a client
    pub fn forget(&mut self, client: &K) {
        self.acked.remove(client);
    }

    pub fn tracked_clients(&self) -> usize {
        self.acked.len()
    }

    fn find(&self, tick: u64) -> Option<&SentSnapshot> {
        // History is appended in tick order
        self.history
            .binary_search_by_key(&tick, |s| s.snapshot.tick)
            .ok()
            .and_then(|idx| self.history.get(idx))
    }
}
