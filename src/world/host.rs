//! Authoritative tick loop: simulate, log, record, delta-encode and fan out

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net::pool::{ConnectionId, ConnectionPool, FanOutReport};
use crate::net::Packet;
use crate::replication::{
    BandwidthMonitor, ClientBaselines, Event, EventLog, RecordId, RecordingEngine, Snapshot,
    StateInspector,
};
use crate::util::time::{tick_delta, tick_duration, unix_millis};
use crate::ws::protocol::{EVENT, SNAPSHOT};

use super::Simulation;

/// Replication state shared between the tick loop and diagnostics readers.
///
/// Only the host writes to these; HTTP handlers and request responders take
/// short locks to read or to record client reports.
pub struct WorldServices {
    pub event_log: Mutex<EventLog>,
    pub recording: Mutex<RecordingEngine>,
    pub bandwidth: Mutex<BandwidthMonitor>,
    pub inspector: Mutex<StateInspector>,
    tick: AtomicU64,
    tick_rate: u32,
}

impl WorldServices {
    pub fn new(config: &Config) -> Self {
        Self {
            event_log: Mutex::new(EventLog::new(config.event_log_max_size)),
            recording: Mutex::new(RecordingEngine::new(
                config.tick_rate,
                config.recording_window_secs,
            )),
            bandwidth: Mutex::new(BandwidthMonitor::new(
                config.tick_rate,
                config.bandwidth_budget_bps,
            )),
            inspector: Mutex::new(StateInspector::new(config.inspector_max_history)),
            tick: AtomicU64::new(0),
            tick_rate: config.tick_rate,
        }
    }

    /// Last tick the host completed
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }
}

/// Message from a client session to the tick loop
#[derive(Debug, Clone, PartialEq)]
pub struct WorldInput {
    pub conn_id: ConnectionId,
    pub kind: InputKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    Joined,
    Left,
    /// Client applied the snapshot for this tick
    Ack { tick: u64 },
    InputBufferDepth { depth: usize },
}

/// What one tick produced, for tests and tracing
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub tick: u64,
    pub snapshot: Snapshot,
    pub events: Vec<Event>,
    pub report: FanOutReport,
    pub bytes_sent: u64,
}

/// Drives a [`Simulation`] at a fixed rate and replicates it to every
/// joined client in the pool.
pub struct WorldHost<S> {
    sim: S,
    services: Arc<WorldServices>,
    pool: Arc<ConnectionPool>,
    inputs: mpsc::Receiver<WorldInput>,
    baselines: ClientBaselines<ConnectionId>,
    clients: BTreeSet<ConnectionId>,
    tick: u64,
    tick_rate: u32,
}

impl<S: Simulation> WorldHost<S> {
    pub fn new(
        sim: S,
        services: Arc<WorldServices>,
        pool: Arc<ConnectionPool>,
        inputs: mpsc::Receiver<WorldInput>,
        baseline_history: usize,
    ) -> Self {
        let tick_rate = services.tick_rate();
        Self {
            sim,
            services,
            pool,
            inputs,
            baselines: ClientBaselines::new(baseline_history),
            clients: BTreeSet::new(),
            tick: 0,
            tick_rate,
        }
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Run until `shutdown` flips to true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_rate = self.tick_rate, "World host started");

        let mut ticker = interval(tick_duration(self.tick_rate));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.run_tick().await;
                    if !outcome.report.failed.is_empty() {
                        debug!(
                            tick = outcome.tick,
                            failed = outcome.report.failed.len(),
                            "Some snapshot sends failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(tick = self.tick, "World host stopped");
    }

    /// Advance the world by exactly one tick
    pub async fn run_tick(&mut self) -> TickOutcome {
        self.process_inputs();

        self.tick += 1;
        let tick = self.tick;
        let snapshot = self.sim.step(tick, tick_delta(self.tick_rate));
        let events = self.log_events(tick, &snapshot);

        let (report, bytes_sent) = self.replicate(&snapshot, &events).await;

        self.baselines.push_sent(&snapshot, unix_millis());
        {
            let mut bandwidth = self.services.bandwidth.lock();
            bandwidth.set_active_players(self.clients.len());
            bandwidth.record_sent(bytes_sent, &snapshot);
        }
        self.services.tick.store(tick, Ordering::Release);

        TickOutcome {
            tick,
            snapshot,
            events,
            report,
            bytes_sent,
        }
    }

    /// Drain everything sessions sent since the last tick
    fn process_inputs(&mut self) {
        while let Ok(input) = self.inputs.try_recv() {
            let player_id = RecordId::from(input.conn_id.as_str());
            match input.kind {
                InputKind::Joined => {
                    self.sim.add_player(&player_id);
                    self.clients.insert(input.conn_id);
                }
                InputKind::Left => {
                    self.sim.remove_player(&player_id);
                    self.baselines.forget(&input.conn_id);
                    self.clients.remove(&input.conn_id);
                }
                InputKind::Ack { tick } => match self.baselines.ack(&input.conn_id, tick) {
                    Some(sent_at) => {
                        let delay_ms = unix_millis().saturating_sub(sent_at) as f64;
                        self.services
                            .inspector
                            .lock()
                            .record_snapshot_delay(player_id, delay_ms);
                    }
                    None => {
                        debug!(conn_id = %input.conn_id, tick, "Ack for unknown tick");
                    }
                },
                InputKind::InputBufferDepth { depth } => {
                    self.services
                        .inspector
                        .lock()
                        .record_input_buffer_depth(player_id, depth);
                }
            }
        }
    }

    /// Write simulation events to the log and the recording
    fn log_events(&mut self, tick: u64, snapshot: &Snapshot) -> Vec<Event> {
        let mut logged = Vec::new();
        {
            let mut log = self.services.event_log.lock();
            log.set_tick(tick);
            for event in self.sim.drain_events() {
                if let Some(event) = log.record(event.kind, event.data, event.meta) {
                    logged.push(event);
                }
            }
        }

        let mut recording = self.services.recording.lock();
        // Snapshot first so timeline events carry this tick
        recording.record_snapshot(tick, snapshot);
        for event in &logged {
            recording.record_event(event.kind.as_str(), event.data.clone());
        }

        logged
    }

    /// Per-client delta against each client's acked base, then the tick's events
    async fn replicate(&mut self, snapshot: &Snapshot, events: &[Event]) -> (FanOutReport, u64) {
        let (snapshot_targets, snapshot_bytes) = self.snapshot_targets(snapshot);
        let (event_targets, event_bytes) = self.event_targets(events);

        let mut report = self.pool.fan_out(snapshot_targets).await;
        if !event_targets.is_empty() {
            let event_report = self.pool.fan_out(event_targets).await;
            for id in event_report.failed {
                if !report.failed.contains(&id) {
                    report.failed.push(id);
                }
            }
        }

        (report, snapshot_bytes + event_bytes)
    }

    fn snapshot_targets(&self, snapshot: &Snapshot) -> (Vec<(ConnectionId, Packet)>, u64) {
        let mut bytes = 0u64;
        let mut targets = Vec::with_capacity(self.clients.len());

        for conn_id in &self.clients {
            let delta = self.baselines.encode_for(conn_id, snapshot);
            // Nothing changed since the client's base
            if delta.is_noop() {
                continue;
            }
            match Packet::message(SNAPSHOT, &delta) {
                Ok(packet) => {
                    bytes += encoded_len(&packet);
                    targets.push((conn_id.clone(), packet));
                }
                Err(e) => warn!(conn_id = %conn_id, error = %e, "Failed to encode snapshot"),
            }
        }

        (targets, bytes)
    }

    fn event_targets(&self, events: &[Event]) -> (Vec<(ConnectionId, Packet)>, u64) {
        let mut bytes = 0u64;
        let mut targets = Vec::with_capacity(events.len() * self.clients.len());

        for event in events {
            let packet = match Packet::message(EVENT, event) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(event_id = event.id, error = %e, "Failed to encode event");
                    continue;
                }
            };
            let len = encoded_len(&packet);
            for conn_id in &self.clients {
                bytes += len;
                targets.push((conn_id.clone(), packet.clone()));
            }
        }

        (targets, bytes)
    }
}

fn encoded_len(packet: &Packet) -> u64 {
    packet.encode().map(|text| text.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{ChannelTransport, StalledTransport, Transport, TransportEvent};
    use crate::replication::{decode_snapshot, EventKind, SnapshotDelta};
    use crate::world::sandbox::{SandboxWorld, SPAWN_INTERVAL_TICKS};

    fn host(pool: Arc<ConnectionPool>) -> (WorldHost<SandboxWorld>, mpsc::Sender<WorldInput>) {
        let config = Config {
            tick_rate: 10,
            ..Config::default()
        };
        let services = Arc::new(WorldServices::new(&config));
        let (tx, rx) = mpsc::channel(64);
        (
            WorldHost::new(SandboxWorld::new(42), services, pool, rx, 8),
            tx,
        )
    }

    fn input(id: &str, kind: InputKind) -> WorldInput {
        WorldInput {
            conn_id: id.into(),
            kind,
        }
    }

    fn snapshots(rx: &mut tokio::sync::broadcast::Receiver<TransportEvent>) -> Vec<SnapshotDelta> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Message(packet) = event {
                if packet.name() == Some(SNAPSHOT) {
                    out.push(packet.decode_data().unwrap());
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn first_snapshot_is_full_then_deltas_after_ack() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (server, client) = ChannelTransport::pair();
        pool.add("c1".into(), Arc::new(server));
        let mut rx = client.subscribe();

        let (mut host, tx) = host(pool);
        tx.send(input("c1", InputKind::Joined)).await.unwrap();

        let first = host.run_tick().await;
        assert_eq!(first.report.delivered, vec![ConnectionId::from("c1")]);
        let received = snapshots(&mut rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].base_tick, None);
        assert_eq!(received[0].players.added.len(), 1);

        let base = decode_snapshot(&received[0], None);
        tx.send(input("c1", InputKind::Ack { tick: first.tick }))
            .await
            .unwrap();
        let second = host.run_tick().await;
        let received = snapshots(&mut rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].base_tick, Some(first.tick));

        let rebuilt = decode_snapshot(&received[0], Some(&base));
        assert_eq!(rebuilt.players, second.snapshot.players);
        assert!(host.services.inspector.lock().summary().avg_snapshot_delay_ms >= 0.0);
    }

    #[tokio::test]
    async fn events_are_logged_recorded_and_sent() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (server, client) = ChannelTransport::pair();
        pool.add("c1".into(), Arc::new(server));
        let mut rx = client.subscribe();

        let (mut host, tx) = host(pool);
        tx.send(input("c1", InputKind::Joined)).await.unwrap();

        let first = host.run_tick().await;
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].kind, EventKind::custom("player.joined"));
        assert_eq!(first.events[0].tick, 1);

        let mut saw_event = false;
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Message(packet) = event {
                saw_event |= packet.name() == Some(EVENT);
            }
        }
        assert!(saw_event);

        for _ in 1..SPAWN_INTERVAL_TICKS {
            host.run_tick().await;
        }
        let log = host.services.event_log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().last().unwrap().tick, SPAWN_INTERVAL_TICKS);
        drop(log);

        let recording = host.services.recording.lock();
        assert_eq!(recording.event_count(), 2);
        assert_eq!(recording.latest_tick(), Some(SPAWN_INTERVAL_TICKS));
    }

    #[tokio::test]
    async fn leaving_client_stops_receiving() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (server, _client) = ChannelTransport::pair();
        pool.add("c1".into(), Arc::new(server));

        let (mut host, tx) = host(pool);
        tx.send(input("c1", InputKind::Joined)).await.unwrap();
        host.run_tick().await;
        assert_eq!(host.client_count(), 1);

        tx.send(input("c1", InputKind::Left)).await.unwrap();
        let outcome = host.run_tick().await;
        assert_eq!(host.client_count(), 0);
        assert!(outcome.report.delivered.is_empty());
        assert_eq!(host.simulation().player_count(), 0);
    }

    #[tokio::test]
    async fn input_buffer_depth_reaches_inspector() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (mut host, tx) = host(pool);
        tx.send(input("c1", InputKind::InputBufferDepth { depth: 4 }))
            .await
            .unwrap();
        host.run_tick().await;

        let summary = host.services.inspector.lock().summary();
        assert_eq!(summary.input_buffer_depth.get("c1"), Some(&4.0));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (host, _tx) = host(pool);
        let services = host.services.clone();
        let (stop, stopped) = watch::channel(false);

        let handle = tokio::spawn(host.run(stopped));
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert!(services.current_tick() >= 1);
    }

    #[tokio::test]
    async fn stalled_client_does_not_hold_up_the_tick() {
        let pool = Arc::new(ConnectionPool::new(4));
        let (server, client) = ChannelTransport::pair();
        pool.add("c1".into(), Arc::new(server));
        pool.add("stuck".into(), Arc::new(StalledTransport));
        let mut rx = client.subscribe();

        let (mut host, tx) = host(pool);
        tx.send(input("c1", InputKind::Joined)).await.unwrap();
        tx.send(input("stuck", InputKind::Joined)).await.unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), host.run_tick())
            .await
            .expect("tick completes despite a stalled client");
        assert_eq!(outcome.report.delivered, vec![ConnectionId::from("c1")]);
        assert_eq!(outcome.report.failed, vec![ConnectionId::from("stuck")]);
        assert_eq!(host.services.current_tick(), 1);
        assert_eq!(snapshots(&mut rx).len(), 1);
    }
}
