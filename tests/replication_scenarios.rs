//! End-to-end replication scenarios across the public API

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::broadcast;

use world_sync_server::app::{run_session, AppState};
use world_sync_server::config::Config;
use world_sync_server::net::request::{RequestError, Requester};
use world_sync_server::net::transport::{next_event, ChannelTransport, Transport, TransportEvent};
use world_sync_server::net::{ConnectionPool, Packet};
use world_sync_server::replication::{
    decode, decode_snapshot, encode, EventFilter, EventKind, EventLog, EventMeta, FieldValue,
    ReplayOptions, Snapshot, SnapshotDelta, StateRecord,
};
use world_sync_server::world::{SandboxWorld, WorldHost};
use world_sync_server::ws::protocol::{Welcome, ACK, SNAPSHOT, WELCOME};

fn record(hp: i32, pos: [f64; 3]) -> StateRecord {
    StateRecord::new("p1").with("hp", hp).with("pos", pos)
}

#[test]
fn unchanged_record_encodes_to_nothing() {
    let prev = record(10, [0.0, 0.0, 0.0]);
    let curr = record(10, [0.0, 0.0, 0.0]);
    assert!(encode(&curr, Some(&prev)).is_none());
}

#[test]
fn changed_fields_round_trip_through_delta() {
    let prev = record(10, [0.0, 0.0, 0.0]);
    let curr = record(8, [1.0, 0.0, 0.0]);

    let delta = encode(&curr, Some(&prev));
    let wire = serde_json::to_value(&delta).unwrap();
    assert_eq!(wire["record"]["hp"], json!(8.0));
    assert_eq!(wire["record"]["pos"], json!([1.0, 0.0, 0.0]));

    assert_eq!(decode(delta.as_ref(), &prev), curr);
}

#[test]
fn bounded_log_keeps_newest_events() {
    let mut log = EventLog::new(3);
    for name in ["A", "B", "C", "D"] {
        log.record(EventKind::custom(name), FieldValue::Null, EventMeta::default());
    }

    let kinds: Vec<&str> = log
        .query(&EventFilter::default())
        .into_iter()
        .map(|e| e.kind.as_str())
        .collect();
    assert_eq!(kinds, vec!["B", "C", "D"]);
}

#[tokio::test]
async fn unanswered_request_times_out_promptly() {
    let (client, _server) = ChannelTransport::pair();
    let requester = Requester::new(Arc::new(client), "client");

    let started = Instant::now();
    let result: Result<serde_json::Value, _> = requester
        .send("server", "never_answered", &json!({}), Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(RequestError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(requester.pending_count(), 0);
}

#[test]
fn pool_refuses_past_capacity() {
    let pool = ConnectionPool::new(2);
    let mut keep = Vec::new();
    let mut add = |id: &str| {
        let (server, client) = ChannelTransport::pair();
        keep.push(client);
        pool.add(id.into(), Arc::new(server))
    };

    assert!(add("a"));
    assert!(add("b"));
    assert!(!add("c"));
    assert_eq!(pool.len(), 2);
}

#[test]
fn logged_world_replays_into_a_fresh_world() {
    use world_sync_server::world::Simulation;

    let mut source = SandboxWorld::new(11);
    let mut log = EventLog::default();
    for tick in 1..=600 {
        source.step(tick, 1.0 / 30.0);
        log.set_tick(tick);
        for event in source.drain_events() {
            log.record(event.kind, event.data, event.meta);
        }
    }

    let mut target = SandboxWorld::new(0);
    let report = log.replay(&mut target, &ReplayOptions::default());
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.events_replayed, log.len());
    assert_eq!(target.entity_count(), source.entity_count());

    let restored = EventLog::deserialize(&log.serialize().unwrap()).unwrap();
    let partial = restored.replay(
        &mut SandboxWorld::new(0),
        &ReplayOptions {
            to_tick: Some(120),
            ..ReplayOptions::default()
        },
    );
    assert_eq!(partial.events_replayed, 2);
}

async fn next_message(
    events: &mut broadcast::Receiver<TransportEvent>,
    name: &'static str,
) -> Packet {
    match next_event(events, Duration::from_secs(2), |e| {
        matches!(e, TransportEvent::Message(p) if p.name() == Some(name))
    })
    .await
    {
        Some(TransportEvent::Message(packet)) => packet,
        other => panic!("expected {name}, got {other:?}"),
    }
}

#[tokio::test]
async fn loopback_client_tracks_the_world() {
    let config = Config {
        tick_rate: 20,
        ..Config::default()
    };
    let (state, world_rx) = AppState::new(config);
    let mut host = WorldHost::new(
        SandboxWorld::new(5),
        state.services.clone(),
        state.pool.clone(),
        world_rx,
        16,
    );

    let (server, client) = ChannelTransport::pair();
    let server: Arc<dyn Transport> = Arc::new(server);
    let mut client_events = client.subscribe();
    let server_events = server.subscribe();
    tokio::spawn(run_session(state.clone(), server, server_events));

    let welcome: Welcome = next_message(&mut client_events, WELCOME)
        .await
        .decode_data()
        .unwrap();
    assert_eq!(welcome.tick_rate, 20);

    // Let the session's join reach the world before ticking
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut known: Option<Snapshot> = None;
    let mut last_tick = None;
    for _ in 0..5 {
        let outcome = host.run_tick().await;
        let delta: SnapshotDelta = next_message(&mut client_events, SNAPSHOT)
            .await
            .decode_data()
            .unwrap();
        assert_eq!(delta.tick, outcome.tick);
        assert_eq!(delta.base_tick, last_tick);

        let rebuilt = decode_snapshot(&delta, known.as_ref());
        assert_eq!(rebuilt.players, outcome.snapshot.players);
        assert_eq!(rebuilt.entities, outcome.snapshot.entities);

        client
            .send(Packet::message(ACK, &json!({ "tick": delta.tick })).unwrap())
            .await;
        // Give the session time to forward the ack before the next tick
        tokio::time::sleep(Duration::from_millis(20)).await;

        last_tick = Some(delta.tick);
        known = Some(rebuilt);
    }

    assert_eq!(state.pool.len(), 1);
    assert_eq!(state.services.current_tick(), 5);
    let summary = state.services.inspector.lock().summary();
    assert!(summary.avg_snapshot_delay_ms >= 0.0);
}
