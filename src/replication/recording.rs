//! Rolling snapshot recorder with an event timeline

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::util::time::unix_millis;

use super::record::{FieldValue, Snapshot};
use super::CodecError;

/// Hard cap on the event timeline
pub const MAX_TIMELINE_EVENTS: usize = 10_000;

/// One recorded tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub tick: u64,
    pub timestamp: u64,
    pub snapshot: Snapshot,
}

/// One entry on the event timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub tick: u64,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: FieldValue,
}

/// Inclusive tick range pulled out of the recorder
#[derive(Debug, Clone, Serialize)]
pub struct Replay {
    pub start_tick: u64,
    pub end_tick: u64,
    /// Wall-clock span covered by the extracted snapshots
    pub duration_ms: u64,
    pub snapshots: Vec<SnapshotFrame>,
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub snapshot_count: usize,
    pub event_count: usize,
    pub tick_rate: u32,
    pub window_secs: u32,
}

#[derive(Serialize, Deserialize)]
struct RecordingEnvelope {
    metadata: RecordingMetadata,
    snapshots: Vec<SnapshotFrame>,
    #[serde(default)]
    events: Vec<TimelineEvent>,
}

/// Keeps the last `window_secs` of snapshots and a longer event timeline
pub struct RecordingEngine {
    snapshots: VecDeque<SnapshotFrame>,
    events: VecDeque<TimelineEvent>,
    tick_rate: u32,
    window_secs: u32,
    recording: bool,
}

impl RecordingEngine {
    pub fn new(tick_rate: u32, window_secs: u32) -> Self {
        Self {
            snapshots: VecDeque::new(),
            events: VecDeque::new(),
            tick_rate: tick_rate.max(1),
            window_secs: window_secs.max(1),
            recording: true,
        }
    }

    /// Maximum number of frames the window holds at the configured tick rate
    pub fn frame_capacity(&self) -> usize {
        (self.window_secs as usize) * (self.tick_rate as usize)
    }

    pub fn start(&mut self) {
        self.recording = true;
    }

    pub fn stop(&mut self) {
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn record_snapshot(&mut self, tick: u64, snapshot: &Snapshot) {
        if !self.recording {
            return;
        }

        self.snapshots.push_back(SnapshotFrame {
            tick,
            timestamp: unix_millis(),
            snapshot: snapshot.clone(),
        });

        let capacity = self.frame_capacity();
        while self.snapshots.len() > capacity {
            self.snapshots.pop_front();
        }
    }

    /// Append to the timeline at the latest recorded tick
    pub fn record_event(&mut self, kind: impl Into<String>, data: FieldValue) {
        if !self.recording {
            return;
        }

        self.events.push_back(TimelineEvent {
            tick: self.latest_tick().unwrap_or(0),
            timestamp: unix_millis(),
            kind: kind.into(),
            data,
        });

        while self.events.len() > MAX_TIMELINE_EVENTS {
            self.events.pop_front();
        }
    }

    pub fn latest_tick(&self) -> Option<u64> {
        self.snapshots.back().map(|f| f.tick)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.events.clear();
    }

    /// Copy out everything between `start_tick` and `end_tick` inclusive
    pub fn get_replay(&self, start_tick: u64, end_tick: u64) -> Replay {
        let snapshots: Vec<SnapshotFrame> = self
            .snapshots
            .iter()
            .filter(|f| f.tick >= start_tick && f.tick <= end_tick)
            .cloned()
            .collect();
        let events: Vec<TimelineEvent> = self
            .events
            .iter()
            .filter(|e| e.tick >= start_tick && e.tick <= end_tick)
            .cloned()
            .collect();

        Replay {
            start_tick,
            end_tick,
            duration_ms: span_ms(snapshots.iter()),
            snapshots,
            events,
        }
    }

    pub fn serialize(&self) -> Result<String, CodecError> {
        let envelope = RecordingEnvelope {
            metadata: RecordingMetadata {
                recorded_at: Utc::now(),
                duration_ms: span_ms(self.snapshots.iter()),
                snapshot_count: self.snapshots.len(),
                event_count: self.events.len(),
                tick_rate: self.tick_rate,
                window_secs: self.window_secs,
            },
            snapshots: self.snapshots.iter().cloned().collect(),
            events: self.events.iter().cloned().collect(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Restore a recording. Buffers come back as stored, nothing is replayed.
    pub fn deserialize(json: &str) -> Result<Self, CodecError> {
        let envelope: RecordingEnvelope = serde_json::from_str(json)?;
        let meta = &envelope.metadata;

        info!(
            recorded_at = %meta.recorded_at,
            snapshots = meta.snapshot_count,
            events = meta.event_count,
            "Loaded recording"
        );

        let mut engine = Self::new(meta.tick_rate, meta.window_secs);
        engine.snapshots = envelope.snapshots.into();
        engine.events = envelope.events.into();
        Ok(engine)
    }
}

fn span_ms<'a>(mut frames: impl DoubleEndedIterator<Item = &'a SnapshotFrame>) -> u64 {
    let first = frames.next().map(|f| f.timestamp);
    let last = frames.next_back().map(|f| f.timestamp);
    match (first, last) {
        (Some(first), Some(last)) => last.saturating_sub(first),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::record::StateRecord;

    fn snapshot(tick: u64) -> Snapshot {
        let mut s = Snapshot::new(tick);
        s.players.push(StateRecord::new("p1").with("tick", tick));
        s
    }

    #[test]
    fn window_is_seconds_times_tick_rate() {
        let mut engine = RecordingEngine::new(10, 2);
        for tick in 1..=50 {
            engine.record_snapshot(tick, &snapshot(tick));
        }
        assert_eq!(engine.snapshot_count(), 20);
        assert_eq!(engine.get_replay(0, 100).snapshots[0].tick, 31);
    }

    #[test]
    fn recorded_snapshot_is_owned_copy() {
        let mut engine = RecordingEngine::new(10, 1);
        let mut live = snapshot(1);
        engine.record_snapshot(1, &live);
        live.players[0].set("tick", 99);

        let replay = engine.get_replay(1, 1);
        assert_eq!(replay.snapshots[0].snapshot, snapshot(1));
    }

    #[test]
    fn events_are_capped() {
        let mut engine = RecordingEngine::new(30, 1);
        for i in 0..(MAX_TIMELINE_EVENTS + 5) {
            engine.record_event("ping", FieldValue::from(i as u64));
        }
        assert_eq!(engine.event_count(), MAX_TIMELINE_EVENTS);
    }

    #[test]
    fn replay_range_is_inclusive_and_read_only() {
        let mut engine = RecordingEngine::new(10, 10);
        for tick in 1..=10 {
            engine.record_snapshot(tick, &snapshot(tick));
            engine.record_event("tick", FieldValue::Null);
        }

        let replay = engine.get_replay(3, 5);
        let ticks: Vec<u64> = replay.snapshots.iter().map(|f| f.tick).collect();
        assert_eq!(ticks, vec![3, 4, 5]);
        assert_eq!(replay.events.len(), 3);
        assert_eq!(engine.snapshot_count(), 10);
        assert_eq!(engine.event_count(), 10);
    }

    #[test]
    fn stopped_engine_ignores_input() {
        let mut engine = RecordingEngine::new(10, 1);
        engine.stop();
        engine.record_snapshot(1, &snapshot(1));
        engine.record_event("x", FieldValue::Null);
        assert_eq!(engine.snapshot_count(), 0);
        assert_eq!(engine.event_count(), 0);
    }

    #[test]
    fn serialize_round_trip() {
        let mut engine = RecordingEngine::new(20, 3);
        engine.record_snapshot(1, &snapshot(1));
        engine.record_snapshot(2, &snapshot(2));
        engine.record_event("spawn", FieldValue::record([("id", "e1")]));

        let json = engine.serialize().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["metadata"]["snapshot_count"], 2);
        assert_eq!(value["metadata"]["event_count"], 1);

        let restored = RecordingEngine::deserialize(&json).unwrap();
        assert_eq!(restored.frame_capacity(), 60);
        assert_eq!(restored.get_replay(0, 10).snapshots, engine.get_replay(0, 10).snapshots);
        assert_eq!(restored.get_replay(0, 10).events, engine.get_replay(0, 10).events);
    }
}
