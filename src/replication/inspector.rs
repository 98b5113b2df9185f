//! Prediction correction and desync diagnostics

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::util::time::unix_millis;

use super::record::{field_equals, FieldValue, RecordId, StateRecord};

/// Trailing window used by every aggregate
pub const STATS_WINDOW_MS: u64 = 5_000;

/// Capacity of the correction notification channel
const NOTIFY_CAPACITY: usize = 256;

/// A client prediction the server had to overrule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionRecord {
    pub player_id: RecordId,
    pub predicted: Vec<f64>,
    pub actual: Vec<f64>,
    pub magnitude: f64,
    pub ts: u64,
}

/// One point of a per-player time series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedSample {
    pub player_id: RecordId,
    pub value: f64,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub from: Option<FieldValue>,
    pub to: Option<FieldValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectorSummary {
    pub correction_rate: f64,
    pub avg_divergence: f64,
    pub avg_snapshot_delay_ms: f64,
    pub corrections_retained: usize,
    /// Most recent input buffer depth reported per player
    pub input_buffer_depth: BTreeMap<String, f64>,
}

/// Rolling history of corrections, divergence, input buffering and snapshot delay
pub struct StateInspector {
    max_history: usize,
    corrections: VecDeque<CorrectionRecord>,
    divergence: VecDeque<TimedSample>,
    input_buffer: VecDeque<TimedSample>,
    snapshot_delay: VecDeque<TimedSample>,
    notify: broadcast::Sender<CorrectionRecord>,
}

impl StateInspector {
    pub fn new(max_history: usize) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            max_history: max_history.max(1),
            corrections: VecDeque::new(),
            divergence: VecDeque::new(),
            input_buffer: VecDeque::new(),
            snapshot_delay: VecDeque::new(),
            notify,
        }
    }

    /// Receive every correction as it is recorded. Lagging receivers drop
    /// old notifications instead of holding up the recorder.
    pub fn subscribe(&self) -> broadcast::Receiver<CorrectionRecord> {
        self.notify.subscribe()
    }

    pub fn record_correction(
        &mut self,
        player_id: impl Into<RecordId>,
        predicted: &[f64],
        actual: &[f64],
        magnitude: f64,
    ) -> CorrectionRecord {
        let record = CorrectionRecord {
            player_id: player_id.into(),
            predicted: predicted.to_vec(),
            actual: actual.to_vec(),
            magnitude,
            ts: unix_millis(),
        };
        self.push_correction(record.clone());
        record
    }

    fn push_correction(&mut self, record: CorrectionRecord) {
        debug!(player_id = %record.player_id, magnitude = record.magnitude, "Prediction corrected");
        push_capped(&mut self.corrections, record.clone(), self.max_history);
        // No subscribers is fine
        let _ = self.notify.send(record);
    }

    pub fn record_divergence(&mut self, player_id: impl Into<RecordId>, magnitude: f64) {
        let sample = timed(player_id, magnitude, unix_millis());
        push_capped(&mut self.divergence, sample, self.max_history);
    }

    pub fn record_input_buffer_depth(&mut self, player_id: impl Into<RecordId>, depth: usize) {
        let sample = timed(player_id, depth as f64, unix_millis());
        push_capped(&mut self.input_buffer, sample, self.max_history);
    }

    pub fn record_snapshot_delay(&mut self, player_id: impl Into<RecordId>, delay_ms: f64) {
        let sample = timed(player_id, delay_ms, unix_millis());
        push_capped(&mut self.snapshot_delay, sample, self.max_history);
    }

    pub fn corrections(&self) -> impl Iterator<Item = &CorrectionRecord> {
        self.corrections.iter()
    }

    pub fn corrections_for<'a>(
        &'a self,
        player_id: &'a RecordId,
    ) -> impl Iterator<Item = &'a CorrectionRecord> + 'a {
        self.corrections.iter().filter(move |c| &c.player_id == player_id)
    }

    /// Corrections per second over the trailing window
    pub fn correction_rate(&self) -> f64 {
        self.correction_rate_at(unix_millis())
    }

    pub fn correction_rate_at(&self, now: u64) -> f64 {
        let count = self
            .corrections
            .iter()
            .filter(|c| in_window(c.ts, now))
            .count();
        count as f64 / (STATS_WINDOW_MS as f64 / 1000.0)
    }

    pub fn avg_divergence(&self) -> f64 {
        self.avg_divergence_at(unix_millis())
    }

    pub fn avg_divergence_at(&self, now: u64) -> f64 {
        windowed_mean(&self.divergence, now)
    }

    pub fn avg_snapshot_delay(&self) -> f64 {
        self.avg_snapshot_delay_at(unix_millis())
    }

    pub fn avg_snapshot_delay_at(&self, now: u64) -> f64 {
        windowed_mean(&self.snapshot_delay, now)
    }

    pub fn summary(&self) -> InspectorSummary {
        let now = unix_millis();
        let mut input_buffer_depth = BTreeMap::new();
        for sample in &self.input_buffer {
            input_buffer_depth.insert(sample.player_id.to_string(), sample.value);
        }

        InspectorSummary {
            correction_rate: self.correction_rate_at(now),
            avg_divergence: self.avg_divergence_at(now),
            avg_snapshot_delay_ms: self.avg_snapshot_delay_at(now),
            corrections_retained: self.corrections.len(),
            input_buffer_depth,
        }
    }
}

/// Field-wise difference over the union of both records' fields
pub fn generate_diff(a: &StateRecord, b: &StateRecord) -> BTreeMap<String, FieldDiff> {
    let keys: BTreeSet<&String> = a.fields.keys().chain(b.fields.keys()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let from = a.fields.get(key);
            let to = b.fields.get(key);
            let same = match (from, to) {
                (Some(x), Some(y)) => field_equals(x, y),
                _ => false,
            };
            (!same).then(|| {
                (
                    key.clone(),
                    FieldDiff {
                        from: from.cloned(),
                        to: to.cloned(),
                    },
                )
            })
        })
        .collect()
}

fn timed(player_id: impl Into<RecordId>, value: f64, ts: u64) -> TimedSample {
    TimedSample {
        player_id: player_id.into(),
        value,
        ts,
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    buf.push_back(item);
    while buf.len() > cap {
        buf.pop_front();
    }
}

fn in_window(ts: u64, now: u64) -> bool {
    now.saturating_sub(ts) <= STATS_WINDOW_MS
}

fn windowed_mean(samples: &VecDeque<TimedSample>, now: u64) -> f64 {
    let (sum, count) = samples
        .iter()
        .filter(|s| in_window(s.ts, now))
        .fold((0.0, 0usize), |(sum, count), s| (sum + s.value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
