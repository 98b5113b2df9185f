//! Append-only causal event log with query and replay

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::time::unix_millis;

use super::record::FieldValue;
use super::CodecError;

/// Default number of events kept before FIFO eviction
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// Version tag written into serialized logs
const LOG_FORMAT_VERSION: u32 = 1;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    EntitySpawned,
    EntityDestroyed,
    /// Any event published on the world bus
    Custom(String),
}

impl EventKind {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EntitySpawned => "entity.spawned",
            Self::EntityDestroyed => "entity.destroyed",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "entity.spawned" => Self::EntitySpawned,
            "entity.destroyed" => Self::EntityDestroyed,
            _ => Self::Custom(name),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Causal linkage attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causal_event_id: Option<u64>,
}

impl EventMeta {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn source_app(mut self, app: impl Into<String>) -> Self {
        self.source_app = Some(app.into());
        self
    }

    pub fn source_entity(mut self, entity: impl Into<String>) -> Self {
        self.source_entity = Some(entity.into());
        self
    }

    pub fn caused_by(mut self, event_id: u64) -> Self {
        self.causal_event_id = Some(event_id);
        self
    }
}

/// One recorded occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(default)]
    pub tick: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: FieldValue,
    #[serde(default)]
    pub meta: EventMeta,
}

/// Query filter. Every set field must match, unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub tick: Option<u64>,
    /// Inclusive on both ends
    pub tick_range: Option<(u64, u64)>,
    pub actor: Option<String>,
    pub entity: Option<String>,
    pub app: Option<String>,
}

impl EventFilter {
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn tick_range(mut self, from: u64, to: u64) -> Self {
        self.tick_range = Some((from, to));
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.kind.as_ref().is_some_and(|k| *k != event.kind) {
            return false;
        }
        if self.tick.is_some_and(|t| t != event.tick) {
            return false;
        }
        if let Some((from, to)) = self.tick_range {
            if event.tick < from || event.tick > to {
                return false;
            }
        }
        meta_matches(&self.actor, &event.meta.actor)
            && meta_matches(&self.entity, &event.meta.source_entity)
            && meta_matches(&self.app, &event.meta.source_app)
    }
}

fn meta_matches(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => actual.as_deref() == Some(wanted.as_str()),
    }
}

/// Errors raised by a runtime while applying a replayed event
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("event carries no entity id")]
    MissingEntityId,

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("entity already exists: {0}")]
    DuplicateEntity(String),

    #[error("runtime rejected event: {0}")]
    Rejected(String),
}

/// The world side that replayed events are applied to
pub trait ReplayRuntime {
    fn spawn_entity(&mut self, data: &FieldValue) -> Result<(), ReplayError>;

    fn destroy_entity(&mut self, entity_id: &str) -> Result<(), ReplayError>;

    /// Re-publish a custom bus event
    fn emit(&mut self, name: &str, data: &FieldValue) -> Result<(), ReplayError>;
}

/// Which part of the log to replay
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub from_tick: Option<u64>,
    pub to_tick: Option<u64>,
    pub filter: Option<EventFilter>,
}

/// A single event that failed to apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayFailure {
    pub event_id: u64,
    pub message: String,
}

/// Outcome of a replay run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub events_replayed: usize,
    pub errors: Vec<ReplayFailure>,
}

#[derive(Serialize, Deserialize)]
struct LogEnvelope {
    version: u32,
    #[serde(default = "default_max_size")]
    max_size: usize,
    events: Vec<Event>,
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

/// Append-only log of world events
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<Event>,
    max_size: usize,
    next_id: u64,
    current_tick: u64,
    paused: bool,
}

impl EventLog {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_size: max_size.max(1),
            next_id: 1,
            current_tick: 0,
            paused: false,
        }
    }

    /// Tick stamped on events recorded without an explicit tick
    pub fn set_tick(&mut self, tick: u64) {
        self.current_tick = tick;
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Append an event at the current tick. Returns `None` while paused.
    pub fn record(&mut self, kind: EventKind, data: FieldValue, meta: EventMeta) -> Option<Event> {
        self.record_at(self.current_tick, kind, data, meta)
    }

    /// Append an event at an explicit tick. Returns `None` while paused.
    pub fn record_at(
        &mut self,
        tick: u64,
        kind: EventKind,
        data: FieldValue,
        meta: EventMeta,
    ) -> Option<Event> {
        if self.paused {
            return None;
        }

        let event = Event {
            id: self.next_id,
            tick,
            timestamp: unix_millis(),
            kind,
            data,
            meta,
        };
        self.next_id += 1;

        self.events.push_back(event.clone());
        while self.events.len() > self.max_size {
            if let Some(evicted) = self.events.pop_front() {
                debug!(event_id = evicted.id, "Evicted oldest event");
            }
        }

        Some(event)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop history. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn get(&self, id: u64) -> Option<&Event> {
        // Ids are strictly increasing, so the deque is sorted by id
        self.events
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .and_then(|idx| self.events.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn query(&self, filter: &EventFilter) -> Vec<&Event> {
        self.events.iter().filter(|e| filter.matches(e)).collect()
    }

    /// Number of retained events per kind
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.kind.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// The event followed by its causes, newest first, up to the root.
    ///
    /// Stops at causes that were evicted or at a link that does not point
    /// to an older event.
    pub fn causal_chain(&self, event_id: u64) -> Vec<&Event> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = self.get(event_id);

        while let Some(event) = cursor {
            if !visited.insert(event.id) {
                break;
            }
            chain.push(event);
            cursor = match event.meta.causal_event_id {
                Some(cause) if cause < event.id => self.get(cause),
                _ => None,
            };
        }

        chain
    }

    /// Re-apply events against a runtime, in tick order then id order.
    ///
    /// A failing event is reported and skipped, it never stops the replay.
    pub fn replay<R: ReplayRuntime>(&self, runtime: &mut R, options: &ReplayOptions) -> ReplayReport {
        let mut selected: Vec<&Event> = self
            .events
            .iter()
            .filter(|e| options.from_tick.map_or(true, |from| e.tick >= from))
            .filter(|e| options.to_tick.map_or(true, |to| e.tick <= to))
            .filter(|e| options.filter.as_ref().map_or(true, |f| f.matches(e)))
            .collect();
        selected.sort_by_key(|e| (e.tick, e.id));

        let mut report = ReplayReport::default();
        for event in selected {
            match apply_event(runtime, event) {
                Ok(()) => report.events_replayed += 1,
                Err(e) => {
                    warn!(event_id = event.id, kind = %event.kind, error = %e, "Replay of event failed");
                    report.errors.push(ReplayFailure {
                        event_id: event.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        report
    }

    pub fn serialize(&self) -> Result<String, CodecError> {
        let envelope = LogEnvelope {
            version: LOG_FORMAT_VERSION,
            max_size: self.max_size,
            events: self.events.iter().cloned().collect(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn deserialize(json: &str) -> Result<Self, CodecError> {
        let envelope: LogEnvelope = serde_json::from_str(json)?;
        if envelope.version > LOG_FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope.version));
        }

        let mut log = Self::new(envelope.max_size);
        log.next_id = envelope.events.iter().map(|e| e.id).max().map_or(1, |max| max + 1);
        log.current_tick = envelope.events.iter().map(|e| e.tick).max().unwrap_or(0);

        let mut events = envelope.events;
        events.sort_by_key(|e| e.id);
        log.events = events.into();
        while log.events.len() > log.max_size {
            log.events.pop_front();
        }

        Ok(log)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

fn apply_event<R: ReplayRuntime>(runtime: &mut R, event: &Event) -> Result<(), ReplayError> {
    match &event.kind {
        EventKind::EntitySpawned => runtime.spawn_entity(&event.data),
        EventKind::EntityDestroyed => {
            let id = entity_id_of(event).ok_or(ReplayError::MissingEntityId)?;
            runtime.destroy_entity(id)
        }
        EventKind::Custom(name) => runtime.emit(name, &event.data),
    }
}

fn entity_id_of(event: &Event) -> Option<&str> {
    let from_data = match &event.data {
        FieldValue::Text(id) => Some(id.as_str()),
        FieldValue::Record(fields) => fields.get("id").and_then(FieldValue::as_str),
        _ => None,
    };
    from_data.or(event.meta.source_entity.as_deref())
}
