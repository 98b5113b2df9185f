//! World simulation seam and the authoritative host that replicates it

pub mod host;
pub mod sandbox;

pub use host::{InputKind, TickOutcome, WorldHost, WorldInput, WorldServices};
pub use sandbox::SandboxWorld;

use crate::replication::{EventKind, EventMeta, FieldValue, RecordId, Snapshot};

/// Something the simulation wants written to the event log
#[derive(Debug, Clone, PartialEq)]
pub struct WorldEvent {
    pub kind: EventKind,
    pub data: FieldValue,
    pub meta: EventMeta,
}

impl WorldEvent {
    pub fn new(kind: EventKind, data: impl Into<FieldValue>) -> Self {
        Self {
            kind,
            data: data.into(),
            meta: EventMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// The physics/gameplay side the host drives once per tick
pub trait Simulation: Send + 'static {
    fn add_player(&mut self, player_id: &RecordId);

    fn remove_player(&mut self, player_id: &RecordId);

    /// Advance one tick and return the full authoritative state
    fn step(&mut self, tick: u64, dt: f32) -> Snapshot;

    /// Events produced since the last call
    fn drain_events(&mut self) -> Vec<WorldEvent>;
}
