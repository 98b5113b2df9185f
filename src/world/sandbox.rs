//! Small deterministic world used by the binary and the end-to-end tests

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::replication::{
    record::POSITION_FIELD, EventKind, EventMeta, FieldValue, RecordId, ReplayError,
    ReplayRuntime, Snapshot, StateRecord,
};

use super::{Simulation, WorldEvent};

/// Ticks between crate spawns
pub const SPAWN_INTERVAL_TICKS: u64 = 60;

/// Oldest crate is destroyed once more than this many exist
pub const MAX_CRATES: usize = 8;

/// Players and crates stay within +-ARENA_HALF_EXTENT on both axes
const ARENA_HALF_EXTENT: f64 = 50.0;
const MAX_SPEED: f64 = 5.0;
/// Per-tick random change in velocity
const VELOCITY_JITTER: f64 = 0.5;

const VELOCITY_FIELD: &str = "velocity";
const APP_NAME: &str = "sandbox";

/// Players drift around a square arena while crates appear and expire.
///
/// All randomness comes from a seeded ChaCha8 generator, so two worlds built
/// from the same seed and fed the same joins produce identical snapshots.
pub struct SandboxWorld {
    rng: ChaCha8Rng,
    players: BTreeMap<RecordId, StateRecord>,
    entities: BTreeMap<RecordId, StateRecord>,
    next_crate: u64,
    pending: Vec<WorldEvent>,
    /// Custom events re-published during replay
    emitted: Vec<String>,
}

impl SandboxWorld {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            players: BTreeMap::new(),
            entities: BTreeMap::new(),
            next_crate: 1,
            pending: Vec::new(),
            emitted: Vec::new(),
        }
    }

    pub fn player(&self, id: &RecordId) -> Option<&StateRecord> {
        self.players.get(id)
    }

    pub fn entity(&self, id: &RecordId) -> Option<&StateRecord> {
        self.entities.get(id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Names of custom events emitted through replay, in order
    pub fn emitted(&self) -> &[String] {
        &self.emitted
    }

    fn random_point(&mut self) -> [f64; 3] {
        [
            self.rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
            self.rng.gen_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
            0.0,
        ]
    }

    fn spawn_crate(&mut self, tick: u64) {
        let id = RecordId::new(format!("crate-{:06}", self.next_crate));
        self.next_crate += 1;

        let record = StateRecord::new(id.clone())
            .with("kind", "crate")
            .with("spawned_at", tick)
            .with(POSITION_FIELD, self.random_point());

        let mut data: BTreeMap<String, FieldValue> = record.fields.clone();
        data.insert("id".to_string(), FieldValue::from(id.as_str()));
        self.pending.push(
            WorldEvent::new(EventKind::EntitySpawned, FieldValue::Record(data)).with_meta(
                EventMeta::default()
                    .source_app(APP_NAME)
                    .source_entity(id.as_str())
                    .reason("periodic spawn"),
            ),
        );

        debug!(entity_id = %id, tick, "Crate spawned");
        self.entities.insert(id, record);
    }

    fn expire_oldest_crate(&mut self) {
        // Zero-padded ids keep map order equal to spawn order
        let Some(oldest) = self.entities.keys().next().cloned() else {
            return;
        };
        self.entities.remove(&oldest);
        self.pending.push(
            WorldEvent::new(EventKind::EntityDestroyed, oldest.as_str()).with_meta(
                EventMeta::default()
                    .source_app(APP_NAME)
                    .source_entity(oldest.as_str())
                    .reason("crate limit"),
            ),
        );
        debug!(entity_id = %oldest, "Crate expired");
    }

    fn drift(rng: &mut ChaCha8Rng, record: &mut StateRecord, dt: f64) {
        let mut position = vector3(record.get(POSITION_FIELD));
        let mut velocity = vector3(record.get(VELOCITY_FIELD));

        for axis in 0..2 {
            velocity[axis] = (velocity[axis] + rng.gen_range(-VELOCITY_JITTER..VELOCITY_JITTER))
                .clamp(-MAX_SPEED, MAX_SPEED);
            position[axis] += velocity[axis] * dt;

            // Bounce off the arena walls
            if position[axis].abs() > ARENA_HALF_EXTENT {
                position[axis] = position[axis].clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
                velocity[axis] = -velocity[axis];
            }
        }

        record.set(POSITION_FIELD, position);
        record.set(VELOCITY_FIELD, velocity);
    }
}

fn vector3(value: Option<&FieldValue>) -> [f64; 3] {
    let mut out = [0.0; 3];
    if let Some(items) = value.and_then(FieldValue::as_list) {
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_f64().unwrap_or(0.0);
        }
    }
    out
}

impl Simulation for SandboxWorld {
    fn add_player(&mut self, player_id: &RecordId) {
        if self.players.contains_key(player_id) {
            return;
        }
        let record = StateRecord::new(player_id.clone())
            .with(POSITION_FIELD, self.random_point())
            .with(VELOCITY_FIELD, [0.0, 0.0, 0.0])
            .with("hp", 100);
        self.players.insert(player_id.clone(), record);

        self.pending.push(
            WorldEvent::new(EventKind::custom("player.joined"), player_id.as_str())
                .with_meta(EventMeta::default().actor(player_id.as_str()).source_app(APP_NAME)),
        );
    }

    fn remove_player(&mut self, player_id: &RecordId) {
        if self.players.remove(player_id).is_none() {
            return;
        }
        self.pending.push(
            WorldEvent::new(EventKind::custom("player.left"), player_id.as_str())
                .with_meta(EventMeta::default().actor(player_id.as_str()).source_app(APP_NAME)),
        );
    }

    fn step(&mut self, tick: u64, dt: f32) -> Snapshot {
        let dt = dt as f64;
        for record in self.players.values_mut() {
            Self::drift(&mut self.rng, record, dt);
        }

        if tick % SPAWN_INTERVAL_TICKS == 0 {
            self.spawn_crate(tick);
            if self.entities.len() > MAX_CRATES {
                self.expire_oldest_crate();
            }
        }

        Snapshot {
            tick,
            players: self.players.values().cloned().collect(),
            entities: self.entities.values().cloned().collect(),
        }
    }

    fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.pending)
    }
}

impl ReplayRuntime for SandboxWorld {
    fn spawn_entity(&mut self, data: &FieldValue) -> Result<(), ReplayError> {
        let fields = data.as_record().ok_or(ReplayError::MissingEntityId)?;
        let id = fields
            .get("id")
            .and_then(FieldValue::as_str)
            .ok_or(ReplayError::MissingEntityId)?;
        let id = RecordId::from(id);
        if self.entities.contains_key(&id) {
            return Err(ReplayError::DuplicateEntity(id.to_string()));
        }

        let mut record = StateRecord::new(id.clone());
        for (key, value) in fields {
            record.set(key.clone(), value.clone());
        }
        self.entities.insert(id, record);
        Ok(())
    }

    fn destroy_entity(&mut self, entity_id: &str) -> Result<(), ReplayError> {
        self.entities
            .remove(&RecordId::from(entity_id))
            .map(|_| ())
            .ok_or_else(|| ReplayError::UnknownEntity(entity_id.to_string()))
    }

    fn emit(&mut self, name: &str, _data: &FieldValue) -> Result<(), ReplayError> {
        self.emitted.push(name.to_string());
        Ok(())
    }
}
