//! Delta encoding of state records and snapshots

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::record::{field_equals, FieldValue, RecordId, Snapshot, StateRecord};

/// Changed fields of one record relative to a base version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Result of encoding a record against an optional base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "record", rename_all = "snake_case")]
pub enum Encoded {
    /// No base known to the receiver, send everything
    Full(StateRecord),
    /// Only the fields that differ from the base
    Delta(RecordDelta),
}

/// Encode `current` against `previous`.
///
/// Returns `None` when nothing changed, meaning nothing needs to be sent.
pub fn encode(current: &StateRecord, previous: Option<&StateRecord>) -> Option<Encoded> {
    match previous {
        None => Some(Encoded::Full(current.clone())),
        Some(previous) => diff_fields(current, previous).map(Encoded::Delta),
    }
}

/// Entity variant of [`encode`]: always diffs, and the delta always carries the id
pub fn encode_entity(current: &StateRecord, previous: &StateRecord) -> Option<RecordDelta> {
    diff_fields(current, previous)
}

fn diff_fields(current: &StateRecord, previous: &StateRecord) -> Option<RecordDelta> {
    let fields: BTreeMap<String, FieldValue> = current
        .fields
        .iter()
        .filter(|(key, value)| {
            previous
                .fields
                .get(*key)
                .map_or(true, |old| !field_equals(value, old))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if fields.is_empty() {
        None
    } else {
        Some(RecordDelta {
            id: current.id.clone(),
            fields,
        })
    }
}

/// Rebuild a full record from a base and an optional delta (shallow merge)
pub fn decode(delta: Option<&Encoded>, base: &StateRecord) -> StateRecord {
    match delta {
        None => base.clone(),
        Some(Encoded::Full(record)) => record.clone(),
        Some(Encoded::Delta(delta)) => apply_delta(delta, base),
    }
}

/// Merge a record delta over its base
pub fn apply_delta(delta: &RecordDelta, base: &StateRecord) -> StateRecord {
    let mut merged = base.clone();
    for (key, value) in &delta.fields {
        merged.fields.insert(key.clone(), value.clone());
    }
    merged
}

/// Partitioned changes between two entity sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityListDelta {
    pub added: Vec<StateRecord>,
    pub modified: Vec<RecordDelta>,
    pub removed: Vec<RecordId>,
}

impl EntityListDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Index records by id for use as a previous-state map
pub fn index_by_id(records: &[StateRecord]) -> HashMap<RecordId, StateRecord> {
    records
        .iter()
        .map(|record| (record.id.clone(), record.clone()))
        .collect()
}

/// Split the current entity set into added, modified and removed relative to `previous`
pub fn compress_entity_list(
    entities: &[StateRecord],
    previous: &HashMap<RecordId, StateRecord>,
) -> EntityListDelta {
    let mut delta = EntityListDelta::default();
    let mut seen: HashSet<&RecordId> = HashSet::with_capacity(entities.len());

    for entity in entities {
        seen.insert(&entity.id);
        match previous.get(&entity.id) {
            None => delta.added.push(entity.clone()),
            Some(old) => {
                if let Some(changed) = encode_entity(entity, old) {
                    delta.modified.push(changed);
                }
            }
        }
    }

    delta.removed = previous
        .keys()
        .filter(|id| !seen.contains(id))
        .cloned()
        .collect();
    // HashMap iteration order is arbitrary
    delta.removed.sort();

    delta
}

/// Receiver side: apply an entity list delta to the last known entity map
pub fn apply_entity_list(
    delta: &EntityListDelta,
    base: &HashMap<RecordId, StateRecord>,
) -> HashMap<RecordId, StateRecord> {
    let mut out = base.clone();

    for id in &delta.removed {
        out.remove(id);
    }
    for record in &delta.added {
        out.insert(record.id.clone(), record.clone());
    }
    for changed in &delta.modified {
        let merged = match out.get(&changed.id) {
            Some(existing) => apply_delta(changed, existing),
            None => StateRecord {
                id: changed.id.clone(),
                fields: changed.fields.clone(),
            },
        };
        out.insert(changed.id.clone(), merged);
    }

    out
}

/// Snapshot reduced against a client's acknowledged base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    pub tick: u64,
    /// Tick the delta was computed against, `None` for a full snapshot
    pub base_tick: Option<u64>,
    pub players: EntityListDelta,
    pub entities: EntityListDelta,
}

impl SnapshotDelta {
    /// True when the delta carries no changes at all
    pub fn is_noop(&self) -> bool {
        self.players.is_empty() && self.entities.is_empty()
    }
}

/// Encode a whole snapshot against an optional base snapshot
pub fn encode_snapshot(current: &Snapshot, base: Option<&Snapshot>) -> SnapshotDelta {
    let empty = HashMap::new();
    let (base_tick, base_players, base_entities) = match base {
        Some(base) => (
            Some(base.tick),
            index_by_id(&base.players),
            index_by_id(&base.entities),
        ),
        None => (None, empty.clone(), empty),
    };

    SnapshotDelta {
        tick: current.tick,
        base_tick,
        players: compress_entity_list(&current.players, &base_players),
        entities: compress_entity_list(&current.entities, &base_entities),
    }
}

/// Receiver side: rebuild the full snapshot from a base and a snapshot delta
pub fn decode_snapshot(delta: &SnapshotDelta, base: Option<&Snapshot>) -> Snapshot {
    let (players, entities) = match base {
        Some(base) => (index_by_id(&base.players), index_by_id(&base.entities)),
        None => (HashMap::new(), HashMap::new()),
    };

    let mut players: Vec<StateRecord> = apply_entity_list(&delta.players, &players)
        .into_values()
        .collect();
    let mut entities: Vec<StateRecord> = apply_entity_list(&delta.entities, &entities)
        .into_values()
        .collect();
    players.sort_by(|a, b| a.id.cmp(&b.id));
    entities.sort_by(|a, b| a.id.cmp(&b.id));

    Snapshot {
        tick: delta.tick,
        players,
        entities,
    }
}
