//! State replication core: records, delta codec, event log, recording and diagnostics

pub mod bandwidth;
pub mod baseline;
pub mod delta;
pub mod event_log;
pub mod inspector;
pub mod record;
pub mod recording;

pub use bandwidth::{BandwidthMonitor, BandwidthSample, BandwidthStats};
pub use baseline::ClientBaselines;
pub use delta::{
    apply_entity_list, compress_entity_list, decode, decode_snapshot, encode, encode_entity,
    encode_snapshot, index_by_id, EntityListDelta, Encoded, RecordDelta, SnapshotDelta,
};
pub use event_log::{
    Event, EventFilter, EventKind, EventLog, EventMeta, ReplayError, ReplayOptions, ReplayReport,
    ReplayRuntime,
};
pub use inspector::{generate_diff, CorrectionRecord, FieldDiff, InspectorSummary, StateInspector};
pub use record::{field_equals, FieldValue, RecordId, Snapshot, StateRecord};
pub use recording::{RecordingEngine, RecordingMetadata, Replay};

/// Errors from persisting or loading logs and recordings
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
}
