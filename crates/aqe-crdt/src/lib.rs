//! # AQE CRDT Crate
//!
//! Conflict-free replicated data types for the AQE mesh: vector clocks,
//! a grow-only counter, a last-writer-wins register, and an observed-remove
//! set with add-wins semantics, plus the delta model used for incremental
//! replication. Pattern-specific replication builds on these types in
//! `aqe-pattern`.

use aqe_common::ReplicaId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod g_counter;
pub mod lww_register;
pub mod or_set;
pub mod store;
pub mod vector_clock;

pub use g_counter::GCounter;
pub use lww_register::LwwRegister;
pub use or_set::{OrSet, OrSetTombstone};
pub use store::{CrdtStore, SnapshotStore, StoredCrdt, StoredCrdtState};
pub use vector_clock::{ClockOrdering, VectorClock};

/// Errors that can occur during CRDT operations.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum CrdtError {
    #[error("Invalid CRDT type: {0}")]
    InvalidType(String),

    #[error("Invalid CRDT state: {0}")]
    InvalidState(String),

    #[error("Corrupt state or delta: {0}")]
    CorruptState(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unknown CRDT: {0}")]
    UnknownCrdt(String),
}

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// The replicated data types the kernel knows how to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtType {
    GCounter,
    LwwRegister,
    OrSet,
    Pattern,
}

impl std::fmt::Display for CrdtType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CrdtType::GCounter => "g-counter",
            CrdtType::LwwRegister => "lww-register",
            CrdtType::OrSet => "or-set",
            CrdtType::Pattern => "pattern",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle metadata carried by every CRDT instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtMeta {
    /// When the instance was created (Unix ms).
    pub created_at_ms: u64,
    /// When the instance last changed (Unix ms).
    pub updated_at_ms: u64,
    /// Number of merge operations performed.
    pub merge_count: u64,
    /// Replica that performed the last local mutation.
    pub last_modified_by: Option<ReplicaId>,
    /// Monotonic state version; bumps on every mutation or effective merge.
    pub state_version: u64,
}

impl CrdtMeta {
    /// Fresh metadata for a newly created instance.
    pub fn new(now_ms: u64) -> Self {
        Self {
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            merge_count: 0,
            last_modified_by: None,
            state_version: 0,
        }
    }

    /// Record a local mutation.
    pub fn record_mutation(&mut self, now_ms: u64, by: &ReplicaId) {
        self.updated_at_ms = now_ms;
        self.last_modified_by = Some(by.clone());
        self.state_version += 1;
    }

    /// Record a merge; `changed` marks whether local state moved.
    pub fn record_merge(&mut self, now_ms: u64, changed: bool) {
        self.merge_count += 1;
        if changed {
            self.updated_at_ms = now_ms;
            self.state_version += 1;
        }
    }
}

/// How a surfaced merge conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Add-wins: both operations' net effect is kept.
    KeepBoth,
    /// The local side's state was kept.
    PreferLocal,
    /// The remote side's state was taken.
    PreferRemote,
}

/// The shape of a surfaced merge conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A value was concurrently added and removed.
    AddRemove,
    /// A register was concurrently written by two replicas.
    ConcurrentWrite,
    /// The same pattern was concurrently edited.
    ConcurrentPatternEdit,
}

/// A conflict detected during merge. Conflicts are always auto-resolved but
/// never silently dropped; callers forward them to the coordination plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    pub kind: ConflictKind,
    /// The element or value the conflict is about.
    pub element: serde_json::Value,
    pub resolution: ConflictResolution,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
}

/// Counters describing the work a merge performed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Remote entries examined.
    pub entries_examined: u64,
    /// Entries that changed local state.
    pub entries_applied: u64,
    /// Tombstones applied to local state.
    pub tombstones_applied: u64,
}

/// Result of merging remote state into a local CRDT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Whether local state changed.
    pub local_changed: bool,
    /// Conflicts detected and auto-resolved during the merge.
    pub conflicts: Vec<MergeConflict>,
    pub stats: MergeStats,
}

impl MergeOutcome {
    /// An outcome describing a merge that changed nothing.
    pub fn unchanged() -> Self {
        Self {
            local_changed: false,
            conflicts: Vec::new(),
            stats: MergeStats::default(),
        }
    }
}

/// One operation inside a [`Delta`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Absolute per-replica counter entry; applied via max so replays are
    /// idempotent.
    CounterEntry { replica: ReplicaId, count: u64 },
    /// Register write.
    SetValue {
        value: serde_json::Value,
        timestamp_ms: u64,
        writer: ReplicaId,
    },
    /// Register clear.
    ClearValue { timestamp_ms: u64, writer: ReplicaId },
    /// Set element addition.
    AddElement {
        value: serde_json::Value,
        tag: String,
        add_clock: VectorClock,
    },
    /// Set element removal (a shipped tombstone).
    RemoveElement {
        value: serde_json::Value,
        /// The add tag this removal targets; `None` for a removal of a
        /// value the remover had not observed.
        tag: Option<String>,
        deleted_by: ReplicaId,
        deleted_at_clock: VectorClock,
        expires_at_ms: u64,
    },
    /// Full pattern replacement carried by the pattern CRDT.
    PutPattern { pattern: serde_json::Value },
}

/// A causal update packet: everything a peer needs to advance its copy of
/// one CRDT from a known clock. Sequence numbers are monotonic per origin
/// replica so receivers can gate ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub crdt_id: String,
    pub crdt_type: CrdtType,
    pub origin: ReplicaId,
    /// The origin's vector clock when the delta was generated.
    pub clock: VectorClock,
    pub sequence: u64,
    pub operations: Vec<DeltaOp>,
}

impl Delta {
    /// Compact bytes for transmission.
    pub fn to_bytes(&self) -> CrdtResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CrdtError::SerializationError(format!("delta encode failed: {e}")))
    }

    /// Restore from compact bytes.
    pub fn from_bytes(bytes: &[u8]) -> CrdtResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CrdtError::CorruptState(format!("delta decode failed: {e}")))
    }
}

/// Configuration shared by kernel CRDTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtConfig {
    /// How long tombstones are retained before they are eligible for
    /// collection (Unix ms).
    pub tombstone_ttl_ms: u64,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            tombstone_ttl_ms: 86_400_000, // 24 hours
        }
    }
}

/// Values storable inside kernel CRDTs.
pub trait CrdtValue: Clone + Serialize + DeserializeOwned + Send + Sync {}

impl<T> CrdtValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync {}

/// Core surface shared by all AQE CRDTs.
///
/// Merge must be commutative, associative, and idempotent; delta
/// application must be idempotent; all mutations are atomic at the
/// snapshot level (a failed operation leaves local state untouched).
pub trait Crdt: Clone + Serialize {
    /// Stable identifier of this instance.
    fn crdt_id(&self) -> &str;

    /// The type tag of this instance.
    fn crdt_type(&self) -> CrdtType;

    /// The replica that owns this instance locally.
    fn origin(&self) -> &ReplicaId;

    /// The current vector clock.
    fn vector_clock(&self) -> &VectorClock;

    /// Lifecycle metadata.
    fn meta(&self) -> &CrdtMeta;

    /// The current value as JSON, for inspection and the event surface.
    fn value(&self) -> serde_json::Value;

    /// Merge remote state into this instance.
    fn merge_state(&mut self, other: &Self, now_ms: u64) -> CrdtResult<MergeOutcome>;

    /// Produce an incremental delta with operations not covered by `since`
    /// (or by the clock of the last generated delta when `since` is None).
    /// Returns None when the receiver already dominates our clock.
    fn generate_delta(&mut self, since: Option<&VectorClock>) -> Option<Delta>;

    /// Apply a delta; returns whether local state changed. Malformed deltas
    /// fail with [`CrdtError::CorruptState`] and leave state untouched.
    fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool>;

    /// Drop expired tombstones; returns how many were collected.
    fn gc_tombstones(&mut self, now_ms: u64) -> usize {
        let _ = now_ms;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crdt_meta_lifecycle() {
        let replica = ReplicaId::new("r1");
        let mut meta = CrdtMeta::new(1_000);
        assert_eq!(meta.state_version, 0);

        meta.record_mutation(2_000, &replica);
        assert_eq!(meta.updated_at_ms, 2_000);
        assert_eq!(meta.state_version, 1);
        assert_eq!(meta.last_modified_by, Some(replica));

        meta.record_merge(3_000, false);
        assert_eq!(meta.merge_count, 1);
        assert_eq!(meta.updated_at_ms, 2_000);

        meta.record_merge(4_000, true);
        assert_eq!(meta.merge_count, 2);
        assert_eq!(meta.updated_at_ms, 4_000);
        assert_eq!(meta.state_version, 2);
    }

    #[test]
    fn test_delta_roundtrip() {
        let delta = Delta {
            crdt_id: "counter-1".to_string(),
            crdt_type: CrdtType::GCounter,
            origin: ReplicaId::new("r1"),
            clock: VectorClock::new(),
            sequence: 7,
            operations: vec![DeltaOp::CounterEntry {
                replica: ReplicaId::new("r1"),
                count: 3,
            }],
        };

        let bytes = delta.to_bytes().unwrap();
        let restored = Delta::from_bytes(&bytes).unwrap();
        assert_eq!(restored.crdt_id, "counter-1");
        assert_eq!(restored.sequence, 7);
        assert_eq!(restored.operations.len(), 1);
    }

    #[test]
    fn test_delta_rejects_garbage() {
        assert!(matches!(
            Delta::from_bytes(&[0xde, 0xad, 0xbe, 0xef]),
            Err(CrdtError::CorruptState(_))
        ));
    }
}
