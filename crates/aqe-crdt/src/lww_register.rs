//! Last-writer-wins register CRDT.
//!
//! Stores a single value with the wall-clock timestamp and origin of its
//! latest write. Causally ordered writes apply in order; concurrent writes
//! are resolved by the larger timestamp, then by origin ordering, and the
//! losing write is surfaced as a conflict.

use crate::{
    ConflictKind, ConflictResolution, Crdt, CrdtError, CrdtMeta, CrdtResult, CrdtType, CrdtValue,
    Delta, DeltaOp, MergeConflict, MergeOutcome, MergeStats, VectorClock,
};
use aqe_common::ReplicaId;
use serde::{Deserialize, Serialize};

/// A register with last-write-wins semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: CrdtValue")]
pub struct LwwRegister<T>
where
    T: CrdtValue,
{
    id: String,
    node_id: ReplicaId,
    value: Option<T>,
    /// Wall-clock time of the winning write (Unix ms).
    timestamp_ms: u64,
    writer: Option<ReplicaId>,
    vector_clock: VectorClock,
    sequence: u64,
    last_delta_clock: VectorClock,
    meta: CrdtMeta,
}

impl<T> LwwRegister<T>
where
    T: CrdtValue,
{
    /// Create an empty register owned by `node_id`.
    pub fn new(id: impl Into<String>, node_id: ReplicaId, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            node_id,
            value: None,
            timestamp_ms: 0,
            writer: None,
            vector_clock: VectorClock::new(),
            sequence: 0,
            last_delta_clock: VectorClock::new(),
            meta: CrdtMeta::new(now_ms),
        }
    }

    /// The current value, if any.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether the register holds no value.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Timestamp of the winning write.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Replica that performed the winning write.
    pub fn writer(&self) -> Option<&ReplicaId> {
        self.writer.as_ref()
    }

    /// Write a new value at the given wall-clock time.
    pub fn write(&mut self, value: T, now_ms: u64) {
        self.vector_clock.increment(&self.node_id);
        self.sequence += 1;
        self.value = Some(value);
        self.timestamp_ms = now_ms;
        self.writer = Some(self.node_id.clone());
        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
    }

    /// Clear the register at the given wall-clock time.
    pub fn clear(&mut self, now_ms: u64) {
        self.vector_clock.increment(&self.node_id);
        self.sequence += 1;
        self.value = None;
        self.timestamp_ms = now_ms;
        self.writer = Some(self.node_id.clone());
        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
    }

    /// LWW resolution: larger timestamp wins, ties broken by origin
    /// ordering so every replica resolves identically.
    fn remote_wins(&self, remote_ts: u64, remote_writer: Option<&ReplicaId>) -> bool {
        match remote_ts.cmp(&self.timestamp_ms) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (remote_writer, self.writer.as_ref()) {
                (Some(remote), Some(local)) => remote.as_str() > local.as_str(),
                (Some(_), None) => true,
                _ => false,
            },
        }
    }

    fn take_remote(&mut self, value: Option<T>, timestamp_ms: u64, writer: Option<ReplicaId>) {
        self.value = value;
        self.timestamp_ms = timestamp_ms;
        self.writer = writer;
    }
}

impl<T> Crdt for LwwRegister<T>
where
    T: CrdtValue,
{
    fn crdt_id(&self) -> &str {
        &self.id
    }

    fn crdt_type(&self) -> CrdtType {
        CrdtType::LwwRegister
    }

    fn origin(&self) -> &ReplicaId {
        &self.node_id
    }

    fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    fn meta(&self) -> &CrdtMeta {
        &self.meta
    }

    fn value(&self) -> serde_json::Value {
        serde_json::json!({
            "value": self.value.as_ref().and_then(|v| serde_json::to_value(v).ok()),
            "timestamp_ms": self.timestamp_ms,
            "writer": self.writer,
        })
    }

    fn merge_state(&mut self, other: &Self, now_ms: u64) -> CrdtResult<MergeOutcome> {
        if other.id != self.id {
            return Err(CrdtError::InvalidState(format!(
                "cannot merge register '{}' into '{}'",
                other.id, self.id
            )));
        }

        let mut conflicts = Vec::new();
        let mut stats = MergeStats {
            entries_examined: 1,
            ..Default::default()
        };

        let ordering = self.vector_clock.compare(&other.vector_clock);
        let mut changed = false;

        match ordering {
            crate::ClockOrdering::Equal | crate::ClockOrdering::After => {
                // We have already seen the remote write.
            }
            crate::ClockOrdering::Before => {
                self.take_remote(
                    other.value.clone(),
                    other.timestamp_ms,
                    other.writer.clone(),
                );
                stats.entries_applied = 1;
                changed = true;
            }
            crate::ClockOrdering::Concurrent => {
                let remote_wins = self.remote_wins(other.timestamp_ms, other.writer.as_ref());
                conflicts.push(MergeConflict {
                    kind: ConflictKind::ConcurrentWrite,
                    element: serde_json::json!({
                        "register": self.id,
                        "local_writer": self.writer,
                        "remote_writer": other.writer,
                    }),
                    resolution: if remote_wins {
                        ConflictResolution::PreferRemote
                    } else {
                        ConflictResolution::PreferLocal
                    },
                    local_clock: self.vector_clock.clone(),
                    remote_clock: other.vector_clock.clone(),
                });
                if remote_wins {
                    self.take_remote(
                        other.value.clone(),
                        other.timestamp_ms,
                        other.writer.clone(),
                    );
                    stats.entries_applied = 1;
                    changed = true;
                }
            }
        }

        self.vector_clock.merge(&other.vector_clock);
        self.sequence = self.sequence.max(other.sequence);
        self.meta.record_merge(now_ms, changed);

        Ok(MergeOutcome {
            local_changed: changed,
            conflicts,
            stats,
        })
    }

    fn generate_delta(&mut self, since: Option<&VectorClock>) -> Option<Delta> {
        let baseline = since.unwrap_or(&self.last_delta_clock).clone();
        if baseline.dominates_or_equal(&self.vector_clock) {
            return None;
        }

        let writer = self.writer.clone()?;
        let op = match &self.value {
            Some(value) => DeltaOp::SetValue {
                value: serde_json::to_value(value).ok()?,
                timestamp_ms: self.timestamp_ms,
                writer,
            },
            None => DeltaOp::ClearValue {
                timestamp_ms: self.timestamp_ms,
                writer,
            },
        };

        if since.is_none() {
            self.last_delta_clock = self.vector_clock.clone();
        }
        Some(Delta {
            crdt_id: self.id.clone(),
            crdt_type: CrdtType::LwwRegister,
            origin: self.node_id.clone(),
            clock: self.vector_clock.clone(),
            sequence: self.sequence,
            operations: vec![op],
        })
    }

    fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool> {
        if delta.crdt_type != CrdtType::LwwRegister {
            return Err(CrdtError::InvalidType(format!(
                "expected lww-register delta, got {}",
                delta.crdt_type
            )));
        }
        if delta.crdt_id != self.id {
            return Err(CrdtError::InvalidState(format!(
                "delta for '{}' applied to '{}'",
                delta.crdt_id, self.id
            )));
        }

        let mut changed = false;
        for op in &delta.operations {
            match op {
                DeltaOp::SetValue {
                    value,
                    timestamp_ms,
                    writer,
                } => {
                    if self.remote_wins(*timestamp_ms, Some(writer)) {
                        let typed: T = serde_json::from_value(value.clone()).map_err(|e| {
                            CrdtError::CorruptState(format!("register delta value: {e}"))
                        })?;
                        self.take_remote(Some(typed), *timestamp_ms, Some(writer.clone()));
                        changed = true;
                    }
                }
                DeltaOp::ClearValue {
                    timestamp_ms,
                    writer,
                } => {
                    if self.remote_wins(*timestamp_ms, Some(writer)) {
                        self.take_remote(None, *timestamp_ms, Some(writer.clone()));
                        changed = true;
                    }
                }
                other => {
                    return Err(CrdtError::CorruptState(format!(
                        "unexpected op in register delta: {other:?}"
                    )));
                }
            }
        }

        self.vector_clock.merge(&delta.clock);
        self.meta.record_merge(now_ms, changed);
        Ok(changed)
    }
}
