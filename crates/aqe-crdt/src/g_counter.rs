//! Grow-only counter CRDT.
//!
//! Each replica owns one slot that only ever increases; the counter's value
//! is the sum over all slots and merge takes the per-replica maximum, so
//! any delivery order converges.

use crate::{
    Crdt, CrdtError, CrdtMeta, CrdtResult, CrdtType, Delta, DeltaOp, MergeOutcome, MergeStats,
    VectorClock,
};
use aqe_common::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A grow-only counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    id: String,
    node_id: ReplicaId,
    /// Per-replica non-negative counts. Ordered for deterministic
    /// serialization.
    counts: BTreeMap<ReplicaId, u64>,
    vector_clock: VectorClock,
    sequence: u64,
    last_delta_clock: VectorClock,
    meta: CrdtMeta,
}

impl GCounter {
    /// Create a new counter owned by `node_id`.
    pub fn new(id: impl Into<String>, node_id: ReplicaId, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            node_id,
            counts: BTreeMap::new(),
            vector_clock: VectorClock::new(),
            sequence: 0,
            last_delta_clock: VectorClock::new(),
            meta: CrdtMeta::new(now_ms),
        }
    }

    /// Current total across all replicas.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// The contribution of a single replica.
    pub fn count_for(&self, replica: &ReplicaId) -> u64 {
        self.counts.get(replica).copied().unwrap_or(0)
    }

    /// Add `amount` to the local replica's slot.
    pub fn increment(&mut self, amount: u64, now_ms: u64) {
        let entry = self.counts.entry(self.node_id.clone()).or_insert(0);
        *entry += amount;
        self.vector_clock.increment(&self.node_id);
        self.sequence += 1;
        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
    }

    /// Replicas that have contributed to this counter.
    pub fn contributing_replicas(&self) -> Vec<ReplicaId> {
        self.counts.keys().cloned().collect()
    }
}

impl Crdt for GCounter {
    fn crdt_id(&self) -> &str {
        &self.id
    }

    fn crdt_type(&self) -> CrdtType {
        CrdtType::GCounter
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
            "total": self.total(),
            "counts": self.counts,
        })
    }

    fn merge_state(&mut self, other: &Self, now_ms: u64) -> CrdtResult<MergeOutcome> {
        if other.id != self.id {
            return Err(CrdtError::InvalidState(format!(
                "cannot merge counter '{}' into '{}'",
                other.id, self.id
            )));
        }

        let mut stats = MergeStats::default();
        let mut changed = false;

        for (replica, &remote_count) in &other.counts {
            stats.entries_examined += 1;
            let entry = self.counts.entry(replica.clone()).or_insert(0);
            if remote_count > *entry {
                *entry = remote_count;
                stats.entries_applied += 1;
                changed = true;
            }
        }

        self.vector_clock.merge(&other.vector_clock);
        self.sequence = self.sequence.max(other.sequence);
        self.meta.record_merge(now_ms, changed);

        Ok(MergeOutcome {
            local_changed: changed,
            conflicts: Vec::new(),
            stats,
        })
    }

    fn generate_delta(&mut self, since: Option<&VectorClock>) -> Option<Delta> {
        let baseline = since.unwrap_or(&self.last_delta_clock).clone();
        if baseline.dominates_or_equal(&self.vector_clock) {
            return None;
        }

        let operations: Vec<DeltaOp> = self
            .counts
            .iter()
            .filter(|(replica, _)| self.vector_clock.get(replica) > baseline.get(replica))
            .map(|(replica, &count)| DeltaOp::CounterEntry {
                replica: replica.clone(),
                count,
            })
            .collect();

        if operations.is_empty() {
            return None;
        }

        if since.is_none() {
            self.last_delta_clock = self.vector_clock.clone();
        }
        Some(Delta {
            crdt_id: self.id.clone(),
            crdt_type: CrdtType::GCounter,
            origin: self.node_id.clone(),
            clock: self.vector_clock.clone(),
            sequence: self.sequence,
            operations,
        })
    }

    fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool> {
        if delta.crdt_type != CrdtType::GCounter {
            return Err(CrdtError::InvalidType(format!(
                "expected g-counter delta, got {}",
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
                DeltaOp::CounterEntry { replica, count } => {
                    let entry = self.counts.entry(replica.clone()).or_insert(0);
                    if *count > *entry {
                        *entry = *count;
                        changed = true;
                    }
                }
                other => {
                    return Err(CrdtError::CorruptState(format!(
                        "unexpected op in g-counter delta: {other:?}"
                    )));
                }
            }
        }

        self.vector_clock.merge(&delta.clock);
        self.meta.record_merge(now_ms, changed);
        Ok(changed)
    }
}
