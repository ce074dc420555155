//! Pattern CRDT: replication wrapper around a [`SharedPattern`].
//!
//! Merge resolution uses the pattern's version clock: the causally later
//! edit wins outright. Concurrent edits of the same pattern are resolved by
//! the higher quality score, then by lexicographic origin, and the decision
//! is surfaced as a `ConcurrentPatternEdit` conflict.

use crate::model::SharedPattern;
use aqe_common::ReplicaId;
use aqe_crdt::{
    ClockOrdering, ConflictKind, ConflictResolution, Crdt, CrdtError, CrdtMeta, CrdtResult,
    CrdtType, Delta, DeltaOp, MergeConflict, MergeOutcome, MergeStats, VectorClock,
};
use serde::{Deserialize, Serialize};

/// A replicated pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCrdt {
    node_id: ReplicaId,
    pattern: SharedPattern,
    /// Replica that authored the current revision: the local replica after
    /// an update, the remote origin after an adopted merge.
    last_editor: ReplicaId,
    sequence: u64,
    last_delta_clock: VectorClock,
    meta: CrdtMeta,
}

impl PatternCrdt {
    /// Wrap a pattern owned by `node_id`. The pattern's version clock gains
    /// an initial event for the owning replica if it has none.
    pub fn new(mut pattern: SharedPattern, node_id: ReplicaId, now_ms: u64) -> Self {
        if pattern.version.vector_clock.total_events() == 0 {
            pattern.version.vector_clock.increment(&node_id);
        }
        Self {
            last_editor: node_id.clone(),
            node_id,
            pattern,
            sequence: 1,
            last_delta_clock: VectorClock::new(),
            meta: CrdtMeta::new(now_ms),
        }
    }

    /// The wrapped pattern.
    pub fn pattern(&self) -> &SharedPattern {
        &self.pattern
    }

    /// Replace the pattern with a locally edited revision. The edit
    /// advances the version clock and links the previous version.
    pub fn update(&mut self, mut edited: SharedPattern, now_ms: u64) -> CrdtResult<()> {
        if edited.id != self.pattern.id {
            return Err(CrdtError::InvalidState(format!(
                "cannot update pattern '{}' with '{}'",
                self.pattern.id, edited.id
            )));
        }

        let mut clock = self.pattern.version.vector_clock.clone();
        clock.increment(&self.node_id);
        edited.version.vector_clock = clock;
        edited.version.previous_version = Some(self.pattern.version.version.clone());
        edited.updated_at_ms = now_ms;

        self.pattern = edited;
        self.last_editor = self.node_id.clone();
        self.sequence += 1;
        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
        Ok(())
    }

    /// Decide whether the remote revision wins a concurrent edit:
    /// higher quality score first, then lexicographic origin of the two
    /// edits, then the semantic version, then the content hash so the
    /// decision is deterministic on every replica.
    fn remote_wins_concurrent(&self, remote: &SharedPattern, remote_origin: &ReplicaId) -> bool {
        let local_score = self.pattern.quality.score();
        let remote_score = remote.quality.score();
        if remote_score != local_score {
            return remote_score > local_score;
        }
        if remote_origin != &self.last_editor {
            return remote_origin.as_str() > self.last_editor.as_str();
        }
        if remote.version.semver() != self.pattern.version.semver() {
            return remote.version.semver() > self.pattern.version.semver();
        }
        remote.content.content_hash > self.pattern.content.content_hash
    }

    fn integrate_remote(
        &mut self,
        remote: &SharedPattern,
        remote_origin: &ReplicaId,
        now_ms: u64,
    ) -> CrdtResult<MergeOutcome> {
        if remote.id != self.pattern.id {
            return Err(CrdtError::InvalidState(format!(
                "cannot merge pattern '{}' into '{}'",
                remote.id, self.pattern.id
            )));
        }

        let mut conflicts = Vec::new();
        let mut stats = MergeStats {
            entries_examined: 1,
            ..Default::default()
        };
        let mut changed = false;

        let local_clock = self.pattern.version.vector_clock.clone();
        let remote_clock = remote.version.vector_clock.clone();

        match local_clock.compare(&remote_clock) {
            ClockOrdering::Equal | ClockOrdering::After => {}
            ClockOrdering::Before => {
                self.pattern = remote.clone();
                self.last_editor = remote_origin.clone();
                stats.entries_applied = 1;
                changed = true;
            }
            ClockOrdering::Concurrent => {
                let remote_wins = self.remote_wins_concurrent(remote, remote_origin);
                conflicts.push(MergeConflict {
                    kind: ConflictKind::ConcurrentPatternEdit,
                    element: serde_json::json!({
                        "pattern_id": self.pattern.id,
                        "local_version": self.pattern.version.version,
                        "remote_version": remote.version.version,
                    }),
                    resolution: if remote_wins {
                        ConflictResolution::PreferRemote
                    } else {
                        ConflictResolution::PreferLocal
                    },
                    local_clock: local_clock.clone(),
                    remote_clock: remote_clock.clone(),
                });
                if remote_wins {
                    self.pattern = remote.clone();
                    self.last_editor = remote_origin.clone();
                    stats.entries_applied = 1;
                    changed = true;
                }
            }
        }

        // the merged revision has seen both histories
        let mut merged_clock = local_clock;
        merged_clock.merge(&remote_clock);
        self.pattern.version.vector_clock = merged_clock;
        self.meta.record_merge(now_ms, changed);

        Ok(MergeOutcome {
            local_changed: changed,
            conflicts,
            stats,
        })
    }
}

impl Crdt for PatternCrdt {
    fn crdt_id(&self) -> &str {
        &self.pattern.id
    }

    fn crdt_type(&self) -> CrdtType {
        CrdtType::Pattern
    }

    fn origin(&self) -> &ReplicaId {
        &self.node_id
    }

    fn vector_clock(&self) -> &VectorClock {
        &self.pattern.version.vector_clock
    }

    fn meta(&self) -> &CrdtMeta {
        &self.meta
    }

    fn value(&self) -> serde_json::Value {
        serde_json::to_value(&self.pattern).unwrap_or(serde_json::Value::Null)
    }

    fn merge_state(&mut self, other: &Self, now_ms: u64) -> CrdtResult<MergeOutcome> {
        // the author of the remote revision, not a guess from its clock
        let outcome = self.integrate_remote(&other.pattern, &other.last_editor, now_ms)?;
        self.sequence = self.sequence.max(other.sequence);
        Ok(outcome)
    }

    fn generate_delta(&mut self, since: Option<&VectorClock>) -> Option<Delta> {
        let baseline = since.unwrap_or(&self.last_delta_clock).clone();
        if baseline.dominates_or_equal(&self.pattern.version.vector_clock) {
            return None;
        }

        let pattern_json = serde_json::to_value(&self.pattern).ok()?;
        if since.is_none() {
            self.last_delta_clock = self.pattern.version.vector_clock.clone();
        }
        Some(Delta {
            crdt_id: self.pattern.id.clone(),
            crdt_type: CrdtType::Pattern,
            origin: self.node_id.clone(),
            clock: self.pattern.version.vector_clock.clone(),
            sequence: self.sequence,
            operations: vec![DeltaOp::PutPattern {
                pattern: pattern_json,
            }],
        })
    }

    fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool> {
        if delta.crdt_type != CrdtType::Pattern {
            return Err(CrdtError::InvalidType(format!(
                "expected pattern delta, got {}",
                delta.crdt_type
            )));
        }
        if delta.crdt_id != self.pattern.id {
            return Err(CrdtError::InvalidState(format!(
                "delta for '{}' applied to '{}'",
                delta.crdt_id, self.pattern.id
            )));
        }

        let mut changed = false;
        for op in &delta.operations {
            match op {
                DeltaOp::PutPattern { pattern } => {
                    let remote: SharedPattern =
                        serde_json::from_value(pattern.clone()).map_err(|e| {
                            CrdtError::CorruptState(format!("pattern delta decode: {e}"))
                        })?;
                    let outcome = self.integrate_remote(&remote, &delta.origin, now_ms)?;
                    changed |= outcome.local_changed;
                }
                other => {
                    return Err(CrdtError::CorruptState(format!(
                        "unexpected op in pattern delta: {other:?}"
                    )));
                }
            }
        }
        Ok(changed)
    }
}
