//! Observed-remove set CRDT with add-wins semantics.
//!
//! Elements are (value, tag) pairs; a tag is minted on every add as
//! `<replica>-<wall-ms>-<nonce>` together with the vector clock at add
//! time. Removal tombstones every live tag of the value; removing a value
//! that was never observed records a value-level tombstone so a concurrent
//! remote add still surfaces the conflict. Merge is add-wins: a tombstone
//! only erases an add it causally dominates, and a concurrent add/remove
//! pair keeps the element and emits an `AddRemove` conflict.

use crate::{
    ConflictKind, ConflictResolution, Crdt, CrdtConfig, CrdtError, CrdtMeta, CrdtResult, CrdtType,
    CrdtValue, Delta, DeltaOp, MergeConflict, MergeOutcome, MergeStats, VectorClock,
};
use aqe_common::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

/// Marker for a removed element, kept until expiry so late-arriving state
/// still sees the removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "T: CrdtValue + Eq + Hash")]
pub struct OrSetTombstone<T>
where
    T: CrdtValue + Eq + Hash,
{
    /// The add tag this tombstone erases; `None` when the remover had not
    /// observed any tag for the value.
    pub target_tag: Option<String>,
    pub element: T,
    pub deleted_by: ReplicaId,
    /// The remover's vector clock at deletion.
    pub deleted_at_clock: VectorClock,
    /// When this tombstone becomes eligible for collection (Unix ms).
    pub expires_at_ms: u64,
}

/// Statistics about an OR-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrSetStats {
    pub current_size: u64,
    pub live_tags: u64,
    pub tombstones: u64,
    pub contributing_replicas: u64,
}

/// An observed-remove set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: CrdtValue + Eq + Hash")]
pub struct OrSet<T>
where
    T: CrdtValue + Eq + Hash,
{
    id: String,
    node_id: ReplicaId,
    /// Live tags per element, each with the clock observed at add time.
    entries: HashMap<T, HashMap<String, VectorClock>>,
    tombstones: Vec<OrSetTombstone<T>>,
    vector_clock: VectorClock,
    sequence: u64,
    last_delta_clock: VectorClock,
    tombstone_ttl_ms: u64,
    meta: CrdtMeta,
}

impl<T> OrSet<T>
where
    T: CrdtValue + Eq + Hash,
{
    /// Create a new set owned by `node_id` with default tombstone TTL.
    pub fn new(id: impl Into<String>, node_id: ReplicaId, now_ms: u64) -> Self {
        Self::with_config(id, node_id, now_ms, &CrdtConfig::default())
    }

    /// Create a new set with an explicit configuration.
    pub fn with_config(
        id: impl Into<String>,
        node_id: ReplicaId,
        now_ms: u64,
        config: &CrdtConfig,
    ) -> Self {
        Self {
            id: id.into(),
            node_id,
            entries: HashMap::new(),
            tombstones: Vec::new(),
            vector_clock: VectorClock::new(),
            sequence: 0,
            last_delta_clock: VectorClock::new(),
            tombstone_ttl_ms: config.tombstone_ttl_ms,
            meta: CrdtMeta::new(now_ms),
        }
    }

    /// Whether the element is currently in the set.
    pub fn contains(&self, element: &T) -> bool {
        self.entries
            .get(element)
            .map(|tags| !tags.is_empty())
            .unwrap_or(false)
    }

    /// All elements currently in the set.
    pub fn elements(&self) -> Vec<T> {
        self.entries
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(value, _)| value.clone())
            .collect()
    }

    /// Number of elements currently in the set.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|tags| !tags.is_empty())
            .count()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live tags for an element.
    pub fn tags_for(&self, element: &T) -> Vec<String> {
        self.entries
            .get(element)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tombstones currently retained.
    pub fn tombstones(&self) -> &[OrSetTombstone<T>] {
        &self.tombstones
    }

    /// Add an element, returning the minted tag.
    pub fn add(&mut self, element: T, now_ms: u64, nonce: u64) -> String {
        self.vector_clock.increment(&self.node_id);
        self.sequence += 1;

        let tag = format!(
            "{}-{}-{:08x}",
            self.node_id,
            now_ms,
            (nonce & 0xffff_ffff) as u32
        );
        self.entries
            .entry(element)
            .or_default()
            .insert(tag.clone(), self.vector_clock.clone());

        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
        tag
    }

    /// Remove an element, tombstoning every live tag. Removing a value with
    /// no observed tags records a value-level tombstone so the removal can
    /// still conflict with a concurrent add. Returns the number of
    /// tombstones created.
    pub fn remove(&mut self, element: &T, now_ms: u64) -> usize {
        self.vector_clock.increment(&self.node_id);
        self.sequence += 1;
        let deleted_at_clock = self.vector_clock.clone();
        let expires_at_ms = now_ms + self.tombstone_ttl_ms;

        let live = self.entries.remove(element).unwrap_or_default();
        let created = if live.is_empty() {
            self.tombstones.push(OrSetTombstone {
                target_tag: None,
                element: element.clone(),
                deleted_by: self.node_id.clone(),
                deleted_at_clock,
                expires_at_ms,
            });
            1
        } else {
            let count = live.len();
            for (tag, _) in live {
                self.tombstones.push(OrSetTombstone {
                    target_tag: Some(tag),
                    element: element.clone(),
                    deleted_by: self.node_id.clone(),
                    deleted_at_clock: deleted_at_clock.clone(),
                    expires_at_ms,
                });
            }
            count
        };

        let node = self.node_id.clone();
        self.meta.record_mutation(now_ms, &node);
        created
    }

    /// Statistics about this set.
    pub fn stats(&self) -> OrSetStats {
        let mut replicas = std::collections::HashSet::new();
        for tags in self.entries.values() {
            for clock in tags.values() {
                replicas.extend(clock.replicas().cloned());
            }
        }
        for ts in &self.tombstones {
            replicas.insert(ts.deleted_by.clone());
        }

        OrSetStats {
            current_size: self.len() as u64,
            live_tags: self.entries.values().map(|t| t.len() as u64).sum(),
            tombstones: self.tombstones.len() as u64,
            contributing_replicas: replicas.len() as u64,
        }
    }

    /// Collect expired tombstones that every peer described by `observed`
    /// has seen. Collection requires both expiry and observation.
    pub fn gc_tombstones_synced(&mut self, now_ms: u64, observed: &VectorClock) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|ts| {
            !(ts.expires_at_ms <= now_ms && observed.dominates_or_equal(&ts.deleted_at_clock))
        });
        before - self.tombstones.len()
    }

    fn find_tombstone(&self, element: &T, tag: Option<&str>) -> Option<usize> {
        self.tombstones.iter().position(|ts| {
            &ts.element == element
                && match (&ts.target_tag, tag) {
                    (Some(t), Some(tag)) => t == tag,
                    (None, _) => true,
                    (Some(_), None) => false,
                }
        })
    }

    fn has_equivalent_tombstone(&self, other: &OrSetTombstone<T>) -> bool {
        self.tombstones.iter().any(|ts| {
            ts.target_tag == other.target_tag
                && ts.element == other.element
                && ts.deleted_by == other.deleted_by
                && ts.deleted_at_clock == other.deleted_at_clock
        })
    }

    /// Integrate one remote live tag. Returns (changed, conflict).
    fn apply_remote_add(
        &mut self,
        element: &T,
        tag: &str,
        add_clock: &VectorClock,
    ) -> (bool, Option<MergeConflict>) {
        if self
            .entries
            .get(element)
            .map(|tags| tags.contains_key(tag))
            .unwrap_or(false)
        {
            return (false, None);
        }

        if let Some(pos) = self.find_tombstone(element, Some(tag)) {
            let ts_clock = self.tombstones[pos].deleted_at_clock.clone();
            if ts_clock.dominates_or_equal(add_clock) {
                // The removal observed this add; it stays removed.
                return (false, None);
            }
            let conflict = if add_clock.dominates(&ts_clock) {
                // Causal re-add after the removal.
                None
            } else {
                Some(MergeConflict {
                    kind: ConflictKind::AddRemove,
                    element: serde_json::to_value(element).unwrap_or(serde_json::Value::Null),
                    resolution: ConflictResolution::KeepBoth,
                    local_clock: ts_clock,
                    remote_clock: add_clock.clone(),
                })
            };
            self.tombstones.remove(pos);
            self.entries
                .entry(element.clone())
                .or_default()
                .insert(tag.to_string(), add_clock.clone());
            return (true, conflict);
        }

        self.entries
            .entry(element.clone())
            .or_default()
            .insert(tag.to_string(), add_clock.clone());
        (true, None)
    }

    /// Integrate one remote tombstone. Returns (changed, applied, conflict).
    fn apply_remote_tombstone(
        &mut self,
        remote: &OrSetTombstone<T>,
        now_ms: u64,
    ) -> (bool, bool, Option<MergeConflict>) {
        if self.has_equivalent_tombstone(remote) {
            return (false, false, None);
        }

        let live = self.entries.get_mut(&remote.element);
        match (&remote.target_tag, live) {
            (Some(tag), Some(tags)) if tags.contains_key(tag.as_str()) => {
                let add_clock = tags[tag.as_str()].clone();
                if remote.deleted_at_clock.dominates_or_equal(&add_clock) {
                    tags.remove(tag.as_str());
                    if tags.is_empty() {
                        self.entries.remove(&remote.element);
                    }
                    self.tombstones.push(remote.clone());
                    (true, true, None)
                } else if add_clock.dominates(&remote.deleted_at_clock) {
                    // Our add is causally newer; the tombstone is stale.
                    (false, false, None)
                } else {
                    // Concurrent add and remove: add wins.
                    (
                        false,
                        false,
                        Some(MergeConflict {
                            kind: ConflictKind::AddRemove,
                            element: serde_json::to_value(&remote.element)
                                .unwrap_or(serde_json::Value::Null),
                            resolution: ConflictResolution::KeepBoth,
                            local_clock: add_clock,
                            remote_clock: remote.deleted_at_clock.clone(),
                        }),
                    )
                }
            }
            (None, Some(tags)) if !tags.is_empty() => {
                let retained: HashMap<String, VectorClock> = tags
                    .iter()
                    .filter(|(_, add_clock)| {
                        !remote.deleted_at_clock.dominates_or_equal(add_clock)
                    })
                    .map(|(t, c)| (t.clone(), c.clone()))
                    .collect();
                let removed_any = retained.len() < tags.len();
                let survivor_clock = retained.values().next().cloned();

                if retained.is_empty() {
                    self.entries.remove(&remote.element);
                    self.tombstones.push(remote.clone());
                    (true, true, None)
                } else {
                    *tags = retained;
                    // Survivors are concurrent with the removal: add wins.
                    (
                        removed_any,
                        removed_any,
                        Some(MergeConflict {
                            kind: ConflictKind::AddRemove,
                            element: serde_json::to_value(&remote.element)
                                .unwrap_or(serde_json::Value::Null),
                            resolution: ConflictResolution::KeepBoth,
                            local_clock: survivor_clock.unwrap_or_default(),
                            remote_clock: remote.deleted_at_clock.clone(),
                        }),
                    )
                }
            }
            _ => {
                // Nothing live to erase; retain for propagation unless the
                // tombstone is already expired.
                if remote.expires_at_ms > now_ms {
                    self.tombstones.push(remote.clone());
                    (true, false, None)
                } else {
                    (false, false, None)
                }
            }
        }
    }
}

impl<T> Crdt for OrSet<T>
where
    T: CrdtValue + Eq + Hash,
{
    fn crdt_id(&self) -> &str {
        &self.id
    }

    fn crdt_type(&self) -> CrdtType {
        CrdtType::OrSet
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
            "elements": self.elements(),
            "size": self.len(),
            "stats": self.stats(),
        })
    }

    fn merge_state(&mut self, other: &Self, now_ms: u64) -> CrdtResult<MergeOutcome> {
        if other.id != self.id {
            return Err(CrdtError::InvalidState(format!(
                "cannot merge or-set '{}' into '{}'",
                other.id, self.id
            )));
        }

        let mut conflicts = Vec::new();
        let mut stats = MergeStats::default();
        let mut changed = false;

        for (element, tags) in &other.entries {
            for (tag, add_clock) in tags {
                stats.entries_examined += 1;
                let (did_change, conflict) = self.apply_remote_add(element, tag, add_clock);
                if did_change {
                    stats.entries_applied += 1;
                    changed = true;
                }
                if let Some(c) = conflict {
                    conflicts.push(c);
                }
            }
        }

        for remote_ts in &other.tombstones {
            stats.entries_examined += 1;
            let (did_change, applied, conflict) = self.apply_remote_tombstone(remote_ts, now_ms);
            if did_change {
                changed = true;
            }
            if applied {
                stats.tombstones_applied += 1;
            }
            if let Some(c) = conflict {
                conflicts.push(c);
            }
        }

        self.vector_clock.merge(&other.vector_clock);
        self.sequence = self.sequence.max(other.sequence);
        self.meta.record_merge(now_ms, changed);
        self.gc_tombstones(now_ms);

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

        let mut operations = Vec::new();
        for (element, tags) in &self.entries {
            for (tag, add_clock) in tags {
                if !baseline.dominates_or_equal(add_clock) {
                    operations.push(DeltaOp::AddElement {
                        value: serde_json::to_value(element).ok()?,
                        tag: tag.clone(),
                        add_clock: add_clock.clone(),
                    });
                }
            }
        }
        for ts in &self.tombstones {
            if !baseline.dominates_or_equal(&ts.deleted_at_clock) {
                operations.push(DeltaOp::RemoveElement {
                    value: serde_json::to_value(&ts.element).ok()?,
                    tag: ts.target_tag.clone(),
                    deleted_by: ts.deleted_by.clone(),
                    deleted_at_clock: ts.deleted_at_clock.clone(),
                    expires_at_ms: ts.expires_at_ms,
                });
            }
        }

        if operations.is_empty() {
            return None;
        }

        if since.is_none() {
            self.last_delta_clock = self.vector_clock.clone();
        }
        Some(Delta {
            crdt_id: self.id.clone(),
            crdt_type: CrdtType::OrSet,
            origin: self.node_id.clone(),
            clock: self.vector_clock.clone(),
            sequence: self.sequence,
            operations,
        })
    }

    fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool> {
        if delta.crdt_type != CrdtType::OrSet {
            return Err(CrdtError::InvalidType(format!(
                "expected or-set delta, got {}",
                delta.crdt_type
            )));
        }
        if delta.crdt_id != self.id {
            return Err(CrdtError::InvalidState(format!(
                "delta for '{}' applied to '{}'",
                delta.crdt_id, self.id
            )));
        }

        // Decode every operation before touching state so a malformed delta
        // leaves the set unmodified.
        enum Decoded<T: CrdtValue + Eq + Hash> {
            Add(T, String, VectorClock),
            Remove(OrSetTombstone<T>),
        }
        let mut decoded = Vec::with_capacity(delta.operations.len());
        for op in &delta.operations {
            match op {
                DeltaOp::AddElement {
                    value,
                    tag,
                    add_clock,
                } => {
                    let element: T = serde_json::from_value(value.clone()).map_err(|e| {
                        CrdtError::CorruptState(format!("or-set delta element: {e}"))
                    })?;
                    decoded.push(Decoded::Add(element, tag.clone(), add_clock.clone()));
                }
                DeltaOp::RemoveElement {
                    value,
                    tag,
                    deleted_by,
                    deleted_at_clock,
                    expires_at_ms,
                } => {
                    let element: T = serde_json::from_value(value.clone()).map_err(|e| {
                        CrdtError::CorruptState(format!("or-set delta element: {e}"))
                    })?;
                    decoded.push(Decoded::Remove(OrSetTombstone {
                        target_tag: tag.clone(),
                        element,
                        deleted_by: deleted_by.clone(),
                        deleted_at_clock: deleted_at_clock.clone(),
                        expires_at_ms: *expires_at_ms,
                    }));
                }
                other => {
                    return Err(CrdtError::CorruptState(format!(
                        "unexpected op in or-set delta: {other:?}"
                    )));
                }
            }
        }

        let mut changed = false;
        for item in decoded {
            match item {
                Decoded::Add(element, tag, add_clock) => {
                    let (did_change, _) = self.apply_remote_add(&element, &tag, &add_clock);
                    changed |= did_change;
                }
                Decoded::Remove(ts) => {
                    let (did_change, _, _) = self.apply_remote_tombstone(&ts, now_ms);
                    changed |= did_change;
                }
            }
        }

        self.vector_clock.merge(&delta.clock);
        self.meta.record_merge(now_ms, changed);
        Ok(changed)
    }

    fn gc_tombstones(&mut self, now_ms: u64) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|ts| ts.expires_at_ms > now_ms);
        before - self.tombstones.len()
    }
}
