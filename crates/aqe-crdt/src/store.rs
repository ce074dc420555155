//! Dynamic store for the kernel CRDT instances a replica maintains.
//!
//! The coordination manager owns one store per replica; the sync
//! orchestrator pulls deltas out of it and feeds remote state back in. The
//! store holds the concrete instantiations the coordination plane
//! replicates: counters, JSON registers, and string sets.

use crate::{
    Crdt, CrdtError, CrdtResult, CrdtType, Delta, GCounter, LwwRegister, MergeOutcome, OrSet,
    VectorClock,
};
use aqe_common::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A kernel CRDT instance held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredCrdt {
    Counter(GCounter),
    Register(LwwRegister<serde_json::Value>),
    Set(OrSet<String>),
}

impl StoredCrdt {
    /// The instance's id.
    pub fn crdt_id(&self) -> &str {
        match self {
            StoredCrdt::Counter(c) => c.crdt_id(),
            StoredCrdt::Register(r) => r.crdt_id(),
            StoredCrdt::Set(s) => s.crdt_id(),
        }
    }

    /// The instance's type tag.
    pub fn crdt_type(&self) -> CrdtType {
        match self {
            StoredCrdt::Counter(_) => CrdtType::GCounter,
            StoredCrdt::Register(_) => CrdtType::LwwRegister,
            StoredCrdt::Set(_) => CrdtType::OrSet,
        }
    }

    /// The instance's vector clock.
    pub fn vector_clock(&self) -> &VectorClock {
        match self {
            StoredCrdt::Counter(c) => c.vector_clock(),
            StoredCrdt::Register(r) => r.vector_clock(),
            StoredCrdt::Set(s) => s.vector_clock(),
        }
    }

    /// The instance's current value as JSON.
    pub fn value(&self) -> serde_json::Value {
        match self {
            StoredCrdt::Counter(c) => c.value(),
            StoredCrdt::Register(r) => r.value(),
            StoredCrdt::Set(s) => s.value(),
        }
    }
}

/// Portable snapshot of a stored CRDT, as shipped in a full state fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCrdtState(pub StoredCrdt);

/// Optional persistence supplied by the host: snapshots keyed by CRDT id.
/// The core never persists state itself.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, crdt_id: &str, snapshot: &StoredCrdtState) -> CrdtResult<()>;
    fn load(&self, crdt_id: &str) -> CrdtResult<Option<StoredCrdtState>>;
}

/// Keyed collection of the CRDT instances a replica replicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtStore {
    node_id: ReplicaId,
    entries: HashMap<String, StoredCrdt>,
}

impl CrdtStore {
    /// Create an empty store owned by `node_id`.
    pub fn new(node_id: ReplicaId) -> Self {
        Self {
            node_id,
            entries: HashMap::new(),
        }
    }

    /// The replica that owns this store.
    pub fn node_id(&self) -> &ReplicaId {
        &self.node_id
    }

    /// Ids of all instances.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get an instance by id.
    pub fn get(&self, id: &str) -> Option<&StoredCrdt> {
        self.entries.get(id)
    }

    /// Create (or fetch) a counter with the given id.
    pub fn counter_mut(&mut self, id: &str, now_ms: u64) -> CrdtResult<&mut GCounter> {
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| StoredCrdt::Counter(GCounter::new(id, self.node_id.clone(), now_ms)));
        match entry {
            StoredCrdt::Counter(c) => Ok(c),
            other => Err(CrdtError::InvalidType(format!(
                "'{id}' is a {}, not a g-counter",
                other.crdt_type()
            ))),
        }
    }

    /// Create (or fetch) a JSON register with the given id.
    pub fn register_mut(
        &mut self,
        id: &str,
        now_ms: u64,
    ) -> CrdtResult<&mut LwwRegister<serde_json::Value>> {
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| {
            StoredCrdt::Register(LwwRegister::new(id, self.node_id.clone(), now_ms))
        });
        match entry {
            StoredCrdt::Register(r) => Ok(r),
            other => Err(CrdtError::InvalidType(format!(
                "'{id}' is a {}, not a lww-register",
                other.crdt_type()
            ))),
        }
    }

    /// Create (or fetch) a string set with the given id.
    pub fn set_mut(&mut self, id: &str, now_ms: u64) -> CrdtResult<&mut OrSet<String>> {
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| StoredCrdt::Set(OrSet::new(id, self.node_id.clone(), now_ms)));
        match entry {
            StoredCrdt::Set(s) => Ok(s),
            other => Err(CrdtError::InvalidType(format!(
                "'{id}' is a {}, not an or-set",
                other.crdt_type()
            ))),
        }
    }

    /// Merge a remote snapshot, creating the local instance if absent.
    pub fn merge_state(
        &mut self,
        state: &StoredCrdtState,
        now_ms: u64,
    ) -> CrdtResult<MergeOutcome> {
        let id = state.0.crdt_id().to_string();
        match self.entries.get_mut(&id) {
            None => {
                self.entries.insert(id, state.0.clone());
                Ok(MergeOutcome {
                    local_changed: true,
                    conflicts: Vec::new(),
                    stats: Default::default(),
                })
            }
            Some(local) => match (local, &state.0) {
                (StoredCrdt::Counter(l), StoredCrdt::Counter(r)) => l.merge_state(r, now_ms),
                (StoredCrdt::Register(l), StoredCrdt::Register(r)) => l.merge_state(r, now_ms),
                (StoredCrdt::Set(l), StoredCrdt::Set(r)) => l.merge_state(r, now_ms),
                (local, remote) => Err(CrdtError::InvalidType(format!(
                    "cannot merge {} into {} for '{}'",
                    remote.crdt_type(),
                    local.crdt_type(),
                    remote.crdt_id()
                ))),
            },
        }
    }

    /// Generate deltas for every instance that advanced past `since`.
    pub fn generate_deltas(&mut self, since: Option<&VectorClock>) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for entry in self.entries.values_mut() {
            let delta = match entry {
                StoredCrdt::Counter(c) => c.generate_delta(since),
                StoredCrdt::Register(r) => r.generate_delta(since),
                StoredCrdt::Set(s) => s.generate_delta(since),
            };
            if let Some(d) = delta {
                deltas.push(d);
            }
        }
        deltas
    }

    /// Route a delta to the owning instance, creating it if absent.
    pub fn apply_delta(&mut self, delta: &Delta, now_ms: u64) -> CrdtResult<bool> {
        if !self.entries.contains_key(&delta.crdt_id) {
            let fresh = match delta.crdt_type {
                CrdtType::GCounter => {
                    StoredCrdt::Counter(GCounter::new(&delta.crdt_id, self.node_id.clone(), now_ms))
                }
                CrdtType::LwwRegister => StoredCrdt::Register(LwwRegister::new(
                    &delta.crdt_id,
                    self.node_id.clone(),
                    now_ms,
                )),
                CrdtType::OrSet => {
                    StoredCrdt::Set(OrSet::new(&delta.crdt_id, self.node_id.clone(), now_ms))
                }
                CrdtType::Pattern => {
                    return Err(CrdtError::InvalidType(
                        "pattern deltas are handled by the pattern store".to_string(),
                    ));
                }
            };
            self.entries.insert(delta.crdt_id.clone(), fresh);
        }

        match self.entries.get_mut(&delta.crdt_id) {
            Some(StoredCrdt::Counter(c)) => c.apply_delta(delta, now_ms),
            Some(StoredCrdt::Register(r)) => r.apply_delta(delta, now_ms),
            Some(StoredCrdt::Set(s)) => s.apply_delta(delta, now_ms),
            None => Err(CrdtError::UnknownCrdt(delta.crdt_id.clone())),
        }
    }

    /// Snapshot one instance for a full state fetch.
    pub fn snapshot(&self, id: &str) -> CrdtResult<StoredCrdtState> {
        self.entries
            .get(id)
            .cloned()
            .map(StoredCrdtState)
            .ok_or_else(|| CrdtError::UnknownCrdt(id.to_string()))
    }

    /// Run tombstone GC across all instances; returns total collected.
    pub fn gc_all(&mut self, now_ms: u64) -> usize {
        self.entries
            .values_mut()
            .map(|entry| match entry {
                StoredCrdt::Set(s) => s.gc_tombstones(now_ms),
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica_a() -> ReplicaId {
        ReplicaId::new("replica_a")
    }

    fn replica_b() -> ReplicaId {
        ReplicaId::new("replica_b")
    }

    #[test]
    fn test_store_typed_accessors() {
        let mut store = CrdtStore::new(replica_a());

        store.counter_mut("runs", 0).unwrap().increment(2, 1);
        store
            .register_mut("status", 0)
            .unwrap()
            .write(serde_json::json!("ok"), 1);
        store.set_mut("tags", 0).unwrap().add("fast".to_string(), 1, 1);

        assert_eq!(store.len(), 3);
        assert!(matches!(
            store.counter_mut("status", 0),
            Err(CrdtError::InvalidType(_))
        ));
    }

    #[test]
    fn test_store_merge_creates_missing_instance() {
        let mut a = CrdtStore::new(replica_a());
        a.counter_mut("runs", 0).unwrap().increment(5, 1);
        let snapshot = a.snapshot("runs").unwrap();

        let mut b = CrdtStore::new(replica_b());
        let outcome = b.merge_state(&snapshot, 10).unwrap();
        assert!(outcome.local_changed);

        let merged = b.get("runs").unwrap();
        assert_eq!(merged.value()["total"], 5);
    }

    #[test]
    fn test_store_merge_rejects_type_mismatch() {
        let mut a = CrdtStore::new(replica_a());
        a.counter_mut("thing", 0).unwrap();
        let snapshot = a.snapshot("thing").unwrap();

        let mut b = CrdtStore::new(replica_b());
        b.set_mut("thing", 0).unwrap();
        assert!(matches!(
            b.merge_state(&snapshot, 1),
            Err(CrdtError::InvalidType(_))
        ));
    }

    #[test]
    fn test_store_deltas_roundtrip() {
        let mut a = CrdtStore::new(replica_a());
        a.counter_mut("runs", 0).unwrap().increment(3, 1);
        a.set_mut("tags", 0).unwrap().add("slow".to_string(), 1, 7);

        let deltas = a.generate_deltas(None);
        assert_eq!(deltas.len(), 2);

        let mut b = CrdtStore::new(replica_b());
        for delta in &deltas {
            assert!(b.apply_delta(delta, 5).unwrap());
        }
        assert_eq!(b.get("runs").unwrap().value()["total"], 3);

        // replay is idempotent
        for delta in &deltas {
            assert!(!b.apply_delta(delta, 6).unwrap());
        }
    }
}
