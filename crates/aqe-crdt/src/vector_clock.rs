//! Vector clock for tracking causality between replica events.
//!
//! Each replica increments its own component on every local mutation and
//! takes the component-wise maximum when merging remote state. Comparing
//! two clocks yields the causal relationship between the states they
//! describe.

use crate::{CrdtError, CrdtResult};
use aqe_common::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Identical component-wise.
    Equal,
    /// This clock happened-before the other.
    Before,
    /// The other clock happened-before this one.
    After,
    /// Neither dominates; the states are causally unrelated.
    Concurrent,
}

/// Map from replica id to a monotonic logical timestamp.
///
/// The map is ordered so serialization is canonical: equal clocks encode to
/// equal bytes and hash equally. Replicas absent from the map read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Create a clock with one initial component.
    pub fn with_replica(replica: ReplicaId, timestamp: u64) -> Self {
        let mut clocks = BTreeMap::new();
        clocks.insert(replica, timestamp);
        Self { clocks }
    }

    /// The component for a replica; unseen replicas read as 0.
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Increment the component for the given replica.
    pub fn increment(&mut self, replica: &ReplicaId) {
        let entry = self.clocks.entry(replica.clone()).or_insert(0);
        *entry += 1;
    }

    /// Set the component for a replica. Components never decrease; a lower
    /// value than the current one is ignored.
    pub fn set(&mut self, replica: ReplicaId, timestamp: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Merge another clock into this one, component-wise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &ts) in &other.clocks {
            let entry = self.clocks.entry(replica.clone()).or_insert(0);
            if ts > *entry {
                *entry = ts;
            }
        }
    }

    /// Determine the causal relationship between two clocks.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for replica in self.clocks.keys().chain(other.clocks.keys()) {
            let ours = self.get(replica);
            let theirs = other.get(replica);
            if ours < theirs {
                has_less = true;
            } else if ours > theirs {
                has_greater = true;
            }
        }

        match (has_less, has_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Whether this clock happened-after the other (strict domination).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    /// Whether this clock is ahead of or equal to the other in every
    /// component.
    pub fn dominates_or_equal(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    /// Whether this clock happened-before the other.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Whether the clocks are causally unrelated.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// All replica ids tracked by this clock.
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.clocks.keys()
    }

    /// Total number of events across all replicas.
    pub fn total_events(&self) -> u64 {
        self.clocks.values().sum()
    }

    /// Canonical compact bytes; equal clocks encode identically because the
    /// underlying map is ordered.
    pub fn to_bytes(&self) -> CrdtResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CrdtError::SerializationError(format!("clock encode failed: {e}")))
    }

    /// Restore from compact bytes.
    pub fn from_bytes(bytes: &[u8]) -> CrdtResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CrdtError::CorruptState(format!("clock decode failed: {e}")))
    }

    /// Deterministic hex digest of this clock.
    pub fn hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for (replica, timestamp) in &self.clocks {
            hasher.update(replica.as_str().as_bytes());
            hasher.update(timestamp.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VectorClock{{")?;
        let mut first = true;
        for (replica, timestamp) in &self.clocks {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{replica}: {timestamp}")?;
            first = false;
        }
        write!(f, "}}")
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

    fn replica_c() -> ReplicaId {
        ReplicaId::new("replica_c")
    }

    #[test]
    fn test_unseen_replicas_read_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get(&replica_a()), 0);

        let clock = VectorClock::with_replica(replica_a(), 5);
        assert_eq!(clock.get(&replica_a()), 5);
        assert_eq!(clock.get(&replica_b()), 0);
    }

    #[test]
    fn test_increment_is_monotonic() {
        let mut clock = VectorClock::new();
        clock.increment(&replica_a());
        clock.increment(&replica_a());
        clock.increment(&replica_b());

        assert_eq!(clock.get(&replica_a()), 2);
        assert_eq!(clock.get(&replica_b()), 1);

        // set never decreases a component
        clock.set(replica_a(), 1);
        assert_eq!(clock.get(&replica_a()), 2);
    }

    #[test]
    fn test_merge_takes_componentwise_max() {
        let mut left = VectorClock::new();
        left.set(replica_a(), 2);
        left.set(replica_b(), 1);

        let mut right = VectorClock::new();
        right.set(replica_a(), 1);
        right.set(replica_b(), 2);
        right.set(replica_c(), 1);

        left.merge(&right);
        assert_eq!(left.get(&replica_a()), 2);
        assert_eq!(left.get(&replica_b()), 2);
        assert_eq!(left.get(&replica_c()), 1);
    }

    #[test]
    fn test_compare_orderings() {
        let mut before = VectorClock::new();
        before.increment(&replica_a());

        let mut after = before.clone();
        after.increment(&replica_a());
        after.increment(&replica_b());

        assert_eq!(before.compare(&after), ClockOrdering::Before);
        assert_eq!(after.compare(&before), ClockOrdering::After);
        assert_eq!(before.compare(&before.clone()), ClockOrdering::Equal);
        assert!(before.happened_before(&after));
        assert!(after.dominates(&before));
    }

    #[test]
    fn test_compare_concurrent() {
        let mut left = VectorClock::new();
        left.increment(&replica_a());

        let mut right = VectorClock::new();
        right.increment(&replica_b());

        assert_eq!(left.compare(&right), ClockOrdering::Concurrent);
        assert!(left.is_concurrent(&right));
        assert!(!left.dominates(&right));
        assert!(!right.dominates(&left));
    }

    #[test]
    fn test_merge_commutative_associative_idempotent() {
        let mut a = VectorClock::new();
        a.set(replica_a(), 3);
        a.set(replica_b(), 1);

        let mut b = VectorClock::new();
        b.set(replica_b(), 4);
        b.set(replica_c(), 2);

        let mut c = VectorClock::new();
        c.set(replica_a(), 1);
        c.set(replica_c(), 5);

        // commutative
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        // associative
        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);

        // idempotent
        let mut aa = a.clone();
        aa.merge(&a);
        assert_eq!(aa, a);
    }

    #[test]
    fn test_canonical_serialization_and_hash() {
        let mut one = VectorClock::new();
        one.set(replica_a(), 1);
        one.set(replica_b(), 2);

        let mut two = VectorClock::new();
        two.set(replica_b(), 2);
        two.set(replica_a(), 1);

        assert_eq!(one.to_bytes().unwrap(), two.to_bytes().unwrap());
        assert_eq!(one.hash(), two.hash());

        two.set(replica_c(), 1);
        assert_ne!(one.hash(), two.hash());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut clock = VectorClock::new();
        clock.increment(&replica_a());
        clock.increment(&replica_b());

        let bytes = clock.to_bytes().unwrap();
        assert_eq!(VectorClock::from_bytes(&bytes).unwrap(), clock);
    }

    #[test]
    fn test_total_events() {
        let mut clock = VectorClock::new();
        clock.set(replica_a(), 5);
        clock.set(replica_b(), 3);
        assert_eq!(clock.total_events(), 8);
    }
}
