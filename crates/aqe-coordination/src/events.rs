//! The external event surface of the coordination plane.
//!
//! Events are a tagged enum; applications register handlers by event tag
//! (or `"*"` for everything) and the manager fans each event out to the
//! matching handlers.

use aqe_common::ReplicaId;
use aqe_crdt::MergeConflict;
use aqe_sync::HealthStatus;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum CoordinationEvent {
    PeerAuthenticated {
        peer: ReplicaId,
    },
    SyncStarted {
        peer: ReplicaId,
    },
    SyncCompleted {
        peer: ReplicaId,
        synced: usize,
        conflicts: usize,
    },
    SyncFailed {
        peer: ReplicaId,
        error: String,
        retryable: bool,
    },
    HealthChanged {
        peer: ReplicaId,
        status: HealthStatus,
    },
    ConflictDetected {
        peer: ReplicaId,
        conflict: MergeConflict,
    },
    PeerDisconnected {
        peer: ReplicaId,
        reason: String,
    },
}

impl CoordinationEvent {
    /// Stable tag used to register handlers.
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::PeerAuthenticated { .. } => "PeerAuthenticated",
            CoordinationEvent::SyncStarted { .. } => "SyncStarted",
            CoordinationEvent::SyncCompleted { .. } => "SyncCompleted",
            CoordinationEvent::SyncFailed { .. } => "SyncFailed",
            CoordinationEvent::HealthChanged { .. } => "HealthChanged",
            CoordinationEvent::ConflictDetected { .. } => "ConflictDetected",
            CoordinationEvent::PeerDisconnected { .. } => "PeerDisconnected",
        }
    }

    /// The peer this event is about.
    pub fn peer(&self) -> &ReplicaId {
        match self {
            CoordinationEvent::PeerAuthenticated { peer }
            | CoordinationEvent::SyncStarted { peer }
            | CoordinationEvent::SyncCompleted { peer, .. }
            | CoordinationEvent::SyncFailed { peer, .. }
            | CoordinationEvent::HealthChanged { peer, .. }
            | CoordinationEvent::ConflictDetected { peer, .. }
            | CoordinationEvent::PeerDisconnected { peer, .. } => peer,
        }
    }
}
