//! # AQE Coordination Crate
//!
//! The top-level facade of the AQE mesh core. The coordination manager
//! owns the local identity, the peer registry, one health monitor and one
//! sync orchestrator wiring per peer, the challenge/response
//! authentication handshake, and the external event surface. The
//! performance optimizer wraps the hot CRDT and index access paths.

pub mod events;
pub mod manager;
pub mod perf;

pub use events::CoordinationEvent;
pub use manager::{
    CoordinationConfig, CoordinationManager, PeerAuthState, PeerEntry, PeerMetrics, PeerSender,
};
pub use perf::{PerfConfig, PerfStats, PerformanceOptimizer, QueuedUpdate};

/// Errors raised by the coordination plane.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Authentication failed for {0}")]
    AuthFailed(aqe_common::ReplicaId),

    #[error("Peer not found: {0}")]
    PeerNotFound(aqe_common::ReplicaId),

    #[error("Peer not authenticated: {0}")]
    NotAuthenticated(aqe_common::ReplicaId),

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error(transparent)]
    Net(#[from] aqe_net::NetError),

    #[error(transparent)]
    Sync(#[from] aqe_sync::SyncError),

    #[error(transparent)]
    Protocol(#[from] aqe_protocol::ProtocolError),

    #[error(transparent)]
    Crdt(#[from] aqe_crdt::CrdtError),
}

/// Result type for coordination operations.
pub type CoordResult<T> = Result<T, CoordinationError>;
