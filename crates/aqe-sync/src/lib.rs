//! # AQE Sync Crate
//!
//! Per-peer liveness monitoring and state reconciliation for the AQE mesh:
//! the health monitor computes RTT/jitter/loss and a composite health score
//! from ping/pong traffic; the sync orchestrator reconciles patterns and
//! CRDT deltas with connected peers under batching, rate limits, and
//! sequence-gated causal delivery.

pub mod health;
pub mod orchestrator;

pub use health::{
    HealthConfig, HealthIssue, HealthLevel, HealthMonitor, HealthStatus, HealthThresholds,
    IssueSeverity,
};
pub use orchestrator::{
    SyncConfig, SyncEvent, SyncOrchestrator, SyncStats, SyncTransport,
};

/// Errors raised during synchronization.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Authentication denied: {0}")]
    AuthDenied(String),

    #[error("Sharing policy violation: {0}")]
    PolicyViolation(String),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Delta sequence gap for '{crdt_id}'; full state fetch required")]
    StateFetchRequired { crdt_id: String },

    #[error(transparent)]
    Pattern(#[from] aqe_pattern::PatternError),

    #[error(transparent)]
    Crdt(#[from] aqe_crdt::CrdtError),
}

impl SyncError {
    /// Whether retrying with backoff can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
