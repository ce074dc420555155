//! # AQE Common Crate
//!
//! Shared types and utilities for the AQE mesh coordination core: replica
//! identity, deterministic time and randomness providers, retry with
//! backoff, and token-bucket rate limiting. Every other `aqe-*` crate
//! builds on these so that tests can run with injected time and RNG.

use serde::{Deserialize, Serialize};

pub mod rate;
pub mod retry;

pub use rate::{RateLimitError, TokenBucket, TokenBucketConfig};
pub use retry::retry_with_backoff;

/// Unique identifier for a replica in the mesh.
///
/// A replica is one process holding a local copy of shared state. The id is
/// stable across restarts, keys vector clocks, marks the origin of CRDT
/// operations, and acts as the authentication principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    /// Create a new ReplicaId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        ReplicaId(s)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        ReplicaId(s.to_string())
    }
}

/// Errors shared across AQE mesh crates.
#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
}

/// Result type for common operations.
pub type CommonResult<T> = Result<T, CommonError>;

/// Source of wall-clock and monotonic-ish time.
///
/// All timestamp reads in the mesh go through this trait so that tombstone
/// expiry, LRU bookkeeping, and version tie-breaks are reproducible in
/// tests.
pub trait TimeProvider: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn unix_seconds(&self) -> u64 {
        self.unix_millis() / 1000
    }
}

/// Production time provider backed by the system clock.
#[derive(Debug, Clone, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Fixed time provider for deterministic tests.
///
/// The contained value is public so tests can advance time manually.
#[derive(Debug, Clone)]
pub struct FixedTimeProvider(pub std::sync::Arc<std::sync::atomic::AtomicU64>);

impl FixedTimeProvider {
    /// Create a provider frozen at the given millisecond timestamp.
    pub fn new(millis: u64) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU64::new(
            millis,
        )))
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, millis: u64) {
        self.0
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    /// Set the clock to an absolute millisecond timestamp.
    pub fn set(&self, millis: u64) {
        self.0.store(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeProvider for FixedTimeProvider {
    fn unix_millis(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Source of randomness for tags, nonces, jitter, and privacy noise.
pub trait RngProvider: Send + Sync {
    /// Uniform u64.
    fn next_u64(&self) -> u64;

    /// Uniform f64 in [0, 1).
    fn next_f64(&self) -> f64;

    /// Fill the buffer with uniform bytes.
    fn fill_bytes(&self, buf: &mut [u8]);
}

/// Production RNG backed by the process-global fastrand generator.
#[derive(Debug, Clone, Default)]
pub struct FastrandRngProvider;

impl RngProvider for FastrandRngProvider {
    fn next_u64(&self) -> u64 {
        fastrand::u64(..)
    }

    fn next_f64(&self) -> f64 {
        fastrand::f64()
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = fastrand::u8(..);
        }
    }
}

/// Seeded RNG for deterministic tests.
pub struct SeededRngProvider(std::sync::Mutex<fastrand::Rng>);

impl SeededRngProvider {
    /// Create a generator with a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self(std::sync::Mutex::new(fastrand::Rng::with_seed(seed)))
    }
}

impl RngProvider for SeededRngProvider {
    fn next_u64(&self) -> u64 {
        self.0.lock().expect("rng lock").u64(..)
    }

    fn next_f64(&self) -> f64 {
        self.0.lock().expect("rng lock").f64()
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        let mut rng = self.0.lock().expect("rng lock");
        for b in buf.iter_mut() {
            *b = rng.u8(..);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_creation() {
        let id = ReplicaId::new("replica-1");
        assert_eq!(id.as_str(), "replica-1");
        assert_eq!(id.to_string(), "replica-1");
        assert_eq!(ReplicaId::from("replica-1"), id);
    }

    #[test]
    fn test_fixed_time_provider_advances() {
        let time = FixedTimeProvider::new(1_000);
        assert_eq!(time.unix_millis(), 1_000);
        assert_eq!(time.unix_seconds(), 1);

        time.advance(2_500);
        assert_eq!(time.unix_millis(), 3_500);
        assert_eq!(time.unix_seconds(), 3);
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = SeededRngProvider::new(42);
        let b = SeededRngProvider::new(42);
        assert_eq!(a.next_u64(), b.next_u64());
        assert_eq!(a.next_f64(), b.next_f64());

        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.fill_bytes(&mut buf_a);
        b.fill_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn test_rng_f64_range() {
        let rng = SeededRngProvider::new(7);
        for _ in 0..100 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
