//! # AQE NAT Crate
//!
//! NAT traversal and connection establishment for browser-hosted mesh
//! replicas: STUN-based NAT classification, TURN relay management with
//! credential refresh, UDP hole punching with an escalation ladder, and
//! application-level connectivity testing with path recommendation.
//!
//! All network I/O happens behind caller-supplied async traits; this crate
//! only drives the protocols.

use serde::{Deserialize, Serialize};

pub mod connectivity;
pub mod detector;
pub mod puncher;
pub mod turn;

pub use connectivity::{
    nat_success_probability, recommend_path, CandidateInfo, CandidateType, ConnectivityConfig,
    ConnectivityReport, ConnectivityTester, PathRecommendation, PathStrategy, ProbeChannel,
    RankedCandidate, TransportProtocol,
};
pub use detector::{
    FilteringClass, NatDetectionResult, NatDetector, NatDetectorConfig, StunClient, StunMapping,
};
pub use puncher::{
    FallbackAction, HolePunchConfig, HolePunchResult, HolePuncher, PathProber, PortPredictor,
    PredictionConfidence, PredictionMethod, PunchEvent, PunchLevel, PunchMethod, PunchSignal,
    PunchSignals,
};
pub use turn::{
    CredentialFetcher, RelayProbe, RelayTransport, TurnConfig, TurnCredentials, TurnEvent,
    TurnManager, TurnManagerConfig,
};

/// Errors raised while establishing connectivity.
#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("No servers available: {0}")]
    NoServers(String),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for connectivity operations.
pub type NatResult<T> = Result<T, NatError>;

/// NAT behavior classes observed in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    /// No NAT: the mapped address equals the local address.
    Open,
    /// Endpoint-independent mapping and filtering.
    FullCone,
    /// Endpoint-independent mapping, address-dependent filtering.
    RestrictedCone,
    /// Endpoint-independent mapping, address-and-port-dependent filtering.
    PortRestricted,
    /// Endpoint-dependent mapping: a new external port per destination.
    Symmetric,
    /// Not enough data to classify.
    Unknown,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NatType::Open => "open",
            NatType::FullCone => "full-cone",
            NatType::RestrictedCone => "restricted-cone",
            NatType::PortRestricted => "port-restricted",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}
