//! # AQE Net Crate
//!
//! The transport plumbing of the AQE mesh: a reconnecting signaling client
//! with room semantics and heartbeats, and the peer-connection manager that
//! owns per-peer channel lifecycles. The actual sockets and WebRTC stack
//! are supplied by the host through async traits.

pub mod peer;
pub mod signaling;

pub use peer::{
    ConnectionQuality, ConnectionState, PeerConnectionManager, PeerEvent, PeerManagerConfig,
    PeerRecord, PeerTransport,
};
pub use signaling::{
    MessageStream, SignalingClient, SignalingConfig, SignalingEvent, StreamConn, StreamEvent,
};

/// Errors raised by the networking layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Channel not open: {0}")]
    NotOpen(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Protocol(#[from] aqe_protocol::ProtocolError),
}

/// Result type for networking operations.
pub type NetResult<T> = Result<T, NetError>;
