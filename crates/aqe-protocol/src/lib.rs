//! # AQE Protocol Crate
//!
//! The single source of truth for AQE mesh wire messages: the signaling
//! envelope and its payloads, pattern sync requests/responses and
//! broadcasts, and the signed coordination envelope used for
//! authentication, liveness, and delta shipping.
//!
//! Signaling messages are JSON objects of the form
//! `{type, id, from, to?, roomId?, timestamp, payload}`; the transport
//! underneath is any duplex message stream.

use aqe_common::ReplicaId;
use aqe_crdt::{Delta, MergeConflict, VectorClock};
use aqe_identity::{PublicKeyBytes, SignatureBytes};
use aqe_pattern::{PatternQuery, SharedPattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version for message compatibility.
pub const AQE_PROTOCOL_VERSION: u32 = 1;

/// Errors raised while handling protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// === Signaling ===

/// Envelope wrapping every signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub payload: SignalPayload,
    /// Unique message id.
    pub id: String,
    pub from: ReplicaId,
    /// Target peer; None for room-wide or server-directed messages.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<ReplicaId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub room_id: Option<String>,
    /// Unix milliseconds at send time.
    pub timestamp: u64,
}

impl SignalEnvelope {
    /// Wrap a payload with a fresh id.
    pub fn new(payload: SignalPayload, from: ReplicaId, timestamp: u64) -> Self {
        Self {
            payload,
            id: uuid::Uuid::new_v4().to_string(),
            from,
            to: None,
            room_id: None,
            timestamp,
        }
    }

    /// Set the target peer.
    pub fn to_peer(mut self, peer: ReplicaId) -> Self {
        self.to = Some(peer);
        self
    }

    /// Set the room.
    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room_id = Some(room.into());
        self
    }

    /// Encode to wire JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decode from wire JSON.
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Signaling payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    #[serde(rename = "ICECandidate")]
    IceCandidate(IceCandidatePayload),
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    PeerJoined(PeerPresence),
    PeerLeft(PeerPresence),
    RoomInfo(RoomInfoPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    Error(ErrorPayload),
    Renegotiate(RenegotiatePayload),
}

impl SignalPayload {
    /// Stable string identifier of the message type.
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "Offer",
            SignalPayload::Answer(_) => "Answer",
            SignalPayload::IceCandidate(_) => "ICECandidate",
            SignalPayload::JoinRoom(_) => "JoinRoom",
            SignalPayload::LeaveRoom(_) => "LeaveRoom",
            SignalPayload::PeerJoined(_) => "PeerJoined",
            SignalPayload::PeerLeft(_) => "PeerLeft",
            SignalPayload::RoomInfo(_) => "RoomInfo",
            SignalPayload::Ping(_) => "Ping",
            SignalPayload::Pong(_) => "Pong",
            SignalPayload::Error(_) => "Error",
            SignalPayload::Renegotiate(_) => "Renegotiate",
        }
    }
}

/// SDP blob carried by offers and answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// Reference to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

/// Presence change of one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub peer: ReplicaId,
}

/// Room membership snapshot sent after a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfoPayload {
    pub room_id: String,
    pub peers: Vec<ReplicaId>,
}

/// Heartbeat ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: u64,
}

/// Heartbeat pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub original_timestamp: u64,
    pub respond_timestamp: u64,
}

/// Server- or peer-reported error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

/// Request to renegotiate a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiatePayload {
    pub reason: String,
}

// === Pattern sync ===

/// Pull-based sync request carrying the requester's known clocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternSyncRequest {
    pub request_id: String,
    pub requester: ReplicaId,
    /// Explicit pattern ids to fetch, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pattern_ids: Option<Vec<String>>,
    /// Attribute/similarity query, when discovering.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<PatternQuery>,
    /// Pattern id to the requester's known version clock; the responder
    /// sends only patterns these clocks do not dominate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vector_clocks: Option<HashMap<String, VectorClock>>,
    pub timestamp: u64,
    /// Whether full content (vs. summaries) is requested.
    pub include_content: bool,
    /// Continuation token from a previous paginated response.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub continuation_token: Option<String>,
}

impl PatternSyncRequest {
    /// New request with a fresh id.
    pub fn new(requester: ReplicaId, timestamp: u64) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            requester,
            pattern_ids: None,
            query: None,
            vector_clocks: None,
            timestamp,
            include_content: true,
            continuation_token: None,
        }
    }
}

/// Response to a [`PatternSyncRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternSyncResponse {
    pub request_id: String,
    pub responder: ReplicaId,
    pub patterns: Vec<SharedPattern>,
    /// Conflicts the responder resolved while assembling the response.
    pub conflicts: Vec<MergeConflict>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub continuation_token: Option<String>,
    pub timestamp: u64,
}

/// Gossip-style announcement types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastType {
    NewPattern,
    PatternUpdate,
    PatternDelete,
    PatternRequest,
    PeerDiscovery,
}

/// Signed gossip announcement with a hop budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternBroadcast {
    #[serde(rename = "type")]
    pub broadcast_type: BroadcastType,
    pub broadcast_id: String,
    pub sender: ReplicaId,
    pub payload: serde_json::Value,
    /// Remaining hops; relays decrement and drop at zero.
    pub ttl: u32,
    pub timestamp: u64,
    pub signature: SignatureBytes,
}

// === Coordination ===

/// Challenge sent by the auth initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub nonce: String,
}

/// Signature over the challenge nonce and the responder's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub nonce: String,
    pub responder: ReplicaId,
    pub public_key: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl AuthResponse {
    /// The bytes the responder signs: nonce bound to its identity.
    pub fn signing_bytes(nonce: &str, responder: &ReplicaId) -> Vec<u8> {
        format!("{nonce}:{responder}").into_bytes()
    }
}

/// Verdict on an [`AuthResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// Payloads carried by the signed coordination envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoordinationPayload {
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    AuthResult(AuthResult),
    Ping(PingPayload),
    Pong(PongPayload),
    SyncRequest(PatternSyncRequest),
    SyncResponse(PatternSyncResponse),
    Broadcast(PatternBroadcast),
    /// CRDT deltas shipped by the sync orchestrator.
    Deltas(Vec<Delta>),
    /// Full state fetch after a delta-sequence gap.
    StateFetchRequest {
        request_id: String,
        crdt_id: String,
    },
    /// Snapshot answering a [`CoordinationPayload::StateFetchRequest`].
    StateFetchResponse {
        request_id: String,
        crdt_id: String,
        /// Serialized `StoredCrdtState`.
        state: serde_json::Value,
    },
}

impl CoordinationPayload {
    /// Stable string identifier of the payload type.
    pub fn message_type(&self) -> &'static str {
        match self {
            CoordinationPayload::AuthChallenge(_) => "AuthChallenge",
            CoordinationPayload::AuthResponse(_) => "AuthResponse",
            CoordinationPayload::AuthResult(_) => "AuthResult",
            CoordinationPayload::Ping(_) => "Ping",
            CoordinationPayload::Pong(_) => "Pong",
            CoordinationPayload::SyncRequest(_) => "SyncRequest",
            CoordinationPayload::SyncResponse(_) => "SyncResponse",
            CoordinationPayload::Broadcast(_) => "Broadcast",
            CoordinationPayload::Deltas(_) => "Deltas",
            CoordinationPayload::StateFetchRequest { .. } => "StateFetchRequest",
            CoordinationPayload::StateFetchResponse { .. } => "StateFetchResponse",
        }
    }
}

/// Signed envelope for coordination messages. Receivers verify the
/// signature against the sender's declared public key before acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationEnvelope {
    pub version: u32,
    pub sender: ReplicaId,
    pub payload: CoordinationPayload,
    pub timestamp: u64,
    pub signature: SignatureBytes,
}

impl CoordinationEnvelope {
    /// The canonical bytes a sender signs.
    pub fn signing_bytes(
        sender: &ReplicaId,
        payload: &CoordinationPayload,
        timestamp: u64,
    ) -> ProtocolResult<Vec<u8>> {
        let body = serde_json::json!({
            "version": AQE_PROTOCOL_VERSION,
            "sender": sender,
            "payload": payload,
            "timestamp": timestamp,
        });
        serde_json::to_vec(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Assemble a signed envelope.
    pub fn signed(
        sender: ReplicaId,
        payload: CoordinationPayload,
        timestamp: u64,
        signer: &dyn aqe_identity::Signer,
    ) -> ProtocolResult<Self> {
        let bytes = Self::signing_bytes(&sender, &payload, timestamp)?;
        let signature = signer.sign(&bytes);
        Ok(Self {
            version: AQE_PROTOCOL_VERSION,
            sender,
            payload,
            timestamp,
            signature,
        })
    }

    /// Verify the envelope signature against a declared public key.
    pub fn verify(&self, signer: &dyn aqe_identity::Signer, public_key: &PublicKeyBytes) -> bool {
        match Self::signing_bytes(&self.sender, &self.payload, self.timestamp) {
            Ok(bytes) => signer.verify(&bytes, &self.signature, public_key),
            Err(_) => false,
        }
    }
}
