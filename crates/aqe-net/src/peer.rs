//! Peer-connection lifecycle management.
//!
//! Owns one [`PeerRecord`] per peer for the peer's lifetime: connection
//! state, data channels, queued ICE candidates, quality metrics, and
//! reconnection bookkeeping. The underlying WebRTC-style transport is
//! supplied by the host through [`PeerTransport`]; signaling glue feeds
//! remote offers, answers, and candidates back into the manager.

use crate::{NetError, NetResult};
use aqe_common::{ReplicaId, RngProvider, TimeProvider};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the default reliable ordered channel.
pub const CHANNEL_RELIABLE: &str = "reliable";

/// Label of the default unreliable unordered channel.
pub const CHANNEL_UNRELIABLE: &str = "unreliable";

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
    Closed,
}

/// Rolling quality metrics for a peer link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub rtt_ms: Option<u64>,
    pub packet_loss_pct: Option<f64>,
    pub bandwidth_kbps: Option<f64>,
    pub local_candidate_type: Option<String>,
    pub remote_candidate_type: Option<String>,
}

/// Everything the manager tracks about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: ReplicaId,
    pub public_key: Vec<u8>,
    pub state: ConnectionState,
    pub last_seen_ms: u64,
    pub reconnect_attempts: u32,
    pub quality: ConnectionQuality,
    pub metadata: HashMap<String, String>,
    pub initiator: bool,
    open_channels: HashSet<String>,
    pending_candidates: Vec<String>,
    remote_description_set: bool,
    reconnect_at_ms: Option<u64>,
}

impl PeerRecord {
    fn new(peer_id: ReplicaId, initiator: bool, now_ms: u64) -> Self {
        Self {
            peer_id,
            public_key: Vec::new(),
            state: ConnectionState::New,
            last_seen_ms: now_ms,
            reconnect_attempts: 0,
            quality: ConnectionQuality::default(),
            metadata: HashMap::new(),
            initiator,
            open_channels: HashSet::new(),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            reconnect_at_ms: None,
        }
    }

    /// Whether the given channel reported open.
    pub fn channel_open(&self, label: &str) -> bool {
        self.open_channels.contains(label)
    }
}

/// Host-supplied peer transport (the reference is WebRTC).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, peer: &ReplicaId) -> NetResult<String>;
    async fn create_answer(&self, peer: &ReplicaId, offer: &str) -> NetResult<String>;
    async fn set_remote_description(&self, peer: &ReplicaId, description: &str) -> NetResult<()>;
    async fn add_ice_candidate(&self, peer: &ReplicaId, candidate: &str) -> NetResult<()>;
    async fn open_channel(
        &self,
        peer: &ReplicaId,
        label: &str,
        reliable: bool,
        ordered: bool,
    ) -> NetResult<()>;
    async fn send(&self, peer: &ReplicaId, label: &str, data: Vec<u8>) -> NetResult<()>;
    async fn close(&self, peer: &ReplicaId) -> NetResult<()>;
}

/// Events emitted by the manager for the signaling glue and the
/// coordination plane.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    OfferReady { peer: ReplicaId, sdp: String },
    AnswerReady { peer: ReplicaId, sdp: String },
    StateChanged { peer: ReplicaId, state: ConnectionState },
    ChannelOpen { peer: ReplicaId, label: String },
    ReconnectScheduled { peer: ReplicaId, delay_ms: u64 },
    Reconnected { peer: ReplicaId },
    /// The signaling glue should send `Renegotiate{reason}` to the peer.
    RenegotiateRequested { peer: ReplicaId, reason: String },
    Removed { peer: ReplicaId },
}

/// Reconnection and channel defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerManagerConfig {
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    /// Jitter fraction applied to reconnect delays.
    pub reconnect_jitter: f64,
    pub reconnect_max_attempts: u32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.2,
            reconnect_max_attempts: 5,
        }
    }
}

/// Options for [`PeerConnectionManager::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub initiator: bool,
    pub metadata: HashMap<String, String>,
}

/// Owns per-peer channel lifecycles.
pub struct PeerConnectionManager {
    config: PeerManagerConfig,
    transport: Arc<dyn PeerTransport>,
    peers: DashMap<ReplicaId, PeerRecord>,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnectionManager {
    /// Create a manager. Returns the manager and its event stream.
    pub fn new(
        config: PeerManagerConfig,
        transport: Arc<dyn PeerTransport>,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                transport,
                peers: DashMap::new(),
                time,
                rng,
                events,
            },
            receiver,
        )
    }

    /// Snapshot a peer's record.
    pub fn peer(&self, peer: &ReplicaId) -> Option<PeerRecord> {
        self.peers.get(peer).map(|r| r.clone())
    }

    /// Ids of all tracked peers.
    pub fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peers.iter().map(|r| r.key().clone()).collect()
    }

    /// Peers currently in the Connected state.
    pub fn connected_peers(&self) -> Vec<ReplicaId> {
        self.peers
            .iter()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Begin connecting to a peer. When `initiator`, an offer is created
    /// and surfaced through [`PeerEvent::OfferReady`]; default data
    /// channels are requested either way.
    pub async fn connect(&self, peer: &ReplicaId, options: ConnectOptions) -> NetResult<()> {
        let now = self.time.unix_millis();
        {
            let mut record = self
                .peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), options.initiator, now));
            record.metadata.extend(options.metadata.clone());
            record.initiator = options.initiator;
            record.state = ConnectionState::Connecting;
        }
        self.emit_state(peer, ConnectionState::Connecting);

        self.transport
            .open_channel(peer, CHANNEL_RELIABLE, true, true)
            .await?;
        self.transport
            .open_channel(peer, CHANNEL_UNRELIABLE, false, false)
            .await?;

        if options.initiator {
            let sdp = self.transport.create_offer(peer).await?;
            let _ = self.events.send(PeerEvent::OfferReady {
                peer: peer.clone(),
                sdp,
            });
        }
        Ok(())
    }

    /// Tear down a peer connection and drop its record. When `notify` is
    /// set, a renegotiate notice for the peer is surfaced first.
    pub async fn disconnect(&self, peer: &ReplicaId, notify: bool) -> NetResult<()> {
        let existed = self.peers.remove(peer).is_some();
        if !existed {
            return Err(NetError::PeerNotFound(peer.to_string()));
        }
        if notify {
            let _ = self.events.send(PeerEvent::RenegotiateRequested {
                peer: peer.clone(),
                reason: "disconnect".to_string(),
            });
        }
        let result = self.transport.close(peer).await;
        let _ = self.events.send(PeerEvent::Removed { peer: peer.clone() });
        info!("disconnected peer {peer}");
        result
    }

    /// Send bytes on an open channel.
    pub async fn send_raw(&self, peer: &ReplicaId, label: &str, data: Vec<u8>) -> NetResult<()> {
        {
            let record = self
                .peers
                .get(peer)
                .ok_or_else(|| NetError::PeerNotFound(peer.to_string()))?;
            if !record.channel_open(label) {
                return Err(NetError::NotOpen(format!("{peer}/{label}")));
            }
        }
        self.transport.send(peer, label, data).await
    }

    /// Send a JSON-serializable message on an open channel.
    pub async fn send<T: serde::Serialize>(
        &self,
        peer: &ReplicaId,
        label: &str,
        message: &T,
    ) -> NetResult<()> {
        let data =
            serde_json::to_vec(message).map_err(|e| NetError::Malformed(e.to_string()))?;
        self.send_raw(peer, label, data).await
    }

    /// Handle a remote offer. A peer without local state is implicitly
    /// created in non-initiator mode.
    pub async fn handle_remote_offer(&self, peer: &ReplicaId, sdp: &str) -> NetResult<()> {
        let now = self.time.unix_millis();
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(peer.clone(), false, now));

        self.transport.set_remote_description(peer, sdp).await?;
        self.mark_remote_description(peer).await?;

        let answer = self.transport.create_answer(peer, sdp).await?;
        let _ = self.events.send(PeerEvent::AnswerReady {
            peer: peer.clone(),
            sdp: answer,
        });
        Ok(())
    }

    /// Handle a remote answer to our offer.
    pub async fn handle_remote_answer(&self, peer: &ReplicaId, sdp: &str) -> NetResult<()> {
        if !self.peers.contains_key(peer) {
            return Err(NetError::PeerNotFound(peer.to_string()));
        }
        self.transport.set_remote_description(peer, sdp).await?;
        self.mark_remote_description(peer).await
    }

    /// Handle a trickled remote ICE candidate. Candidates arriving before
    /// the remote description are queued and flushed on first set.
    pub async fn handle_remote_candidate(&self, peer: &ReplicaId, candidate: &str) -> NetResult<()> {
        let ready = {
            let mut record = self
                .peers
                .get_mut(peer)
                .ok_or_else(|| NetError::PeerNotFound(peer.to_string()))?;
            if record.remote_description_set {
                true
            } else {
                debug!("queueing ICE candidate for {peer} until remote description");
                record.pending_candidates.push(candidate.to_string());
                false
            }
        };
        if ready {
            self.transport.add_ice_candidate(peer, candidate).await?;
        }
        Ok(())
    }

    /// Record a channel-open notification from the transport.
    pub fn channel_opened(&self, peer: &ReplicaId, label: &str) {
        if let Some(mut record) = self.peers.get_mut(peer) {
            record.open_channels.insert(label.to_string());
            record.last_seen_ms = self.time.unix_millis();
        }
        let _ = self.events.send(PeerEvent::ChannelOpen {
            peer: peer.clone(),
            label: label.to_string(),
        });
    }

    /// Record a channel-closed notification from the transport.
    pub fn channel_closed(&self, peer: &ReplicaId, label: &str) {
        if let Some(mut record) = self.peers.get_mut(peer) {
            record.open_channels.remove(label);
        }
    }

    /// Update rolling quality metrics for a peer.
    pub fn update_quality(&self, peer: &ReplicaId, quality: ConnectionQuality) {
        if let Some(mut record) = self.peers.get_mut(peer) {
            record.quality = quality;
        }
    }

    /// Record a transport connection-state change. Disconnections and
    /// failures schedule a reconnect with exponential backoff and jitter.
    pub fn transport_state_changed(&self, peer: &ReplicaId, state: ConnectionState) {
        let mut reconnect_delay = None;
        let mut reconnected = false;
        {
            let Some(mut record) = self.peers.get_mut(peer) else {
                warn!("state change for unknown peer {peer}");
                return;
            };
            let was = record.state;
            record.state = state;
            record.last_seen_ms = self.time.unix_millis();

            match state {
                ConnectionState::Connected => {
                    if was == ConnectionState::Reconnecting {
                        reconnected = true;
                    }
                    record.reconnect_attempts = 0;
                    record.reconnect_at_ms = None;
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    if record.reconnect_attempts < self.config.reconnect_max_attempts {
                        let delay = self.reconnect_delay(record.reconnect_attempts);
                        record.reconnect_at_ms = Some(self.time.unix_millis() + delay);
                        record.reconnect_attempts += 1;
                        reconnect_delay = Some(delay);
                    }
                }
                _ => {}
            }
        }

        self.emit_state(peer, state);
        if reconnected {
            let _ = self.events.send(PeerEvent::Reconnected { peer: peer.clone() });
        }
        if let Some(delay_ms) = reconnect_delay {
            debug!("scheduling reconnect to {peer} in {delay_ms} ms");
            let _ = self.events.send(PeerEvent::ReconnectScheduled {
                peer: peer.clone(),
                delay_ms,
            });
        }
    }

    /// Re-initiate connections whose reconnect deadline has passed.
    /// Returns the peers a reconnect was started for.
    pub async fn poll_reconnects(&self) -> Vec<ReplicaId> {
        let now = self.time.unix_millis();
        let due: Vec<(ReplicaId, bool)> = self
            .peers
            .iter()
            .filter(|r| r.reconnect_at_ms.map(|t| t <= now).unwrap_or(false))
            .map(|r| (r.key().clone(), r.initiator))
            .collect();

        let mut started = Vec::new();
        for (peer, initiator) in due {
            if let Some(mut record) = self.peers.get_mut(&peer) {
                record.reconnect_at_ms = None;
                record.state = ConnectionState::Reconnecting;
                record.remote_description_set = false;
                record.open_channels.clear();
            }
            self.emit_state(&peer, ConnectionState::Reconnecting);

            if initiator {
                match self.transport.create_offer(&peer).await {
                    Ok(sdp) => {
                        let _ = self.events.send(PeerEvent::OfferReady {
                            peer: peer.clone(),
                            sdp,
                        });
                    }
                    Err(e) => {
                        warn!("reconnect offer for {peer} failed: {e}");
                        self.transport_state_changed(&peer, ConnectionState::Failed);
                        continue;
                    }
                }
            }
            started.push(peer);
        }
        started
    }

    fn reconnect_delay(&self, attempt: u32) -> u64 {
        let base = self.config.reconnect_initial_delay_ms as f64
            * self.config.reconnect_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.reconnect_max_delay_ms as f64);
        let jitter = (self.rng.next_f64() * 2.0 - 1.0) * capped * self.config.reconnect_jitter;
        (capped + jitter).max(0.0) as u64
    }

    async fn mark_remote_description(&self, peer: &ReplicaId) -> NetResult<()> {
        let pending = {
            let mut record = self
                .peers
                .get_mut(peer)
                .ok_or_else(|| NetError::PeerNotFound(peer.to_string()))?;
            record.remote_description_set = true;
            std::mem::take(&mut record.pending_candidates)
        };
        for candidate in pending {
            self.transport.add_ice_candidate(peer, &candidate).await?;
        }
        Ok(())
    }

    fn emit_state(&self, peer: &ReplicaId, state: ConnectionState) {
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::{FixedTimeProvider, SeededRngProvider};
    use std::sync::Mutex as StdMutex;

    fn peer_b() -> ReplicaId {
        ReplicaId::new("peer_b")
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: StdMutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self, peer: &ReplicaId) -> NetResult<String> {
            self.log(format!("offer:{peer}"));
            Ok("offer-sdp".to_string())
        }

        async fn create_answer(&self, peer: &ReplicaId, _offer: &str) -> NetResult<String> {
            self.log(format!("answer:{peer}"));
            Ok("answer-sdp".to_string())
        }

        async fn set_remote_description(
            &self,
            peer: &ReplicaId,
            _description: &str,
        ) -> NetResult<()> {
            self.log(format!("remote_description:{peer}"));
            Ok(())
        }

        async fn add_ice_candidate(&self, peer: &ReplicaId, candidate: &str) -> NetResult<()> {
            self.log(format!("candidate:{peer}:{candidate}"));
            Ok(())
        }

        async fn open_channel(
            &self,
            peer: &ReplicaId,
            label: &str,
            _reliable: bool,
            _ordered: bool,
        ) -> NetResult<()> {
            self.log(format!("open_channel:{peer}:{label}"));
            Ok(())
        }

        async fn send(&self, peer: &ReplicaId, label: &str, data: Vec<u8>) -> NetResult<()> {
            self.log(format!("send:{peer}:{label}:{}", data.len()));
            Ok(())
        }

        async fn close(&self, peer: &ReplicaId) -> NetResult<()> {
            self.log(format!("close:{peer}"));
            Ok(())
        }
    }

    fn manager() -> (
        PeerConnectionManager,
        Arc<RecordingTransport>,
        mpsc::UnboundedReceiver<PeerEvent>,
        FixedTimeProvider,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let time = FixedTimeProvider::new(100_000);
        let config = PeerManagerConfig {
            reconnect_jitter: 0.0,
            ..PeerManagerConfig::default()
        };
        let (manager, events) = PeerConnectionManager::new(
            config,
            transport.clone(),
            Arc::new(time.clone()),
            Arc::new(SeededRngProvider::new(2)),
        );
        (manager, transport, events, time)
    }

    #[tokio::test]
    async fn test_connect_as_initiator_creates_offer_and_channels() {
        let (manager, transport, mut events, _time) = manager();

        manager
            .connect(
                &peer_b(),
                ConnectOptions {
                    initiator: true,
                    ..ConnectOptions::default()
                },
            )
            .await
            .unwrap();

        let calls = transport.calls();
        assert!(calls.contains(&"open_channel:peer_b:reliable".to_string()));
        assert!(calls.contains(&"open_channel:peer_b:unreliable".to_string()));
        assert!(calls.contains(&"offer:peer_b".to_string()));

        let mut saw_offer = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::OfferReady { .. }) {
                saw_offer = true;
            }
        }
        assert!(saw_offer);

        assert_eq!(
            manager.peer(&peer_b()).unwrap().state,
            ConnectionState::Connecting
        );
    }

    #[tokio::test]
    async fn test_remote_offer_implicitly_creates_peer() {
        let (manager, transport, mut events, _time) = manager();

        manager
            .handle_remote_offer(&peer_b(), "their-offer")
            .await
            .unwrap();

        let record = manager.peer(&peer_b()).unwrap();
        assert!(!record.initiator);

        assert!(transport.calls().contains(&"answer:peer_b".to_string()));
        let mut saw_answer = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::AnswerReady { .. }) {
                saw_answer = true;
            }
        }
        assert!(saw_answer);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (manager, transport, _events, _time) = manager();

        manager
            .connect(&peer_b(), ConnectOptions::default())
            .await
            .unwrap();

        manager
            .handle_remote_candidate(&peer_b(), "cand-1")
            .await
            .unwrap();
        manager
            .handle_remote_candidate(&peer_b(), "cand-2")
            .await
            .unwrap();
        assert!(!transport
            .calls()
            .iter()
            .any(|c| c.starts_with("candidate:")));

        manager
            .handle_remote_answer(&peer_b(), "their-answer")
            .await
            .unwrap();

        let calls = transport.calls();
        assert!(calls.contains(&"candidate:peer_b:cand-1".to_string()));
        assert!(calls.contains(&"candidate:peer_b:cand-2".to_string()));

        // after the description is set, candidates pass straight through
        manager
            .handle_remote_candidate(&peer_b(), "cand-3")
            .await
            .unwrap();
        assert!(transport
            .calls()
            .contains(&"candidate:peer_b:cand-3".to_string()));
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let (manager, transport, _events, _time) = manager();
        manager
            .connect(&peer_b(), ConnectOptions::default())
            .await
            .unwrap();

        let err = manager
            .send_raw(&peer_b(), CHANNEL_RELIABLE, vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NotOpen(_)));

        manager.channel_opened(&peer_b(), CHANNEL_RELIABLE);
        manager
            .send_raw(&peer_b(), CHANNEL_RELIABLE, vec![1, 2, 3])
            .await
            .unwrap();
        assert!(transport
            .calls()
            .contains(&"send:peer_b:reliable:3".to_string()));

        // unknown peer
        let err = manager
            .send_raw(&ReplicaId::new("ghost"), CHANNEL_RELIABLE, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_reconnect_backoff_schedule_and_recovery() {
        let (manager, transport, mut events, time) = manager();
        manager
            .connect(
                &peer_b(),
                ConnectOptions {
                    initiator: true,
                    ..ConnectOptions::default()
                },
            )
            .await
            .unwrap();
        manager.transport_state_changed(&peer_b(), ConnectionState::Connected);

        // link drops: first reconnect after the initial delay
        manager.transport_state_changed(&peer_b(), ConnectionState::Disconnected);
        let record = manager.peer(&peer_b()).unwrap();
        assert_eq!(record.reconnect_attempts, 1);
        assert_eq!(record.reconnect_at_ms, Some(101_000));

        // not due yet
        assert!(manager.poll_reconnects().await.is_empty());

        time.advance(1_500);
        let started = manager.poll_reconnects().await;
        assert_eq!(started, vec![peer_b()]);
        assert_eq!(
            manager.peer(&peer_b()).unwrap().state,
            ConnectionState::Reconnecting
        );
        // a fresh offer went out
        assert!(transport.calls().iter().filter(|c| *c == "offer:peer_b").count() >= 2);

        // success resets the attempt counter and emits Reconnected
        manager.transport_state_changed(&peer_b(), ConnectionState::Connected);
        assert_eq!(manager.peer(&peer_b()).unwrap().reconnect_attempts, 0);

        let mut saw_reconnected = false;
        let mut saw_scheduled = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PeerEvent::Reconnected { .. } => saw_reconnected = true,
                PeerEvent::ReconnectScheduled { delay_ms, .. } => {
                    saw_scheduled = true;
                    assert_eq!(delay_ms, 1_000);
                }
                _ => {}
            }
        }
        assert!(saw_reconnected);
        assert!(saw_scheduled);
    }

    #[tokio::test]
    async fn test_second_failure_backs_off_exponentially() {
        let (manager, _transport, _events, time) = manager();
        manager
            .connect(&peer_b(), ConnectOptions::default())
            .await
            .unwrap();

        manager.transport_state_changed(&peer_b(), ConnectionState::Failed);
        time.advance(1_100);
        manager.poll_reconnects().await;

        manager.transport_state_changed(&peer_b(), ConnectionState::Failed);
        let record = manager.peer(&peer_b()).unwrap();
        assert_eq!(record.reconnect_attempts, 2);
        // second delay is initial * multiplier
        assert_eq!(record.reconnect_at_ms, Some(101_100 + 2_000));
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_and_notifies() {
        let (manager, transport, mut events, _time) = manager();
        manager
            .connect(&peer_b(), ConnectOptions::default())
            .await
            .unwrap();

        manager.disconnect(&peer_b(), true).await.unwrap();
        assert!(manager.peer(&peer_b()).is_none());
        assert!(transport.calls().contains(&"close:peer_b".to_string()));

        let mut saw_renegotiate = false;
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::RenegotiateRequested { reason, .. } = event {
                saw_renegotiate = true;
                assert_eq!(reason, "disconnect");
            }
        }
        assert!(saw_renegotiate);

        assert!(matches!(
            manager.disconnect(&peer_b(), false).await,
            Err(NetError::PeerNotFound(_))
        ));
    }
}
