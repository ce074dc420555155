//! The coordination manager.
//!
//! Owns the local identity and the peer registry, runs the
//! challenge/response authentication handshake, wires one health monitor
//! per peer and the sync orchestrator onto the signed coordination
//! envelope channel, and fans events out to registered handlers. The
//! manager never panics; failures transition the affected peer to
//! `Failed` or `Disconnected`.

use crate::events::CoordinationEvent;
use crate::{CoordResult, CoordinationError};
use aqe_common::{ReplicaId, RngProvider, TimeProvider};
use aqe_crdt::CrdtStore;
use aqe_identity::{PublicKeyBytes, Signer};
use aqe_pattern::{PatternCrdt, PatternIndex};
use aqe_protocol::{
    AuthChallenge, AuthResponse, AuthResult, CoordinationEnvelope, CoordinationPayload,
    PatternSyncRequest, PatternSyncResponse, PingPayload, PongPayload,
};
use aqe_sync::{
    HealthConfig, HealthLevel, HealthMonitor, HealthStatus, SyncConfig, SyncError, SyncEvent,
    SyncOrchestrator, SyncResult, SyncTransport,
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Timeout awaiting a sync or state-fetch response.
    pub sync_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub health: HealthConfig,
    pub sync: SyncConfig,
    /// Challenge nonce length in bytes.
    pub nonce_bytes: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 10_000,
            ping_interval_ms: 5_000,
            health: HealthConfig::default(),
            sync: SyncConfig::default(),
            nonce_bytes: 32,
        }
    }
}

/// Authentication lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerAuthState {
    Connecting,
    Authenticating,
    Authenticated,
    Disconnected,
    Failed,
}

/// Per-peer traffic and sync counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub syncs_completed: u64,
    pub patterns_synced: u64,
    pub last_sync_ms: Option<u64>,
}

/// Registry entry for one peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: ReplicaId,
    /// Declared public key; None until learned from discovery or the
    /// peer's auth response.
    pub public_key: Option<PublicKeyBytes>,
    pub state: PeerAuthState,
    pub last_seen_ms: u64,
    pub metrics: PeerMetrics,
    our_nonce: Option<String>,
    last_health_level: Option<HealthLevel>,
}

impl PeerEntry {
    fn new(peer_id: ReplicaId, public_key: Option<PublicKeyBytes>, now_ms: u64) -> Self {
        Self {
            peer_id,
            public_key,
            state: PeerAuthState::Connecting,
            last_seen_ms: now_ms,
            metrics: PeerMetrics::default(),
            our_nonce: None,
            last_health_level: None,
        }
    }
}

/// Outbound envelope channel; backed by the peer-connection manager's
/// reliable data channel in production.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_envelope(
        &self,
        peer: &ReplicaId,
        envelope: CoordinationEnvelope,
    ) -> CoordResult<()>;
}

#[derive(Default)]
struct PendingRequests {
    syncs: StdMutex<HashMap<String, oneshot::Sender<PatternSyncResponse>>>,
    fetches: StdMutex<HashMap<String, oneshot::Sender<aqe_crdt::StoredCrdtState>>>,
}

/// [`SyncTransport`] implementation that rides the signed coordination
/// envelopes and correlates responses by request id.
struct EnvelopeSyncTransport {
    local: ReplicaId,
    signer: Arc<dyn Signer>,
    sender: Arc<dyn PeerSender>,
    pending: Arc<PendingRequests>,
    broadcast_targets: Arc<StdRwLock<HashSet<ReplicaId>>>,
    time: Arc<dyn TimeProvider>,
    timeout_ms: u64,
}

impl EnvelopeSyncTransport {
    async fn send_payload(&self, peer: &ReplicaId, payload: CoordinationPayload) -> SyncResult<()> {
        let envelope = CoordinationEnvelope::signed(
            self.local.clone(),
            payload,
            self.time.unix_millis(),
            self.signer.as_ref(),
        )
        .map_err(|e| SyncError::Network(e.to_string()))?;
        self.sender
            .send_envelope(peer, envelope)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for EnvelopeSyncTransport {
    async fn send_sync_request(
        &self,
        peer: &ReplicaId,
        request: PatternSyncRequest,
    ) -> SyncResult<PatternSyncResponse> {
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .syncs
            .lock()
            .expect("pending lock")
            .insert(request_id.clone(), tx);

        self.send_payload(peer, CoordinationPayload::SyncRequest(request))
            .await?;

        let timeout = std::time::Duration::from_millis(self.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SyncError::Network("response channel dropped".to_string())),
            Err(_) => {
                self.pending
                    .syncs
                    .lock()
                    .expect("pending lock")
                    .remove(&request_id);
                Err(SyncError::Timeout(format!("sync request to {peer}")))
            }
        }
    }

    async fn send_deltas(&self, peer: &ReplicaId, deltas: Vec<aqe_crdt::Delta>) -> SyncResult<()> {
        self.send_payload(peer, CoordinationPayload::Deltas(deltas))
            .await
    }

    async fn fetch_state(
        &self,
        peer: &ReplicaId,
        crdt_id: &str,
    ) -> SyncResult<aqe_crdt::StoredCrdtState> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .fetches
            .lock()
            .expect("pending lock")
            .insert(request_id.clone(), tx);

        self.send_payload(
            peer,
            CoordinationPayload::StateFetchRequest {
                request_id: request_id.clone(),
                crdt_id: crdt_id.to_string(),
            },
        )
        .await?;

        let timeout = std::time::Duration::from_millis(self.timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(SyncError::Network("fetch channel dropped".to_string())),
            Err(_) => {
                self.pending
                    .fetches
                    .lock()
                    .expect("pending lock")
                    .remove(&request_id);
                Err(SyncError::Timeout(format!("state fetch from {peer}")))
            }
        }
    }

    async fn broadcast(&self, broadcast: aqe_protocol::PatternBroadcast) -> SyncResult<()> {
        let targets: Vec<ReplicaId> = self
            .broadcast_targets
            .read()
            .expect("targets lock")
            .iter()
            .cloned()
            .collect();
        for peer in targets {
            if let Err(e) = self
                .send_payload(&peer, CoordinationPayload::Broadcast(broadcast.clone()))
                .await
            {
                debug!("broadcast to {peer} failed: {e}");
            }
        }
        Ok(())
    }
}

/// Top-level coordination facade.
pub struct CoordinationManager {
    local: ReplicaId,
    signer: Arc<dyn Signer>,
    config: CoordinationConfig,
    sender: Arc<dyn PeerSender>,
    peers: DashMap<ReplicaId, PeerEntry>,
    monitors: DashMap<ReplicaId, HealthMonitor>,
    orchestrator: Arc<SyncOrchestrator>,
    sync_events: Mutex<mpsc::UnboundedReceiver<SyncEvent>>,
    pending: Arc<PendingRequests>,
    broadcast_targets: Arc<StdRwLock<HashSet<ReplicaId>>>,
    store: Arc<RwLock<CrdtStore>>,
    #[allow(clippy::type_complexity)]
    handlers: StdRwLock<HashMap<String, Vec<Arc<dyn Fn(&CoordinationEvent) + Send + Sync>>>>,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
}

impl CoordinationManager {
    /// Assemble the coordination plane around the shared pattern index and
    /// CRDT store.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: ReplicaId,
        signer: Arc<dyn Signer>,
        sender: Arc<dyn PeerSender>,
        index: Arc<RwLock<PatternIndex>>,
        store: Arc<RwLock<CrdtStore>>,
        config: CoordinationConfig,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> Self {
        let pending = Arc::new(PendingRequests::default());
        let broadcast_targets = Arc::new(StdRwLock::new(HashSet::new()));
        let patterns = Arc::new(RwLock::new(HashMap::<String, PatternCrdt>::new()));

        let transport = Arc::new(EnvelopeSyncTransport {
            local: local.clone(),
            signer: signer.clone(),
            sender: sender.clone(),
            pending: pending.clone(),
            broadcast_targets: broadcast_targets.clone(),
            time: time.clone(),
            timeout_ms: config.sync_timeout_ms,
        });
        let (orchestrator, sync_events) = SyncOrchestrator::new(
            local.clone(),
            config.sync.clone(),
            transport,
            index,
            patterns,
            store.clone(),
            time.clone(),
            rng.clone(),
        );

        Self {
            local,
            signer,
            config,
            sender,
            peers: DashMap::new(),
            monitors: DashMap::new(),
            orchestrator: Arc::new(orchestrator),
            sync_events: Mutex::new(sync_events),
            pending,
            broadcast_targets,
            store,
            handlers: StdRwLock::new(HashMap::new()),
            time,
            rng,
        }
    }

    /// The local replica id.
    pub fn local_id(&self) -> &ReplicaId {
        &self.local
    }

    /// The sync orchestrator (for pattern publication and broadcasts).
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Registry snapshot for a peer.
    pub fn peer(&self, peer: &ReplicaId) -> Option<PeerEntry> {
        self.peers.get(peer).map(|e| e.clone())
    }

    /// Peers eligible for sync and health monitoring.
    pub fn authenticated_peers(&self) -> Vec<ReplicaId> {
        self.peers
            .iter()
            .filter(|e| e.state == PeerAuthState::Authenticated)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Register an event handler for one event tag, or `"*"` for all.
    pub fn on<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&CoordinationEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("handlers lock")
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    fn emit(&self, event: CoordinationEvent) {
        let handlers = self.handlers.read().expect("handlers lock");
        for key in [event.event_type(), "*"] {
            if let Some(list) = handlers.get(key) {
                for handler in list {
                    handler(&event);
                }
            }
        }
    }

    /// Begin authenticating a peer whose public key discovery provided.
    /// The challenge goes out immediately.
    pub async fn connect(&self, peer: ReplicaId, public_key: PublicKeyBytes) -> CoordResult<()> {
        let now = self.time.unix_millis();
        let nonce = self.fresh_nonce();
        {
            let mut entry = self
                .peers
                .entry(peer.clone())
                .or_insert_with(|| PeerEntry::new(peer.clone(), None, now));
            entry.public_key = Some(public_key);
            entry.state = PeerAuthState::Authenticating;
            entry.our_nonce = Some(nonce.clone());
        }

        info!("authenticating peer {peer}");
        self.send_payload(
            &peer,
            CoordinationPayload::AuthChallenge(AuthChallenge { nonce }),
        )
        .await
    }

    /// Drop a peer from active duty. The entry stays in the registry so a
    /// later `connect` can retry.
    pub async fn disconnect(&self, peer: &ReplicaId, reason: &str) -> CoordResult<()> {
        {
            let mut entry = self
                .peers
                .get_mut(peer)
                .ok_or_else(|| CoordinationError::PeerNotFound(peer.clone()))?;
            entry.state = PeerAuthState::Disconnected;
            entry.our_nonce = None;
        }
        self.broadcast_targets
            .write()
            .expect("targets lock")
            .remove(peer);
        self.monitors.remove(peer);
        info!("disconnected peer {peer}: {reason}");
        self.emit(CoordinationEvent::PeerDisconnected {
            peer: peer.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Synchronize patterns with an authenticated peer.
    pub async fn sync_patterns(&self, peer: &ReplicaId) -> CoordResult<usize> {
        self.require_authenticated(peer)?;
        let synced = self.orchestrator.sync_with_peer(peer).await?;
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.metrics.syncs_completed += 1;
            entry.metrics.patterns_synced += synced as u64;
            entry.metrics.last_sync_ms = Some(self.time.unix_millis());
        }
        Ok(synced)
    }

    /// Ship outstanding CRDT deltas to an authenticated peer.
    pub async fn ship_deltas(&self, peer: &ReplicaId) -> CoordResult<usize> {
        self.require_authenticated(peer)?;
        Ok(self.orchestrator.ship_deltas(peer).await?)
    }

    /// Current health of a peer, when monitored.
    pub fn get_health(&self, peer: &ReplicaId) -> Option<HealthStatus> {
        self.monitors
            .get(peer)
            .map(|m| m.status(self.time.unix_millis()))
    }

    /// Traffic and sync counters for a peer.
    pub fn get_metrics(&self, peer: &ReplicaId) -> Option<PeerMetrics> {
        self.peers.get(peer).map(|e| e.metrics.clone())
    }

    /// Send a liveness ping to an authenticated peer.
    pub async fn ping_peer(&self, peer: &ReplicaId) -> CoordResult<()> {
        self.require_authenticated(peer)?;
        let now = self.time.unix_millis();
        {
            let mut monitor = self
                .monitors
                .entry(peer.clone())
                .or_insert_with(|| HealthMonitor::new(peer.clone(), self.config.health.clone()));
            monitor.record_ping_sent(now, now);
        }
        self.send_payload(peer, CoordinationPayload::Ping(PingPayload { timestamp: now }))
            .await
    }

    /// One maintenance pass: ping peers, run health checks, and forward
    /// orchestrator events.
    pub async fn tick(&self) {
        for peer in self.authenticated_peers() {
            if let Err(e) = self.ping_peer(&peer).await {
                debug!("ping to {peer} failed: {e}");
            }
        }
        self.run_health_checks();
        self.drain_sync_events().await;
    }

    /// Run a health check for every monitored peer, emitting
    /// `HealthChanged` on level transitions.
    pub fn run_health_checks(&self) {
        let now = self.time.unix_millis();
        for mut monitor in self.monitors.iter_mut() {
            let status = monitor.check(now);
            let peer = monitor.key().clone();
            drop(monitor);
            self.note_health(&peer, status);
        }
    }

    /// Forward queued orchestrator events to the registered handlers.
    pub async fn drain_sync_events(&self) {
        let mut receiver = self.sync_events.lock().await;
        while let Ok(event) = receiver.try_recv() {
            let mapped = match event {
                SyncEvent::SyncStarted { peer } => CoordinationEvent::SyncStarted { peer },
                SyncEvent::SyncCompleted {
                    peer,
                    synced,
                    conflicts,
                } => CoordinationEvent::SyncCompleted {
                    peer,
                    synced,
                    conflicts: conflicts.len(),
                },
                SyncEvent::SyncFailed {
                    peer,
                    error,
                    retryable,
                } => CoordinationEvent::SyncFailed {
                    peer,
                    error,
                    retryable,
                },
                SyncEvent::ConflictDetected { peer, conflict } => {
                    CoordinationEvent::ConflictDetected { peer, conflict }
                }
                SyncEvent::DeltaGap { peer, crdt_id } => {
                    debug!("delta gap with {peer} on {crdt_id}");
                    continue;
                }
            };
            self.emit(mapped);
        }
    }

    /// Process one inbound coordination envelope. Signatures are verified
    /// against the peer's declared key before any state mutation; auth
    /// messages bootstrap that key.
    pub async fn handle_envelope(&self, envelope: CoordinationEnvelope) -> CoordResult<()> {
        let sender = envelope.sender.clone();
        let now = self.time.unix_millis();

        let is_auth_payload = matches!(
            envelope.payload,
            CoordinationPayload::AuthChallenge(_)
                | CoordinationPayload::AuthResponse(_)
                | CoordinationPayload::AuthResult(_)
        );

        if !is_auth_payload {
            let key = self.peers.get(&sender).and_then(|e| e.public_key.clone());
            match key {
                Some(key) if envelope.verify(self.signer.as_ref(), &key) => {}
                Some(_) => {
                    warn!("dropping envelope from {sender}: bad signature");
                    return Err(CoordinationError::AuthFailed(sender));
                }
                None => {
                    warn!("dropping envelope from unauthenticated peer {sender}");
                    return Err(CoordinationError::NotAuthenticated(sender));
                }
            }
        }

        if let Some(mut entry) = self.peers.get_mut(&sender) {
            entry.last_seen_ms = now;
            entry.metrics.messages_received += 1;
        }

        match envelope.payload {
            CoordinationPayload::AuthChallenge(challenge) => {
                self.handle_auth_challenge(&sender, challenge).await
            }
            CoordinationPayload::AuthResponse(response) => {
                self.handle_auth_response(&sender, response).await
            }
            CoordinationPayload::AuthResult(result) => self.handle_auth_result(&sender, result),
            CoordinationPayload::Ping(ping) => {
                self.send_payload(
                    &sender,
                    CoordinationPayload::Pong(PongPayload {
                        original_timestamp: ping.timestamp,
                        respond_timestamp: now,
                    }),
                )
                .await
            }
            CoordinationPayload::Pong(pong) => {
                let status = {
                    let mut monitor = self.monitors.entry(sender.clone()).or_insert_with(|| {
                        HealthMonitor::new(sender.clone(), self.config.health.clone())
                    });
                    monitor.record_pong(pong.original_timestamp, now)
                };
                self.note_health(&sender, status);
                Ok(())
            }
            CoordinationPayload::SyncRequest(request) => {
                let response = self.orchestrator.handle_sync_request(&request).await?;
                self.send_payload(&sender, CoordinationPayload::SyncResponse(response))
                    .await
            }
            CoordinationPayload::SyncResponse(response) => {
                let waiter = self
                    .pending
                    .syncs
                    .lock()
                    .expect("pending lock")
                    .remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("stale sync response {}", response.request_id),
                }
                Ok(())
            }
            CoordinationPayload::Deltas(deltas) => {
                self.orchestrator.handle_remote_deltas(&sender, deltas).await?;
                Ok(())
            }
            CoordinationPayload::Broadcast(broadcast) => {
                if let Some(relay) = self.orchestrator.handle_broadcast(broadcast).await {
                    let targets: Vec<ReplicaId> = {
                        let targets = self.broadcast_targets.read().expect("targets lock");
                        targets.iter().filter(|p| **p != sender).cloned().collect()
                    };
                    for peer in targets {
                        let _ = self
                            .send_payload(&peer, CoordinationPayload::Broadcast(relay.clone()))
                            .await;
                    }
                }
                Ok(())
            }
            CoordinationPayload::StateFetchRequest {
                request_id,
                crdt_id,
            } => {
                let snapshot = {
                    let store = self.store.read().await;
                    store.snapshot(&crdt_id)?
                };
                let state = serde_json::to_value(&snapshot)
                    .map_err(|e| CoordinationError::SendFailure(e.to_string()))?;
                self.send_payload(
                    &sender,
                    CoordinationPayload::StateFetchResponse {
                        request_id,
                        crdt_id,
                        state,
                    },
                )
                .await
            }
            CoordinationPayload::StateFetchResponse {
                request_id, state, ..
            } => {
                let waiter = self
                    .pending
                    .fetches
                    .lock()
                    .expect("pending lock")
                    .remove(&request_id);
                if let Some(tx) = waiter {
                    match serde_json::from_value(state) {
                        Ok(snapshot) => {
                            let _ = tx.send(snapshot);
                        }
                        Err(e) => warn!("undecodable state fetch response: {e}"),
                    }
                }
                Ok(())
            }
        }
    }

    async fn handle_auth_challenge(
        &self,
        sender: &ReplicaId,
        challenge: AuthChallenge,
    ) -> CoordResult<()> {
        let now = self.time.unix_millis();
        let needs_own_challenge = {
            let mut entry = self
                .peers
                .entry(sender.clone())
                .or_insert_with(|| PeerEntry::new(sender.clone(), None, now));
            // auth failure is unrecoverable for the session; only an
            // explicit connect() restarts it
            if entry.state == PeerAuthState::Failed {
                warn!("ignoring challenge from failed peer {sender}");
                return Err(CoordinationError::AuthFailed(sender.clone()));
            }
            if entry.state != PeerAuthState::Authenticated {
                entry.state = PeerAuthState::Authenticating;
            }
            entry.public_key.is_none() && entry.our_nonce.is_none()
        };

        let bytes = AuthResponse::signing_bytes(&challenge.nonce, &self.local);
        let response = AuthResponse {
            nonce: challenge.nonce,
            responder: self.local.clone(),
            public_key: self.signer.public_key(),
            signature: self.signer.sign(&bytes),
        };
        self.send_payload(sender, CoordinationPayload::AuthResponse(response))
            .await?;

        // we have no key on file for this peer: challenge it back so both
        // directions end up authenticated
        if needs_own_challenge {
            let nonce = self.fresh_nonce();
            if let Some(mut entry) = self.peers.get_mut(sender) {
                entry.our_nonce = Some(nonce.clone());
            }
            self.send_payload(
                sender,
                CoordinationPayload::AuthChallenge(AuthChallenge { nonce }),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_auth_response(
        &self,
        sender: &ReplicaId,
        response: AuthResponse,
    ) -> CoordResult<()> {
        let (expected_nonce, declared_key) = match self.peers.get(sender) {
            Some(entry) => (entry.our_nonce.clone(), entry.public_key.clone()),
            None => (None, None),
        };

        let Some(expected_nonce) = expected_nonce else {
            warn!("unsolicited auth response from {sender}");
            return Err(CoordinationError::AuthFailed(sender.clone()));
        };

        let verify_key = declared_key.unwrap_or_else(|| response.public_key.clone());
        let bytes = AuthResponse::signing_bytes(&response.nonce, &response.responder);
        let ok = response.nonce == expected_nonce
            && &response.responder == sender
            && self
                .signer
                .verify(&bytes, &response.signature, &verify_key);

        if ok {
            {
                let mut entry = self
                    .peers
                    .get_mut(sender)
                    .ok_or_else(|| CoordinationError::PeerNotFound(sender.clone()))?;
                entry.state = PeerAuthState::Authenticated;
                entry.public_key = Some(verify_key);
                entry.our_nonce = None;
            }
            self.broadcast_targets
                .write()
                .expect("targets lock")
                .insert(sender.clone());

            self.send_payload(
                sender,
                CoordinationPayload::AuthResult(AuthResult {
                    ok: true,
                    reason: None,
                }),
            )
            .await?;
            info!("peer {sender} authenticated");
            self.emit(CoordinationEvent::PeerAuthenticated {
                peer: sender.clone(),
            });
            Ok(())
        } else {
            if let Some(mut entry) = self.peers.get_mut(sender) {
                entry.state = PeerAuthState::Failed;
                entry.our_nonce = None;
            }
            let _ = self
                .send_payload(
                    sender,
                    CoordinationPayload::AuthResult(AuthResult {
                        ok: false,
                        reason: Some("signature verification failed".to_string()),
                    }),
                )
                .await;
            warn!("authentication of {sender} failed");
            self.emit(CoordinationEvent::PeerDisconnected {
                peer: sender.clone(),
                reason: "authentication failed".to_string(),
            });
            Err(CoordinationError::AuthFailed(sender.clone()))
        }
    }

    fn handle_auth_result(&self, sender: &ReplicaId, result: AuthResult) -> CoordResult<()> {
        let Some(mut entry) = self.peers.get_mut(sender) else {
            return Err(CoordinationError::PeerNotFound(sender.clone()));
        };

        if result.ok {
            if entry.state == PeerAuthState::Authenticating {
                entry.state = PeerAuthState::Authenticated;
                drop(entry);
                self.broadcast_targets
                    .write()
                    .expect("targets lock")
                    .insert(sender.clone());
                self.emit(CoordinationEvent::PeerAuthenticated {
                    peer: sender.clone(),
                });
            }
            Ok(())
        } else {
            let reason = result.reason.unwrap_or_else(|| "rejected".to_string());
            entry.state = PeerAuthState::Failed;
            drop(entry);
            warn!("peer {sender} rejected our authentication: {reason}");
            self.emit(CoordinationEvent::PeerDisconnected {
                peer: sender.clone(),
                reason,
            });
            Err(CoordinationError::AuthFailed(sender.clone()))
        }
    }

    fn note_health(&self, peer: &ReplicaId, status: HealthStatus) {
        let changed = {
            let Some(mut entry) = self.peers.get_mut(peer) else {
                return;
            };
            let changed = entry.last_health_level != Some(status.level);
            entry.last_health_level = Some(status.level);
            changed
        };
        if changed {
            self.emit(CoordinationEvent::HealthChanged {
                peer: peer.clone(),
                status,
            });
        }
    }

    fn require_authenticated(&self, peer: &ReplicaId) -> CoordResult<()> {
        match self.peers.get(peer) {
            Some(entry) if entry.state == PeerAuthState::Authenticated => Ok(()),
            Some(_) => Err(CoordinationError::NotAuthenticated(peer.clone())),
            None => Err(CoordinationError::PeerNotFound(peer.clone())),
        }
    }

    fn fresh_nonce(&self) -> String {
        let mut bytes = vec![0u8; self.config.nonce_bytes];
        self.rng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    async fn send_payload(
        &self,
        peer: &ReplicaId,
        payload: CoordinationPayload,
    ) -> CoordResult<()> {
        let envelope = CoordinationEnvelope::signed(
            self.local.clone(),
            payload,
            self.time.unix_millis(),
            self.signer.as_ref(),
        )?;
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.metrics.messages_sent += 1;
        }
        self.sender.send_envelope(peer, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::{FixedTimeProvider, SeededRngProvider};
    use aqe_identity::Ed25519Signer;
    use aqe_pattern::{IndexConfig, PatternCategory, PatternContent, SharedPattern};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Routes envelopes directly into the target manager.
    #[derive(Default)]
    struct Router {
        managers: StdRwLock<HashMap<ReplicaId, Arc<CoordinationManager>>>,
    }

    impl Router {
        fn register(&self, manager: Arc<CoordinationManager>) {
            self.managers
                .write()
                .unwrap()
                .insert(manager.local_id().clone(), manager);
        }
    }

    #[async_trait]
    impl PeerSender for Router {
        async fn send_envelope(
            &self,
            peer: &ReplicaId,
            envelope: CoordinationEnvelope,
        ) -> CoordResult<()> {
            let target = self.managers.read().unwrap().get(peer).cloned();
            match target {
                Some(manager) => {
                    // delivery failures on the far side are the far side's
                    // problem, not a send failure
                    let _ = manager.handle_envelope(envelope).await;
                    Ok(())
                }
                None => Err(CoordinationError::SendFailure(format!(
                    "no route to {peer}"
                ))),
            }
        }
    }

    fn build_manager(
        name: &str,
        router: Arc<Router>,
        time: FixedTimeProvider,
    ) -> (Arc<CoordinationManager>, Arc<Ed25519Signer>) {
        let signer = Arc::new(Ed25519Signer::generate());
        let index = Arc::new(RwLock::new(PatternIndex::new(
            IndexConfig::default(),
            Arc::new(time.clone()),
        )));
        let store = Arc::new(RwLock::new(CrdtStore::new(ReplicaId::new(name))));
        let manager = Arc::new(CoordinationManager::new(
            ReplicaId::new(name),
            signer.clone(),
            router.clone(),
            index,
            store,
            CoordinationConfig::default(),
            Arc::new(time.clone()),
            Arc::new(SeededRngProvider::new(7)),
        ));
        router.register(manager.clone());
        (manager, signer)
    }

    fn pattern(id: &str, raw: &str) -> SharedPattern {
        SharedPattern::new(
            id,
            PatternCategory::Test,
            PatternContent::from_raw(raw, "typescript"),
            vec![1.0, 0.0, 0.0, 0.0],
            0,
        )
    }

    #[tokio::test]
    async fn test_mutual_authentication_handshake() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (b, b_signer) = build_manager("replica_b", router.clone(), time.clone());

        let authenticated = Arc::new(AtomicUsize::new(0));
        let counter = authenticated.clone();
        a.on("PeerAuthenticated", move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();

        assert_eq!(
            a.peer(&ReplicaId::new("replica_b")).unwrap().state,
            PeerAuthState::Authenticated
        );
        // b challenged back and authenticated a as well
        assert_eq!(
            b.peer(&ReplicaId::new("replica_a")).unwrap().state,
            PeerAuthState::Authenticated
        );
        assert_eq!(authenticated.load(Ordering::SeqCst), 1);
        assert_eq!(a.authenticated_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_fails_with_wrong_declared_key() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (_b, _b_signer) = build_manager("replica_b", router.clone(), time.clone());

        // declare a key that does not match b's real key
        let imposter = Ed25519Signer::generate();
        a.connect(ReplicaId::new("replica_b"), imposter.public_key())
            .await
            .unwrap();

        let entry = a.peer(&ReplicaId::new("replica_b")).unwrap();
        assert_eq!(entry.state, PeerAuthState::Failed);
        assert!(a.authenticated_peers().is_empty());
    }

    #[tokio::test]
    async fn test_sync_requires_authentication() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _) = build_manager("replica_a", router.clone(), time.clone());

        let err = a.sync_patterns(&ReplicaId::new("replica_b")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::PeerNotFound(_)));

        // an entry that exists but is not authenticated is rejected too
        let (_b, b_signer) = build_manager("replica_b", router.clone(), time.clone());
        let _ = b_signer;
        let now = time.unix_millis();
        a.peers.insert(
            ReplicaId::new("replica_b"),
            PeerEntry::new(ReplicaId::new("replica_b"), None, now),
        );
        let err = a.sync_patterns(&ReplicaId::new("replica_b")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn test_end_to_end_pattern_sync() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (b, b_signer) = build_manager("replica_b", router.clone(), time.clone());

        // b owns a pattern worth sharing
        b.orchestrator()
            .merge_remote_pattern(pattern("p-login", "expect(login()).toBeTruthy()"))
            .await
            .unwrap();

        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();

        let synced = a.sync_patterns(&ReplicaId::new("replica_b")).await.unwrap();
        assert_eq!(synced, 1);

        let metrics = a.get_metrics(&ReplicaId::new("replica_b")).unwrap();
        assert_eq!(metrics.syncs_completed, 1);
        assert_eq!(metrics.patterns_synced, 1);

        // completed event reaches handlers via drain
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        a.on("SyncCompleted", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        a.drain_sync_events().await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ping_pong_feeds_health_monitor() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (_b, b_signer) = build_manager("replica_b", router.clone(), time.clone());

        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();

        a.ping_peer(&ReplicaId::new("replica_b")).await.unwrap();

        let health = a.get_health(&ReplicaId::new("replica_b")).unwrap();
        assert!(health.responsive);
        assert_eq!(health.level, aqe_sync::HealthLevel::Healthy);
        // the pong came back within the same fixed-time instant
        assert_eq!(health.current_rtt_ms, Some(0));
    }

    #[tokio::test]
    async fn test_unauthenticated_envelopes_are_rejected() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());

        let stranger = Ed25519Signer::generate();
        let envelope = CoordinationEnvelope::signed(
            ReplicaId::new("stranger"),
            CoordinationPayload::Ping(PingPayload { timestamp: 1 }),
            1,
            &stranger,
        )
        .unwrap();

        let result = a.handle_envelope(envelope).await;
        assert!(matches!(
            result,
            Err(CoordinationError::NotAuthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_registry_entry() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (_b, b_signer) = build_manager("replica_b", router.clone(), time.clone());

        let disconnected = Arc::new(AtomicUsize::new(0));
        let counter = disconnected.clone();
        a.on("PeerDisconnected", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();
        a.disconnect(&ReplicaId::new("replica_b"), "operator request")
            .await
            .unwrap();

        let entry = a.peer(&ReplicaId::new("replica_b")).unwrap();
        assert_eq!(entry.state, PeerAuthState::Disconnected);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        // sync attempts are refused until connect() is called again
        assert!(a.sync_patterns(&ReplicaId::new("replica_b")).await.is_err());

        // reconnecting re-authenticates
        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();
        assert_eq!(
            a.peer(&ReplicaId::new("replica_b")).unwrap().state,
            PeerAuthState::Authenticated
        );
    }

    #[tokio::test]
    async fn test_wildcard_handler_sees_all_events() {
        let router = Arc::new(Router::default());
        let time = FixedTimeProvider::new(1_000_000);
        let (a, _a_signer) = build_manager("replica_a", router.clone(), time.clone());
        let (_b, b_signer) = build_manager("replica_b", router.clone(), time.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        a.on("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.connect(ReplicaId::new("replica_b"), b_signer.public_key())
            .await
            .unwrap();
        assert!(seen.load(Ordering::SeqCst) >= 1);
    }
}
