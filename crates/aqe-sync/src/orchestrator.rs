//! Sync orchestration.
//!
//! Reconciles pattern and CRDT state with connected peers: pull-based
//! pattern sync driven by version clocks with pagination, policy-filtered
//! responses with anonymization and differential privacy applied per
//! pattern, CRDT delta shipping with per-origin sequence gating and a
//! bounded out-of-order buffer, token-bucket rate limits, and retry with
//! backoff for transient failures. Per-peer syncs are serialized; syncs
//! with distinct peers run concurrently.

use crate::{SyncError, SyncResult};
use aqe_common::{
    ReplicaId, RngProvider, TimeProvider, TokenBucket, TokenBucketConfig,
};
use aqe_crdt::{Crdt, CrdtStore, Delta, MergeConflict, StoredCrdtState, VectorClock};
use aqe_pattern::{
    apply_differential_privacy, Anonymizer, AnonymizerConfig, DpMechanism, DpParams,
    PatternCodec, PatternCrdt, PatternIndex, PrivacyLevel, SharedPattern,
};
use aqe_protocol::{PatternBroadcast, PatternSyncRequest, PatternSyncResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Transport the orchestrator speaks through; backed by the coordination
/// plane's authenticated peer channels.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send_sync_request(
        &self,
        peer: &ReplicaId,
        request: PatternSyncRequest,
    ) -> SyncResult<PatternSyncResponse>;

    async fn send_deltas(&self, peer: &ReplicaId, deltas: Vec<Delta>) -> SyncResult<()>;

    /// Full snapshot fetch after a delta gap.
    async fn fetch_state(&self, peer: &ReplicaId, crdt_id: &str) -> SyncResult<StoredCrdtState>;

    async fn broadcast(&self, broadcast: PatternBroadcast) -> SyncResult<()>;
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_interval_ms: u64,
    /// Patterns per response batch.
    pub max_batch_size: usize,
    /// Encoded-size budget per batch.
    pub max_bytes_per_batch: usize,
    pub syncs_per_minute: u64,
    pub broadcasts_per_minute: u64,
    pub patterns_per_hour: u64,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Out-of-order deltas buffered per (origin, CRDT) before a full state
    /// fetch is forced.
    pub delta_buffer_window: usize,
    /// Remembered broadcast ids for relay deduplication.
    pub broadcast_dedup_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            max_batch_size: 32,
            max_bytes_per_batch: 256 * 1024,
            syncs_per_minute: 12,
            broadcasts_per_minute: 30,
            patterns_per_hour: 500,
            max_retries: 3,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            delta_buffer_window: 64,
            broadcast_dedup_cap: 4_096,
        }
    }
}

/// Events surfaced to the coordination plane.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted {
        peer: ReplicaId,
    },
    SyncCompleted {
        peer: ReplicaId,
        synced: usize,
        conflicts: Vec<MergeConflict>,
    },
    SyncFailed {
        peer: ReplicaId,
        error: String,
        retryable: bool,
    },
    ConflictDetected {
        peer: ReplicaId,
        conflict: MergeConflict,
    },
    DeltaGap {
        peer: ReplicaId,
        crdt_id: String,
    },
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub syncs_completed: u64,
    pub syncs_failed: u64,
    pub patterns_synced: u64,
    pub patterns_shared: u64,
    pub deltas_shipped: u64,
    pub deltas_applied: u64,
    pub conflicts_detected: u64,
    pub state_fetches: u64,
}

/// Inbound delta sequencing for one (origin, CRDT) pair.
#[derive(Debug, Default)]
struct DeltaBuffer {
    last_applied_seq: u64,
    buffered: BTreeMap<u64, Delta>,
}

/// Orchestrates pattern and CRDT synchronization with peers.
pub struct SyncOrchestrator {
    local: ReplicaId,
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    index: Arc<RwLock<PatternIndex>>,
    patterns: Arc<RwLock<HashMap<String, PatternCrdt>>>,
    store: Arc<RwLock<CrdtStore>>,
    /// Aggregate store clock each peer is known to have acknowledged.
    peer_store_clocks: RwLock<HashMap<ReplicaId, VectorClock>>,
    /// Per-peer sync serialization.
    peer_locks: DashMap<ReplicaId, Arc<Mutex<()>>>,
    sync_buckets: DashMap<ReplicaId, Arc<TokenBucket>>,
    broadcast_bucket: TokenBucket,
    pattern_bucket: TokenBucket,
    delta_buffers: Mutex<HashMap<(ReplicaId, String), DeltaBuffer>>,
    /// Contiguous outbound sequence per (peer, CRDT) so receivers can gate
    /// ordering regardless of how many mutations one delta covers.
    outbound_seqs: Mutex<HashMap<(ReplicaId, String), u64>>,
    seen_broadcasts: Mutex<HashSet<String>>,
    codec: PatternCodec,
    anonymizer: Anonymizer,
    stats: Mutex<SyncStats>,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create an orchestrator. Returns it and its event stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: ReplicaId,
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        index: Arc<RwLock<PatternIndex>>,
        patterns: Arc<RwLock<HashMap<String, PatternCrdt>>>,
        store: Arc<RwLock<CrdtStore>>,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let broadcast_bucket = TokenBucket::new(
            TokenBucketConfig::per_minute(config.broadcasts_per_minute),
            time.clone(),
        );
        let pattern_bucket = TokenBucket::new(
            TokenBucketConfig::per_hour(config.patterns_per_hour),
            time.clone(),
        );
        (
            Self {
                local,
                config,
                transport,
                index,
                patterns,
                store,
                peer_store_clocks: RwLock::new(HashMap::new()),
                peer_locks: DashMap::new(),
                sync_buckets: DashMap::new(),
                broadcast_bucket,
                pattern_bucket,
                delta_buffers: Mutex::new(HashMap::new()),
                outbound_seqs: Mutex::new(HashMap::new()),
                seen_broadcasts: Mutex::new(HashSet::new()),
                codec: PatternCodec::new(),
                anonymizer: Anonymizer::new(AnonymizerConfig::default()),
                stats: Mutex::new(SyncStats::default()),
                time,
                rng,
                events,
            },
            receiver,
        )
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    fn peer_lock(&self, peer: &ReplicaId) -> Arc<Mutex<()>> {
        self.peer_locks
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn sync_bucket(&self, peer: &ReplicaId) -> Arc<TokenBucket> {
        self.sync_buckets
            .entry(peer.clone())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    TokenBucketConfig::per_minute(self.config.syncs_per_minute),
                    self.time.clone(),
                ))
            })
            .clone()
    }

    /// Pull patterns from a peer and merge them locally. Per-peer calls
    /// are serialized; rate limits apply per peer.
    pub async fn sync_with_peer(&self, peer: &ReplicaId) -> SyncResult<usize> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        if let Err(limited) = self.sync_bucket(peer).try_acquire() {
            return Err(SyncError::RateLimited {
                retry_after_ms: limited.retry_after_ms,
            });
        }

        let _ = self.events.send(SyncEvent::SyncStarted { peer: peer.clone() });

        let result = self.pull_patterns(peer).await;
        match result {
            Ok((synced, conflicts)) => {
                let mut stats = self.stats.lock().await;
                stats.syncs_completed += 1;
                stats.patterns_synced += synced as u64;
                stats.conflicts_detected += conflicts.len() as u64;
                drop(stats);

                info!(
                    "sync with {peer} completed: {synced} patterns, {} conflicts",
                    conflicts.len()
                );
                let _ = self.events.send(SyncEvent::SyncCompleted {
                    peer: peer.clone(),
                    synced,
                    conflicts,
                });
                Ok(synced)
            }
            Err(e) => {
                self.stats.lock().await.syncs_failed += 1;
                warn!("sync with {peer} failed: {e}");
                let _ = self.events.send(SyncEvent::SyncFailed {
                    peer: peer.clone(),
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                });
                Err(e)
            }
        }
    }

    async fn pull_patterns(
        &self,
        peer: &ReplicaId,
    ) -> SyncResult<(usize, Vec<MergeConflict>)> {
        let mut synced = 0usize;
        let mut conflicts = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let clocks: HashMap<String, VectorClock> = {
                let patterns = self.patterns.read().await;
                patterns
                    .iter()
                    .map(|(id, crdt)| (id.clone(), crdt.vector_clock().clone()))
                    .collect()
            };

            let mut request = PatternSyncRequest::new(self.local.clone(), self.time.unix_millis());
            request.vector_clocks = Some(clocks);
            request.continuation_token = continuation.clone();

            let response = self.send_with_retry(peer, request).await?;

            for pattern in &response.patterns {
                let outcome = self.merge_remote_pattern(pattern.clone()).await?;
                synced += 1;
                for conflict in outcome {
                    let _ = self.events.send(SyncEvent::ConflictDetected {
                        peer: peer.clone(),
                        conflict: conflict.clone(),
                    });
                    conflicts.push(conflict);
                }
            }

            if response.has_more && response.continuation_token.is_some() {
                continuation = response.continuation_token;
            } else {
                return Ok((synced, conflicts));
            }
        }
    }

    async fn send_with_retry(
        &self,
        peer: &ReplicaId,
        request: PatternSyncRequest,
    ) -> SyncResult<PatternSyncResponse> {
        let mut delay = self.config.retry_initial_delay_ms;
        let mut attempt = 0;
        loop {
            match self.transport.send_sync_request(peer, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    debug!("sync request to {peer} failed (attempt {attempt}), retrying: {e}");
                    let jitter = self.rng.next_u64() % (delay / 4 + 1);
                    tokio::time::sleep(std::time::Duration::from_millis(delay + jitter)).await;
                    delay = (delay * 2).min(self.config.retry_max_delay_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Merge a remote pattern through the pattern CRDT and refresh the
    /// index. Returns the conflicts the merge surfaced.
    pub async fn merge_remote_pattern(
        &self,
        pattern: SharedPattern,
    ) -> SyncResult<Vec<MergeConflict>> {
        let now = self.time.unix_millis();
        let mut patterns = self.patterns.write().await;

        let conflicts = match patterns.get_mut(&pattern.id) {
            Some(existing) => {
                let remote = PatternCrdt::new(pattern.clone(), self.local.clone(), now);
                let outcome = existing.merge_state(&remote, now)?;
                if outcome.local_changed {
                    let merged = existing.pattern().clone();
                    drop(patterns);
                    let _ = self.index.write().await.add(merged);
                } else {
                    drop(patterns);
                }
                outcome.conflicts
            }
            None => {
                let crdt = PatternCrdt::new(pattern.clone(), self.local.clone(), now);
                patterns.insert(pattern.id.clone(), crdt);
                drop(patterns);
                let _ = self.index.write().await.add(pattern)?;
                Vec::new()
            }
        };

        Ok(conflicts)
    }

    /// Answer a peer's sync request: policy-filtered patterns whose clocks
    /// the requester does not dominate, privacy transformations applied,
    /// batched with pagination.
    pub async fn handle_sync_request(
        &self,
        request: &PatternSyncRequest,
    ) -> SyncResult<PatternSyncResponse> {
        let requester = &request.requester;
        let offset: usize = request
            .continuation_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);

        // assemble the candidate list under a stable order
        let mut candidates: Vec<SharedPattern> = {
            let patterns = self.patterns.read().await;
            patterns
                .values()
                .filter(|crdt| {
                    let p = crdt.pattern();
                    if !p.sharing.permits(requester) {
                        return false;
                    }
                    // patterns learned from elsewhere need redistribution
                    // rights before they are forwarded
                    if p.metadata.source.is_some() && !p.sharing.redistributable {
                        return false;
                    }
                    match request
                        .vector_clocks
                        .as_ref()
                        .and_then(|clocks| clocks.get(&p.id))
                    {
                        Some(known) => !known.dominates_or_equal(&p.version.vector_clock),
                        None => true,
                    }
                })
                .map(|crdt| crdt.pattern().clone())
                .collect()
        };
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(ids) = &request.pattern_ids {
            let wanted: HashSet<&String> = ids.iter().collect();
            candidates.retain(|p| wanted.contains(&p.id));
        }

        let total = candidates.len();
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        let mut next_offset = offset;

        for pattern in candidates.into_iter().skip(offset) {
            if batch.len() >= self.config.max_batch_size {
                break;
            }
            if self.pattern_bucket.try_acquire().is_err() {
                debug!("pattern share budget exhausted; truncating batch");
                break;
            }

            let prepared = self.apply_sharing_policy(pattern)?;
            let encoded_len = self.codec.serialize(&prepared)?.len();
            if !batch.is_empty() && bytes + encoded_len > self.config.max_bytes_per_batch {
                break;
            }
            bytes += encoded_len;
            next_offset += 1;
            batch.push(prepared);
        }

        self.stats.lock().await.patterns_shared += batch.len() as u64;

        let has_more = next_offset < total;
        Ok(PatternSyncResponse {
            request_id: request.request_id.clone(),
            responder: self.local.clone(),
            patterns: if request.include_content {
                batch
            } else {
                batch
                    .into_iter()
                    .map(|mut p| {
                        p.content.raw = String::new();
                        p.content.normalized = None;
                        p
                    })
                    .collect()
            },
            conflicts: Vec::new(),
            has_more,
            continuation_token: has_more.then(|| next_offset.to_string()),
            timestamp: self.time.unix_millis(),
        })
    }

    /// Apply the pattern's privacy transformations before it leaves the
    /// replica.
    fn apply_sharing_policy(&self, mut pattern: SharedPattern) -> SyncResult<SharedPattern> {
        if matches!(
            pattern.sharing.privacy,
            PrivacyLevel::Anonymized | PrivacyLevel::Differential
        ) {
            let (anonymized, _report) = self.anonymizer.anonymize(&pattern.content.raw);
            pattern.content.anonymized = Some(anonymized.clone());
            pattern.content.raw = anonymized;
            pattern.content.normalized = None;
        }

        if pattern.sharing.differential_privacy
            || pattern.sharing.privacy == PrivacyLevel::Differential
        {
            let params = pattern
                .sharing
                .dp_params
                .as_ref()
                .map(|p| DpParams {
                    epsilon: p.epsilon,
                    delta: p.delta,
                    mechanism: DpMechanism::Laplace,
                    sensitivity: p.sensitivity,
                    clip_norm: p.clip_norm,
                })
                .unwrap_or_default();
            if !pattern.embedding.is_empty() {
                let result =
                    apply_differential_privacy(&pattern.embedding, &params, self.rng.as_ref())?;
                pattern.embedding = result.noised;
            }
        }

        Ok(pattern)
    }

    /// Ship CRDT deltas the peer has not acknowledged yet.
    pub async fn ship_deltas(&self, peer: &ReplicaId) -> SyncResult<usize> {
        let known = {
            let clocks = self.peer_store_clocks.read().await;
            clocks.get(peer).cloned().unwrap_or_default()
        };

        let mut deltas = {
            let mut store = self.store.write().await;
            store.generate_deltas(Some(&known))
        };
        if deltas.is_empty() {
            return Ok(0);
        }

        {
            let mut seqs = self.outbound_seqs.lock().await;
            for delta in &mut deltas {
                let entry = seqs
                    .entry((peer.clone(), delta.crdt_id.clone()))
                    .or_insert(0);
                *entry += 1;
                delta.sequence = *entry;
            }
        }

        let mut shipped = 0usize;
        for chunk in deltas.chunks(self.config.max_batch_size) {
            self.transport.send_deltas(peer, chunk.to_vec()).await?;
            shipped += chunk.len();

            let mut clocks = self.peer_store_clocks.write().await;
            let entry = clocks.entry(peer.clone()).or_default();
            for delta in chunk {
                entry.merge(&delta.clock);
            }
        }

        self.stats.lock().await.deltas_shipped += shipped as u64;
        Ok(shipped)
    }

    /// Apply deltas received from a peer, gated by per-origin sequence
    /// numbers. Out-of-order deltas are buffered up to the configured
    /// window; past it, a full state fetch replaces the local instance.
    pub async fn handle_remote_deltas(
        &self,
        peer: &ReplicaId,
        deltas: Vec<Delta>,
    ) -> SyncResult<usize> {
        let now = self.time.unix_millis();
        let mut applied = 0usize;

        for delta in deltas {
            let key = (delta.origin.clone(), delta.crdt_id.clone());
            let mut buffers = self.delta_buffers.lock().await;
            let buffer = buffers.entry(key.clone()).or_default();

            if delta.sequence <= buffer.last_applied_seq {
                continue; // replay
            }

            if delta.sequence == buffer.last_applied_seq + 1 {
                buffer.last_applied_seq = delta.sequence;
                let mut ready = vec![delta];
                // drain any buffered successors
                while let Some(next) = buffer.buffered.remove(&(buffer.last_applied_seq + 1)) {
                    buffer.last_applied_seq = next.sequence;
                    ready.push(next);
                }
                drop(buffers);

                let mut store = self.store.write().await;
                for delta in ready {
                    if store.apply_delta(&delta, now)? {
                        applied += 1;
                    }
                }
            } else {
                buffer.buffered.insert(delta.sequence, delta.clone());
                if buffer.buffered.len() > self.config.delta_buffer_window {
                    buffer.buffered.clear();
                    buffer.last_applied_seq = delta.sequence;
                    drop(buffers);

                    warn!(
                        "delta gap for '{}' from {}; fetching full state",
                        delta.crdt_id, delta.origin
                    );
                    let _ = self.events.send(SyncEvent::DeltaGap {
                        peer: peer.clone(),
                        crdt_id: delta.crdt_id.clone(),
                    });

                    let state = self.transport.fetch_state(peer, &delta.crdt_id).await?;
                    let mut store = self.store.write().await;
                    store.merge_state(&state, now)?;
                    self.stats.lock().await.state_fetches += 1;
                    applied += 1;
                }
            }
        }

        self.stats.lock().await.deltas_applied += applied as u64;
        Ok(applied)
    }

    /// Send a broadcast, subject to the broadcast rate limit.
    pub async fn send_broadcast(&self, broadcast: PatternBroadcast) -> SyncResult<()> {
        if let Err(limited) = self.broadcast_bucket.try_acquire() {
            return Err(SyncError::RateLimited {
                retry_after_ms: limited.retry_after_ms,
            });
        }
        self.seen_broadcasts
            .lock()
            .await
            .insert(broadcast.broadcast_id.clone());
        self.transport.broadcast(broadcast).await
    }

    /// Process an incoming broadcast: deduplicate by id, decrement the hop
    /// budget, and return the relay copy when it should be forwarded.
    pub async fn handle_broadcast(
        &self,
        broadcast: PatternBroadcast,
    ) -> Option<PatternBroadcast> {
        {
            let mut seen = self.seen_broadcasts.lock().await;
            if seen.contains(&broadcast.broadcast_id) {
                return None;
            }
            if seen.len() >= self.config.broadcast_dedup_cap {
                seen.clear();
            }
            seen.insert(broadcast.broadcast_id.clone());
        }

        if broadcast.ttl <= 1 {
            return None;
        }
        let mut relay = broadcast;
        relay.ttl -= 1;
        Some(relay)
    }
}
