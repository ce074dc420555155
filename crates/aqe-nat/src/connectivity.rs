//! Application-level connectivity testing and path recommendation.
//!
//! Sends a burst of pings over an established channel to measure RTT,
//! jitter, and loss, optionally probes bandwidth, ranks ICE candidates by
//! a weighted RTT/reliability/path score, and recommends a connection
//! strategy from the NAT pairing.

use crate::{NatResult, NatType};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transport protocol of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// ICE candidate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

/// A candidate path under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub id: String,
    pub candidate_type: CandidateType,
    pub protocol: TransportProtocol,
    /// Measured RTT when available.
    pub rtt_ms: Option<u64>,
}

/// A candidate with its computed scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: CandidateInfo,
    pub rtt_score: f64,
    pub reliability_score: f64,
    pub path_score: f64,
    /// `0.4·rtt + 0.3·reliability + 0.3·path`.
    pub total_score: f64,
    pub recommended: bool,
}

/// Probe channel over an established connection.
#[async_trait]
pub trait ProbeChannel: Send + Sync {
    /// Application-level ping; returns the RTT in milliseconds.
    async fn ping(&self, seq: u32, timeout_ms: u64) -> NatResult<u64>;

    /// One-way transfer of `len` bytes confirmed by an ack; returns elapsed
    /// milliseconds.
    async fn transfer(&self, len: usize, timeout_ms: u64) -> NatResult<u64>;
}

/// Tester configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub ping_count: u32,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub bandwidth_probe: bool,
    pub bandwidth_probe_bytes: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            ping_count: 10,
            ping_interval_ms: 100,
            ping_timeout_ms: 2_000,
            bandwidth_probe: false,
            bandwidth_probe_bytes: 64 * 1024,
        }
    }
}

/// Measured link quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub pings_sent: u32,
    pub pings_succeeded: u32,
    pub avg_rtt_ms: f64,
    pub min_rtt_ms: u64,
    pub max_rtt_ms: u64,
    /// Mean absolute deviation of successful RTTs.
    pub jitter_ms: f64,
    pub success_rate: f64,
    pub bandwidth_kbps: Option<f64>,
}

/// Connectivity tester over a caller-supplied probe channel.
pub struct ConnectivityTester {
    config: ConnectivityConfig,
    channel: Arc<dyn ProbeChannel>,
}

impl ConnectivityTester {
    /// Create a tester.
    pub fn new(config: ConnectivityConfig, channel: Arc<dyn ProbeChannel>) -> Self {
        Self { config, channel }
    }

    /// Run the ping series (and bandwidth probe when configured).
    pub async fn run(&self) -> ConnectivityReport {
        let mut rtts: Vec<u64> = Vec::with_capacity(self.config.ping_count as usize);
        for seq in 0..self.config.ping_count {
            match self.channel.ping(seq, self.config.ping_timeout_ms).await {
                Ok(rtt) => rtts.push(rtt),
                Err(e) => debug!("connectivity ping {seq} failed: {e}"),
            }
            if seq + 1 < self.config.ping_count && self.config.ping_interval_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.ping_interval_ms,
                ))
                .await;
            }
        }

        let bandwidth_kbps = if self.config.bandwidth_probe {
            match self
                .channel
                .transfer(self.config.bandwidth_probe_bytes, self.config.ping_timeout_ms)
                .await
            {
                Ok(elapsed_ms) if elapsed_ms > 0 => {
                    Some(self.config.bandwidth_probe_bytes as f64 * 8.0 / elapsed_ms as f64)
                }
                _ => None,
            }
        } else {
            None
        };

        let succeeded = rtts.len() as u32;
        let avg = if rtts.is_empty() {
            0.0
        } else {
            rtts.iter().sum::<u64>() as f64 / rtts.len() as f64
        };
        let jitter = if rtts.is_empty() {
            0.0
        } else {
            rtts.iter()
                .map(|r| (*r as f64 - avg).abs())
                .sum::<f64>()
                / rtts.len() as f64
        };

        ConnectivityReport {
            pings_sent: self.config.ping_count,
            pings_succeeded: succeeded,
            avg_rtt_ms: avg,
            min_rtt_ms: rtts.iter().copied().min().unwrap_or(0),
            max_rtt_ms: rtts.iter().copied().max().unwrap_or(0),
            jitter_ms: jitter,
            success_rate: if self.config.ping_count == 0 {
                0.0
            } else {
                succeeded as f64 / self.config.ping_count as f64
            },
            bandwidth_kbps,
        }
    }
}

/// Rank candidates by weighted RTT, reliability, and path type. The best
/// candidate is marked recommended.
pub fn rank_candidates(candidates: &[CandidateInfo], nat_heavy: bool) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .map(|candidate| {
            let rtt_score = match candidate.rtt_ms {
                Some(rtt) => (100.0 - rtt as f64 / 10.0).clamp(0.0, 100.0),
                None => 50.0,
            };

            let mut reliability_score: f64 = 50.0;
            if candidate.protocol == TransportProtocol::Tcp {
                reliability_score += 20.0;
            }
            if candidate.candidate_type == CandidateType::Relay {
                reliability_score += 20.0;
            }
            if nat_heavy && candidate.candidate_type == CandidateType::Host {
                reliability_score -= 15.0;
            }
            let reliability_score = reliability_score.clamp(0.0, 100.0);

            let path_score = match candidate.candidate_type {
                CandidateType::Host => 100.0,
                CandidateType::Srflx => 80.0,
                CandidateType::Prflx => 70.0,
                CandidateType::Relay => 30.0,
            };

            let total_score = 0.4 * rtt_score + 0.3 * reliability_score + 0.3 * path_score;
            RankedCandidate {
                candidate: candidate.clone(),
                rtt_score,
                reliability_score,
                path_score,
                total_score,
                recommended: false,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(best) = ranked.first_mut() {
        best.recommended = true;
    }
    ranked
}

/// Expected direct-connection success probability for a NAT pairing.
pub fn nat_success_probability(local: NatType, remote: NatType) -> f64 {
    use NatType::*;

    // unknown classifications are pessimistic but not hopeless
    if local == Unknown || remote == Unknown {
        return 0.3;
    }

    // symmetric against symmetric is nearly unworkable without relays
    let pair = |a: NatType, b: NatType| (local == a && remote == b) || (local == b && remote == a);

    if pair(Open, Open) {
        0.99
    } else if local == Open || remote == Open {
        0.95
    } else if pair(FullCone, FullCone) {
        0.9
    } else if pair(FullCone, RestrictedCone) {
        0.85
    } else if pair(FullCone, PortRestricted) {
        0.8
    } else if pair(FullCone, Symmetric) {
        0.6
    } else if pair(RestrictedCone, RestrictedCone) {
        0.8
    } else if pair(RestrictedCone, PortRestricted) {
        0.75
    } else if pair(RestrictedCone, Symmetric) {
        0.4
    } else if pair(PortRestricted, PortRestricted) {
        0.7
    } else if pair(PortRestricted, Symmetric) {
        0.2
    } else {
        // symmetric vs symmetric
        0.05
    }
}

/// Connection strategy for a NAT pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStrategy {
    Direct,
    /// Direct first, TURN standing by.
    Hybrid,
    Turn,
    Abort,
}

/// A recommended strategy with its rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRecommendation {
    pub strategy: PathStrategy,
    pub success_probability: f64,
    pub rationale: String,
}

/// Recommend a connection strategy for the NAT pairing.
pub fn recommend_path(local: NatType, remote: NatType, turn_available: bool) -> PathRecommendation {
    let p = nat_success_probability(local, remote);

    if p >= 0.7 {
        PathRecommendation {
            strategy: PathStrategy::Direct,
            success_probability: p,
            rationale: format!(
                "{local} to {remote} succeeds directly in ~{:.0}% of attempts",
                p * 100.0
            ),
        }
    } else if p >= 0.4 {
        PathRecommendation {
            strategy: PathStrategy::Hybrid,
            success_probability: p,
            rationale: format!(
                "{local} to {remote} is uncertain (~{:.0}%); try direct with TURN fallback",
                p * 100.0
            ),
        }
    } else if turn_available {
        PathRecommendation {
            strategy: PathStrategy::Turn,
            success_probability: p,
            rationale: format!(
                "{local} to {remote} rarely connects directly (~{:.0}%); relay through TURN",
                p * 100.0
            ),
        }
    } else {
        PathRecommendation {
            strategy: PathStrategy::Abort,
            success_probability: p,
            rationale: format!(
                "{local} to {remote} rarely connects directly (~{:.0}%) and no TURN server is available",
                p * 100.0
            ),
        }
    }
}
