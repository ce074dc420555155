//! UDP hole punching with an escalation ladder.
//!
//! Tries increasingly expensive paths to a peer: direct, simultaneous-open
//! hole punch (or port prediction when a symmetric NAT is involved), TCP
//! when enabled, then TURN relays over UDP, TCP, and TLS. Each level is
//! capped in attempts and wall time; events report progress and level
//! changes.

use crate::turn::{RelayTransport, TurnConfig};
use crate::{NatResult, NatType};
use aqe_common::{ReplicaId, RngProvider, TimeProvider};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One rung of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchLevel {
    Direct,
    HolePunch,
    Tcp,
    TurnUdp,
    TurnTcp,
    TurnTls,
}

impl PunchLevel {
    fn next(self, enable_tcp: bool) -> Option<PunchLevel> {
        match self {
            PunchLevel::Direct => Some(PunchLevel::HolePunch),
            PunchLevel::HolePunch => {
                if enable_tcp {
                    Some(PunchLevel::Tcp)
                } else {
                    Some(PunchLevel::TurnUdp)
                }
            }
            PunchLevel::Tcp => Some(PunchLevel::TurnUdp),
            PunchLevel::TurnUdp => Some(PunchLevel::TurnTcp),
            PunchLevel::TurnTcp => Some(PunchLevel::TurnTls),
            PunchLevel::TurnTls => None,
        }
    }

    /// The relay transport for TURN rungs.
    pub fn relay_transport(self) -> Option<RelayTransport> {
        match self {
            PunchLevel::TurnUdp => Some(RelayTransport::Udp),
            PunchLevel::TurnTcp => Some(RelayTransport::Tcp),
            PunchLevel::TurnTls => Some(RelayTransport::Tls),
            _ => None,
        }
    }
}

/// How the winning path was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchMethod {
    Direct,
    Simultaneous,
    Predicted,
    Tcp,
    Relay,
}

/// Control messages exchanged over the coordination channel during
/// simultaneous open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PunchSignal {
    Ready { attempt: u32 },
    Punch { attempt: u32, ports: Vec<u16> },
    Ack { attempt: u32 },
}

/// Coordination channel supplied by the caller (usually the signaling
/// transport).
#[async_trait]
pub trait PunchSignals: Send + Sync {
    async fn send_signal(&self, peer: &ReplicaId, signal: PunchSignal) -> NatResult<()>;

    /// Next signal from the peer, or None on timeout.
    async fn recv_signal(
        &self,
        peer: &ReplicaId,
        timeout_ms: u64,
    ) -> NatResult<Option<PunchSignal>>;
}

/// Path probing supplied by the caller.
#[async_trait]
pub trait PathProber: Send + Sync {
    async fn probe_direct(&self, peer: &ReplicaId) -> bool;
    async fn probe_predicted_ports(&self, peer: &ReplicaId, ports: &[u16]) -> bool;
    async fn probe_tcp(&self, peer: &ReplicaId) -> bool;
    async fn probe_relay(&self, server: &TurnConfig, transport: RelayTransport) -> bool;
}

/// Events emitted while punching.
#[derive(Debug, Clone)]
pub enum PunchEvent {
    Started {
        peer: ReplicaId,
    },
    AttemptFailed {
        level: PunchLevel,
        attempt: u32,
    },
    LevelChanged {
        from: PunchLevel,
        to: PunchLevel,
    },
    Succeeded {
        level: PunchLevel,
        method: PunchMethod,
    },
    Exhausted,
}

/// Confidence of a port prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PredictionConfidence {
    Low,
    Medium,
    High,
}

/// How predicted ports were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionMethod {
    Linear,
    Hybrid,
    Random,
}

/// A batch of predicted external ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPrediction {
    pub ports: Vec<u16>,
    pub method: PredictionMethod,
    pub confidence: PredictionConfidence,
}

/// Predicts the next external ports of a symmetric NAT from recently
/// observed mappings.
#[derive(Debug, Clone, Default)]
pub struct PortPredictor {
    observed: Vec<u16>,
}

impl PortPredictor {
    /// Create an empty predictor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed external port, oldest first.
    pub fn observe(&mut self, port: u16) {
        self.observed.push(port);
        if self.observed.len() > 16 {
            self.observed.remove(0);
        }
    }

    /// Predict the next `count` ports.
    ///
    /// Stable increments (variance < 10) extrapolate linearly with high
    /// confidence; unstable increments produce a window around the
    /// expected next port with medium confidence; with fewer than two
    /// observations the prediction falls back to random offsets with low
    /// confidence.
    pub fn predict(&self, count: usize, rng: &dyn RngProvider) -> PortPrediction {
        let last = match self.observed.split_last() {
            Some((&last, earlier)) if !earlier.is_empty() => i32::from(last),
            Some((&last, _)) => return random_prediction(count, rng, last),
            None => return random_prediction(count, rng, 40_000),
        };

        let deltas: Vec<i32> = self
            .observed
            .windows(2)
            .map(|w| i32::from(w[1]) - i32::from(w[0]))
            .collect();
        let mean = deltas.iter().sum::<i32>() as f64 / deltas.len() as f64;
        let variance = deltas
            .iter()
            .map(|d| {
                let diff = *d as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / deltas.len() as f64;

        if variance < 10.0 {
            let step = mean.round() as i32;
            let ports = (1..=count as i32)
                .map(|k| clamp_port(last + step * k))
                .collect();
            PortPrediction {
                ports,
                method: PredictionMethod::Linear,
                confidence: PredictionConfidence::High,
            }
        } else {
            let expected = last + mean.round() as i32;
            let half = (count / 2) as i32;
            let ports = (-half..=(count as i32 - half - 1))
                .map(|offset| clamp_port(expected + offset))
                .collect();
            PortPrediction {
                ports,
                method: PredictionMethod::Hybrid,
                confidence: PredictionConfidence::Medium,
            }
        }
    }
}

fn clamp_port(value: i32) -> u16 {
    value.clamp(1_024, u16::MAX as i32) as u16
}

fn random_prediction(count: usize, rng: &dyn RngProvider, base: u16) -> PortPrediction {
    let ports = (0..count)
        .map(|_| {
            let offset = (rng.next_u64() % 2_048) as u16;
            base.saturating_add(offset).max(1_024)
        })
        .collect();
    PortPrediction {
        ports,
        method: PredictionMethod::Random,
        confidence: PredictionConfidence::Low,
    }
}

/// What to do when all direct rungs are exhausted.
#[derive(Debug, Clone)]
pub enum FallbackAction {
    Relay {
        server: TurnConfig,
        transport: RelayTransport,
    },
    Abort,
}

/// Puncher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolePunchConfig {
    pub max_attempts_per_level: u32,
    pub timeout_per_level_ms: u64,
    /// Attempts of the port-prediction path before escalating.
    pub prediction_attempts: u32,
    /// Ports predicted per attempt.
    pub prediction_window: usize,
    /// Whether the TCP rung is part of the ladder. Browser-hosted replicas
    /// cannot open raw TCP paths, so it defaults off.
    pub enable_tcp: bool,
    pub auto_escalate: bool,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_level: 3,
            timeout_per_level_ms: 5_000,
            prediction_attempts: 2,
            prediction_window: 5,
            enable_tcp: false,
            auto_escalate: true,
        }
    }
}

/// Outcome of a punch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolePunchResult {
    pub success: bool,
    pub method: Option<PunchMethod>,
    /// The last level tried.
    pub level: PunchLevel,
    /// Total attempts across all levels.
    pub attempts: u32,
    pub exhausted: bool,
    pub duration_ms: u64,
}

/// Drives hole punching for one peer pair.
pub struct HolePuncher {
    config: HolePunchConfig,
    signals: Arc<dyn PunchSignals>,
    prober: Arc<dyn PathProber>,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    events: mpsc::UnboundedSender<PunchEvent>,
}

impl HolePuncher {
    /// Create a puncher. Returns the puncher and its event stream.
    pub fn new(
        config: HolePunchConfig,
        signals: Arc<dyn PunchSignals>,
        prober: Arc<dyn PathProber>,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<PunchEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                signals,
                prober,
                time,
                rng,
                events,
            },
            receiver,
        )
    }

    /// Punch a path to `peer`, walking the escalation ladder.
    ///
    /// `observed_remote_ports` are the peer's recently observed external
    /// ports (for symmetric prediction); `relays` are the healthy TURN
    /// servers available for the relay rungs.
    pub async fn punch(
        &self,
        peer: &ReplicaId,
        local_nat: NatType,
        remote_nat: NatType,
        observed_remote_ports: &[u16],
        relays: &[TurnConfig],
    ) -> HolePunchResult {
        let started = self.time.unix_millis();
        let _ = self.events.send(PunchEvent::Started { peer: peer.clone() });

        let mut level = PunchLevel::Direct;
        let mut attempts = 0u32;

        loop {
            let method = self
                .attempt_level(
                    peer,
                    level,
                    local_nat,
                    remote_nat,
                    observed_remote_ports,
                    relays,
                    &mut attempts,
                )
                .await;

            if let Some(method) = method {
                info!("punch to {peer} succeeded at {level:?} via {method:?}");
                let _ = self.events.send(PunchEvent::Succeeded { level, method });
                return HolePunchResult {
                    success: true,
                    method: Some(method),
                    level,
                    attempts,
                    exhausted: false,
                    duration_ms: self.time.unix_millis().saturating_sub(started),
                };
            }

            if !self.config.auto_escalate {
                return HolePunchResult {
                    success: false,
                    method: None,
                    level,
                    attempts,
                    exhausted: false,
                    duration_ms: self.time.unix_millis().saturating_sub(started),
                };
            }

            match level.next(self.config.enable_tcp) {
                Some(next) => {
                    debug!("punch to {peer}: escalating {level:?} -> {next:?}");
                    let _ = self
                        .events
                        .send(PunchEvent::LevelChanged { from: level, to: next });
                    level = next;
                }
                None => {
                    let _ = self.events.send(PunchEvent::Exhausted);
                    return HolePunchResult {
                        success: false,
                        method: None,
                        level,
                        attempts,
                        exhausted: true,
                        duration_ms: self.time.unix_millis().saturating_sub(started),
                    };
                }
            }
        }
    }

    /// The action to take once direct rungs are exhausted: the first
    /// available relay, or abort.
    pub fn fallback_action(&self, relays: &[TurnConfig]) -> FallbackAction {
        match relays.first() {
            Some(server) => FallbackAction::Relay {
                server: server.clone(),
                transport: RelayTransport::Udp,
            },
            None => FallbackAction::Abort,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_level(
        &self,
        peer: &ReplicaId,
        level: PunchLevel,
        local_nat: NatType,
        remote_nat: NatType,
        observed_remote_ports: &[u16],
        relays: &[TurnConfig],
        attempts: &mut u32,
    ) -> Option<PunchMethod> {
        match level {
            PunchLevel::Direct => {
                for attempt in 0..self.config.max_attempts_per_level {
                    *attempts += 1;
                    if self.prober.probe_direct(peer).await {
                        return Some(PunchMethod::Direct);
                    }
                    let _ = self.events.send(PunchEvent::AttemptFailed { level, attempt });
                }
                None
            }
            PunchLevel::HolePunch => {
                let symmetric =
                    local_nat == NatType::Symmetric || remote_nat == NatType::Symmetric;
                if symmetric {
                    // simultaneous open cannot work through a symmetric NAT;
                    // predict the peer's next external ports instead
                    let mut predictor = PortPredictor::new();
                    for port in observed_remote_ports {
                        predictor.observe(*port);
                    }
                    for attempt in 0..self.config.prediction_attempts {
                        *attempts += 1;
                        let prediction =
                            predictor.predict(self.config.prediction_window, self.rng.as_ref());
                        debug!(
                            "punch to {peer}: trying {} predicted ports ({:?})",
                            prediction.ports.len(),
                            prediction.method
                        );
                        if self
                            .prober
                            .probe_predicted_ports(peer, &prediction.ports)
                            .await
                        {
                            return Some(PunchMethod::Predicted);
                        }
                        let _ = self.events.send(PunchEvent::AttemptFailed { level, attempt });
                    }
                    None
                } else {
                    for attempt in 0..self.config.max_attempts_per_level {
                        *attempts += 1;
                        if self.simultaneous_open(peer, attempt).await {
                            return Some(PunchMethod::Simultaneous);
                        }
                        let _ = self.events.send(PunchEvent::AttemptFailed { level, attempt });
                    }
                    None
                }
            }
            PunchLevel::Tcp => {
                for attempt in 0..self.config.max_attempts_per_level {
                    *attempts += 1;
                    if self.prober.probe_tcp(peer).await {
                        return Some(PunchMethod::Tcp);
                    }
                    let _ = self.events.send(PunchEvent::AttemptFailed { level, attempt });
                }
                None
            }
            PunchLevel::TurnUdp | PunchLevel::TurnTcp | PunchLevel::TurnTls => {
                let transport = match level {
                    PunchLevel::TurnTcp => RelayTransport::Tcp,
                    PunchLevel::TurnTls => RelayTransport::Tls,
                    _ => RelayTransport::Udp,
                };
                for (attempt, server) in relays
                    .iter()
                    .take(self.config.max_attempts_per_level as usize)
                    .enumerate()
                {
                    *attempts += 1;
                    if self.prober.probe_relay(server, transport).await {
                        return Some(PunchMethod::Relay);
                    }
                    let _ = self.events.send(PunchEvent::AttemptFailed {
                        level,
                        attempt: attempt as u32,
                    });
                }
                None
            }
        }
    }

    /// One simultaneous-open round: exchange `ready`, send `punch` on the
    /// peer's `ready`, confirm with `ack`.
    async fn simultaneous_open(&self, peer: &ReplicaId, attempt: u32) -> bool {
        if self
            .signals
            .send_signal(peer, PunchSignal::Ready { attempt })
            .await
            .is_err()
        {
            return false;
        }

        let deadline = self
            .time
            .unix_millis()
            .saturating_add(self.config.timeout_per_level_ms);
        loop {
            let remaining = deadline.saturating_sub(self.time.unix_millis());
            if remaining == 0 {
                return false;
            }
            match self.signals.recv_signal(peer, remaining).await {
                Ok(Some(PunchSignal::Ready { attempt: a })) if a == attempt => {
                    if self
                        .signals
                        .send_signal(peer, PunchSignal::Punch {
                            attempt,
                            ports: Vec::new(),
                        })
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
                Ok(Some(PunchSignal::Punch { attempt: a, .. })) if a == attempt => {
                    // the peer's punch arrived: the mapping is open
                    let _ = self
                        .signals
                        .send_signal(peer, PunchSignal::Ack { attempt })
                        .await;
                    return true;
                }
                Ok(Some(PunchSignal::Ack { attempt: a })) if a == attempt => {
                    return true;
                }
                Ok(Some(_)) => {
                    // stale signal from a previous attempt
                    continue;
                }
                Ok(None) | Err(_) => return false,
            }
        }
    }
}
