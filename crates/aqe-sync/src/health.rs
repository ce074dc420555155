//! Per-peer health monitoring.
//!
//! Tracks application-level ping/pong traffic in a bounded sample window
//! and derives a health status: current and average RTT, jitter (sample
//! standard deviation), packet loss, a 0-100 score built from weighted
//! penalties, a level, and the list of detected issues with
//! recommendations. A change callback fires on every level transition.

use aqe_common::ReplicaId;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Health levels, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unhealthy,
}

/// Severity of a detected issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    Warning,
    Critical,
}

/// One detected health issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Issue kind: `packet_loss`, `high_rtt`, `high_jitter`, `no_response`.
    pub kind: String,
    pub severity: IssueSeverity,
    /// The measured value that tripped the threshold.
    pub value: f64,
    pub threshold: f64,
    pub detected_at_ms: u64,
}

/// Thresholds for penalties and issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub rtt_warning_ms: f64,
    pub rtt_critical_ms: f64,
    pub loss_warning_pct: f64,
    pub loss_critical_pct: f64,
    pub jitter_high_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            rtt_warning_ms: 150.0,
            rtt_critical_ms: 500.0,
            loss_warning_pct: 5.0,
            loss_critical_pct: 20.0,
            jitter_high_ms: 50.0,
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Ring-buffer size for RTT samples.
    pub latency_sample_size: usize,
    /// Unacknowledged pings tolerated before the peer counts as
    /// unresponsive.
    pub max_failed_pings: u32,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            ping_timeout_ms: 5_000,
            latency_sample_size: 50,
            max_failed_pings: 3,
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Computed health of one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub peer: ReplicaId,
    pub level: HealthLevel,
    /// 0-100, higher is better.
    pub score: u8,
    pub responsive: bool,
    /// RTT of the most recent successful ping.
    pub current_rtt_ms: Option<u64>,
    pub avg_rtt_ms: f64,
    /// Sample standard deviation of the RTT window.
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub failed_pings: u32,
    pub issues: Vec<HealthIssue>,
    pub recommendations: Vec<String>,
    pub timestamp_ms: u64,
}

type ChangeCallback = Box<dyn Fn(&HealthStatus) + Send + Sync>;

/// Ping/pong-driven health monitor for one peer.
pub struct HealthMonitor {
    peer: ReplicaId,
    config: HealthConfig,
    samples: VecDeque<u64>,
    pending: HashMap<u64, u64>,
    pings_sent: u64,
    pongs_received: u64,
    failed_pings: u32,
    current_rtt_ms: Option<u64>,
    last_level: Option<HealthLevel>,
    on_change: Option<ChangeCallback>,
}

impl HealthMonitor {
    /// Create a monitor for one peer.
    pub fn new(peer: ReplicaId, config: HealthConfig) -> Self {
        Self {
            peer,
            config,
            samples: VecDeque::new(),
            pending: HashMap::new(),
            pings_sent: 0,
            pongs_received: 0,
            failed_pings: 0,
            current_rtt_ms: None,
            last_level: None,
            on_change: None,
        }
    }

    /// Register the level-transition callback.
    pub fn set_on_change(&mut self, callback: ChangeCallback) {
        self.on_change = Some(callback);
    }

    /// The monitored peer.
    pub fn peer(&self) -> &ReplicaId {
        &self.peer
    }

    /// Record that a ping with the given sequence number went out.
    pub fn record_ping_sent(&mut self, seq: u64, now_ms: u64) {
        self.pings_sent += 1;
        self.pending.insert(seq, now_ms);
    }

    /// Record a pong; produces the refreshed status (firing the change
    /// callback on a level transition).
    pub fn record_pong(&mut self, seq: u64, now_ms: u64) -> HealthStatus {
        if let Some(sent_at) = self.pending.remove(&seq) {
            let rtt = now_ms.saturating_sub(sent_at);
            self.pongs_received += 1;
            self.current_rtt_ms = Some(rtt);
            self.samples.push_back(rtt);
            while self.samples.len() > self.config.latency_sample_size {
                self.samples.pop_front();
            }
        } else {
            debug!("pong for unknown ping {seq} from {}", self.peer);
        }
        self.check(now_ms)
    }

    /// Expire pending pings past the timeout; returns how many failed.
    pub fn expire_pending(&mut self, now_ms: u64) -> u32 {
        let timeout = self.config.ping_timeout_ms;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, sent_at)| now_ms.saturating_sub(**sent_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &expired {
            self.pending.remove(seq);
        }
        self.failed_pings += expired.len() as u32;
        expired.len() as u32
    }

    /// Run one health check: expire overdue pings, compute the status, and
    /// fire the change callback on a level transition.
    pub fn check(&mut self, now_ms: u64) -> HealthStatus {
        self.expire_pending(now_ms);
        let status = self.status(now_ms);

        if self.last_level != Some(status.level) {
            let transitioned = self.last_level.is_some();
            self.last_level = Some(status.level);
            if transitioned {
                if let Some(callback) = &self.on_change {
                    callback(&status);
                }
            }
        }
        status
    }

    /// Compute the current status without mutating monitor state.
    pub fn status(&self, now_ms: u64) -> HealthStatus {
        let avg = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
        };
        let jitter = if self.samples.len() < 2 {
            0.0
        } else {
            let variance = self
                .samples
                .iter()
                .map(|s| {
                    let diff = *s as f64 - avg;
                    diff * diff
                })
                .sum::<f64>()
                / (self.samples.len() - 1) as f64;
            variance.sqrt()
        };
        let loss_pct = if self.pings_sent == 0 {
            0.0
        } else {
            (self.pings_sent - self.pongs_received) as f64 / self.pings_sent as f64 * 100.0
        };
        let responsive = self.failed_pings < self.config.max_failed_pings;

        let thresholds = &self.config.thresholds;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut score: i32 = 100;

        if !responsive {
            score -= 50;
            issues.push(HealthIssue {
                kind: "no_response".to_string(),
                severity: IssueSeverity::Critical,
                value: self.failed_pings as f64,
                threshold: self.config.max_failed_pings as f64,
                detected_at_ms: now_ms,
            });
            recommendations.push("peer is unresponsive; consider reconnecting".to_string());
        }

        if avg > 0.0 {
            if avg >= thresholds.rtt_critical_ms {
                score -= 40;
                issues.push(HealthIssue {
                    kind: "high_rtt".to_string(),
                    severity: IssueSeverity::Critical,
                    value: avg,
                    threshold: thresholds.rtt_critical_ms,
                    detected_at_ms: now_ms,
                });
                recommendations.push("latency is critical; prefer another path".to_string());
            } else if avg >= thresholds.rtt_warning_ms {
                score -= 15;
                issues.push(HealthIssue {
                    kind: "high_rtt".to_string(),
                    severity: IssueSeverity::Warning,
                    value: avg,
                    threshold: thresholds.rtt_warning_ms,
                    detected_at_ms: now_ms,
                });
                recommendations.push("latency is elevated; reduce sync batch sizes".to_string());
            }
        }

        if loss_pct >= thresholds.loss_critical_pct {
            score -= 40;
            issues.push(HealthIssue {
                kind: "packet_loss".to_string(),
                severity: IssueSeverity::Critical,
                value: loss_pct,
                threshold: thresholds.loss_critical_pct,
                detected_at_ms: now_ms,
            });
            recommendations.push("packet loss is critical; switch to a relay path".to_string());
        } else if loss_pct >= thresholds.loss_warning_pct {
            score -= 20;
            issues.push(HealthIssue {
                kind: "packet_loss".to_string(),
                severity: IssueSeverity::Warning,
                value: loss_pct,
                threshold: thresholds.loss_warning_pct,
                detected_at_ms: now_ms,
            });
            recommendations.push("packet loss detected; monitor the link".to_string());
        }

        if jitter >= thresholds.jitter_high_ms {
            score -= 10;
            issues.push(HealthIssue {
                kind: "high_jitter".to_string(),
                severity: IssueSeverity::Warning,
                value: jitter,
                threshold: thresholds.jitter_high_ms,
                detected_at_ms: now_ms,
            });
            recommendations.push("jitter is high; avoid latency-sensitive traffic".to_string());
        }

        let score = score.clamp(0, 100) as u8;
        let mut level = match score {
            s if s > 70 => HealthLevel::Healthy,
            s if s > 40 => HealthLevel::Warning,
            s if s > 20 => HealthLevel::Critical,
            _ => HealthLevel::Unhealthy,
        };
        // outstanding issues bump the level at least to their severity
        if issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Critical)
        {
            level = level.max(HealthLevel::Critical);
        } else if !issues.is_empty() {
            level = level.max(HealthLevel::Warning);
        }
        if !responsive {
            level = HealthLevel::Unhealthy;
        }

        HealthStatus {
            peer: self.peer.clone(),
            level,
            score,
            responsive,
            current_rtt_ms: self.current_rtt_ms,
            avg_rtt_ms: avg,
            jitter_ms: jitter,
            packet_loss_pct: loss_pct,
            failed_pings: self.failed_pings,
            issues,
            recommendations,
            timestamp_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn peer() -> ReplicaId {
        ReplicaId::new("peer_b")
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(peer(), HealthConfig::default())
    }

    #[test]
    fn test_fresh_monitor_is_healthy() {
        let monitor = monitor();
        let status = monitor.status(0);
        assert_eq!(status.level, HealthLevel::Healthy);
        assert_eq!(status.score, 100);
        assert!(status.responsive);
        assert!(status.issues.is_empty());
    }

    #[test]
    fn test_single_lost_ping_degrades_to_warning() {
        // 10 pings, 9 answered with the listed RTTs, one times out:
        // loss 10%, current RTT 62, avg ~59.4, score 80, level Warning,
        // exactly one packet_loss warning.
        let mut monitor = monitor();
        let rtts = [50u64, 60, 55, 70, 60, 65, 55, 58, 62];

        let mut now = 0u64;
        for (i, rtt) in rtts.iter().enumerate() {
            monitor.record_ping_sent(i as u64, now);
            monitor.record_pong(i as u64, now + rtt);
            now += 1_000;
        }
        // the tenth ping never comes back
        monitor.record_ping_sent(9, now);
        now += 5_000;

        let status = monitor.check(now);
        assert_eq!(status.packet_loss_pct, 10.0);
        assert_eq!(status.current_rtt_ms, Some(62));
        assert!((status.avg_rtt_ms - 59.444).abs() < 0.01);
        assert_eq!(status.score, 80);
        assert_eq!(status.level, HealthLevel::Warning);
        assert!(status.responsive);

        let loss_issues: Vec<_> = status
            .issues
            .iter()
            .filter(|i| i.kind == "packet_loss")
            .collect();
        assert_eq!(loss_issues.len(), 1);
        assert_eq!(loss_issues[0].severity, IssueSeverity::Warning);
        assert_eq!(status.issues.len(), 1);
    }

    #[test]
    fn test_unresponsive_peer_is_unhealthy() {
        let mut monitor = monitor();
        for seq in 0..4u64 {
            monitor.record_ping_sent(seq, seq * 100);
        }
        let status = monitor.check(100_000);

        assert!(!status.responsive);
        assert_eq!(status.level, HealthLevel::Unhealthy);
        assert!(status.issues.iter().any(|i| i.kind == "no_response"));
    }

    #[test]
    fn test_score_non_increasing_in_rtt_and_loss() {
        // low RTT, no loss
        let mut good = monitor();
        for seq in 0..10u64 {
            good.record_ping_sent(seq, seq * 1_000);
            good.record_pong(seq, seq * 1_000 + 20);
        }
        let good_status = good.status(20_000);

        // high RTT, no loss
        let mut slow = monitor();
        for seq in 0..10u64 {
            slow.record_ping_sent(seq, seq * 1_000);
            slow.record_pong(seq, seq * 1_000 + 600);
        }
        let slow_status = slow.status(20_000);

        // high RTT and loss
        let mut lossy = monitor();
        for seq in 0..10u64 {
            lossy.record_ping_sent(seq, seq * 1_000);
            if seq % 2 == 0 {
                lossy.record_pong(seq, seq * 1_000 + 600);
            }
        }
        lossy.expire_pending(100_000);
        let lossy_status = lossy.status(100_000);

        assert!(good_status.score >= slow_status.score);
        assert!(slow_status.score >= lossy_status.score);
    }

    #[test]
    fn test_jitter_is_sample_standard_deviation() {
        let mut monitor = monitor();
        for (seq, rtt) in [10u64, 20, 30].iter().enumerate() {
            monitor.record_ping_sent(seq as u64, 0);
            monitor.record_pong(seq as u64, *rtt);
        }
        let status = monitor.status(1_000);
        // sample stddev of [10, 20, 30] is 10
        assert!((status.jitter_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let config = HealthConfig {
            latency_sample_size: 5,
            ..HealthConfig::default()
        };
        let mut monitor = HealthMonitor::new(peer(), config);
        for seq in 0..20u64 {
            monitor.record_ping_sent(seq, seq * 100);
            monitor.record_pong(seq, seq * 100 + 10);
        }
        assert_eq!(monitor.samples.len(), 5);
    }

    #[test]
    fn test_change_callback_fires_on_level_transition() {
        let transitions = Arc::new(AtomicU32::new(0));
        let counter = transitions.clone();

        let mut monitor = monitor();
        monitor.set_on_change(Box::new(move |_status| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // establish a healthy baseline
        monitor.record_ping_sent(0, 0);
        monitor.record_pong(0, 20);
        assert_eq!(transitions.load(Ordering::SeqCst), 0);

        // four lost pings push the peer to Unhealthy
        for seq in 1..5u64 {
            monitor.record_ping_sent(seq, 100);
        }
        monitor.check(100_000);
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        // staying at the same level does not re-fire
        monitor.check(101_000);
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
