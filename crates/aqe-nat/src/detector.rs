//! STUN-based NAT classification.
//!
//! Issues binding requests against at least two STUN servers and compares
//! the mapped addresses they report. Results are cached under a TTL and
//! concurrent detection requests coalesce onto a single probe run.

use crate::{NatError, NatResult, NatType};
use aqe_common::TimeProvider;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A mapped address reported by one STUN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunMapping {
    pub mapped_addr: String,
    pub mapped_port: u16,
}

/// Filtering behavior, when the client can test it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilteringClass {
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
}

/// Caller-supplied STUN I/O.
#[async_trait]
pub trait StunClient: Send + Sync {
    /// Issue a binding request from the given local endpoint.
    async fn binding_request(
        &self,
        server: &str,
        local_addr: &str,
        local_port: u16,
    ) -> NatResult<StunMapping>;

    /// Probe filtering behavior when the underlying stack supports it.
    async fn filtering_test(&self) -> Option<FilteringClass> {
        None
    }
}

/// Detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatDetectorConfig {
    pub servers: Vec<String>,
    pub cache_ttl_ms: u64,
    /// Minimum corroborating servers for a non-Unknown classification.
    pub min_servers: usize,
}

impl Default for NatDetectorConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            cache_ttl_ms: 300_000, // 5 minutes
            min_servers: 2,
        }
    }
}

/// Outcome of one classification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatDetectionResult {
    pub nat_type: NatType,
    pub local_addr: String,
    pub local_port: u16,
    pub external_addr: Option<String>,
    pub external_port: Option<u16>,
    /// Whether all servers reported the same external mapping.
    pub port_mapping_consistent: bool,
    pub endpoint_independent_filtering: bool,
    /// Monotone in the number of corroborating servers, in [0, 1].
    pub confidence: f64,
    pub servers_used: Vec<String>,
    pub duration_ms: u64,
    pub timestamp_ms: u64,
}

/// STUN-driven NAT detector with result caching.
pub struct NatDetector {
    config: NatDetectorConfig,
    stun: Arc<dyn StunClient>,
    time: Arc<dyn TimeProvider>,
    cache: Mutex<Option<NatDetectionResult>>,
    // held across a probe run so concurrent detect() calls coalesce
    probing: Mutex<()>,
}

impl NatDetector {
    /// Create a detector.
    pub fn new(
        config: NatDetectorConfig,
        stun: Arc<dyn StunClient>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            stun,
            time,
            cache: Mutex::new(None),
            probing: Mutex::new(()),
        }
    }

    /// Classify the local NAT, returning a cached result when fresh.
    pub async fn detect(&self, local_addr: &str, local_port: u16) -> NatResult<NatDetectionResult> {
        if let Some(cached) = self.cached().await {
            debug!("returning cached NAT classification: {}", cached.nat_type);
            return Ok(cached);
        }

        let _guard = self.probing.lock().await;
        // another caller may have finished the probe while we waited
        if let Some(cached) = self.cached().await {
            return Ok(cached);
        }

        let result = self.run_detection(local_addr, local_port).await?;
        *self.cache.lock().await = Some(result.clone());
        info!(
            "NAT classified as {} (confidence {:.2}, {} servers)",
            result.nat_type,
            result.confidence,
            result.servers_used.len()
        );
        Ok(result)
    }

    /// Drop the cached result so the next detect() probes again.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn cached(&self) -> Option<NatDetectionResult> {
        let cache = self.cache.lock().await;
        let result = cache.as_ref()?;
        let age = self.time.unix_millis().saturating_sub(result.timestamp_ms);
        (age < self.config.cache_ttl_ms).then(|| result.clone())
    }

    async fn run_detection(
        &self,
        local_addr: &str,
        local_port: u16,
    ) -> NatResult<NatDetectionResult> {
        if self.config.servers.is_empty() {
            return Err(NatError::NoServers("no STUN servers configured".to_string()));
        }

        let started = self.time.unix_millis();
        let mut mappings: Vec<(String, StunMapping)> = Vec::new();
        for server in &self.config.servers {
            match self
                .stun
                .binding_request(server, local_addr, local_port)
                .await
            {
                Ok(mapping) => mappings.push((server.clone(), mapping)),
                Err(e) => debug!("STUN binding against {server} failed: {e}"),
            }
        }

        let duration_ms = self.time.unix_millis().saturating_sub(started);
        let servers_used: Vec<String> = mappings.iter().map(|(s, _)| s.clone()).collect();
        let corroborating = mappings.len();
        let confidence = corroborating as f64 / (corroborating + 1) as f64;

        let mut result = NatDetectionResult {
            nat_type: NatType::Unknown,
            local_addr: local_addr.to_string(),
            local_port,
            external_addr: None,
            external_port: None,
            port_mapping_consistent: false,
            endpoint_independent_filtering: false,
            confidence,
            servers_used,
            duration_ms,
            timestamp_ms: self.time.unix_millis(),
        };

        if mappings.is_empty() {
            result.confidence = 0.0;
            return Ok(result);
        }

        let first = &mappings[0].1;
        result.external_addr = Some(first.mapped_addr.clone());
        result.external_port = Some(first.mapped_port);

        // no translation at all
        if mappings
            .iter()
            .any(|(_, m)| m.mapped_addr == local_addr && m.mapped_port == local_port)
        {
            result.nat_type = NatType::Open;
            result.port_mapping_consistent = true;
            result.endpoint_independent_filtering = true;
            return Ok(result);
        }

        let consistent = mappings
            .iter()
            .all(|(_, m)| m.mapped_addr == first.mapped_addr && m.mapped_port == first.mapped_port);
        result.port_mapping_consistent = consistent;

        if corroborating < self.config.min_servers {
            // a single answer cannot distinguish cone from symmetric
            result.nat_type = NatType::Unknown;
            return Ok(result);
        }

        if consistent {
            result.nat_type = match self.stun.filtering_test().await {
                Some(FilteringClass::EndpointIndependent) | None => {
                    result.endpoint_independent_filtering = true;
                    NatType::FullCone
                }
                Some(FilteringClass::AddressDependent) => NatType::RestrictedCone,
                Some(FilteringClass::AddressAndPortDependent) => NatType::PortRestricted,
            };
        } else if mappings
            .iter()
            .any(|(_, m)| m.mapped_port != first.mapped_port)
        {
            result.nat_type = NatType::Symmetric;
        } else {
            result.nat_type = NatType::Unknown;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::FixedTimeProvider;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockStun {
        /// server -> reported mapping
        responses: HashMap<String, StunMapping>,
        filtering: Option<FilteringClass>,
        calls: AtomicUsize,
    }

    impl MockStun {
        fn new(responses: Vec<(&str, &str, u16)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(server, addr, port)| {
                        (
                            server.to_string(),
                            StunMapping {
                                mapped_addr: addr.to_string(),
                                mapped_port: port,
                            },
                        )
                    })
                    .collect(),
                filtering: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StunClient for MockStun {
        async fn binding_request(
            &self,
            server: &str,
            _local_addr: &str,
            _local_port: u16,
        ) -> NatResult<StunMapping> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(server)
                .cloned()
                .ok_or_else(|| NatError::Network(format!("no answer from {server}")))
        }

        async fn filtering_test(&self) -> Option<FilteringClass> {
            self.filtering
        }
    }

    fn detector(stun: MockStun, servers: Vec<&str>) -> (NatDetector, FixedTimeProvider) {
        let time = FixedTimeProvider::new(10_000);
        let config = NatDetectorConfig {
            servers: servers.into_iter().map(String::from).collect(),
            ..NatDetectorConfig::default()
        };
        (
            NatDetector::new(config, Arc::new(stun), Arc::new(time.clone())),
            time,
        )
    }

    #[tokio::test]
    async fn test_open_when_mapped_equals_local() {
        let stun = MockStun::new(vec![
            ("s1", "192.168.1.5", 4000),
            ("s2", "192.168.1.5", 4000),
        ]);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::Open);
        assert!(result.port_mapping_consistent);
    }

    #[tokio::test]
    async fn test_full_cone_when_mappings_consistent() {
        let stun = MockStun::new(vec![("s1", "203.0.113.7", 61000), ("s2", "203.0.113.7", 61000)]);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::FullCone);
        assert_eq!(result.external_port, Some(61000));
        assert!(result.port_mapping_consistent);
    }

    #[tokio::test]
    async fn test_port_restricted_with_filtering_probe() {
        let mut stun =
            MockStun::new(vec![("s1", "203.0.113.7", 61000), ("s2", "203.0.113.7", 61000)]);
        stun.filtering = Some(FilteringClass::AddressAndPortDependent);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::PortRestricted);
    }

    #[tokio::test]
    async fn test_symmetric_when_ports_differ() {
        let stun = MockStun::new(vec![("s1", "203.0.113.7", 61000), ("s2", "203.0.113.7", 61004)]);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::Symmetric);
        assert!(!result.port_mapping_consistent);
    }

    #[tokio::test]
    async fn test_unknown_when_no_responses() {
        let stun = MockStun::new(vec![]);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::Unknown);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_confidence_monotone_in_corroborating_servers() {
        // two servers answering
        let stun2 = MockStun::new(vec![("s1", "203.0.113.7", 61000), ("s2", "203.0.113.7", 61000)]);
        let (d2, _t2) = detector(stun2, vec!["s1", "s2"]);
        let two = d2.detect("192.168.1.5", 4000).await.unwrap();

        // three servers answering
        let stun3 = MockStun::new(vec![
            ("s1", "203.0.113.7", 61000),
            ("s2", "203.0.113.7", 61000),
            ("s3", "203.0.113.7", 61000),
        ]);
        let (d3, _t3) = detector(stun3, vec!["s1", "s2", "s3"]);
        let three = d3.detect("192.168.1.5", 4000).await.unwrap();

        // one server answering (the other is dead)
        let stun1 = MockStun::new(vec![("s1", "203.0.113.7", 61000)]);
        let (d1, _t1) = detector(stun1, vec!["s1", "s2"]);
        let one = d1.detect("192.168.1.5", 4000).await.unwrap();

        assert!(one.confidence < two.confidence);
        assert!(two.confidence < three.confidence);
    }

    #[tokio::test]
    async fn test_single_answer_is_not_enough_to_classify() {
        let stun = MockStun::new(vec![("s1", "203.0.113.7", 61000)]);
        let (detector, _time) = detector(stun, vec!["s1", "s2"]);

        let result = detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(result.nat_type, NatType::Unknown);
        assert!(result.external_addr.is_some());
    }

    #[tokio::test]
    async fn test_cache_and_invalidate() {
        let stun = Arc::new(MockStun::new(vec![
            ("s1", "203.0.113.7", 61000),
            ("s2", "203.0.113.7", 61000),
        ]));
        let time = FixedTimeProvider::new(10_000);
        let config = NatDetectorConfig {
            servers: vec!["s1".to_string(), "s2".to_string()],
            ..NatDetectorConfig::default()
        };
        let detector = NatDetector::new(config, stun.clone(), Arc::new(time.clone()));

        detector.detect("192.168.1.5", 4000).await.unwrap();
        detector.detect("192.168.1.5", 4000).await.unwrap();
        // the second call was served from cache
        assert_eq!(stun.calls.load(Ordering::SeqCst), 2);

        time.advance(400_000); // past the TTL
        detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(stun.calls.load(Ordering::SeqCst), 4);

        detector.invalidate().await;
        detector.detect("192.168.1.5", 4000).await.unwrap();
        assert_eq!(stun.calls.load(Ordering::SeqCst), 6);
    }
}
