//! TURN relay management.
//!
//! Tracks a set of TURN servers, probes their health by gathering relay
//! candidates, keeps latency samples, refreshes credentials before expiry
//! through a caller-supplied endpoint with bounded retries, and hands out
//! the lowest-latency healthy server on request.

use crate::{NatError, NatResult};
use aqe_common::{retry_with_backoff, RngProvider, TimeProvider};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Transport used to reach a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayTransport {
    Udp,
    Tcp,
    Tls,
}

/// One configured TURN server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub credential_type: String,
    pub expires_at_ms: Option<u64>,
    pub region: Option<String>,
    pub priority: u8,
}

impl TurnConfig {
    /// Stable key for this server: its first URL.
    pub fn key(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or("")
    }
}

/// Fresh credentials returned by the refresh endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    pub expires_at_ms: Option<u64>,
}

/// Health probing: gather one relay candidate under a relay-only ICE policy
/// and report the observed latency.
#[async_trait]
pub trait RelayProbe: Send + Sync {
    async fn gather_relay_latency(&self, server: &TurnConfig) -> NatResult<u64>;
}

/// Credential refresh endpoint supplied by the host application.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch_credentials(&self, server_url: &str) -> NatResult<TurnCredentials>;
}

/// Events emitted by the manager.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    CredentialsRefreshed { url: String },
    RefreshFailed { url: String, error: String },
    ServerUnhealthy { url: String },
    ServerRecovered { url: String },
    AllocationFailed { url: String },
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnManagerConfig {
    pub probe_interval_ms: u64,
    /// Probe failures in a row before a server is marked unhealthy.
    pub max_consecutive_failures: u32,
    /// Refresh credentials this long before they expire.
    pub refresh_margin_ms: u64,
    pub refresh_max_retries: u32,
    pub refresh_initial_delay_ms: u64,
    pub refresh_max_delay_ms: u64,
    /// Rolling latency window per server.
    pub latency_samples: usize,
}

impl Default for TurnManagerConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            max_consecutive_failures: 3,
            refresh_margin_ms: 60_000,
            refresh_max_retries: 4,
            refresh_initial_delay_ms: 500,
            refresh_max_delay_ms: 8_000,
            latency_samples: 8,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    config: TurnConfig,
    healthy: bool,
    consecutive_failures: u32,
    latency: VecDeque<u64>,
    refreshing: bool,
}

impl ServerState {
    fn avg_latency(&self) -> Option<u64> {
        if self.latency.is_empty() {
            return None;
        }
        Some(self.latency.iter().sum::<u64>() / self.latency.len() as u64)
    }
}

/// TURN server manager.
pub struct TurnManager {
    config: TurnManagerConfig,
    servers: RwLock<HashMap<String, ServerState>>,
    probe: Arc<dyn RelayProbe>,
    fetcher: Arc<dyn CredentialFetcher>,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    events: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnManager {
    /// Create a manager over the given servers. Returns the manager and the
    /// event stream.
    pub fn new(
        config: TurnManagerConfig,
        servers: Vec<TurnConfig>,
        probe: Arc<dyn RelayProbe>,
        fetcher: Arc<dyn CredentialFetcher>,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let states = servers
            .into_iter()
            .map(|config| {
                (
                    config.key().to_string(),
                    ServerState {
                        config,
                        healthy: true,
                        consecutive_failures: 0,
                        latency: VecDeque::new(),
                        refreshing: false,
                    },
                )
            })
            .collect();
        (
            Self {
                config,
                servers: RwLock::new(states),
                probe,
                fetcher,
                time,
                rng,
                events,
            },
            receiver,
        )
    }

    /// Run one health-probe round over all servers; returns how many are
    /// healthy afterwards.
    pub async fn probe_all(&self) -> usize {
        let configs: Vec<TurnConfig> = {
            let servers = self.servers.read().await;
            servers.values().map(|s| s.config.clone()).collect()
        };

        for config in configs {
            let outcome = self.probe.gather_relay_latency(&config).await;
            let mut servers = self.servers.write().await;
            let Some(state) = servers.get_mut(config.key()) else {
                continue;
            };
            match outcome {
                Ok(latency_ms) => {
                    state.latency.push_back(latency_ms);
                    while state.latency.len() > self.config.latency_samples {
                        state.latency.pop_front();
                    }
                    state.consecutive_failures = 0;
                    if !state.healthy {
                        state.healthy = true;
                        info!("TURN server {} recovered", config.key());
                        let _ = self.events.send(TurnEvent::ServerRecovered {
                            url: config.key().to_string(),
                        });
                    }
                }
                Err(e) => {
                    debug!("relay probe against {} failed: {e}", config.key());
                    state.consecutive_failures += 1;
                    let _ = self.events.send(TurnEvent::AllocationFailed {
                        url: config.key().to_string(),
                    });
                    if state.healthy
                        && state.consecutive_failures >= self.config.max_consecutive_failures
                    {
                        state.healthy = false;
                        warn!(
                            "TURN server {} unhealthy after {} failures",
                            config.key(),
                            state.consecutive_failures
                        );
                        let _ = self.events.send(TurnEvent::ServerUnhealthy {
                            url: config.key().to_string(),
                        });
                    }
                }
            }
        }

        let servers = self.servers.read().await;
        servers.values().filter(|s| s.healthy).count()
    }

    /// Refresh credentials for every server within the expiry margin.
    pub async fn refresh_expiring(&self) -> usize {
        let now = self.time.unix_millis();
        let due: Vec<String> = {
            let servers = self.servers.read().await;
            servers
                .values()
                .filter(|s| {
                    s.config
                        .expires_at_ms
                        .map(|t| t.saturating_sub(self.config.refresh_margin_ms) <= now)
                        .unwrap_or(false)
                })
                .map(|s| s.config.key().to_string())
                .collect()
        };

        let mut refreshed = 0;
        for url in due {
            if self.refresh_credentials(&url).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Refresh one server's credentials with bounded retries. A refresh
    /// already in flight for the same server is not restarted.
    pub async fn refresh_credentials(&self, url: &str) -> NatResult<()> {
        {
            let mut servers = self.servers.write().await;
            let state = servers
                .get_mut(url)
                .ok_or_else(|| NatError::NoServers(format!("unknown TURN server {url}")))?;
            if state.refreshing {
                debug!("credential refresh for {url} already in flight");
                return Ok(());
            }
            state.refreshing = true;
        }

        let fetcher = self.fetcher.clone();
        let url_owned = url.to_string();
        let result = retry_with_backoff(
            || fetcher.fetch_credentials(&url_owned),
            self.rng.as_ref(),
            self.config.refresh_max_retries,
            Duration::from_millis(self.config.refresh_initial_delay_ms),
            Duration::from_millis(self.config.refresh_max_delay_ms),
        )
        .await;

        let mut servers = self.servers.write().await;
        let state = servers
            .get_mut(url)
            .ok_or_else(|| NatError::NoServers(format!("unknown TURN server {url}")))?;
        state.refreshing = false;

        match result {
            Ok(credentials) => {
                state.config.username = credentials.username;
                state.config.credential = credentials.credential;
                state.config.expires_at_ms = credentials.expires_at_ms;
                info!("refreshed TURN credentials for {url}");
                let _ = self.events.send(TurnEvent::CredentialsRefreshed {
                    url: url.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let _ = self.events.send(TurnEvent::RefreshFailed {
                    url: url.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// The best healthy server and the remaining healthy alternatives,
    /// ordered by average latency (unknown latency last, then priority).
    pub async fn select(&self) -> Option<(TurnConfig, Vec<TurnConfig>)> {
        let servers = self.servers.read().await;
        let mut healthy: Vec<(&ServerState, Option<u64>)> = servers
            .values()
            .filter(|s| s.healthy)
            .map(|s| (s, s.avg_latency()))
            .collect();
        if healthy.is_empty() {
            return None;
        }

        healthy.sort_by(|a, b| match (a.1, b.1) {
            (Some(la), Some(lb)) => la.cmp(&lb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.0.config.priority.cmp(&a.0.config.priority),
        });

        let mut iter = healthy.into_iter().map(|(s, _)| s.config.clone());
        let chosen = iter.next()?;
        Some((chosen, iter.collect()))
    }

    /// All currently healthy servers, best first.
    pub async fn healthy_servers(&self) -> Vec<TurnConfig> {
        match self.select().await {
            Some((chosen, mut rest)) => {
                rest.insert(0, chosen);
                rest
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::{FixedTimeProvider, SeededRngProvider};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn turn(url: &str, priority: u8) -> TurnConfig {
        TurnConfig {
            urls: vec![url.to_string()],
            username: "user".to_string(),
            credential: "pass".to_string(),
            credential_type: "password".to_string(),
            expires_at_ms: None,
            region: None,
            priority,
        }
    }

    struct MockProbe {
        latencies: HashMap<String, Option<u64>>,
    }

    #[async_trait]
    impl RelayProbe for MockProbe {
        async fn gather_relay_latency(&self, server: &TurnConfig) -> NatResult<u64> {
            match self.latencies.get(server.key()).copied().flatten() {
                Some(latency) => Ok(latency),
                None => Err(NatError::ProbeFailed("no relay candidate".to_string())),
            }
        }
    }

    struct MockFetcher {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl CredentialFetcher for MockFetcher {
        async fn fetch_credentials(&self, _server_url: &str) -> NatResult<TurnCredentials> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(NatError::Network("refresh endpoint down".to_string()));
            }
            Ok(TurnCredentials {
                username: "fresh-user".to_string(),
                credential: "fresh-pass".to_string(),
                expires_at_ms: Some(1_000_000),
            })
        }
    }

    fn manager(
        servers: Vec<TurnConfig>,
        latencies: Vec<(&str, Option<u64>)>,
        fail_first: u32,
    ) -> (TurnManager, mpsc::UnboundedReceiver<TurnEvent>) {
        let probe = Arc::new(MockProbe {
            latencies: latencies
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        let fetcher = Arc::new(MockFetcher {
            calls: AtomicU32::new(0),
            fail_first,
        });
        let config = TurnManagerConfig {
            refresh_initial_delay_ms: 1,
            refresh_max_delay_ms: 2,
            ..TurnManagerConfig::default()
        };
        TurnManager::new(
            config,
            servers,
            probe,
            fetcher,
            Arc::new(FixedTimeProvider::new(500_000)),
            Arc::new(SeededRngProvider::new(1)),
        )
    }

    #[tokio::test]
    async fn test_selection_orders_by_latency() {
        let (manager, _events) = manager(
            vec![turn("turn:a", 1), turn("turn:b", 1), turn("turn:c", 1)],
            vec![("turn:a", Some(80)), ("turn:b", Some(20)), ("turn:c", Some(50))],
            0,
        );

        manager.probe_all().await;
        let (chosen, alternatives) = manager.select().await.unwrap();
        assert_eq!(chosen.key(), "turn:b");
        assert_eq!(alternatives.len(), 2);
        assert_eq!(alternatives[0].key(), "turn:c");
        assert_eq!(alternatives[1].key(), "turn:a");
    }

    #[tokio::test]
    async fn test_unhealthy_after_consecutive_failures_and_recovery() {
        let (manager, mut events) = manager(
            vec![turn("turn:a", 1)],
            vec![("turn:a", None)],
            0,
        );

        for _ in 0..3 {
            manager.probe_all().await;
        }
        assert!(manager.select().await.is_none());

        let mut saw_unhealthy = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TurnEvent::ServerUnhealthy { .. }) {
                saw_unhealthy = true;
            }
        }
        assert!(saw_unhealthy);
    }

    #[tokio::test]
    async fn test_recovery_after_successful_probe() {
        struct FlakyProbe {
            calls: AtomicU32,
            fail_first: u32,
        }
        #[async_trait]
        impl RelayProbe for FlakyProbe {
            async fn gather_relay_latency(&self, _server: &TurnConfig) -> NatResult<u64> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.fail_first {
                    return Err(NatError::ProbeFailed("down".to_string()));
                }
                Ok(30)
            }
        }

        let (manager, mut events) = TurnManager::new(
            TurnManagerConfig::default(),
            vec![turn("turn:a", 1)],
            Arc::new(FlakyProbe {
                calls: AtomicU32::new(0),
                fail_first: 3,
            }),
            Arc::new(MockFetcher {
                calls: AtomicU32::new(0),
                fail_first: 0,
            }),
            Arc::new(FixedTimeProvider::new(0)),
            Arc::new(SeededRngProvider::new(1)),
        );

        // three failures mark the server unhealthy, the fourth probe
        // succeeds and recovers it
        for _ in 0..4 {
            manager.probe_all().await;
        }
        assert!(manager.select().await.is_some());

        let mut saw_recovered = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TurnEvent::ServerRecovered { .. }) {
                saw_recovered = true;
            }
        }
        assert!(saw_recovered);
    }

    #[tokio::test]
    async fn test_credential_refresh_with_retries() {
        let (manager, mut events) = manager(
            vec![turn("turn:a", 1)],
            vec![("turn:a", Some(10))],
            2, // first two fetches fail, then succeed
        );

        manager.refresh_credentials("turn:a").await.unwrap();

        let servers = manager.servers.read().await;
        assert_eq!(servers["turn:a"].config.username, "fresh-user");
        drop(servers);

        let mut saw_refreshed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TurnEvent::CredentialsRefreshed { .. }) {
                saw_refreshed = true;
            }
        }
        assert!(saw_refreshed);
    }

    #[tokio::test]
    async fn test_refresh_expiring_honors_margin() {
        let mut expiring = turn("turn:a", 1);
        expiring.expires_at_ms = Some(520_000); // within the 60s margin of t=500s
        let mut fresh = turn("turn:b", 1);
        fresh.expires_at_ms = Some(2_000_000);

        let (manager, _events) = manager(
            vec![expiring, fresh],
            vec![("turn:a", Some(10)), ("turn:b", Some(10))],
            0,
        );

        assert_eq!(manager.refresh_expiring().await, 1);
        let servers = manager.servers.read().await;
        assert_eq!(servers["turn:a"].config.username, "fresh-user");
        assert_eq!(servers["turn:b"].config.username, "user");
    }
}
