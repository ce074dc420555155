//! Signaling client.
//!
//! Wraps a caller-supplied duplex message stream (the reference transport
//! is a WebSocket) with the mesh signaling semantics: one room at a time,
//! outbound queueing while the link is down, heartbeat pings, and
//! exponential-backoff reconnection that rejoins the last room. A close
//! with code 1000 is final. Malformed messages are logged and dropped.

use crate::{NetError, NetResult};
use aqe_common::{ReplicaId, RngProvider, TimeProvider};
use aqe_protocol::{PingPayload, RoomRef, SignalEnvelope, SignalPayload};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Normal-closure code; the client does not reconnect after it.
pub const CLOSE_NORMAL: u16 = 1000;

/// Something that can open a duplex message stream.
#[async_trait]
pub trait MessageStream: Send + Sync {
    async fn connect(&self, url: &str) -> NetResult<Box<dyn StreamConn>>;
}

/// An open duplex message stream.
#[async_trait]
pub trait StreamConn: Send + Sync {
    async fn send_text(&self, text: String) -> NetResult<()>;
    async fn recv_event(&self) -> NetResult<StreamEvent>;
    async fn close(&self, code: u16) -> NetResult<()>;
}

/// Events surfaced by a stream connection.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(String),
    Closed { code: u16 },
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    /// Jitter fraction applied to each reconnect delay.
    pub reconnect_jitter: f64,
    pub reconnect_max_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://signal.aqe-mesh.dev".to_string(),
            heartbeat_interval_ms: 30_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.25,
            reconnect_max_attempts: 8,
        }
    }
}

/// Events delivered to the client's consumer.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    /// Link lost; `will_retry` is false when the client is giving up.
    Disconnected { will_retry: bool },
    /// A signaling message addressed to us.
    Message(SignalEnvelope),
    /// Room membership confirmed by the server.
    RoomJoined { room_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct ClientShared {
    state: LinkState,
    conn: Option<Arc<dyn StreamConn>>,
    queue: VecDeque<SignalEnvelope>,
    current_room: Option<String>,
    last_room: Option<String>,
}

/// Reconnecting signaling client.
pub struct SignalingClient {
    config: SignalingConfig,
    stream: Arc<dyn MessageStream>,
    local: ReplicaId,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    shared: Mutex<ClientShared>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl SignalingClient {
    /// Create a client. Returns the client and its event stream.
    pub fn new(
        config: SignalingConfig,
        stream: Arc<dyn MessageStream>,
        local: ReplicaId,
        time: Arc<dyn TimeProvider>,
        rng: Arc<dyn RngProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                stream,
                local,
                time,
                rng,
                shared: Mutex::new(ClientShared {
                    state: LinkState::Idle,
                    conn: None,
                    queue: VecDeque::new(),
                    current_room: None,
                    last_room: None,
                }),
                events,
            },
            receiver,
        )
    }

    /// The local replica id.
    pub fn local_id(&self) -> &ReplicaId {
        &self.local
    }

    /// Send an envelope, queueing it while the link is down.
    pub async fn send(&self, envelope: SignalEnvelope) -> NetResult<()> {
        let conn = {
            let mut shared = self.shared.lock().await;
            match (&shared.state, shared.conn.clone()) {
                (LinkState::Connected, Some(conn)) => conn,
                (LinkState::Closed, _) => {
                    return Err(NetError::NotConnected("client closed".to_string()));
                }
                _ => {
                    debug!("queueing {} while link is down", envelope.payload.message_type());
                    shared.queue.push_back(envelope);
                    return Ok(());
                }
            }
        };
        conn.send_text(envelope.to_json()?).await
    }

    /// Join a room, leaving the previous one first. Success is inferred
    /// from the subsequent RoomInfo message.
    pub async fn join_room(&self, room_id: impl Into<String>) -> NetResult<()> {
        let room_id = room_id.into();
        let previous = {
            let mut shared = self.shared.lock().await;
            let previous = shared.current_room.take();
            shared.last_room = Some(room_id.clone());
            previous
        };

        if let Some(previous) = previous {
            if previous != room_id {
                let leave = SignalEnvelope::new(
                    SignalPayload::LeaveRoom(RoomRef {
                        room_id: previous.clone(),
                    }),
                    self.local.clone(),
                    self.time.unix_millis(),
                )
                .in_room(previous);
                self.send(leave).await?;
            }
        }

        let join = SignalEnvelope::new(
            SignalPayload::JoinRoom(RoomRef {
                room_id: room_id.clone(),
            }),
            self.local.clone(),
            self.time.unix_millis(),
        )
        .in_room(room_id);
        self.send(join).await
    }

    /// Leave the current room.
    pub async fn leave_room(&self) -> NetResult<()> {
        let room = {
            let mut shared = self.shared.lock().await;
            shared.last_room = None;
            shared.current_room.take()
        };
        let Some(room) = room else {
            return Ok(());
        };
        let leave = SignalEnvelope::new(
            SignalPayload::LeaveRoom(RoomRef {
                room_id: room.clone(),
            }),
            self.local.clone(),
            self.time.unix_millis(),
        )
        .in_room(room);
        self.send(leave).await
    }

    /// Drive the connection until shutdown or a final disconnect.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> NetResult<()> {
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.enter_closed().await;
                return Ok(());
            }

            {
                let mut shared = self.shared.lock().await;
                shared.state = if attempts == 0 {
                    LinkState::Connecting
                } else {
                    LinkState::Reconnecting
                };
            }

            match self.stream.connect(&self.config.url).await {
                Ok(conn) => {
                    let conn: Arc<dyn StreamConn> = Arc::from(conn);
                    attempts = 0;
                    self.on_open(conn.clone()).await?;

                    match self.pump(conn, &mut shutdown).await {
                        LinkOutcome::Shutdown => {
                            self.enter_closed().await;
                            return Ok(());
                        }
                        LinkOutcome::ClosedFinal => {
                            let _ = self
                                .events
                                .send(SignalingEvent::Disconnected { will_retry: false });
                            self.enter_closed().await;
                            return Ok(());
                        }
                        LinkOutcome::Lost => {
                            let _ = self
                                .events
                                .send(SignalingEvent::Disconnected { will_retry: true });
                        }
                    }
                }
                Err(e) => {
                    warn!("signaling connect failed: {e}");
                }
            }

            attempts += 1;
            if attempts >= self.config.reconnect_max_attempts {
                warn!("giving up after {attempts} reconnect attempts");
                let _ = self
                    .events
                    .send(SignalingEvent::Disconnected { will_retry: false });
                self.enter_closed().await;
                return Err(NetError::NotConnected(
                    "reconnect attempts exhausted".to_string(),
                ));
            }

            let delay = self.reconnect_delay(attempts);
            debug!("reconnecting in {delay} ms (attempt {attempts})");
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> u64 {
        let base = self.config.reconnect_initial_delay_ms as f64
            * self.config.reconnect_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.reconnect_max_delay_ms as f64);
        let jitter_span = capped * self.config.reconnect_jitter;
        let jitter = (self.rng.next_f64() * 2.0 - 1.0) * jitter_span;
        (capped + jitter).max(0.0) as u64
    }

    async fn on_open(&self, conn: Arc<dyn StreamConn>) -> NetResult<()> {
        info!("signaling link open");
        let (queued, rejoin) = {
            let mut shared = self.shared.lock().await;
            shared.state = LinkState::Connected;
            shared.conn = Some(conn.clone());
            let queued: Vec<SignalEnvelope> = shared.queue.drain(..).collect();
            (queued, shared.last_room.clone())
        };
        let _ = self.events.send(SignalingEvent::Connected);

        for envelope in queued {
            conn.send_text(envelope.to_json()?).await?;
        }

        if let Some(room) = rejoin {
            debug!("rejoining room {room}");
            let join = SignalEnvelope::new(
                SignalPayload::JoinRoom(RoomRef {
                    room_id: room.clone(),
                }),
                self.local.clone(),
                self.time.unix_millis(),
            )
            .in_room(room);
            conn.send_text(join.to_json()?).await?;
        }
        Ok(())
    }

    async fn enter_closed(&self) {
        let conn = {
            let mut shared = self.shared.lock().await;
            shared.state = LinkState::Closed;
            shared.conn.take()
        };
        if let Some(conn) = conn {
            let _ = conn.close(CLOSE_NORMAL).await;
        }
    }

    async fn pump(
        &self,
        conn: Arc<dyn StreamConn>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkOutcome {
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return LinkOutcome::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = SignalEnvelope::new(
                        SignalPayload::Ping(PingPayload {
                            timestamp: self.time.unix_millis(),
                        }),
                        self.local.clone(),
                        self.time.unix_millis(),
                    );
                    if let Ok(json) = ping.to_json() {
                        if conn.send_text(json).await.is_err() {
                            self.drop_conn().await;
                            return LinkOutcome::Lost;
                        }
                    }
                }
                event = conn.recv_event() => match event {
                    Ok(StreamEvent::Message(text)) => self.handle_message(&text).await,
                    Ok(StreamEvent::Closed { code }) => {
                        self.drop_conn().await;
                        if code == CLOSE_NORMAL {
                            info!("signaling link closed normally");
                            return LinkOutcome::ClosedFinal;
                        }
                        warn!("signaling link lost (code {code})");
                        return LinkOutcome::Lost;
                    }
                    Err(e) => {
                        warn!("signaling receive error: {e}");
                        self.drop_conn().await;
                        return LinkOutcome::Lost;
                    }
                }
            }
        }
    }

    async fn drop_conn(&self) {
        let mut shared = self.shared.lock().await;
        shared.conn = None;
        shared.state = LinkState::Reconnecting;
    }

    async fn handle_message(&self, text: &str) {
        let envelope = match SignalEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed signaling message: {e}");
                return;
            }
        };

        if let SignalPayload::RoomInfo(info) = &envelope.payload {
            let mut shared = self.shared.lock().await;
            shared.current_room = Some(info.room_id.clone());
            let _ = self.events.send(SignalingEvent::RoomJoined {
                room_id: info.room_id.clone(),
            });
        }

        let _ = self.events.send(SignalingEvent::Message(envelope));
    }
}

enum LinkOutcome {
    Shutdown,
    ClosedFinal,
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_common::{FixedTimeProvider, SeededRngProvider};
    use aqe_protocol::RoomInfoPayload;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn local() -> ReplicaId {
        ReplicaId::new("replica_a")
    }

    /// Scripted stream: records sent text, serves queued inbound events.
    struct ScriptedConn {
        sent: Arc<StdMutex<Vec<String>>>,
        inbound: Arc<StdMutex<VecDeque<StreamEvent>>>,
    }

    #[async_trait]
    impl StreamConn for ScriptedConn {
        async fn send_text(&self, text: String) -> NetResult<()> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv_event(&self) -> NetResult<StreamEvent> {
            loop {
                if let Some(event) = self.inbound.lock().unwrap().pop_front() {
                    return Ok(event);
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        }

        async fn close(&self, _code: u16) -> NetResult<()> {
            Ok(())
        }
    }

    struct ScriptedStream {
        sent: Arc<StdMutex<Vec<String>>>,
        inbound: Arc<StdMutex<VecDeque<StreamEvent>>>,
        connects: AtomicU32,
        fail_first: u32,
    }

    impl ScriptedStream {
        fn new(fail_first: u32) -> Self {
            Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
                inbound: Arc::new(StdMutex::new(VecDeque::new())),
                connects: AtomicU32::new(0),
                fail_first,
            }
        }

        fn push_inbound(&self, event: StreamEvent) {
            self.inbound.lock().unwrap().push_back(event);
        }
    }

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn connect(&self, _url: &str) -> NetResult<Box<dyn StreamConn>> {
            let call = self.connects.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(NetError::Transport("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedConn {
                sent: self.sent.clone(),
                inbound: self.inbound.clone(),
            }))
        }
    }

    fn client(
        stream: Arc<ScriptedStream>,
    ) -> (
        Arc<SignalingClient>,
        mpsc::UnboundedReceiver<SignalingEvent>,
        watch::Sender<bool>,
    ) {
        let config = SignalingConfig {
            heartbeat_interval_ms: 50,
            reconnect_initial_delay_ms: 1,
            reconnect_max_delay_ms: 5,
            reconnect_max_attempts: 4,
            ..SignalingConfig::default()
        };
        let (client, events) = SignalingClient::new(
            config,
            stream,
            local(),
            Arc::new(FixedTimeProvider::new(1_000)),
            Arc::new(SeededRngProvider::new(5)),
        );
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        (Arc::new(client), events, shutdown_tx)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_messages_queue_until_connected_then_flush() {
        let stream = Arc::new(ScriptedStream::new(0));
        let (client, mut events, shutdown) = client(stream.clone());

        // send before the run loop has connected: must queue, not fail
        let ping = SignalEnvelope::new(
            SignalPayload::Ping(PingPayload { timestamp: 1 }),
            local(),
            1,
        );
        client.send(ping).await.unwrap();

        let runner = {
            let client = client.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { client.run(rx).await })
        };

        let sent = stream.sent.clone();
        wait_for("queued message flush", || !sent.lock().unwrap().is_empty()).await;

        // the first event is Connected
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SignalingEvent::Connected));

        shutdown.send(true).unwrap();
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_room_leaves_previous_and_rejoin_uses_last() {
        let stream = Arc::new(ScriptedStream::new(0));
        let (client, mut events, shutdown) = client(stream.clone());

        let runner = {
            let client = client.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { client.run(rx).await })
        };

        let sent = stream.sent.clone();
        wait_for("connect", || {
            stream.connects.load(Ordering::SeqCst) > 0
        })
        .await;

        client.join_room("room-1").await.unwrap();
        // server confirms, so the client knows its current room
        stream.push_inbound(StreamEvent::Message(
            SignalEnvelope::new(
                SignalPayload::RoomInfo(RoomInfoPayload {
                    room_id: "room-1".to_string(),
                    peers: vec![],
                }),
                ReplicaId::new("server"),
                2,
            )
            .to_json()
            .unwrap(),
        ));
        loop {
            match events.recv().await.unwrap() {
                SignalingEvent::RoomJoined { room_id } => {
                    assert_eq!(room_id, "room-1");
                    break;
                }
                _ => continue,
            }
        }

        client.join_room("room-2").await.unwrap();
        wait_for("leave + join sent", || {
            let sent = sent.lock().unwrap();
            sent.iter().any(|m| m.contains("LeaveRoom") && m.contains("room-1"))
                && sent.iter().any(|m| m.contains("JoinRoom") && m.contains("room-2"))
        })
        .await;

        shutdown.send(true).unwrap();
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_abnormal_close_and_rejoin() {
        let stream = Arc::new(ScriptedStream::new(0));
        let (client, mut events, shutdown) = client(stream.clone());

        let runner = {
            let client = client.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { client.run(rx).await })
        };

        wait_for("connect", || stream.connects.load(Ordering::SeqCst) > 0).await;
        client.join_room("room-9").await.unwrap();

        // abnormal close triggers reconnection
        stream.push_inbound(StreamEvent::Closed { code: 1006 });
        wait_for("reconnect", || {
            stream.connects.load(Ordering::SeqCst) >= 2
        })
        .await;

        // the last room is rejoined on the new link
        let sent = stream.sent.clone();
        wait_for("rejoin", || {
            sent.lock()
                .unwrap()
                .iter()
                .filter(|m| m.contains("JoinRoom") && m.contains("room-9"))
                .count()
                >= 2
        })
        .await;

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SignalingEvent::Disconnected { will_retry: true }) {
                saw_retry = true;
            }
        }
        assert!(saw_retry);

        shutdown.send(true).unwrap();
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_normal_close_is_final() {
        let stream = Arc::new(ScriptedStream::new(0));
        let (client, mut events, shutdown) = client(stream.clone());

        let runner = {
            let client = client.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { client.run(rx).await })
        };
        let _shutdown_keepalive = shutdown;

        wait_for("connect", || stream.connects.load(Ordering::SeqCst) > 0).await;
        stream.push_inbound(StreamEvent::Closed { code: CLOSE_NORMAL });

        let result = runner.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(stream.connects.load(Ordering::SeqCst), 1);

        let mut saw_final = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SignalingEvent::Disconnected { will_retry: false }) {
                saw_final = true;
            }
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let stream = Arc::new(ScriptedStream::new(u32::MAX));
        let (client, _events, shutdown) = client(stream.clone());

        let rx = shutdown.subscribe();
        let result = client.run(rx).await;
        assert!(result.is_err());
        assert_eq!(stream.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_malformed_inbound_is_dropped() {
        let stream = Arc::new(ScriptedStream::new(0));
        let (client, mut events, shutdown) = client(stream.clone());

        let runner = {
            let client = client.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { client.run(rx).await })
        };

        wait_for("connect", || stream.connects.load(Ordering::SeqCst) > 0).await;
        stream.push_inbound(StreamEvent::Message("{garbage".to_string()));
        stream.push_inbound(StreamEvent::Message(
            SignalEnvelope::new(
                SignalPayload::Ping(PingPayload { timestamp: 5 }),
                ReplicaId::new("server"),
                5,
            )
            .to_json()
            .unwrap(),
        ));

        // only the valid message arrives
        let mut messages = 0;
        for _ in 0..200 {
            match events.try_recv() {
                Ok(SignalingEvent::Message(_)) => {
                    messages += 1;
                    break;
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(2)).await,
            }
        }
        assert_eq!(messages, 1);

        shutdown.send(true).unwrap();
        let _ = runner.await.unwrap();
    }

    #[test]
    fn test_reconnect_delay_backoff_and_cap() {
        let stream = Arc::new(ScriptedStream::new(0));
        let config = SignalingConfig {
            reconnect_initial_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.0,
            ..SignalingConfig::default()
        };
        let (client, _events) = SignalingClient::new(
            config,
            stream,
            local(),
            Arc::new(FixedTimeProvider::new(0)),
            Arc::new(SeededRngProvider::new(5)),
        );

        assert_eq!(client.reconnect_delay(1), 100);
        assert_eq!(client.reconnect_delay(2), 200);
        assert_eq!(client.reconnect_delay(3), 400);
        // capped
        assert_eq!(client.reconnect_delay(10), 1_000);
    }
}
