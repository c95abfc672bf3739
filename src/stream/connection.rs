// =============================================================================
// Market Data Connection — Authenticated, self-healing streaming session
// =============================================================================
//
// State machine:
//
//   Disconnected ──connect()──▶ Connecting ──handshake──▶ Authenticating
//        ▲                          │                           │
//        │◀──────── failure ────────┴───────── failure ─────────┤
//        │                                                      ▼
//        │◀── close() ── Closing ◀── close() ── Degraded ◀── Connected
//                                                  │              ▲
//                                                  └─ reconnect ──┘
//
// Locking:
//   * `lifecycle` (async mutex) serialises every state transition together
//     with subscribe / unsubscribe / replay, so a reconnect in progress can
//     never race a user subscribe and drop it.
//   * The inbound pump never takes `lifecycle`.  It resolves pending
//     acknowledgements and dispatches data frames through the registry's own
//     short-lived lock, so a transition waiting on an ack cannot deadlock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, TopicParseError};
use crate::runtime_config::ConnectionParams;
use crate::stream::auth::{ClockOffset, Credentials};
use crate::stream::events::{ConnectionEvent, ConnectionEventKind, EventBus};
use crate::stream::monitor::{
    ConnectionMonitor, MonitorSettings, ResubscribeReport, RunFlag, Supervised,
};
use crate::stream::registry::{Callback, SubscriptionRegistry};
use crate::stream::router::{ControlAck, MessageRouter, Routed};
use crate::stream::topic::Topic;
use crate::stream::transport::Transport;
use crate::types::ConnectionState;

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: String,
    /// Path component of the signed payload.
    pub auth_path: String,
    pub auth_expiry_ms: i64,
    /// Bound on subscribe / unsubscribe acknowledgements.
    pub request_timeout: Duration,
    /// Skip the auth step (public streams only).
    pub authenticate: bool,
}

impl ConnectionSettings {
    pub fn from_params(params: &ConnectionParams) -> Self {
        Self {
            endpoint: params.endpoint(),
            auth_path: params.auth_path.clone(),
            auth_expiry_ms: params.auth_expiry_ms,
            request_timeout: params.request_timeout(),
            authenticate: true,
        }
    }

    /// Settings for the unauthenticated public market stream.
    pub fn public_from_params(params: &ConnectionParams) -> Self {
        Self {
            endpoint: params.public_endpoint().to_string(),
            authenticate: false,
            ..Self::from_params(params)
        }
    }
}

/// Result of a user-initiated subscribe.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// Confirmed by the venue.
    Active,
    /// Registered; will be sent when the session is (re)established.
    Deferred,
    /// Registered but the venue did not confirm it; retried on reconnect.
    Failed(ConnectionError),
}

// -----------------------------------------------------------------------------
// Inbound side (shared with the pump task)
// -----------------------------------------------------------------------------

struct Inbound {
    router: MessageRouter,
    pending: Mutex<HashMap<String, oneshot::Sender<ControlAck>>>,
    last_pong: Mutex<Option<Instant>>,
}

impl Inbound {
    fn await_ack(&self, key: impl Into<String>) -> oneshot::Receiver<ControlAck> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.into(), tx);
        rx
    }

    fn forget(&self, key: &str) {
        self.pending.lock().remove(key);
    }

    /// Drop every pending sender so that waiters fail fast.
    fn abandon_pending(&self) {
        self.pending.lock().clear();
    }

    fn handle(&self, text: &str) {
        match self.router.route(text) {
            Routed::Control(ack) => {
                let waiter = self.pending.lock().remove(&ack.key());
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!(op = %ack.op, success = ack.success, "unsolicited operation response"),
                }
            }
            Routed::Pong => {
                *self.last_pong.lock() = Some(Instant::now());
            }
            Routed::Dispatched(_) | Routed::Dropped(_) | Routed::Ignored => {}
        }
    }
}

async fn pump(inbound: Arc<Inbound>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        inbound.handle(&text);
    }
    debug!("inbound channel closed");
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Session {
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    settings: ConnectionSettings,
    credentials: Credentials,
    clock: Arc<ClockOffset>,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    inbound: Arc<Inbound>,
    state: RwLock<ConnectionState>,
    lifecycle: tokio::sync::Mutex<Session>,
    running: Arc<RunFlag>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

/// Handle to one streaming session.  Cheap to clone.
#[derive(Clone)]
pub struct MarketDataConnection {
    inner: Arc<Inner>,
}

impl MarketDataConnection {
    pub fn new(
        settings: ConnectionSettings,
        credentials: Credentials,
        clock: Arc<ClockOffset>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let inbound = Arc::new(Inbound {
            router: MessageRouter::new(registry.clone()),
            pending: Mutex::new(HashMap::new()),
            last_pong: Mutex::new(None),
        });
        let events = EventBus::new(settings.endpoint.clone());

        info!(endpoint = %settings.endpoint, authenticate = settings.authenticate, "market data connection created");

        Self {
            inner: Arc::new(Inner {
                settings,
                credentials,
                clock,
                transport,
                registry,
                inbound,
                state: RwLock::new(ConnectionState::Disconnected),
                lifecycle: tokio::sync::Mutex::new(Session::default()),
                running: Arc::new(RunFlag::new(false)),
                monitor: Mutex::new(None),
                events,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// When the venue last answered a heartbeat.
    pub fn last_pong(&self) -> Option<Instant> {
        *self.inner.inbound.last_pong.lock()
    }

    /// (dispatched, dropped) inbound data frames.
    pub fn frame_counters(&self) -> (u64, u64) {
        self.inner.inbound.router.counters()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.is_running()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!(from = %from, to = %to, "connection state changed");
            self.inner
                .events
                .emit(ConnectionEventKind::StateChanged { from, to });
        }
    }

    fn session_is_live(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.transport.is_live()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open, authenticate and replay registered topics.
    ///
    /// Concurrent callers serialise on the lifecycle lock: the second one
    /// finds the session already connected and returns without dialling.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.running.start();
        let mut session = self.inner.lifecycle.lock().await;

        if self.session_is_live() {
            debug!("connect: already connected");
            return Ok(());
        }

        self.establish(&mut session).await?;
        let report = self.replay().await;
        if !report.is_complete() {
            warn!(failed = report.failed.len(), "some topics could not be subscribed");
        }
        Ok(())
    }

    /// Start the watchdog task if it is not already running.
    pub fn spawn_monitor(&self, settings: MonitorSettings) {
        let mut slot = self.inner.monitor.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("monitor already running");
            return;
        }
        self.inner.running.start();
        let session: Arc<dyn Supervised> = Arc::new(self.clone());
        let monitor = ConnectionMonitor::new(session, self.inner.running.clone(), settings);
        *slot = Some(monitor.spawn());
    }

    /// Stop the monitor, tear down the socket and end in `Disconnected`.
    ///
    /// Once this returns no callback is running or will run.  Must not be
    /// called from inside a topic callback.
    pub async fn close(&self) {
        self.inner.running.stop();

        let monitor = self.inner.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }

        let mut session = self.inner.lifecycle.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Degraded
        ) {
            self.set_state(ConnectionState::Closing);
        }

        self.teardown(&mut session).await;
        self.set_state(ConnectionState::Disconnected);
        info!("connection closed");
    }

    async fn teardown(&self, session: &mut Session) {
        self.inner.transport.shutdown().await;
        if let Some(pump) = session.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.inner.inbound.abandon_pending();
        self.inner.registry.mark_all_inactive();
    }

    /// Dial and authenticate.  Leaves the state `Connected` on success and
    /// `Disconnected` on failure.  Caller holds the lifecycle lock.
    async fn establish(&self, session: &mut Session) -> Result<(), ConnectionError> {
        self.teardown(session).await;
        self.set_state(ConnectionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .inner
            .transport
            .open(&self.inner.settings.endpoint, tx)
            .await
        {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        session.pump = Some(tokio::spawn(pump(self.inner.inbound.clone(), rx)));

        if self.inner.settings.authenticate {
            self.set_state(ConnectionState::Authenticating);
            if let Err(e) = self.authenticate().await {
                warn!(error = %e, "authentication failed");
                self.teardown(session).await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), ConnectionError> {
        let clock = &self.inner.clock;
        let signed_at = clock.venue_now_ms();
        let challenge = self.inner.credentials.challenge(
            &self.inner.settings.auth_path,
            signed_at,
            self.inner.settings.auth_expiry_ms,
        )?;

        let ack_rx = self.inner.inbound.await_ack("auth");
        if let Err(e) = self.inner.transport.send(challenge.to_frame()).await {
            self.inner.inbound.forget("auth");
            return Err(e);
        }

        let window = Duration::from_millis((challenge.expires_ms - signed_at).max(0) as u64);
        let ack = match tokio::time::timeout(window, ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => {
                return Err(ConnectionError::Transport(
                    "socket dropped during authentication".into(),
                ))
            }
            Err(_) => {
                self.inner.inbound.forget("auth");
                return Err(ConnectionError::AuthExpired {
                    expires_ms: challenge.expires_ms,
                    completed_ms: clock.venue_now_ms(),
                });
            }
        };

        let completed_ms = clock.venue_now_ms();
        if !challenge.is_valid_at(completed_ms) {
            return Err(ConnectionError::AuthExpired {
                expires_ms: challenge.expires_ms,
                completed_ms,
            });
        }
        if !ack.success {
            return Err(ConnectionError::Authentication(ack.message));
        }

        debug!("authenticated");
        Ok(())
    }

    /// Send one operation and wait for its acknowledgement.
    async fn request(&self, op: &str, topic: &Topic) -> Result<(), ConnectionError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let ack_rx = self.inner.inbound.await_ack(req_id.clone());
        let frame = json!({
            "op": op,
            "req_id": req_id,
            "args": [topic.venue_topic()],
        })
        .to_string();

        if let Err(e) = self.inner.transport.send(frame).await {
            self.inner.inbound.forget(&req_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.settings.request_timeout, ack_rx).await {
            Ok(Ok(ack)) if ack.success => Ok(()),
            Ok(Ok(ack)) => Err(ConnectionError::Rejected(ack.message)),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.inner.inbound.forget(&req_id);
                Err(ConnectionError::Timeout("operation acknowledgement"))
            }
        }
    }

    /// Re-send every registered topic.  A failed topic stays inactive and
    /// does not stop the others.  Caller holds the lifecycle lock.
    async fn replay(&self) -> ResubscribeReport {
        let mut report = ResubscribeReport::default();

        for topic in self.inner.registry.snapshot() {
            match self.request("subscribe", &topic).await {
                Ok(()) => {
                    self.inner.registry.set_active(&topic, true);
                    report.restored.push(topic);
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "subscribe failed, topic left inactive");
                    self.inner.registry.set_active(&topic, false);
                    report.failed.push((topic, e));
                }
            }
        }

        self.inner.events.emit(ConnectionEventKind::Resubscribed {
            restored: report.restored.iter().map(Topic::to_string).collect(),
            failed: report.failed.iter().map(|(t, _)| t.to_string()).collect(),
        });
        report
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register `callback` for `raw` and subscribe now when connected.
    pub async fn subscribe(
        &self,
        raw: &str,
        callback: Callback,
    ) -> Result<SubscribeOutcome, TopicParseError> {
        let topic: Topic = raw.parse()?;
        let _session = self.inner.lifecycle.lock().await;

        let already_active = self.inner.registry.is_active(&topic);
        self.inner.registry.add_topic(topic.clone(), callback);

        if already_active {
            return Ok(SubscribeOutcome::Active);
        }
        if self.state() != ConnectionState::Connected {
            debug!(topic = %topic, "not connected, subscription deferred");
            return Ok(SubscribeOutcome::Deferred);
        }

        match self.request("subscribe", &topic).await {
            Ok(()) => {
                self.inner.registry.set_active(&topic, true);
                info!(topic = %topic, "subscribed");
                Ok(SubscribeOutcome::Active)
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "subscribe failed, will retry on reconnect");
                Ok(SubscribeOutcome::Failed(e))
            }
        }
    }

    /// Forget `raw`.  Unsubscribing an unknown topic is a no-op.
    pub async fn unsubscribe(&self, raw: &str) -> Result<(), TopicParseError> {
        let topic: Topic = raw.parse()?;
        let _session = self.inner.lifecycle.lock().await;

        let was_active = self.inner.registry.is_active(&topic);
        if !self.inner.registry.remove(&topic) {
            debug!(topic = %topic, "unsubscribe of unknown topic ignored");
            return Ok(());
        }

        if was_active && self.state() == ConnectionState::Connected {
            if let Err(e) = self.request("unsubscribe", &topic).await {
                warn!(topic = %topic, error = %e, "venue unsubscribe failed");
            }
        }
        info!(topic = %topic, "unsubscribed");
        Ok(())
    }

    /// Send one application-level ping.
    pub async fn heartbeat(&self) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::Closed);
        }
        let frame = json!({ "op": "ping", "req_id": uuid::Uuid::new_v4().to_string() }).to_string();
        self.inner.transport.send(frame).await
    }
}

#[async_trait]
impl Supervised for MarketDataConnection {
    fn is_live(&self) -> bool {
        self.session_is_live()
    }

    fn mark_degraded(&self) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Degraded);
        }
        self.inner.registry.mark_all_inactive();
    }

    async fn reconnect(&self) -> Result<ResubscribeReport, ConnectionError> {
        let mut session = self.inner.lifecycle.lock().await;

        if !self.inner.running.is_running() {
            return Err(ConnectionError::Closed);
        }
        if self.session_is_live() {
            // Someone else reconnected while we waited for the lock.
            return Ok(ResubscribeReport {
                restored: self.inner.registry.live_topics(),
                failed: Vec::new(),
            });
        }

        self.establish(&mut session).await?;
        Ok(self.replay().await)
    }

    async fn heartbeat(&self) -> Result<(), ConnectionError> {
        MarketDataConnection::heartbeat(self).await
    }

    fn publish(&self, event: ConnectionEventKind) {
        self.inner.events.emit(event);
    }
}
