// =============================================================================
// Connection Monitor — Liveness watchdog, reconnect backoff and heartbeats
// =============================================================================
//
// Runs as one background Tokio task per connection, waking every
// `poll_interval` (10 s by default) to:
//   1. Probe liveness of the session.  A dead session is marked degraded and
//      reconnected; the reconnect replays every registered topic.
//   2. On reconnect failure, sleep `reconnect_interval` instead of the poll
//      interval.  From `max_consecutive_failures` on the sleep doubles and
//      each failure is reported as critical.  Retries never stop on their
//      own.
//   3. Send a heartbeat on the first live tick and then once
//      `heartbeat_interval` has elapsed since the last one.  A heartbeat
//      that fails because the socket is already closed is left to step 1 on
//      the next tick; anything else is a warning.
//
// The monitor only sees the session through the `Supervised` trait, so the
// policy is exercised in tests against a scripted fake.
//
// Every sleep is interruptible: `RunFlag::stop` wakes the loop immediately.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::runtime_config::ConnectionParams;
use crate::stream::events::ConnectionEventKind;
use crate::stream::topic::Topic;

// -----------------------------------------------------------------------------
// Supervised seam
// -----------------------------------------------------------------------------

/// Outcome of replaying the registry after a reconnect.
#[derive(Debug, Default, Clone)]
pub struct ResubscribeReport {
    pub restored: Vec<Topic>,
    pub failed: Vec<(Topic, ConnectionError)>,
}

impl ResubscribeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What the monitor needs from a session.
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    /// Synchronous liveness probe.
    fn is_live(&self) -> bool;

    /// Record that the session was found dead.
    fn mark_degraded(&self);

    /// Re-establish the session and replay subscriptions.
    async fn reconnect(&self) -> Result<ResubscribeReport, ConnectionError>;

    async fn heartbeat(&self) -> Result<(), ConnectionError>;

    /// Forward an event to external listeners.
    fn publish(&self, _event: ConnectionEventKind) {}
}

// -----------------------------------------------------------------------------
// Run flag
// -----------------------------------------------------------------------------

/// Shared "keep running" flag with a wake-up for sleeping loops.
#[derive(Debug)]
pub struct RunFlag {
    running: AtomicBool,
    wake: Notify,
}

impl RunFlag {
    pub fn new(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
            wake: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Clear the flag and wake every sleeper.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Sleep for `duration` unless stopped first.
    ///
    /// Returns `true` when the full sleep elapsed and the flag is still set.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop() is not lost.
        notified.as_mut().enable();

        if !self.is_running() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = notified => false,
        }
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

// -----------------------------------------------------------------------------
// Backoff policy
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub reconnect_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl BackoffPolicy {
    /// Whether `failures` consecutive failures warrant a critical report.
    pub fn is_critical(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }

    /// Sleep after the `failures`-th consecutive failure.  Non-decreasing in
    /// `failures`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if self.is_critical(failures) {
            self.reconnect_interval * 2
        } else {
            self.reconnect_interval
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}

/// Timing knobs of the monitor loop.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl MonitorSettings {
    pub fn from_params(params: &ConnectionParams) -> Self {
        Self {
            poll_interval: params.monitor_interval(),
            heartbeat_interval: params.heartbeat_interval(),
            backoff: BackoffPolicy {
                reconnect_interval: params.reconnect_interval(),
                max_consecutive_failures: params.max_consecutive_failures,
            },
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_params(&ConnectionParams::default())
    }
}

// -----------------------------------------------------------------------------
// Monitor
// -----------------------------------------------------------------------------

/// What one tick did.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Idle,
    HeartbeatSent,
    /// Heartbeat failed; `swallowed` when the socket was already closed.
    HeartbeatFailed { swallowed: bool },
    Reconnected(ResubscribeReport),
    ReconnectFailed {
        attempt: u32,
        critical: bool,
        delay: Duration,
    },
}

pub struct ConnectionMonitor {
    session: Arc<dyn Supervised>,
    flag: Arc<RunFlag>,
    settings: MonitorSettings,
    consecutive_failures: u32,
    /// `None` until the first heartbeat, so a fresh monitor pings at once.
    last_heartbeat: Option<Instant>,
}

impl ConnectionMonitor {
    pub fn new(session: Arc<dyn Supervised>, flag: Arc<RunFlag>, settings: MonitorSettings) -> Self {
        Self {
            session,
            flag,
            settings,
            consecutive_failures: 0,
            last_heartbeat: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// One pass of the watchdog.
    pub async fn tick(&mut self) -> TickOutcome {
        // ── 1. Liveness / reconnect ─────────────────────────────────────
        if !self.session.is_live() {
            self.session.mark_degraded();
            return match self.session.reconnect().await {
                Ok(report) => self.on_reconnected(report),
                Err(e) => self.on_reconnect_failed(e),
            };
        }

        // ── 2. Heartbeat ────────────────────────────────────────────────
        let due = self
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.settings.heartbeat_interval);
        if !due {
            return TickOutcome::Idle;
        }

        match self.session.heartbeat().await {
            Ok(()) => {
                self.last_heartbeat = Some(Instant::now());
                debug!("heartbeat sent");
                TickOutcome::HeartbeatSent
            }
            Err(ConnectionError::Closed) => {
                debug!("heartbeat raced a closed socket, liveness check will recover");
                TickOutcome::HeartbeatFailed { swallowed: true }
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed");
                self.session.mark_degraded();
                self.session.publish(ConnectionEventKind::HeartbeatFailed {
                    error: e.to_string(),
                });
                TickOutcome::HeartbeatFailed { swallowed: false }
            }
        }
    }

    fn on_reconnected(&mut self, report: ResubscribeReport) -> TickOutcome {
        if self.consecutive_failures > 0 {
            info!(
                previous_failures = self.consecutive_failures,
                "reconnected after failures"
            );
        }
        self.consecutive_failures = 0;
        self.last_heartbeat = Some(Instant::now());

        for (topic, err) in &report.failed {
            warn!(topic = %topic, error = %err, "topic left inactive after reconnect");
        }
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "subscriptions replayed"
        );
        TickOutcome::Reconnected(report)
    }

    fn on_reconnect_failed(&mut self, err: ConnectionError) -> TickOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let attempt = self.consecutive_failures;
        let policy = self.settings.backoff;
        let critical = policy.is_critical(attempt);
        let delay = policy.delay_after(attempt);

        if err.is_auth() {
            warn!(attempt, error = %err, "reconnect failed: authentication");
        } else {
            warn!(attempt, error = %err, "reconnect failed: transport");
        }
        if critical {
            error!(
                attempt,
                delay_secs = delay.as_secs(),
                "CRITICAL: connection keeps failing, backing off"
            );
        }

        self.session.publish(ConnectionEventKind::ReconnectFailed {
            attempt,
            critical,
            authentication: err.is_auth(),
            error: err.to_string(),
        });

        TickOutcome::ReconnectFailed {
            attempt,
            critical,
            delay,
        }
    }

    /// Sleep that follows `outcome`.
    pub fn delay_for(&self, outcome: &TickOutcome) -> Duration {
        match outcome {
            TickOutcome::ReconnectFailed { delay, .. } => *delay,
            _ => self.settings.poll_interval,
        }
    }

    /// Loop until the run flag is cleared.
    pub async fn run(mut self) {
        info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            heartbeat_secs = self.settings.heartbeat_interval.as_secs(),
            "connection monitor started"
        );

        while self.flag.is_running() {
            let outcome = self.tick().await;
            let delay = self.delay_for(&outcome);
            if !self.flag.sleep(delay).await {
                break;
            }
        }

        info!("connection monitor stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Scripted session: reconnect and heartbeat results are popped in order.
    #[derive(Default)]
    struct FakeSession {
        live: AtomicBool,
        degraded: AtomicU32,
        reconnects: AtomicU32,
        heartbeats: AtomicU32,
        reconnect_script: Mutex<VecDeque<Result<ResubscribeReport, ConnectionError>>>,
        heartbeat_script: Mutex<VecDeque<Result<(), ConnectionError>>>,
        events: Mutex<Vec<ConnectionEventKind>>,
    }

    #[async_trait]
    impl Supervised for FakeSession {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        fn mark_degraded(&self) {
            self.degraded.fetch_add(1, Ordering::SeqCst);
        }

        async fn reconnect(&self) -> Result<ResubscribeReport, ConnectionError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            let next = self
                .reconnect_script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectionError::Transport("refused".into())));
            if next.is_ok() {
                self.live.store(true, Ordering::SeqCst);
            }
            next
        }

        async fn heartbeat(&self) -> Result<(), ConnectionError> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            self.heartbeat_script.lock().pop_front().unwrap_or(Ok(()))
        }

        fn publish(&self, event: ConnectionEventKind) {
            self.events.lock().push(event);
        }
    }

    fn settings(heartbeat: Duration) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: heartbeat,
            backoff: BackoffPolicy::default(),
        }
    }

    fn monitor(session: Arc<FakeSession>, heartbeat: Duration) -> ConnectionMonitor {
        ConnectionMonitor::new(session, Arc::new(RunFlag::default()), settings(heartbeat))
    }

    #[test]
    fn backoff_is_non_decreasing_and_escalates() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (1..=8).map(|n| policy.delay_after(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[3], Duration::from_secs(30));
        assert_eq!(delays[4], Duration::from_secs(60));
        assert!(!policy.is_critical(4));
        assert!(policy.is_critical(5));
    }

    #[tokio::test]
    async fn first_tick_pings_then_idles_until_the_interval() {
        let session = Arc::new(FakeSession::default());
        session.live.store(true, Ordering::SeqCst);
        let mut mon = monitor(session.clone(), Duration::from_secs(3600));

        assert!(matches!(mon.tick().await, TickOutcome::HeartbeatSent));
        assert_eq!(session.heartbeats.load(Ordering::SeqCst), 1);

        assert!(matches!(mon.tick().await, TickOutcome::Idle));
        assert_eq!(session.heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(mon.delay_for(&TickOutcome::Idle), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn failed_first_heartbeat_is_retried_next_tick() {
        let session = Arc::new(FakeSession::default());
        session.live.store(true, Ordering::SeqCst);
        session
            .heartbeat_script
            .lock()
            .push_back(Err(ConnectionError::Closed));
        let mut mon = monitor(session.clone(), Duration::from_secs(3600));

        assert!(matches!(
            mon.tick().await,
            TickOutcome::HeartbeatFailed { swallowed: true }
        ));
        assert!(matches!(mon.tick().await, TickOutcome::HeartbeatSent));
        assert_eq!(session.heartbeats.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_failures_back_off_then_reset_on_success() {
        let session = Arc::new(FakeSession::default());
        {
            let mut script = session.reconnect_script.lock();
            for _ in 0..6 {
                script.push_back(Err(ConnectionError::Transport("refused".into())));
            }
            script.push_back(Ok(ResubscribeReport::default()));
        }
        let mut mon = monitor(session.clone(), Duration::from_secs(3600));

        let mut delays = Vec::new();
        for _ in 0..6 {
            let outcome = mon.tick().await;
            match &outcome {
                TickOutcome::ReconnectFailed {
                    attempt, critical, ..
                } => assert_eq!(*critical, *attempt >= 5),
                other => panic!("expected failure, got {other:?}"),
            }
            delays.push(mon.delay_for(&outcome));
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_secs(30));
        assert_eq!(delays[5], Duration::from_secs(60));

        assert!(matches!(mon.tick().await, TickOutcome::Reconnected(_)));
        assert_eq!(mon.consecutive_failures(), 0);
        assert_eq!(session.degraded.load(Ordering::SeqCst), 7);

        let critical_reports = session
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, ConnectionEventKind::ReconnectFailed { critical: true, .. }))
            .count();
        assert_eq!(critical_reports, 2);
    }

    #[tokio::test]
    async fn auth_failures_use_the_same_backoff() {
        let session = Arc::new(FakeSession::default());
        session
            .reconnect_script
            .lock()
            .push_back(Err(ConnectionError::Authentication("10003".into())));
        let mut mon = monitor(session.clone(), Duration::from_secs(3600));

        let outcome = mon.tick().await;
        assert_eq!(mon.delay_for(&outcome), Duration::from_secs(30));
        assert!(matches!(
            session.events.lock()[0],
            ConnectionEventKind::ReconnectFailed {
                authentication: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reconnect_report_is_passed_through() {
        let session = Arc::new(FakeSession::default());
        session.reconnect_script.lock().push_back(Ok(ResubscribeReport {
            restored: vec![Topic::ticker("BTCUSDT")],
            failed: vec![(
                Topic::ticker("ETHUSDT"),
                ConnectionError::Rejected("no such topic".into()),
            )],
        }));
        let mut mon = monitor(session, Duration::from_secs(3600));

        match mon.tick().await {
            TickOutcome::Reconnected(report) => {
                assert_eq!(report.restored, vec![Topic::ticker("BTCUSDT")]);
                assert_eq!(report.failed.len(), 1);
                assert!(!report.is_complete());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_closed_is_swallowed_other_errors_degrade() {
        let session = Arc::new(FakeSession::default());
        session.live.store(true, Ordering::SeqCst);
        {
            let mut script = session.heartbeat_script.lock();
            script.push_back(Ok(()));
            script.push_back(Err(ConnectionError::Closed));
            script.push_back(Err(ConnectionError::Transport("broken pipe".into())));
        }
        let mut mon = monitor(session.clone(), Duration::ZERO);

        assert!(matches!(mon.tick().await, TickOutcome::HeartbeatSent));
        assert!(matches!(
            mon.tick().await,
            TickOutcome::HeartbeatFailed { swallowed: true }
        ));
        assert_eq!(session.degraded.load(Ordering::SeqCst), 0);
        assert!(matches!(
            mon.tick().await,
            TickOutcome::HeartbeatFailed { swallowed: false }
        ));
        assert_eq!(session.degraded.load(Ordering::SeqCst), 1);
        assert_eq!(session.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_sleep() {
        let flag = Arc::new(RunFlag::default());
        let sleeper = flag.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.stop();

        let finished = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleep should be interrupted")
            .unwrap();
        assert!(!finished);
        assert!(!flag.sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn run_loop_exits_when_flag_is_cleared() {
        let session = Arc::new(FakeSession::default());
        session.live.store(true, Ordering::SeqCst);
        let flag = Arc::new(RunFlag::default());
        let mon = ConnectionMonitor::new(session, flag.clone(), settings(Duration::from_secs(3600)));

        let handle = mon.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
