// =============================================================================
// Bybit Sentinel — Main Entry Point
// =============================================================================
//
// Streams account updates from the private channel and klines from the public
// channel, keeps both sessions healed, and runs the channel breakout strategy
// with multi-timeframe confirmation on every closed bar.
// =============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bybit_sentinel::exchange::BybitClient;
use bybit_sentinel::market_data::{kline_callback, CandleBuffer, CandleKey, CandleSource};
use bybit_sentinel::runtime_config::{RuntimeConfig, SizingParams};
use bybit_sentinel::strategy::confirmation::select_timeframes;
use bybit_sentinel::strategy::{
    calculate_position_size, Analyzer, ChannelBreakout, MultiTimeframeConfirmer,
};
use bybit_sentinel::stream::auth::{local_now_ms, ClockOffset, Credentials};
use bybit_sentinel::stream::events::ConnectionEvent;
use bybit_sentinel::stream::{
    Callback, ConnectionSettings, MarketDataConnection, MonitorSettings, SubscribeOutcome, Topic,
    TungsteniteTransport,
};

const CONFIG_PATH: &str = "runtime_config.json";
/// Bars kept per (symbol, interval).
const BUFFER_CAPACITY: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Bybit Sentinel — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        testnet = config.connection.testnet,
        interval = %config.kline_interval,
        "Configured markets"
    );

    // ── 2. Credentials & clock ───────────────────────────────────────────
    let credentials = Credentials::from_env();
    let clock = Arc::new(ClockOffset::default());
    let rest = BybitClient::from_params(&config.connection)?;

    match rest.server_time_ms().await {
        Ok(server_ms) => {
            clock.calibrate(server_ms, local_now_ms());
        }
        Err(e) => warn!(error = %e, "Clock calibration failed, assuming zero offset"),
    }

    // ── 3. Candle history ────────────────────────────────────────────────
    let buffer = Arc::new(CandleBuffer::new(BUFFER_CAPACITY));
    let mut intervals = vec![config.kline_interval.clone()];
    intervals.extend(select_timeframes(
        &config.confirmation.ladder,
        &config.kline_interval,
    ));

    for symbol in &config.symbols {
        for interval in &intervals {
            match rest
                .backfill(&buffer, symbol, interval, config.confirmation.candle_limit)
                .await
            {
                Ok(count) => info!(symbol = %symbol, interval = %interval, count, "Backfilled candles"),
                Err(e) => warn!(symbol = %symbol, interval = %interval, error = %e, "Backfill failed"),
            }
        }
    }

    // ── 4. Strategy pipeline ─────────────────────────────────────────────
    let analyzer = Analyzer::new(Arc::new(ChannelBreakout::new(
        config.channel_breakout.clone(),
    )));
    let source: Arc<dyn CandleSource> = buffer.clone();
    let confirmer = MultiTimeframeConfirmer::new(&config.confirmation, source);

    let (closed_tx, closed_rx) = mpsc::unbounded_channel::<CandleKey>();
    tokio::spawn(run_analysis(
        closed_rx,
        buffer.clone(),
        analyzer,
        confirmer,
        config.sizing.clone(),
        config.confirmation.candle_limit,
    ));

    // ── 5. Streaming sessions ────────────────────────────────────────────
    let monitor_settings = MonitorSettings::from_params(&config.connection);
    let io_timeout = config.connection.request_timeout();

    let public = MarketDataConnection::new(
        ConnectionSettings::public_from_params(&config.connection),
        Credentials::new("", ""),
        clock.clone(),
        Arc::new(TungsteniteTransport::new(io_timeout)),
    );
    spawn_event_logger("public", public.subscribe_events());

    let on_close = forward_closed_bars(config.kline_interval.clone(), closed_tx);
    let klines = kline_callback(buffer.clone(), Some(on_close));
    for symbol in &config.symbols {
        for interval in &intervals {
            register(&public, &format!("kline.{interval}.{symbol}"), klines.clone()).await;
        }
    }

    let private = if credentials.is_empty() {
        warn!("BYBIT_API_KEY / BYBIT_API_SECRET not set, private stream disabled");
        None
    } else {
        let conn = MarketDataConnection::new(
            ConnectionSettings::from_params(&config.connection),
            credentials.clone(),
            clock.clone(),
            Arc::new(TungsteniteTransport::new(io_timeout)),
        );
        spawn_event_logger("private", conn.subscribe_events());
        Some(conn)
    };

    let account_updates: Callback = Arc::new(|topic: &Topic, payload: &Value| {
        info!(topic = %topic, payload = %payload, "Account update");
    });
    for raw in &config.topics {
        let Ok(topic) = raw.parse::<Topic>() else {
            warn!(topic = %raw, "Ignoring unparseable topic in config");
            continue;
        };
        match (&private, topic.category.is_private()) {
            (Some(conn), true) => register(conn, raw, account_updates.clone()).await,
            (None, true) => warn!(topic = %raw, "Private topic skipped without credentials"),
            (_, false) => register(&public, raw, account_updates.clone()).await,
        }
    }

    // ── 6. Connect & supervise ───────────────────────────────────────────
    let sessions = std::iter::once(("public", &public))
        .chain(private.iter().map(|conn| ("private", conn)));
    for (name, conn) in sessions {
        if let Err(e) = conn.connect().await {
            error!(stream = name, error = %e, "Initial connect failed, monitor will retry");
        }
        conn.spawn_monitor(monitor_settings);
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, closing sessions");

    public.close().await;
    if let Some(conn) = &private {
        conn.close().await;
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Bybit Sentinel shut down complete.");
    Ok(())
}

type CloseHook = Arc<dyn Fn(&CandleKey) + Send + Sync>;

/// Queue closed bars on `base_interval` for the analysis task.
fn forward_closed_bars(base_interval: String, tx: mpsc::UnboundedSender<CandleKey>) -> CloseHook {
    Arc::new(move |key: &CandleKey| {
        if key.interval != base_interval {
            return;
        }
        if let Err(e) = tx.send(key.clone()) {
            debug!(key = %e.0, "analysis task gone, closed bar not queued");
        }
    })
}

async fn register(conn: &MarketDataConnection, raw: &str, callback: Callback) {
    match conn.subscribe(raw, callback).await {
        Ok(SubscribeOutcome::Failed(e)) => warn!(topic = %raw, error = %e, "Subscribe failed"),
        Ok(outcome) => info!(topic = %raw, outcome = ?outcome, "Topic registered"),
        Err(e) => warn!(topic = %raw, error = %e, "Invalid topic"),
    }
}

fn spawn_event_logger(stream: &'static str, mut events: broadcast::Receiver<ConnectionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(stream, event = %json, "Connection event"),
                    Err(e) => warn!(stream, error = %e, "Failed to encode connection event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(stream, skipped = n, "Connection event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Analyze every closed bar on the base interval; confirm and size entries.
async fn run_analysis(
    mut closed: mpsc::UnboundedReceiver<CandleKey>,
    buffer: Arc<CandleBuffer>,
    analyzer: Analyzer,
    confirmer: MultiTimeframeConfirmer,
    sizing: SizingParams,
    limit: usize,
) {
    while let Some(key) = closed.recv().await {
        let window = buffer.get_closed(&key, limit);
        let record = analyzer.analyze(&window, &key.symbol);
        match serde_json::to_string(&record.signal) {
            Ok(json) => info!(key = %key, signal = %json, "Analysis record"),
            Err(e) => warn!(key = %key, error = %e, "Failed to encode analysis record"),
        }

        let kind = record.signal.kind;
        if !kind.is_entry() {
            continue;
        }

        let confirmation = confirmer.confirm(analyzer.engine(), &key.symbol, &key.interval, kind);
        if !confirmation.confirmed {
            info!(
                key = %key,
                signal = %kind,
                confidence = confirmation.confidence,
                "Entry not confirmed on higher timeframes"
            );
            continue;
        }

        let (Some(price), Some(stop)) = (buffer.last_close(&key), record.signal.levels.stop_loss)
        else {
            continue;
        };
        match calculate_position_size(
            price,
            stop,
            sizing.risk_amount,
            sizing.account_size,
            sizing.max_risk_percent,
        ) {
            Ok(size) => info!(
                key = %key,
                signal = %kind,
                strength = record.signal.strength,
                confidence = confirmation.confidence,
                size = size.position_size,
                stop_loss = stop,
                take_profit = ?record.signal.levels.take_profit,
                "Confirmed entry"
            ),
            Err(rejection) => warn!(key = %key, reason = %rejection.reason, "Entry not sized"),
        }
    }
}
