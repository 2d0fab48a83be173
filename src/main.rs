// =============================================================================
// market-feed — Headless Entry Point
// =============================================================================
//
// Opens one feed, logs a summary line every few seconds and shuts down on
// Ctrl+C. The same `MarketFeed` handle is what a UI would embed.
// =============================================================================

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use market_feed::{FeedConfig, MarketFeed, Pair, Timeframe};

const CONFIG_PATH: &str = "feed_config.json";
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });

    // Override the initial subscription from env if available.
    if let Ok(raw) = std::env::var("FEED_PAIR") {
        match Pair::new(&raw) {
            Ok(pair) => config.pair = pair,
            Err(e) => warn!(value = %raw, error = %e, "ignoring FEED_PAIR"),
        }
    }
    if let Ok(raw) = std::env::var("FEED_TIMEFRAME") {
        match raw.parse::<Timeframe>() {
            Ok(tf) => config.timeframe = tf,
            Err(e) => warn!(value = %raw, error = %e, "ignoring FEED_TIMEFRAME"),
        }
    }

    info!(
        pair = %config.pair,
        interval = %config.timeframe,
        ws_url = %config.ws_url,
        rest = %config.rest_base_url,
        "market feed starting"
    );

    // ── 2. Open the feed ─────────────────────────────────────────────────
    let effective = config.clone();
    let pair = config.pair.to_string();
    let timeframe = config.timeframe.to_string();
    let feed = MarketFeed::spawn(config)?;
    feed.open(&pair, &timeframe)?;

    // ── 3. Periodic summary ──────────────────────────────────────────────
    let state = feed.state().clone();
    let summary = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
        let mut last_version = 0;
        loop {
            interval.tick().await;
            let version = state.current_state_version();
            if version == last_version {
                continue;
            }
            last_version = version;

            let snap = state.build_snapshot();
            match &snap.book {
                Some(book) => info!(
                    state = %snap.status.state,
                    live = snap.status.live,
                    last_update_id = book.last_update_id,
                    best_bid = book.best_bid,
                    best_ask = book.best_ask,
                    spread_bps = %format!("{:.2}", book.spread_bps),
                    imbalance = %format!("{:.3}", book.imbalance),
                    candles = snap.candle_count,
                    last_close = ?snap.last_candle.as_ref().map(|c| c.close),
                    "feed summary"
                ),
                None => info!(
                    state = %snap.status.state,
                    live = snap.status.live,
                    reconnect_attempt = snap.status.reconnect_attempt,
                    candles = snap.candle_count,
                    "feed summary (book not synchronised)"
                ),
            }
            if let Some(err) = &snap.status.last_error {
                warn!(error = %err, "feed reports error");
            }
        }
    });

    info!("Feed running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — closing feed");

    summary.abort();
    feed.shutdown().await;

    if let Err(e) = effective.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("market feed shut down complete.");
    Ok(())
}
