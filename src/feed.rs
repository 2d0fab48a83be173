// =============================================================================
// MarketFeed — the handle the UI layer holds
// =============================================================================
//
// Commands are validated here and forwarded to the connection manager's
// inbox; they never block and never touch market data directly. Reads go
// straight to the published `FeedState`.
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::binance::{BinanceClient, Connector, MarketDataApi, WsConnector};
use crate::connection::{Command, ConnectionManager, Input};
use crate::feed_state::{FeedSnapshot, FeedState};
use crate::market_data::{Candle, LocalOrderBook};
use crate::runtime_config::FeedConfig;
use crate::types::{FeedStatus, Pair, Timeframe};

pub struct MarketFeed {
    inbox: mpsc::UnboundedSender<Input>,
    state: Arc<FeedState>,
    task: Option<JoinHandle<()>>,
}

impl MarketFeed {
    /// Spawn a feed against the live exchange endpoints in `config`.
    pub fn spawn(config: FeedConfig) -> Result<Self> {
        let api = BinanceClient::new(config.rest_base_url.clone(), config.request_timeout())?;
        Ok(Self::with_parts(config, Arc::new(WsConnector), Arc::new(api)))
    }

    /// Spawn a feed over caller-supplied transport and REST implementations.
    pub fn with_parts(
        config: FeedConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn MarketDataApi>,
    ) -> Self {
        let state = Arc::new(FeedState::new(config.pair.clone(), config.timeframe));
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(config, connector, api, Arc::clone(&state), tx.clone());
        let task = tokio::spawn(manager.run(rx));

        Self {
            inbox: tx,
            state,
            task: Some(task),
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    pub fn open(&self, pair: &str, timeframe: &str) -> Result<()> {
        let pair = Pair::new(pair)?;
        let timeframe: Timeframe = timeframe.parse()?;
        self.send(Command::Open { pair, timeframe })
    }

    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }

    pub fn change_pair(&self, pair: &str) -> Result<()> {
        self.send(Command::ChangePair(Pair::new(pair)?))
    }

    pub fn change_timeframe(&self, timeframe: &str) -> Result<()> {
        self.send(Command::ChangeTimeframe(timeframe.parse()?))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox
            .send(Input::Command(command))
            .map_err(|_| anyhow!("market feed task has stopped"))
    }

    // ── Published state ─────────────────────────────────────────────────

    pub fn order_book(&self) -> Option<Arc<LocalOrderBook>> {
        self.state.order_book()
    }

    pub fn candles(&self) -> Arc<Vec<Candle>> {
        self.state.candles()
    }

    pub fn status(&self) -> FeedStatus {
        self.state.status()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.state.build_snapshot()
    }

    /// Bumped on every published change.
    pub fn version(&self) -> u64 {
        self.state.current_state_version()
    }

    pub fn state(&self) -> &Arc<FeedState> {
        &self.state
    }

    /// Close the connection and wait for the manager task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.inbox.send(Input::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "market feed task ended abnormally");
            }
        }
    }
}

impl Drop for MarketFeed {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.inbox.send(Input::Shutdown);
        }
    }
}

impl std::fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeed").field("state", &self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::TransportEvent;
    use crate::test_support::{FakeApi, FakeConnector};
    use crate::types::ConnectionState;
    use std::time::Duration;

    fn feed() -> (MarketFeed, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        let feed = MarketFeed::with_parts(
            FeedConfig::default(),
            connector.clone(),
            Arc::new(FakeApi::default()),
        );
        (feed, connector)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_reaches_connected_through_the_task() {
        let (feed, connector) = feed();
        feed.open("btcusdt", "15m").unwrap();
        settle().await;
        assert_eq!(feed.status().state, ConnectionState::Connecting);

        connector.emit(0, TransportEvent::Opened);
        settle().await;
        assert_eq!(feed.status().state, ConnectionState::Connected);
        assert_eq!(feed.state().subscription().1, Timeframe::M15);
        assert_eq!(feed.candles().len(), 2);
        assert!(feed.order_book().is_none());

        feed.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_sending() {
        let (feed, connector) = feed();
        assert!(feed.open("btc/usdt", "1m").is_err());
        assert!(feed.open("btcusdt", "7m").is_err());
        assert!(feed.change_pair("").is_err());
        assert!(feed.change_timeframe("1y").is_err());
        settle().await;
        assert_eq!(connector.connects(), 0);
        feed.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_and_version_tracking() {
        let (feed, connector) = feed();
        let v0 = feed.version();
        feed.open("ethusdt", "1h").unwrap();
        settle().await;
        assert!(feed.version() > v0);

        connector.emit(0, TransportEvent::Opened);
        feed.close().unwrap();
        settle().await;
        assert_eq!(feed.status().state, ConnectionState::Disconnected);
        assert!(feed.candles().is_empty());

        let snap = feed.snapshot();
        assert_eq!(snap.pair, "ETHUSDT");
        assert_eq!(snap.timeframe, "1h");
        feed.shutdown().await;
    }

    #[tokio::test]
    async fn commands_fail_once_task_has_stopped() {
        let (mut feed, _connector) = feed();
        let _ = feed.inbox.send(Input::Shutdown);
        if let Some(task) = feed.task.take() {
            task.await.unwrap();
        }
        assert!(feed.close().is_err());
    }
}
