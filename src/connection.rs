// =============================================================================
// Connection Manager — socket lifecycle, subscriptions, routing
// =============================================================================
//
// One task owns everything mutable: the transport handle, the subscription
// set, the reconciler and the candle series. Commands from the facade,
// transport events, snapshot deliveries, history results and timer expiries
// all arrive on the same inbox and are handled one at a time, so no two
// frames are ever processed concurrently.
//
// State machine:
//
//   Disconnected --open--> Connecting --opened--> Connected
//   Connected|Connecting --closed (abnormal, attempts < max)--> Connecting
//   Connected|Connecting --closed (abnormal, attempts >= max)--> Error
//   any --close--> Disconnected
//
// Stale asynchronous results are fenced off by counters: `conn_id` for
// transport events, `reconnect_generation` for reconnect timers,
// `history_epoch` for kline history, and the reconciler's own epoch for
// snapshots.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::binance::protocol::{
    depth_channel, kline_channel, parse_inbound, ChannelKind, ControlFrame, InboundFrame, Method,
};
use crate::binance::{Connector, MarketDataApi, TransportEvent, TransportHandle, TransportSink};
use crate::feed_state::FeedState;
use crate::market_data::{
    Candle, CandleSeries, DepthEvent, DepthOutcome, KlineOutcome, OrderBookReconciler,
    SnapshotDelivery, SnapshotOutcome, SnapshotSink,
};
use crate::runtime_config::FeedConfig;
use crate::types::{ConnectionState, FeedStatus, Pair, Timeframe};

/// Caller-issued commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { pair: Pair, timeframe: Timeframe },
    Close,
    ChangePair(Pair),
    ChangeTimeframe(Timeframe),
}

/// Everything the manager reacts to.
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Transport { conn_id: u64, event: TransportEvent },
    Snapshot(SnapshotDelivery),
    History {
        epoch: u64,
        timeframe: Timeframe,
        result: Result<Vec<Candle>>,
    },
    ReconnectDue { generation: u64 },
    HealthTick { conn_id: u64 },
    Shutdown,
}

pub struct ConnectionManager {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    api: Arc<dyn MarketDataApi>,
    inbox: mpsc::UnboundedSender<Input>,
    state: Arc<FeedState>,

    // ── Subscription set ────────────────────────────────────────────────
    pair: Pair,
    timeframe: Timeframe,
    kline_subscribed: bool,

    // ── Connection ──────────────────────────────────────────────────────
    conn_state: ConnectionState,
    state_since: DateTime<Utc>,
    attempts: u32,
    desired_open: bool,
    caller_closed: bool,
    conn_id: u64,
    transport: Option<TransportHandle>,
    last_frame_at: Option<Instant>,
    live: bool,
    last_error: Option<String>,

    // ── Scheduled tasks ─────────────────────────────────────────────────
    reconnect_generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    history_epoch: u64,
    history_task: Option<JoinHandle<()>>,

    // ── Market data ─────────────────────────────────────────────────────
    reconciler: OrderBookReconciler,
    candles: CandleSeries,
}

impl ConnectionManager {
    pub fn new(
        config: FeedConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn MarketDataApi>,
        state: Arc<FeedState>,
        inbox: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let snapshot_inbox = inbox.clone();
        let sink: SnapshotSink = Arc::new(move |delivery| {
            let _ = snapshot_inbox.send(Input::Snapshot(delivery));
        });

        let reconciler = OrderBookReconciler::new(
            config.pair.clone(),
            Arc::clone(&api),
            sink,
            config.depth_limit,
            config.snapshot_retry_delay(),
        );

        Self {
            pair: config.pair.clone(),
            timeframe: config.timeframe,
            kline_subscribed: false,
            conn_state: ConnectionState::Disconnected,
            state_since: Utc::now(),
            attempts: 0,
            desired_open: false,
            caller_closed: false,
            conn_id: 0,
            transport: None,
            last_frame_at: None,
            live: false,
            last_error: None,
            reconnect_generation: 0,
            reconnect_task: None,
            health_task: None,
            history_epoch: 0,
            history_task: None,
            reconciler,
            candles: CandleSeries::new(config.max_candles),
            config,
            connector,
            api,
            inbox,
            state,
        }
    }

    /// Process inputs until `Shutdown`, then tear everything down.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        info!(pair = %self.pair, interval = %self.timeframe, "connection manager started");

        while let Some(input) = rx.recv().await {
            if matches!(input, Input::Shutdown) {
                break;
            }
            self.handle(input);
        }

        self.close();
        info!("connection manager stopped");
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Command(Command::Open { pair, timeframe }) => self.open(pair, timeframe),
            Input::Command(Command::Close) | Input::Shutdown => self.close(),
            Input::Command(Command::ChangePair(pair)) => self.change_pair(pair),
            Input::Command(Command::ChangeTimeframe(timeframe)) => self.change_timeframe(timeframe),
            Input::Transport { conn_id, event } => self.on_transport(conn_id, event),
            Input::Snapshot(delivery) => self.on_snapshot(delivery),
            Input::History {
                epoch,
                timeframe,
                result,
            } => self.on_history(epoch, timeframe, result),
            Input::ReconnectDue { generation } => self.on_reconnect_due(generation),
            Input::HealthTick { conn_id } => self.on_health_tick(conn_id),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.conn_state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_task.is_some()
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn reconciler(&self) -> &OrderBookReconciler {
        &self.reconciler
    }

    // ── Commands ────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(pair = %pair, interval = %timeframe))]
    fn open(&mut self, pair: Pair, timeframe: Timeframe) {
        info!("opening feed");

        self.teardown_connection();
        self.cancel_history();

        self.desired_open = true;
        self.caller_closed = false;
        self.attempts = 0;
        self.last_error = None;

        self.pair = pair;
        self.timeframe = timeframe;
        self.state.publish_subscription(self.pair.clone(), self.timeframe);
        self.reset_market_data();

        self.connect();
        self.fetch_history();
    }

    fn close(&mut self) {
        info!(pair = %self.pair, state = %self.conn_state, "closing feed");

        self.caller_closed = true;
        self.desired_open = false;
        self.teardown_connection();
        self.cancel_history();

        self.attempts = 0;
        self.live = false;
        self.reset_market_data();
        self.set_state(ConnectionState::Disconnected);
    }

    fn change_pair(&mut self, pair: Pair) {
        if pair == self.pair {
            debug!(pair = %pair, "pair unchanged");
            return;
        }
        info!(from = %self.pair, to = %pair, "changing pair");

        let reopen = self.desired_open;
        self.teardown_connection();
        self.cancel_history();

        self.pair = pair;
        self.state.publish_subscription(self.pair.clone(), self.timeframe);
        self.reset_market_data();

        if reopen {
            self.attempts = 0;
            self.connect();
            self.fetch_history();
        }
    }

    fn change_timeframe(&mut self, timeframe: Timeframe) {
        if timeframe == self.timeframe {
            debug!(interval = %timeframe, "timeframe unchanged");
            return;
        }
        info!(pair = %self.pair, from = %self.timeframe, to = %timeframe, "changing timeframe");

        if self.conn_state == ConnectionState::Connected && self.kline_subscribed {
            self.send_control(Method::Unsubscribe, ChannelKind::Kline);
        }
        self.kline_subscribed = false;

        self.timeframe = timeframe;
        self.state.publish_subscription(self.pair.clone(), self.timeframe);
        self.candles.clear();
        self.state.publish_candles(self.candles.series());

        // The new kline channel is subscribed once its history has landed.
        if self.desired_open {
            self.fetch_history();
        } else {
            self.cancel_history();
        }
    }

    // ── Transport ───────────────────────────────────────────────────────

    fn connect(&mut self) {
        self.conn_id += 1;
        let conn_id = self.conn_id;
        let inbox = self.inbox.clone();
        let sink: TransportSink = Arc::new(move |event| {
            let _ = inbox.send(Input::Transport { conn_id, event });
        });

        info!(
            conn_id,
            url = %self.config.ws_url,
            attempt = self.attempts,
            "opening transport"
        );
        self.transport = Some(self.connector.connect(&self.config.ws_url, sink));
        self.set_state(ConnectionState::Connecting);
    }

    /// Cancel timers, unsubscribe if connected and close the socket. The
    /// socket's eventual `Closed` event carries a retired `conn_id` or
    /// arrives with no transport held, and is ignored.
    fn teardown_connection(&mut self) {
        self.cancel_reconnect();
        self.stop_health_check();

        if self.conn_state == ConnectionState::Connected {
            self.send_control(Method::Unsubscribe, ChannelKind::Depth);
            if self.kline_subscribed {
                self.send_control(Method::Unsubscribe, ChannelKind::Kline);
            }
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }

        self.kline_subscribed = false;
        self.last_frame_at = None;
    }

    fn on_transport(&mut self, conn_id: u64, event: TransportEvent) {
        if conn_id != self.conn_id || self.transport.is_none() {
            debug!(conn_id, current = self.conn_id, "ignoring event from retired transport");
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(text) => self.on_frame(&text),
            // Only `Closed` drives reconnection.
            TransportEvent::Error(message) => warn!(conn_id, error = %message, "transport error"),
            TransportEvent::Closed(reason) => self.on_closed(reason),
        }
    }

    fn on_opened(&mut self) {
        info!(conn_id = self.conn_id, pair = %self.pair, "transport open, subscribing");

        self.attempts = 0;
        self.reconciler.reset();
        self.publish_book();

        self.last_frame_at = Some(Instant::now());
        self.live = true;
        self.set_state(ConnectionState::Connected);

        self.send_control(Method::Subscribe, ChannelKind::Depth);
        self.send_control(Method::Subscribe, ChannelKind::Kline);
        self.kline_subscribed = true;

        self.start_health_check();
    }

    fn on_closed(&mut self, reason: Option<String>) {
        self.transport = None;
        self.stop_health_check();
        self.kline_subscribed = false;
        self.last_frame_at = None;
        self.live = false;

        // Cancels any in-flight snapshot fetch along with the book.
        self.reconciler.reset();
        self.publish_book();

        if self.caller_closed || !self.desired_open {
            info!(reason = ?reason, "transport closed");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.attempts += 1;
        let max = self.config.max_reconnect_attempts;

        if self.attempts >= max {
            error!(
                attempts = self.attempts,
                reason = ?reason,
                "reconnect attempts exhausted, giving up"
            );
            self.desired_open = false;
            self.cancel_history();
            let message = format!("connection lost after {} attempts", self.attempts);
            self.state.push_error(message.clone());
            self.last_error = Some(message);
            self.set_state(ConnectionState::Error);
            return;
        }

        warn!(
            attempt = self.attempts,
            max,
            delay_ms = self.config.reconnect_delay_ms,
            reason = ?reason,
            "transport closed unexpectedly, reconnecting"
        );
        self.set_state(ConnectionState::Connecting);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();

        let generation = self.reconnect_generation;
        let delay = self.config.reconnect_delay();
        let inbox = self.inbox.clone();

        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Input::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    fn on_reconnect_due(&mut self, generation: u64) {
        if generation != self.reconnect_generation || !self.desired_open || self.transport.is_some() {
            debug!(generation, "ignoring cancelled reconnect");
            return;
        }
        self.reconnect_task = None;

        info!(attempt = self.attempts, pair = %self.pair, "reconnecting");
        self.connect();
    }

    // ── Inbound frames ──────────────────────────────────────────────────

    fn on_frame(&mut self, text: &str) {
        self.last_frame_at = Some(Instant::now());
        if !self.live {
            self.live = true;
            self.publish_status();
        }

        let frame = match parse_inbound(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame {
            InboundFrame::Ack { id } => {
                let channel = id.and_then(ChannelKind::from_correlation_id);
                debug!(id = ?id, channel = ?channel, "control frame acknowledged");
            }
            InboundFrame::Rejected { id, message } => {
                let channel = id.and_then(ChannelKind::from_correlation_id);
                warn!(id = ?id, channel = ?channel, error = %message, "control frame rejected");
                self.state.push_error(format!("subscription rejected: {message}"));
            }
            InboundFrame::Data { stream, data } => {
                if stream == self.channel(ChannelKind::Depth) {
                    self.on_depth_payload(data);
                } else if self.kline_subscribed && stream == self.channel(ChannelKind::Kline) {
                    self.on_kline_payload(&data);
                } else {
                    debug!(stream = %stream, "frame for inactive stream dropped");
                }
            }
        }
    }

    fn on_depth_payload(&mut self, data: serde_json::Value) {
        let event: DepthEvent = match serde_json::from_value(data) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed depth event");
                return;
            }
        };

        match self.reconciler.on_depth_event(event) {
            DepthOutcome::Applied | DepthOutcome::Resync => self.publish_book(),
            DepthOutcome::Buffered | DepthOutcome::AlreadyApplied => {}
        }
    }

    fn on_kline_payload(&mut self, data: &serde_json::Value) {
        let candle = match Candle::from_stream_payload(data) {
            Ok(candle) => candle,
            Err(e) => {
                warn!(error = %e, "dropping malformed kline event");
                return;
            }
        };

        match self.candles.on_kline_event(candle) {
            KlineOutcome::Replaced | KlineOutcome::Appended => {
                self.state.publish_candles(self.candles.series());
            }
            KlineOutcome::Ignored => {}
        }
    }

    fn on_snapshot(&mut self, delivery: SnapshotDelivery) {
        match self.reconciler.on_snapshot(delivery) {
            SnapshotOutcome::Installed { .. } | SnapshotOutcome::Resync => self.publish_book(),
            SnapshotOutcome::Stale | SnapshotOutcome::Superseded => {}
        }
    }

    // ── History ─────────────────────────────────────────────────────────

    fn fetch_history(&mut self) {
        self.cancel_history();

        let epoch = self.history_epoch;
        let api = Arc::clone(&self.api);
        let inbox = self.inbox.clone();
        let pair = self.pair.clone();
        let timeframe = self.timeframe;
        let limit = self.config.kline_limit;

        self.history_task = Some(tokio::spawn(async move {
            let result = api.klines(&pair, timeframe, limit).await;
            let _ = inbox.send(Input::History {
                epoch,
                timeframe,
                result,
            });
        }));
    }

    fn cancel_history(&mut self) {
        self.history_epoch += 1;
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
    }

    fn on_history(&mut self, epoch: u64, timeframe: Timeframe, result: Result<Vec<Candle>>) {
        if epoch != self.history_epoch {
            debug!(interval = %timeframe, "ignoring superseded kline history");
            return;
        }
        self.history_task = None;

        match result {
            Ok(candles) => {
                info!(pair = %self.pair, interval = %timeframe, count = candles.len(), "kline history loaded");
                self.candles.load_historical(candles);
                self.last_error = None;
            }
            Err(e) => {
                warn!(pair = %self.pair, interval = %timeframe, error = %e, "kline history fetch failed");
                self.candles.clear();
                let message = format!("failed to fetch historical data: {e}");
                self.state.push_error(message.clone());
                self.last_error = Some(message);
            }
        }
        self.state.publish_candles(self.candles.series());
        self.publish_status();

        if self.conn_state == ConnectionState::Connected && !self.kline_subscribed {
            self.send_control(Method::Subscribe, ChannelKind::Kline);
            self.kline_subscribed = true;
        }
    }

    // ── Liveness ────────────────────────────────────────────────────────

    fn start_health_check(&mut self) {
        self.stop_health_check();

        let conn_id = self.conn_id;
        let inbox = self.inbox.clone();
        let period = self.config.health_check_interval();

        self.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if inbox.send(Input::HealthTick { conn_id }).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_health_check(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }

    fn on_health_tick(&mut self, conn_id: u64) {
        if conn_id != self.conn_id || self.conn_state != ConnectionState::Connected {
            return;
        }

        let window = self.config.liveness_window();
        let live = self
            .last_frame_at
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false);

        if live != self.live {
            self.live = live;
            if live {
                info!(pair = %self.pair, "stream live again");
            } else {
                warn!(
                    pair = %self.pair,
                    window_ms = self.config.liveness_window_ms,
                    "no frames within liveness window"
                );
            }
            self.publish_status();
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn channel(&self, kind: ChannelKind) -> String {
        match kind {
            ChannelKind::Depth => depth_channel(&self.pair),
            ChannelKind::Kline => kline_channel(&self.pair, self.timeframe),
        }
    }

    fn send_control(&self, method: Method, kind: ChannelKind) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };

        let channel = self.channel(kind);
        let text = match ControlFrame::new(method, kind, channel.clone()).to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, channel = %channel, "control frame not sent");
                return;
            }
        };

        debug!(method = ?method, channel = %channel, id = kind.correlation_id(), "sending control frame");
        if !transport.send_text(text) {
            warn!(channel = %channel, "transport gone, control frame dropped");
        }
    }

    fn reset_market_data(&mut self) {
        self.reconciler.set_pair(self.pair.clone());
        self.candles.clear();
        self.publish_book();
        self.state.publish_candles(self.candles.series());
    }

    fn publish_book(&self) {
        self.state.publish_order_book(self.reconciler.current_book().cloned());
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next != self.conn_state {
            info!(from = %self.conn_state, to = %next, "connection state changed");
            self.conn_state = next;
            self.state_since = Utc::now();
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.state.publish_status(FeedStatus {
            state: self.conn_state,
            reconnect_attempt: self.attempts,
            live: self.live,
            last_error: self.last_error.clone(),
            since: self.state_since,
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for task in [
            self.reconnect_task.take(),
            self.health_task.take(),
            self.history_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
