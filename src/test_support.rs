//! In-memory stand-ins for the socket and the REST API.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::binance::{Connector, MarketDataApi, Outbound, TransportHandle, TransportSink};
use crate::market_data::{Candle, OrderBookSnapshot};
use crate::types::{Pair, Timeframe};

pub struct FakeSocket {
    pub url: String,
    pub sink: TransportSink,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Records every connection attempt; nothing touches the network.
#[derive(Default)]
pub struct FakeConnector {
    sockets: Mutex<Vec<FakeSocket>>,
}

impl FakeConnector {
    pub fn connects(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Everything queued on socket `index` since the last call.
    pub fn take_outbound(&self, index: usize) -> Vec<Outbound> {
        let mut sockets = self.sockets.lock();
        let socket = &mut sockets[index];
        let mut out = Vec::new();
        while let Ok(frame) = socket.outbound.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Text frames on socket `index`, decoded as `(method, channel, id)`.
    pub fn take_control_frames(&self, index: usize) -> Vec<(String, String, u64)> {
        self.take_outbound(index)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => {
                    let v: serde_json::Value = serde_json::from_str(&text).ok()?;
                    Some((
                        v["method"].as_str()?.to_string(),
                        v["params"][0].as_str()?.to_string(),
                        v["id"].as_u64()?,
                    ))
                }
                Outbound::Close => None,
            })
            .collect()
    }

    /// Emit `event` from socket `index` the way a real transport would.
    pub fn emit(&self, index: usize, event: crate::binance::TransportEvent) {
        let sink = self.sockets.lock()[index].sink.clone();
        sink(event);
    }

    pub fn url(&self, index: usize) -> String {
        self.sockets.lock()[index].url.clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &str, sink: TransportSink) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.lock().push(FakeSocket {
            url: url.to_string(),
            sink,
            outbound: rx,
        });
        TransportHandle::new(tx, None)
    }
}

/// Serves a fixed snapshot (or parks forever when none is set) and a
/// two-candle history.
#[derive(Default)]
pub struct FakeApi {
    pub snapshot: Mutex<Option<OrderBookSnapshot>>,
    pub kline_calls: Mutex<Vec<(Pair, Timeframe)>>,
    pub fail_klines: AtomicBool,
}

impl FakeApi {
    pub fn with_snapshot(snapshot: OrderBookSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }
}

pub fn candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
    Candle {
        open_time,
        close_time: open_time + 59_999,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        quote_volume: close,
        trades_count: 1,
        is_closed,
    }
}

#[async_trait]
impl MarketDataApi for FakeApi {
    async fn depth_snapshot(&self, _pair: &Pair, _limit: u32) -> anyhow::Result<OrderBookSnapshot> {
        let snapshot = self.snapshot.lock().clone();
        match snapshot {
            Some(snapshot) => Ok(snapshot),
            None => std::future::pending().await,
        }
    }

    async fn klines(&self, pair: &Pair, timeframe: Timeframe, _limit: u32) -> anyhow::Result<Vec<Candle>> {
        self.kline_calls.lock().push((pair.clone(), timeframe));
        if self.fail_klines.load(Ordering::SeqCst) {
            anyhow::bail!("HTTP 503");
        }
        Ok(vec![candle(0, 1.0, true), candle(60_000, 2.0, false)])
    }
}
