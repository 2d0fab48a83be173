// =============================================================================
// Published Feed State — what the UI layer reads
// =============================================================================
//
// The connection manager is the only writer. Readers take short
// `parking_lot` read locks and clone out `Arc`s, so a reader never holds a
// lock across an await and never observes a half-applied event.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for every published value.
//   - Order book and candles are published as `Arc`s and replaced wholesale.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::{BookSummary, Candle, LocalOrderBook};
use crate::types::{FeedStatus, Pair, Timeframe};

/// Levels per side folded into [`BookSummary`] depth figures.
const SUMMARY_DEPTH: usize = 20;
/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

pub struct FeedState {
    /// Incremented on every published change. Readers poll this to detect
    /// fresh data.
    state_version: AtomicU64,

    subscription: RwLock<(Pair, Timeframe)>,
    order_book: RwLock<Option<Arc<LocalOrderBook>>>,
    candles: RwLock<Arc<Vec<Candle>>>,
    status: RwLock<FeedStatus>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl FeedState {
    pub fn new(pair: Pair, timeframe: Timeframe) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            subscription: RwLock::new((pair, timeframe)),
            order_book: RwLock::new(None),
            candles: RwLock::new(Arc::new(Vec::new())),
            status: RwLock::new(FeedStatus::default()),
            recent_errors: RwLock::new(Vec::new()),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Writers (connection manager only) ───────────────────────────────

    pub(crate) fn publish_subscription(&self, pair: Pair, timeframe: Timeframe) {
        *self.subscription.write() = (pair, timeframe);
        self.increment_version();
    }

    pub(crate) fn publish_order_book(&self, book: Option<Arc<LocalOrderBook>>) {
        *self.order_book.write() = book;
        self.increment_version();
    }

    pub(crate) fn publish_candles(&self, candles: &[Candle]) {
        *self.candles.write() = Arc::new(candles.to_vec());
        self.increment_version();
    }

    pub(crate) fn publish_status(&self, status: FeedStatus) {
        *self.status.write() = status;
        self.increment_version();
    }

    /// Record an error message. Capped at [`MAX_RECENT_ERRORS`]; oldest
    /// entries are evicted first.
    pub(crate) fn push_error(&self, message: String) {
        let record = ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Readers ─────────────────────────────────────────────────────────

    pub fn subscription(&self) -> (Pair, Timeframe) {
        self.subscription.read().clone()
    }

    pub fn order_book(&self) -> Option<Arc<LocalOrderBook>> {
        self.order_book.read().clone()
    }

    pub fn candles(&self) -> Arc<Vec<Candle>> {
        self.candles.read().clone()
    }

    pub fn status(&self) -> FeedStatus {
        self.status.read().clone()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    /// Serialisable point-in-time view of everything published.
    pub fn build_snapshot(&self) -> FeedSnapshot {
        let (pair, timeframe) = self.subscription();
        let candles = self.candles();

        FeedSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            status: self.status(),
            book: self.order_book().map(|b| b.summary(SUMMARY_DEPTH)),
            candle_count: candles.len(),
            last_candle: candles.last().cloned(),
            recent_errors: self.recent_errors(),
        }
    }
}

impl std::fmt::Debug for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedState")
            .field("state_version", &self.current_state_version())
            .field("subscription", &*self.subscription.read())
            .field("status", &*self.status.read())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub pair: String,
    pub timeframe: String,
    pub status: FeedStatus,
    pub book: Option<BookSummary>,
    pub candle_count: usize,
    pub last_candle: Option<Candle>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::OrderBookSnapshot;
    use crate::types::ConnectionState;
    use rust_decimal::Decimal;

    fn state() -> FeedState {
        FeedState::new(Pair::default(), Timeframe::M1)
    }

    #[test]
    fn every_publish_bumps_version() {
        let s = state();
        let v0 = s.current_state_version();
        s.publish_order_book(None);
        s.publish_candles(&[]);
        s.publish_status(FeedStatus::default());
        assert_eq!(s.current_state_version(), v0 + 3);
    }

    #[test]
    fn readers_keep_old_candles_after_republish() {
        let s = state();
        let candle = Candle {
            open_time: 0,
            close_time: 59_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            quote_volume: 0.0,
            trades_count: 0,
            is_closed: true,
        };
        s.publish_candles(&[candle]);
        let held = s.candles();
        s.publish_candles(&[]);
        assert_eq!(held.len(), 1);
        assert!(s.candles().is_empty());
    }

    #[test]
    fn error_log_is_capped() {
        let s = state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            s.push_error(format!("error {i}"));
        }
        let errors = s.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "error 5");
    }

    #[test]
    fn snapshot_summarises_book_and_status() {
        let s = state();
        let book = LocalOrderBook::from_snapshot(OrderBookSnapshot {
            last_update_id: 42,
            bids: vec![(Decimal::from(99), Decimal::ONE)],
            asks: vec![(Decimal::from(101), Decimal::ONE)],
        });
        s.publish_order_book(Some(Arc::new(book)));
        s.publish_status(FeedStatus {
            state: ConnectionState::Connected,
            live: true,
            ..FeedStatus::default()
        });

        let snap = s.build_snapshot();
        assert_eq!(snap.pair, "BTCUSDT");
        assert_eq!(snap.timeframe, "1m");
        assert_eq!(snap.book.as_ref().unwrap().last_update_id, 42);
        assert_eq!(snap.status.state, ConnectionState::Connected);
        assert!(serde_json::to_string(&snap).is_ok());
    }
}
