use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle, from either the REST history or the kline stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub is_closed: bool,
}

impl Candle {
    /// Parse one row of `GET /klines`.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades
    ///
    /// The exchange includes the still-forming candle as the last row; it is
    /// recognised by a close time that lies in the future relative to `now_ms`.
    pub fn from_rest_row(row: &serde_json::Value, now_ms: i64) -> Result<Self> {
        let arr = row.as_array().context("kline entry is not an array")?;
        if arr.len() < 9 {
            anyhow::bail!("kline entry has {} elements, expected at least 9", arr.len());
        }

        let open_time = arr[0].as_i64().context("kline openTime is not an integer")?;
        let close_time = arr[6].as_i64().context("kline closeTime is not an integer")?;

        Ok(Self {
            open_time,
            close_time,
            open: parse_string_f64(&arr[1], "open")?,
            high: parse_string_f64(&arr[2], "high")?,
            low: parse_string_f64(&arr[3], "low")?,
            close: parse_string_f64(&arr[4], "close")?,
            volume: parse_string_f64(&arr[5], "volume")?,
            quote_volume: parse_string_f64(&arr[7], "quoteVolume")?,
            trades_count: arr[8].as_u64().unwrap_or(0),
            is_closed: close_time < now_ms,
        })
    }

    /// Parse the `data` payload of a `<pair>@kline_<interval>` frame.
    ///
    /// Expected shape:
    /// ```json
    /// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "T": ..., "o": "...", ... } }
    /// ```
    pub fn from_stream_payload(data: &serde_json::Value) -> Result<Self> {
        let k = data.get("k").context("missing field k")?;

        Ok(Self {
            open_time: k["t"].as_i64().context("missing field k.t")?,
            close_time: k["T"].as_i64().context("missing field k.T")?,
            open: parse_string_f64(&k["o"], "k.o")?,
            high: parse_string_f64(&k["h"], "k.h")?,
            low: parse_string_f64(&k["l"], "k.l")?,
            close: parse_string_f64(&k["c"], "k.c")?,
            volume: parse_string_f64(&k["v"], "k.v")?,
            quote_volume: parse_string_f64(&k["q"], "k.q")?,
            trades_count: k["n"].as_u64().context("missing field k.n")?,
            is_closed: k["x"].as_bool().context("missing field k.x")?,
        })
    }
}

/// Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

/// What a live kline did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlineOutcome {
    /// Same `open_time` as the last candle; replaced in place.
    Replaced,
    Appended,
    /// Older than the last candle; dropped to keep the series ordered.
    Ignored,
}

/// Time-ordered candle series for one `(pair, interval)`.
///
/// `open_time` values are unique and strictly increasing. Only the last
/// element is ever mutated, and only by a live event carrying the same
/// `open_time`.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: Vec<Candle>,
    max_candles: usize,
}

impl CandleSeries {
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: Vec::new(),
            max_candles: max_candles.max(1),
        }
    }

    /// Replace the whole series with `candles`, sorted by `open_time`.
    /// Duplicate open times keep the last occurrence.
    pub fn load_historical(&mut self, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.open_time == candle.open_time => *last = candle,
                _ => deduped.push(candle),
            }
        }
        self.candles = deduped;
        self.trim();
    }

    /// Upsert a live candle.
    pub fn on_kline_event(&mut self, candle: Candle) -> KlineOutcome {
        let outcome = match self.candles.last_mut() {
            Some(last) if last.open_time == candle.open_time => {
                *last = candle;
                KlineOutcome::Replaced
            }
            Some(last) if last.open_time > candle.open_time => {
                debug!(
                    last_open_time = last.open_time,
                    open_time = candle.open_time,
                    "dropping out-of-order kline"
                );
                KlineOutcome::Ignored
            }
            _ => {
                self.candles.push(candle);
                KlineOutcome::Appended
            }
        };
        self.trim();
        outcome
    }

    pub fn series(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }

    fn trim(&mut self) {
        if self.candles.len() > self.max_candles {
            let excess = self.candles.len() - self.max_candles;
            self.candles.drain(..excess);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trades_count: 50,
            is_closed,
        }
    }

    fn open_times(series: &CandleSeries) -> Vec<i64> {
        series.series().iter().map(|c| c.open_time).collect()
    }

    #[test]
    fn historical_load_sorts_and_replaces() {
        let mut s = CandleSeries::new(100);
        s.on_kline_event(sample_candle(999_999, 1.0, false));

        s.load_historical(vec![
            sample_candle(120_000, 3.0, true),
            sample_candle(0, 1.0, true),
            sample_candle(60_000, 2.0, true),
        ]);
        assert_eq!(open_times(&s), vec![0, 60_000, 120_000]);
    }

    #[test]
    fn historical_load_collapses_duplicate_open_times() {
        let mut s = CandleSeries::new(100);
        s.load_historical(vec![
            sample_candle(0, 1.0, true),
            sample_candle(0, 1.5, true),
        ]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.last().unwrap().close, 1.5);
    }

    #[test]
    fn forming_candle_is_replaced_in_place() {
        let mut s = CandleSeries::new(100);
        s.load_historical(vec![sample_candle(0, 1.0, true), sample_candle(60_000, 2.0, false)]);

        assert_eq!(s.on_kline_event(sample_candle(60_000, 2.5, false)), KlineOutcome::Replaced);
        assert_eq!(s.len(), 2);
        assert_eq!(s.last().unwrap().close, 2.5);

        assert_eq!(s.on_kline_event(sample_candle(60_000, 2.7, true)), KlineOutcome::Replaced);
        assert!(s.last().unwrap().is_closed);
    }

    #[test]
    fn new_open_time_is_appended() {
        let mut s = CandleSeries::new(100);
        s.on_kline_event(sample_candle(0, 1.0, true));
        assert_eq!(s.on_kline_event(sample_candle(60_000, 2.0, false)), KlineOutcome::Appended);
        assert_eq!(open_times(&s), vec![0, 60_000]);
    }

    #[test]
    fn older_event_never_reorders_series() {
        let mut s = CandleSeries::new(100);
        s.load_historical(vec![sample_candle(0, 1.0, true), sample_candle(60_000, 2.0, false)]);
        assert_eq!(s.on_kline_event(sample_candle(0, 9.0, true)), KlineOutcome::Ignored);
        assert_eq!(open_times(&s), vec![0, 60_000]);
        assert_eq!(s.series()[0].close, 1.0);
    }

    #[test]
    fn series_is_capped_dropping_oldest() {
        let mut s = CandleSeries::new(3);
        for i in 0..5 {
            s.on_kline_event(sample_candle(i * 60_000, i as f64, true));
        }
        assert_eq!(open_times(&s), vec![120_000, 180_000, 240_000]);
    }

    #[test]
    fn parse_stream_payload_ok() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000059999,
                "i": "1m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "q": "4567890.12",
                "n": 1500,
                "x": false
            }
        }"#;
        let data: serde_json::Value = serde_json::from_str(json).unwrap();
        let candle = Candle::from_stream_payload(&data).expect("should parse");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert_eq!(candle.trades_count, 1500);
        assert!(!candle.is_closed);
    }

    #[test]
    fn parse_stream_payload_rejects_missing_fields() {
        let data = serde_json::json!({ "k": { "t": 1, "o": "1" } });
        assert!(Candle::from_stream_payload(&data).is_err());
    }

    #[test]
    fn parse_rest_row_marks_forming_candle() {
        let row = serde_json::json!([
            1700000000000i64, "1.0", "2.0", "0.5", "1.5", "10.0",
            1700000059999i64, "15.0", 42, "5.0", "7.5", "0"
        ]);
        let closed = Candle::from_rest_row(&row, 1_700_000_100_000).unwrap();
        assert!(closed.is_closed);
        assert_eq!(closed.trades_count, 42);
        assert!((closed.high - 2.0).abs() < f64::EPSILON);

        let forming = Candle::from_rest_row(&row, 1_700_000_030_000).unwrap();
        assert!(!forming.is_closed);
    }

    #[test]
    fn parse_rest_row_rejects_short_rows() {
        let row = serde_json::json!([1, "1.0", "2.0"]);
        assert!(Candle::from_rest_row(&row, 0).is_err());
    }
}
