// =============================================================================
// Shared types used across the market feed
// =============================================================================

use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A trading pair such as `BTCUSDT`.
///
/// Stored uppercase. REST calls use [`Pair::rest_symbol`], stream channel
/// names use [`Pair::stream_symbol`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair(String);

impl Pair {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("pair must not be empty");
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("pair '{trimmed}' contains non-alphanumeric characters");
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn rest_symbol(&self) -> &str {
        &self.0
    }

    pub fn stream_symbol(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self("BTCUSDT".to_string())
    }
}

impl TryFrom<String> for Pair {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.0
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kline intervals accepted by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub fn all() -> &'static [Timeframe] {
        &[
            Self::S1,
            Self::M1,
            Self::M3,
            Self::M5,
            Self::M15,
            Self::M30,
            Self::H1,
            Self::H2,
            Self::H4,
            Self::H6,
            Self::H8,
            Self::H12,
            Self::D1,
            Self::D3,
            Self::W1,
            Self::Mo1,
        ]
    }

    /// Interval string as used in `@kline_<interval>` and `interval=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match Self::all().iter().find(|tf| tf.as_str() == s) {
            Some(tf) => Ok(*tf),
            None => bail!("unsupported kline interval '{s}'"),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative transport state of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect budget exhausted. Only an explicit `open()` leaves this state.
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Observable status published to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStatus {
    pub state: ConnectionState,
    /// Consecutive abnormal closes since the last successful open.
    pub reconnect_attempt: u32,
    /// Secondary liveness signal: a frame arrived within the liveness window.
    /// Never drives `state`.
    pub live: bool,
    /// Last user-facing failure (history fetch, exhausted reconnects).
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            live: false,
            last_error: None,
            since: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_normalised_per_surface() {
        let pair = Pair::new(" btcUsdt ").unwrap();
        assert_eq!(pair.rest_symbol(), "BTCUSDT");
        assert_eq!(pair.stream_symbol(), "btcusdt");
        assert_eq!(pair.to_string(), "BTCUSDT");
    }

    #[test]
    fn pair_rejects_garbage() {
        assert!(Pair::new("").is_err());
        assert!(Pair::new("BTC/USDT").is_err());
    }

    #[test]
    fn timeframe_parses_exchange_intervals() {
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::Mo1);
        assert_eq!("4h".parse::<Timeframe>().unwrap().as_str(), "4h");
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_serde_uses_interval_strings() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }

    #[test]
    fn pair_deserialises_normalised() {
        let pair: Pair = serde_json::from_str("\"ethusdt\"").unwrap();
        assert_eq!(pair.rest_symbol(), "ETHUSDT");
        assert!(serde_json::from_str::<Pair>("\"\"").is_err());
    }
}
