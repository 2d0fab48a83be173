// =============================================================================
// Feed Configuration — endpoints, subscription defaults and retry policy
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Pair, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/stream".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com/api/v3".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_snapshot_retry_delay_ms() -> u64 {
    2000
}

fn default_depth_limit() -> u32 {
    1000
}

fn default_kline_limit() -> u32 {
    1000
}

fn default_max_candles() -> usize {
    5000
}

fn default_health_check_interval_ms() -> u64 {
    3000
}

fn default_liveness_window_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level configuration for a market feed.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Endpoints -----------------------------------------------------------

    /// Combined-stream WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// REST base including the API version prefix.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    // --- Initial subscription ------------------------------------------------

    #[serde(default)]
    pub pair: Pair,

    #[serde(default)]
    pub timeframe: Timeframe,

    // --- Reconnection --------------------------------------------------------

    /// Fixed delay between an abnormal close and the next connect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Consecutive abnormal closes tolerated before the feed enters `Error`.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    // --- Order book ----------------------------------------------------------

    /// Delay before retrying a failed depth snapshot request.
    #[serde(default = "default_snapshot_retry_delay_ms")]
    pub snapshot_retry_delay_ms: u64,

    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,

    // --- Candles -------------------------------------------------------------

    #[serde(default = "default_kline_limit")]
    pub kline_limit: u32,

    /// Oldest candles are dropped once the series grows past this.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    // --- Liveness ------------------------------------------------------------

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// No frame for this long marks the feed as not live.
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_base_url: default_rest_base_url(),
            pair: Pair::default(),
            timeframe: Timeframe::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            snapshot_retry_delay_ms: default_snapshot_retry_delay_ms(),
            depth_limit: default_depth_limit(),
            kline_limit: default_kline_limit(),
            max_candles: default_max_candles(),
            health_check_interval_ms: default_health_check_interval_ms(),
            liveness_window_ms: default_liveness_window_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pair = %config.pair,
            timeframe = %config.timeframe,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn snapshot_retry_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.ws_url, "wss://stream.binance.com:9443/stream");
        assert_eq!(cfg.rest_base_url, "https://api.binance.com/api/v3");
        assert_eq!(cfg.pair.rest_symbol(), "BTCUSDT");
        assert_eq!(cfg.timeframe, Timeframe::M1);
        assert_eq!(cfg.max_reconnect_attempts, 3);
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(cfg.snapshot_retry_delay(), Duration::from_secs(2));
        assert_eq!(cfg.depth_limit, 1000);
        assert_eq!(cfg.kline_limit, 1000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.pair.rest_symbol(), "BTCUSDT");
        assert_eq!(cfg.liveness_window_ms, 5000);
        assert_eq!(cfg.health_check_interval_ms, 3000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "pair": "ethusdt", "timeframe": "5m", "max_reconnect_attempts": 5 }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.pair.rest_symbol(), "ETHUSDT");
        assert_eq!(cfg.timeframe, Timeframe::M5);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.reconnect_delay_ms, 3000);
    }

    #[test]
    fn invalid_timeframe_is_rejected() {
        let json = r#"{ "timeframe": "7m" }"#;
        assert!(serde_json::from_str::<FeedConfig>(json).is_err());
    }

    #[test]
    fn save_then_load_preserves_subscription() {
        let dir = std::env::temp_dir().join(format!("market-feed-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed_config.json");

        let mut cfg = FeedConfig::default();
        cfg.pair = Pair::new("solusdt").unwrap();
        cfg.timeframe = Timeframe::H1;
        cfg.save(&path).unwrap();

        let loaded = FeedConfig::load(&path).unwrap();
        assert_eq!(loaded.pair, cfg.pair);
        assert_eq!(loaded.timeframe, Timeframe::H1);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
