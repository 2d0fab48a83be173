// =============================================================================
// Request-Weight Tracker — keeps REST usage under the per-minute budget
// =============================================================================
//
// Binance caps request weight at 6000 per minute per IP on spot; we hard-cap
// ourselves well below that. The tracker reads `X-MBX-USED-WEIGHT-1M` after
// every response. A stored reading only counts for the minute it was taken
// in, so a blocked caller is released once the minute rolls over even if no
// further response arrives.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 5000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 4000;

/// Weight of `GET /api/v3/depth` for a given `limit`.
pub fn depth_request_weight(limit: u32) -> u32 {
    match limit {
        0..=100 => 5,
        101..=500 => 25,
        501..=1000 => 50,
        _ => 250,
    }
}

/// Weight of `GET /api/v3/klines`.
pub const KLINES_REQUEST_WEIGHT: u32 = 2;

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// Minute index (`unix_secs / 60`) the reading above belongs to.
    minute: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            minute: AtomicI64::new(current_minute()),
        }
    }

    /// Record the weight reported in the response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w);
    }

    fn record_weight(&self, w: u32) {
        self.minute.store(current_minute(), Ordering::Relaxed);
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    fn used_weight(&self) -> u32 {
        if self.minute.load(Ordering::Relaxed) != current_minute() {
            return 0;
        }
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight();
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight(),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}

fn current_minute() -> i64 {
    Utc::now().timestamp() / 60
}
