// =============================================================================
// Local Order Book — price-level book seeded by a snapshot, advanced by diffs
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One `(price, quantity)` entry as delivered on the wire.
pub type PriceLevel = (Decimal, Decimal);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// Incremental depth update from the `<pair>@depth` stream.
///
/// A quantity of zero means "remove this price level".
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepthEvent {
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b", default)]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "a", default)]
    pub asks: Vec<PriceLevel>,
}

/// Point-in-time full book from `GET /depth`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

/// Result of offering a [`DepthEvent`] to a [`LocalOrderBook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// `u <= lastUpdateId`; the book is unchanged.
    AlreadyApplied,
    /// `U > lastUpdateId + 1`; the book is unchanged and must be discarded.
    Gap,
    Applied,
}

/// Reconciled order book for a single pair.
///
/// Price levels are keyed by exact decimal value, so `"10"` and `"10.00"`
/// address the same level. Bids iterate best (highest) first, asks best
/// (lowest) first. Zero quantities are never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOrderBook {
    last_update_id: u64,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl LocalOrderBook {
    pub fn from_snapshot(snapshot: OrderBookSnapshot) -> Self {
        let mut book = Self {
            last_update_id: snapshot.last_update_id,
            ..Self::default()
        };
        for (price, qty) in snapshot.bids {
            Self::apply_delta(&mut book.bids, price, qty);
        }
        for (price, qty) in snapshot.asks {
            Self::apply_delta(&mut book.asks, price, qty);
        }
        book
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Bid levels, highest price first.
    pub fn bids(&self) -> impl Iterator<Item = (&Decimal, &Decimal)> + '_ {
        self.bids.iter().rev()
    }

    /// Ask levels, lowest price first.
    pub fn asks(&self) -> impl Iterator<Item = (&Decimal, &Decimal)> + '_ {
        self.asks.iter()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn quantity_at(&self, side: Side, price: Decimal) -> Option<Decimal> {
        match side {
            Side::Bid => self.bids.get(&price).copied(),
            Side::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Apply one diff event following the sequence rules:
    /// stale events are ignored, a non-contiguous `U` reports a gap, anything
    /// else is applied and advances `lastUpdateId` to `u`.
    pub fn apply(&mut self, event: &DepthEvent) -> ApplyOutcome {
        let outcome = self.classify(event);
        if outcome != ApplyOutcome::Applied {
            return outcome;
        }

        for (price, qty) in &event.bids {
            Self::apply_delta(&mut self.bids, *price, *qty);
        }
        for (price, qty) in &event.asks {
            Self::apply_delta(&mut self.asks, *price, *qty);
        }

        self.last_update_id = event.final_update_id;
        ApplyOutcome::Applied
    }

    /// What [`apply`](Self::apply) would do with `event`, without mutating.
    pub fn classify(&self, event: &DepthEvent) -> ApplyOutcome {
        if event.final_update_id <= self.last_update_id {
            ApplyOutcome::AlreadyApplied
        } else if event.first_update_id > self.last_update_id.saturating_add(1) {
            ApplyOutcome::Gap
        } else {
            ApplyOutcome::Applied
        }
    }

    fn apply_delta(levels: &mut BTreeMap<Decimal, Decimal>, price: Decimal, qty: Decimal) {
        if qty.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, qty);
        }
    }

    /// Display-oriented summary over the top `depth` levels of each side.
    pub fn summary(&self, depth: usize) -> BookSummary {
        let best_bid = self.best_bid().and_then(|(p, _)| p.to_f64()).unwrap_or(0.0);
        let best_ask = self.best_ask().and_then(|(p, _)| p.to_f64()).unwrap_or(0.0);

        let bid_depth: f64 = self
            .bids()
            .take(depth)
            .filter_map(|(_, q)| q.to_f64())
            .sum();
        let ask_depth: f64 = self
            .asks()
            .take(depth)
            .filter_map(|(_, q)| q.to_f64())
            .sum();

        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = if best_bid > 0.0 && best_ask > 0.0 && mid > 0.0 {
            ((best_ask - best_bid) / mid) * 10_000.0
        } else {
            0.0
        };

        let total_depth = bid_depth + ask_depth;
        let imbalance = if total_depth > 0.0 {
            (bid_depth - ask_depth) / total_depth
        } else {
            0.0
        };

        BookSummary {
            last_update_id: self.last_update_id,
            best_bid,
            best_ask,
            mid,
            bid_depth,
            ask_depth,
            spread_bps,
            imbalance,
        }
    }
}

/// Top-of-book figures for display. Floating point is fine here; level
/// identity never goes through these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub last_update_id: u64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub spread_bps: f64,
    /// -1 (all asks) to +1 (all bids).
    pub imbalance: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
