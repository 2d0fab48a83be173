pub mod candle_series;
pub mod orderbook;
pub mod reconciler;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_series::{Candle, CandleSeries, KlineOutcome};
pub use orderbook::{
    ApplyOutcome, BookSummary, DepthEvent, LocalOrderBook, OrderBookSnapshot, PriceLevel, Side,
};
pub use reconciler::{
    DepthOutcome, OrderBookReconciler, SnapshotDelivery, SnapshotOutcome, SnapshotSink, SyncPhase,
};
