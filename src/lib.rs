// =============================================================================
// market-feed — reconciled order book and candle series over one socket
// =============================================================================

pub mod binance;
pub mod connection;
pub mod feed;
pub mod feed_state;
pub mod market_data;
pub mod runtime_config;
pub mod types;

#[cfg(test)]
mod test_support;

pub use feed::MarketFeed;
pub use feed_state::{FeedSnapshot, FeedState};
pub use runtime_config::FeedConfig;
pub use types::{ConnectionState, FeedStatus, Pair, Timeframe};
