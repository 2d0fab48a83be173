pub mod client;
pub mod protocol;
pub mod rate_limit;
pub mod transport;

pub use client::{BinanceClient, MarketDataApi};
pub use transport::{Connector, Outbound, TransportEvent, TransportHandle, TransportSink, WsConnector};
