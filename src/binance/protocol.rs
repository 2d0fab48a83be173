// =============================================================================
// Combined-stream wire protocol — control frames out, data frames in
// =============================================================================

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{Pair, Timeframe};

/// Stream channel kinds the feed subscribes to. Each kind carries a stable
/// correlation id used on SUBSCRIBE/UNSUBSCRIBE requests so acknowledgements
/// can be attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Depth,
    Kline,
}

impl ChannelKind {
    pub fn correlation_id(self) -> u64 {
        match self {
            Self::Depth => 2,
            Self::Kline => 3,
        }
    }

    pub fn from_correlation_id(id: u64) -> Option<Self> {
        match id {
            2 => Some(Self::Depth),
            3 => Some(Self::Kline),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Depth => write!(f, "depth"),
            Self::Kline => write!(f, "kline"),
        }
    }
}

/// `<pair>@depth`
pub fn depth_channel(pair: &Pair) -> String {
    format!("{}@depth", pair.stream_symbol())
}

/// `<pair>@kline_<interval>`
pub fn kline_channel(pair: &Pair, timeframe: Timeframe) -> String {
    format!("{}@kline_{}", pair.stream_symbol(), timeframe.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Subscribe,
    Unsubscribe,
}

/// `{ "method": ..., "params": [...], "id": n }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlFrame {
    pub method: Method,
    pub params: Vec<String>,
    pub id: u64,
}

impl ControlFrame {
    pub fn new(method: Method, kind: ChannelKind, channel: String) -> Self {
        Self {
            method,
            params: vec![channel],
            id: kind.correlation_id(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialise control frame")
    }
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{ "result": ..., "id": ... }` acknowledgement of a control frame.
    Ack { id: Option<u64> },
    /// `{ "error": {...}, "id": ... }` rejection of a control frame.
    Rejected { id: Option<u64>, message: String },
    /// `{ "stream": "...", "data": {...} }`
    Data { stream: String, data: serde_json::Value },
}

pub fn parse_inbound(text: &str) -> Result<InboundFrame> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse inbound frame JSON")?;

    let obj = root.as_object().context("inbound frame is not a JSON object")?;
    let id = obj.get("id").and_then(|v| v.as_u64());

    if obj.contains_key("result") {
        return Ok(InboundFrame::Ack { id });
    }

    if let Some(err) = obj.get("error") {
        let message = err
            .get("msg")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Ok(InboundFrame::Rejected { id, message });
    }

    let stream = obj
        .get("stream")
        .and_then(|s| s.as_str())
        .context("missing field stream")?
        .to_string();
    let data = obj.get("data").cloned().context("missing field data")?;

    Ok(InboundFrame::Data { stream, data })
}
