// =============================================================================
// WebSocket Transport — one socket task per connection attempt
// =============================================================================
//
// The socket task owns the tungstenite stream. Everything it observes is
// reported through a `TransportSink` as a `TransportEvent`; everything it
// writes comes from the `TransportHandle`'s outbound queue. The task never
// reconnects on its own: a connection ends with exactly one `Closed` event
// and the connection manager decides what happens next.
// =============================================================================

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Events emitted by a transport, in order. `Opened` at most once,
/// `Closed` exactly once and last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed(Option<String>),
    Error(String),
}

pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Write side of a live transport.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, task: Option<JoinHandle<()>>) -> Self {
        Self { outbound, task }
    }

    /// Queue a text frame. Returns `false` if the socket task is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Ask the socket task to send a close frame and exit. If the task has
    /// already stopped listening it is aborted instead.
    pub fn close(mut self) {
        if self.outbound.send(Outbound::Close).is_err() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

/// Opens transports. The production implementation is [`WsConnector`].
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, sink: TransportSink) -> TransportHandle;
}

/// tokio-tungstenite backed connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str, sink: TransportSink) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(url.to_string(), rx, sink));
        TransportHandle::new(tx, Some(task))
    }
}

async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sink: TransportSink,
) {
    info!(url = %url, "connecting to combined stream");

    let ws_stream = match connect_async(&url).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(url = %url, error = %e, "combined stream connect failed");
            sink(TransportEvent::Error(e.to_string()));
            sink(TransportEvent::Closed(Some(format!("connect failed: {e}"))));
            return;
        }
    };

    info!(url = %url, "combined stream connected");
    sink(TransportEvent::Opened);

    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            cmd = outbound.recv() => {
                match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            sink(TransportEvent::Error(e.to_string()));
                            break Some(format!("send failed: {e}"));
                        }
                    }
                    // Handle dropped or explicit close: leave politely.
                    Some(Outbound::Close) | None => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        break Some("closed by client".to_string());
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => sink(TransportEvent::Frame(text)),
                    Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                        Ok(text) => sink(TransportEvent::Frame(text)),
                        Err(e) => debug!(error = %e, "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            debug!(error = %e, "pong not delivered");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| format!("{} {}", f.code, f.reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sink(TransportEvent::Error(e.to_string()));
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            }
        }
    };

    info!(url = %url, reason = ?reason, "combined stream closed");
    sink(TransportEvent::Closed(reason));
}
