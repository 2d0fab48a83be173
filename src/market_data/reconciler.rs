// =============================================================================
// Order Book Reconciler — snapshot/diff synchronisation for one pair
// =============================================================================
//
// Lifecycle of one synchronisation cycle:
//
//   1. The first depth event after a reset records its `U` as `firstEventU`
//      and starts a snapshot fetch. Every event is buffered until a snapshot
//      is installed.
//   2. A snapshot with `lastUpdateId < firstEventU` is discarded and fetched
//      again.
//   3. A usable snapshot seeds the book; the buffer is drained through the
//      normal apply rules and then bypassed until the next reset.
//   4. A gap (`U > lastUpdateId + 1`) wipes everything and the cycle starts
//      again on the next event.
//
// The fetch runs on its own task and reports back through a `SnapshotSink`
// tagged with the epoch it was started in. `reset()` bumps the epoch and
// aborts the task, so a late response can never seed a book for a cycle that
// no longer exists.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binance::MarketDataApi;
use crate::market_data::orderbook::{ApplyOutcome, DepthEvent, LocalOrderBook, OrderBookSnapshot};
use crate::types::Pair;

/// A fetched snapshot, tagged with the reconciler epoch that requested it.
#[derive(Debug, Clone)]
pub struct SnapshotDelivery {
    pub epoch: u64,
    pub snapshot: OrderBookSnapshot,
}

/// Where fetched snapshots are delivered. In the feed this posts into the
/// connection manager's inbox so installation happens on the same sequential
/// path as depth events.
pub type SnapshotSink = Arc<dyn Fn(SnapshotDelivery) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No event seen since the last reset.
    Idle,
    /// Buffering while a snapshot is in flight.
    AwaitingSnapshot,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthOutcome {
    Buffered,
    Applied,
    AlreadyApplied,
    /// Gap detected; book and buffer were dropped.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Book installed; `applied` buffered events survived the drain.
    Installed { applied: usize },
    /// Older than the first buffered event; a new fetch was started.
    Stale,
    /// Gap found while draining the buffer; state wiped.
    Resync,
    /// Belonged to an earlier epoch or arrived after installation.
    Superseded,
}

pub struct OrderBookReconciler {
    pair: Pair,
    api: Arc<dyn MarketDataApi>,
    sink: SnapshotSink,
    depth_limit: u32,
    retry_delay: Duration,

    epoch: u64,
    first_event_u: Option<u64>,
    buffer: Vec<DepthEvent>,
    book: Option<Arc<LocalOrderBook>>,
    fetch_task: Option<JoinHandle<()>>,
}

impl OrderBookReconciler {
    pub fn new(
        pair: Pair,
        api: Arc<dyn MarketDataApi>,
        sink: SnapshotSink,
        depth_limit: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            pair,
            api,
            sink,
            depth_limit,
            retry_delay,
            epoch: 0,
            first_event_u: None,
            buffer: Vec::new(),
            book: None,
            fetch_task: None,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn first_event_u(&self) -> Option<u64> {
        self.first_event_u
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn phase(&self) -> SyncPhase {
        if self.book.is_some() {
            SyncPhase::Synced
        } else if self.first_event_u.is_some() {
            SyncPhase::AwaitingSnapshot
        } else {
            SyncPhase::Idle
        }
    }

    /// The reconciled book, if synchronised. Cloning the `Arc` is cheap; the
    /// next applied event copies the book instead of mutating what readers
    /// hold.
    pub fn current_book(&self) -> Option<&Arc<LocalOrderBook>> {
        self.book.as_ref()
    }

    /// Drop the book, the buffer and any in-flight snapshot fetch.
    pub fn reset(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.first_event_u = None;
        self.buffer.clear();
        self.book = None;
    }

    pub fn set_pair(&mut self, pair: Pair) {
        self.reset();
        self.pair = pair;
    }

    pub fn on_depth_event(&mut self, event: DepthEvent) -> DepthOutcome {
        let Some(book) = self.book.as_mut() else {
            if self.first_event_u.is_none() {
                self.first_event_u = Some(event.first_update_id);
                debug!(
                    pair = %self.pair,
                    first_event_u = event.first_update_id,
                    "first depth event of cycle, requesting snapshot"
                );
                self.request_snapshot();
            }
            self.buffer.push(event);
            return DepthOutcome::Buffered;
        };

        match book.classify(&event) {
            ApplyOutcome::AlreadyApplied => DepthOutcome::AlreadyApplied,
            ApplyOutcome::Gap => {
                warn!(
                    pair = %self.pair,
                    last_update_id = book.last_update_id(),
                    first_update_id = event.first_update_id,
                    "depth sequence gap, resynchronising"
                );
                self.reset();
                DepthOutcome::Resync
            }
            ApplyOutcome::Applied => {
                Arc::make_mut(book).apply(&event);
                DepthOutcome::Applied
            }
        }
    }

    pub fn on_snapshot(&mut self, delivery: SnapshotDelivery) -> SnapshotOutcome {
        if delivery.epoch != self.epoch || self.book.is_some() {
            debug!(
                pair = %self.pair,
                delivered_epoch = delivery.epoch,
                epoch = self.epoch,
                "ignoring superseded snapshot"
            );
            return SnapshotOutcome::Superseded;
        }
        self.fetch_task = None;

        let Some(first_event_u) = self.first_event_u else {
            return SnapshotOutcome::Superseded;
        };

        let snapshot = delivery.snapshot;
        if snapshot.last_update_id < first_event_u {
            warn!(
                pair = %self.pair,
                last_update_id = snapshot.last_update_id,
                first_event_u,
                "snapshot older than buffered stream, refetching"
            );
            self.request_snapshot();
            return SnapshotOutcome::Stale;
        }

        let mut book = LocalOrderBook::from_snapshot(snapshot);
        let buffered = std::mem::take(&mut self.buffer);
        let total = buffered.len();
        let mut applied = 0;

        for event in &buffered {
            match book.apply(event) {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::AlreadyApplied => {}
                ApplyOutcome::Gap => {
                    warn!(
                        pair = %self.pair,
                        last_update_id = book.last_update_id(),
                        first_update_id = event.first_update_id,
                        "gap while draining buffer, resynchronising"
                    );
                    self.reset();
                    return SnapshotOutcome::Resync;
                }
            }
        }

        info!(
            pair = %self.pair,
            last_update_id = book.last_update_id(),
            buffered = total,
            applied,
            "order book synchronised"
        );
        self.book = Some(Arc::new(book));
        SnapshotOutcome::Installed { applied }
    }

    /// Start (or restart) the fetch for the current epoch. Failures are
    /// retried after `retry_delay` until the task is aborted by a reset.
    fn request_snapshot(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }

        let api = Arc::clone(&self.api);
        let sink = Arc::clone(&self.sink);
        let pair = self.pair.clone();
        let epoch = self.epoch;
        let limit = self.depth_limit;
        let retry_delay = self.retry_delay;

        self.fetch_task = Some(tokio::spawn(async move {
            loop {
                match api.depth_snapshot(&pair, limit).await {
                    Ok(snapshot) => {
                        sink(SnapshotDelivery { epoch, snapshot });
                        return;
                    }
                    Err(e) => {
                        warn!(
                            pair = %pair,
                            error = %e,
                            retry_in_ms = retry_delay.as_millis() as u64,
                            "snapshot fetch failed"
                        );
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }));
    }
}

impl Drop for OrderBookReconciler {
    fn drop(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for OrderBookReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookReconciler")
            .field("pair", &self.pair)
            .field("epoch", &self.epoch)
            .field("phase", &self.phase())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
