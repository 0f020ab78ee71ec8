//! Per-PTY output feed: scrollback plus live fan-out to attachments.
//!
//! The PTY pump is the only caller of [`OutputFeed::append`]. Appending and
//! subscribing take the same short lock, so a new subscriber's replay ends
//! exactly where its live stream begins. Live chunks go out on a broadcast
//! channel; a subscriber that falls behind loses the oldest chunks and
//! refills them from scrollback with [`OutputFeed::read_between`]. Nothing
//! under the lock copies history or waits on a client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tabmux_core::replay::{compute_replay, ReplayPlan};
use tabmux_core::scrollback::{RangeRead, ScrollbackBuffer};
use tokio::sync::broadcast;
use tracing::debug;

/// Item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Bytes `[sequence, sequence + data.len())`.
    Output { sequence: u64, data: Arc<[u8]> },
    /// The PTY is gone; no more output will follow.
    Closed { reason: String },
}

/// Returned when subscribing to a feed whose PTY has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedClosed {
    pub reason: String,
}

/// A subscriber's replay and the live stream that continues at `plan.head`.
#[derive(Debug)]
pub struct Subscription {
    pub plan: ReplayPlan,
    pub live: broadcast::Receiver<FeedEvent>,
}

struct FeedState {
    buffer: ScrollbackBuffer,
    /// Dropped on close so subscribers see the end of the stream.
    live: Option<broadcast::Sender<FeedEvent>>,
    closed: Option<String>,
}

/// Output history and live subscribers of one PTY.
pub struct OutputFeed {
    state: Mutex<FeedState>,
    /// Mirrors of the buffer cursors, readable without the lock.
    head: AtomicU64,
    tail: AtomicU64,
}

impl OutputFeed {
    /// `live_capacity` is how many chunks a subscriber may fall behind
    /// before it starts losing the oldest ones.
    pub fn new(scrollback_bytes: usize, live_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(live_capacity.max(1));
        Self {
            state: Mutex::new(FeedState {
                buffer: ScrollbackBuffer::new(scrollback_bytes),
                live: Some(live),
                closed: None,
            }),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    /// Record a chunk of PTY output and broadcast it.
    ///
    /// Returns the sequence of the chunk's first byte.
    pub fn append(&self, data: &[u8]) -> u64 {
        if data.is_empty() {
            return self.head();
        }
        let chunk: Arc<[u8]> = Arc::from(data);

        let mut state = self.state.lock();
        let sequence = state.buffer.append(data);
        self.head.store(state.buffer.head(), Ordering::Release);
        self.tail.store(state.buffer.tail(), Ordering::Release);
        if let Some(live) = &state.live {
            // An error only means nobody is subscribed.
            let _ = live.send(FeedEvent::Output {
                sequence,
                data: chunk,
            });
        }
        sequence
    }

    /// Subscribe to live output and plan the replay in one step.
    ///
    /// Only a snapshot of segment handles is taken under the lock; the
    /// replay bytes are copied after it is released.
    pub fn subscribe(&self, last_acked: Option<u64>) -> Result<Subscription, FeedClosed> {
        let (snapshot, live) = {
            let state = self.state.lock();
            let live = match (&state.closed, &state.live) {
                (None, Some(live)) => live.subscribe(),
                (reason, _) => {
                    return Err(FeedClosed {
                        reason: reason.clone().unwrap_or_default(),
                    })
                }
            };
            (state.buffer.snapshot(), live)
        };

        let plan = compute_replay(&snapshot, last_acked);
        debug!(
            "Subscribed: replay [{}, {}) truncated={}",
            plan.start, plan.head, plan.truncated
        );
        Ok(Subscription { plan, live })
    }

    /// Mark the PTY as ended and tell every subscriber. Idempotent.
    pub fn close(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(reason.to_string());
        if let Some(live) = state.live.take() {
            let _ = live.send(FeedEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Retained bytes in `[from, to)`, for refilling chunks a subscriber
    /// fell behind on. `truncated` is set if part of the range was evicted.
    pub fn read_between(&self, from: u64, to: u64) -> RangeRead {
        let snapshot = self.state.lock().buffer.snapshot();
        snapshot.read_between(from, to)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    #[cfg(test)]
    pub fn closed_reason(&self) -> Option<String> {
        self.state.lock().closed.clone()
    }

    /// Sequence one past the newest byte.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Sequence of the oldest retained byte.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Live subscribers, counting attachments that are still starting.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .live
            .as_ref()
            .map_or(0, |live| live.receiver_count())
    }
}
