use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::media::{StreamId, StreamKind};

/// Counters updated by a queue's producer side and delivery loop.
#[derive(Debug, Default)]
pub struct QueueCounters {
    /// Items accepted by `enqueue`.
    pub enqueued: AtomicU64,
    /// Items handed to the sink successfully.
    pub dispatched: AtomicU64,
    /// Items dropped because they were past the late window.
    pub dropped_late: AtomicU64,
    /// Items the sink refused (wrong payload kind, output failure).
    pub rejected: AtomicU64,
    /// Items discarded because the queue was closed before they were delivered.
    pub abandoned: AtomicU64,
    /// Presentation span currently buffered, in microseconds.
    pub buffered_span_us: AtomicU64,
    /// Number of items currently pending (including the one in flight).
    pub pending_items: AtomicU64,
    /// Set once the delivery loop has returned.
    pub stopped: AtomicBool,
}

impl QueueCounters {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot suitable for logs and JSON output.
    pub fn snapshot(&self, stream_id: StreamId, kind: StreamKind) -> StreamStatus {
        StreamStatus {
            stream_id,
            kind,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped_late: self.dropped_late.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            buffered_ms: self.buffered_span_us.load(Ordering::Relaxed) / 1000,
            pending_items: self.pending_items.load(Ordering::Relaxed),
            running: !self.stopped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one stream queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub enqueued: u64,
    pub dispatched: u64,
    pub dropped_late: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub buffered_ms: u64,
    pub pending_items: u64,
    pub running: bool,
}
