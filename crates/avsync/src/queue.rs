//! Self-servicing, time-bounded media queue.
//!
//! One [`TimedMediaQueue`] exists per active stream. It decouples the decoder (producer)
//! from a [`Sink`] (consumer) and releases each item at its presentation time:
//!
//! - **decoder thread** → `enqueue` (blocks while more than `capacity` of presentation
//!   time is buffered)
//! - **delivery thread** → compares each item with the [`MediaClock`] and either waits,
//!   drops, or dispatches it
//!
//! ## Design
//! - Items travel through a bounded `crossbeam_channel`; its item-count bound is only a
//!   safety net. The real admission rule is time-based and lives in a small
//!   Mutex+Condvar protected deque of pending timestamps, layered on top of the channel.
//! - The item currently being classified stays in the pending deque until it has been
//!   dispatched or dropped, so [`flush`](TimedMediaQueue::flush) really means "everything
//!   enqueued so far has been handled".
//! - Closing drops a shutdown sender. Both the idle wait and the early-item wait select
//!   on it, so a close is observed within one wake cycle.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::clock::MediaClock;
use crate::media::StreamId;
use crate::sink::{Sink, SinkError};
use crate::status::QueueCounters;
use crate::time::{MediaTimestamp, duration_to_micros};

/// Runtime parameters of one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueParams {
    /// Maximum presentation span buffered before `enqueue` blocks.
    pub capacity: Duration,
    /// Items at least this far ahead of the clock are delayed. `None` = never delay.
    pub early_window: Option<Duration>,
    /// Items more than this far behind the clock are dropped. `None` = never drop.
    pub late_window: Option<Duration>,
    /// Item-count bound of the underlying channel.
    pub max_items: usize,
}

type Visit<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S: Sink> {
    Item { item: S::Item, pts: MediaTimestamp },
    Visit(Visit<S>),
}

struct Pending {
    timestamps: VecDeque<MediaTimestamp>,
    closed: bool,
}

impl Pending {
    fn span(&self) -> Duration {
        match (self.timestamps.front(), self.timestamps.back()) {
            (Some(oldest), Some(newest)) => newest.span_since(*oldest),
            _ => Duration::ZERO,
        }
    }
}

struct Shared {
    pending: Mutex<Pending>,
    cv: Condvar,
    counters: Arc<QueueCounters>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.pending.lock().unwrap().closed
    }

    fn publish(&self, g: &Pending) {
        self.counters
            .buffered_span_us
            .store(g.span().as_micros() as u64, Ordering::Relaxed);
        self.counters
            .pending_items
            .store(g.timestamps.len() as u64, Ordering::Relaxed);
    }

    /// Retire the oldest pending item (dispatched or dropped) and wake waiters.
    fn complete_one(&self) {
        let mut g = self.pending.lock().unwrap();
        g.timestamps.pop_front();
        self.publish(&g);
        drop(g);
        self.cv.notify_all();
    }

    /// Everything still pending is abandoned when the loop exits.
    fn abandon_all(&self) {
        let mut g = self.pending.lock().unwrap();
        let n = g.timestamps.len() as u64;
        g.timestamps.clear();
        g.closed = true;
        self.publish(&g);
        drop(g);
        if n > 0 {
            self.counters.abandoned.fetch_add(n, Ordering::Relaxed);
        }
        self.cv.notify_all();
    }
}

/// A capacity-bounded, timestamp-ordered queue with its own delivery thread.
pub struct TimedMediaQueue<S: Sink> {
    stream_id: StreamId,
    capacity: Duration,
    shared: Arc<Shared>,
    tx: Sender<Message<S>>,
    shutdown: Mutex<Option<Sender<()>>>,
    // Serializes producers so pending timestamps and channel order agree.
    producer: Mutex<()>,
    handle: Option<JoinHandle<S>>,
}

impl<S: Sink> TimedMediaQueue<S> {
    /// Spawn the delivery thread and return once it is waiting for items.
    pub fn spawn(
        name: impl Into<String>,
        stream_id: StreamId,
        params: QueueParams,
        clock: Arc<MediaClock>,
        sink: S,
    ) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = crossbeam_channel::bounded(params.max_items.max(1));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);

        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                timestamps: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            counters: QueueCounters::shared(),
        });

        let delivery = DeliveryLoop {
            stream_id,
            early_us: params.early_window.map(duration_to_micros),
            late_us: params.late_window.map(duration_to_micros),
            clock,
            shared: shared.clone(),
            rx,
            shutdown: shutdown_rx,
        };

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _ = ready_tx.send(());
                delivery.run(sink)
            })
            .with_context(|| format!("spawn delivery thread {name}"))?;

        ready_rx
            .recv()
            .with_context(|| format!("delivery thread {name} exited before starting"))?;
        tracing::debug!(stream = stream_id, thread = %name, ?params, "queue started");

        Ok(Self {
            stream_id,
            capacity: params.capacity,
            shared,
            tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            producer: Mutex::new(()),
            handle: Some(handle),
        })
    }

    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.shared.counters
    }

    /// Queue `item` for presentation at `pts`.
    ///
    /// Blocks while the queue is non-empty and `pts` is more than `capacity` past the
    /// oldest pending item. Returns `false` (and drops `item`) if the queue is closed,
    /// including when it is closed while this call is blocked.
    pub fn enqueue(&self, item: S::Item, pts: MediaTimestamp) -> bool {
        let _producer = self.producer.lock().unwrap();

        let mut g = self.shared.pending.lock().unwrap();
        while !g.closed
            && g
                .timestamps
                .front()
                .is_some_and(|oldest| pts.span_since(*oldest) > self.capacity)
        {
            g = self.shared.cv.wait(g).unwrap();
        }
        if g.closed {
            return false;
        }
        g.timestamps.push_back(pts);
        self.shared.publish(&g);
        drop(g);

        // Only fails once the delivery thread is gone; nothing left to undo then.
        if self.tx.send(Message::Item { item, pts }).is_err() {
            return false;
        }
        QueueCounters::bump(&self.shared.counters.enqueued);
        true
    }

    /// Block until every item enqueued so far was dispatched or dropped, or the queue
    /// is closed. Returns immediately on an empty queue.
    pub fn flush(&self) {
        let mut g = self.shared.pending.lock().unwrap();
        while !g.closed && !g.timestamps.is_empty() {
            g = self.shared.cv.wait(g).unwrap();
        }
    }

    /// Run `f` on the sink from the delivery thread, after every item enqueued before
    /// this call. Returns `None` if the queue closed first.
    pub fn with_sink<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let _producer = self.producer.lock().unwrap();
            if self.shared.is_closed() {
                return None;
            }
            let visit: Visit<S> = Box::new(move |sink: &mut S| {
                let _ = reply_tx.send(f(sink));
            });
            self.tx.send(Message::Visit(visit)).ok()?;
        }
        reply_rx.recv().ok()
    }

    /// Stop accepting items and tell the delivery thread to exit. Idempotent.
    pub fn close(&self) {
        {
            let mut g = self.shared.pending.lock().unwrap();
            if g.closed {
                return;
            }
            g.closed = true;
        }
        self.shared.cv.notify_all();
        // Dropping the sender disconnects the shutdown channel.
        self.shutdown.lock().unwrap().take();
        tracing::debug!(stream = self.stream_id, "queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the queue, wait for the delivery thread to stop, and hand back the sink.
    ///
    /// Returns `None` if the delivery thread panicked.
    pub fn join(mut self) -> Option<S> {
        self.close();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(sink) => Some(sink),
            Err(_) => {
                tracing::error!(stream = self.stream_id, "delivery thread panicked");
                None
            }
        }
    }
}

impl<S: Sink> Drop for TimedMediaQueue<S> {
    fn drop(&mut self) {
        self.close();
    }
}

struct DeliveryLoop<S: Sink> {
    stream_id: StreamId,
    early_us: Option<i64>,
    late_us: Option<i64>,
    clock: Arc<MediaClock>,
    shared: Arc<Shared>,
    rx: Receiver<Message<S>>,
    shutdown: Receiver<()>,
}

/// What happened to one item.
enum Outcome {
    Handled,
    Closed,
}

impl<S: Sink> DeliveryLoop<S> {
    fn run(self, mut sink: S) -> S {
        loop {
            let msg = crossbeam_channel::select! {
                recv(self.rx) -> msg => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
            };

            match msg {
                Message::Visit(visit) => visit(&mut sink),
                Message::Item { item, pts } => match self.present(&mut sink, item, pts) {
                    Outcome::Handled => self.shared.complete_one(),
                    Outcome::Closed => break,
                },
            }
        }

        self.shared.abandon_all();
        self.shared.counters.stopped.store(true, Ordering::Relaxed);
        tracing::debug!(stream = self.stream_id, "delivery loop stopped");
        sink
    }

    /// Wait until `item` is due, then drop or dispatch it.
    fn present(&self, sink: &mut S, item: S::Item, pts: MediaTimestamp) -> Outcome {
        loop {
            if self.shared.is_closed() {
                return Outcome::Closed;
            }

            let delta = pts.delta_since(self.clock.now());

            if self.early_us.is_some_and(|early| delta >= early) {
                // Re-check after a third of the distance so clock resets are noticed.
                let nap = Duration::from_millis((delta / 3 / 1000).max(1) as u64);
                match self.shutdown.recv_timeout(nap) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return Outcome::Closed,
                }
            }

            if self.late_us.is_some_and(|late| delta < -late) {
                tracing::warn!(
                    stream = self.stream_id,
                    pts_us = pts.as_micros(),
                    late_us = -delta,
                    "dropping late media"
                );
                QueueCounters::bump(&self.shared.counters.dropped_late);
                return Outcome::Handled;
            }

            match sink.dispatch(item, pts) {
                Ok(()) => QueueCounters::bump(&self.shared.counters.dispatched),
                Err(err @ SinkError::UnexpectedPayload { .. }) => {
                    tracing::error!(stream = self.stream_id, "dispatch rejected: {err}");
                    QueueCounters::bump(&self.shared.counters.rejected);
                }
                Err(err) => {
                    tracing::warn!(stream = self.stream_id, "dispatch failed: {err}");
                    QueueCounters::bump(&self.shared.counters.rejected);
                }
            }
            return Outcome::Handled;
        }
    }
}
