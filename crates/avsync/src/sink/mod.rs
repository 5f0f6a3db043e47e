//! Delivery targets for scheduled media.
//!
//! A [`Sink`] is what a [`TimedMediaQueue`](crate::queue::TimedMediaQueue) calls when an
//! item is due. Each queue owns exactly one sink and only touches it from its delivery
//! thread, so sinks need `Send` but never `Sync`.
//!
//! - [`VideoSink`]: converts a decoded frame to an RGB image and notifies listeners.
//! - [`AudioSink`]: writes sample blocks to an [`AudioLine`]; the line's blocking write
//!   is what paces audio.

mod audio;
mod video;

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::media::{Image, StreamId, StreamKind};
use crate::time::MediaTimestamp;

pub use audio::{AudioLine, AudioSink, PacedNullLine};
pub use video::{FrameConverter, VideoSink};

#[cfg(test)]
pub(crate) use audio::tests as audio_tests;

/// Consumer of items released by a queue's delivery loop.
pub trait Sink: Send + 'static {
    type Item: Send + 'static;

    /// Deliver one due item. Called at most once per item, in queue order.
    fn dispatch(&mut self, item: Self::Item, pts: MediaTimestamp) -> Result<(), SinkError>;
}

/// Reasons a sink refuses a single dispatch. None of them stop the delivery loop.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Payload kind does not match the stream's sink (wiring bug).
    #[error("unexpected {found} payload for {expected} sink")]
    UnexpectedPayload {
        expected: StreamKind,
        found: StreamKind,
    },

    /// Payload is of the right kind but cannot be interpreted.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The output device or line failed.
    #[error("output failed: {0:#}")]
    Output(anyhow::Error),
}

/// A new image is ready for display.
#[derive(Clone, Debug)]
pub struct NewImage {
    pub stream_id: StreamId,
    pub image: Arc<Image>,
    pub pts: MediaTimestamp,
}

/// Observer of presentation events (typically a render surface).
///
/// Callbacks run on the delivery thread of the stream that produced the event and
/// should hand work off rather than render inline.
pub trait MediaListener: Send + Sync {
    fn on_new_image(&self, event: &NewImage);

    /// Called once per session after every stream queue has stopped.
    fn on_end_of_media(&self) {}
}

/// Registry of [`MediaListener`]s shared by all video sinks of a session.
#[derive(Default)]
pub struct MediaListeners {
    inner: RwLock<Vec<Arc<dyn MediaListener>>>,
}

fn same_listener(a: &Arc<dyn MediaListener>, b: &Arc<dyn MediaListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl MediaListeners {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener. Adding the same listener twice has no effect.
    pub fn add(&self, listener: Arc<dyn MediaListener>) {
        let mut g = self.inner.write().unwrap();
        if !g.iter().any(|l| same_listener(l, &listener)) {
            g.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn MediaListener>) {
        let mut g = self.inner.write().unwrap();
        g.retain(|l| !same_listener(l, listener));
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Listeners are cloned out so a callback may add/remove without deadlocking.
    fn current(&self) -> Vec<Arc<dyn MediaListener>> {
        self.inner.read().unwrap().clone()
    }

    pub fn fire_new_image(&self, event: &NewImage) {
        for l in self.current() {
            l.on_new_image(event);
        }
    }

    pub fn fire_end_of_media(&self) {
        for l in self.current() {
            l.on_end_of_media();
        }
    }
}
