//! Bounded buffer of interleaved `f32` samples between an audio sink and the CPAL callback.
//!
//! The sink side pushes with [`SampleBuffer::push_blocking`], which parks while the buffer
//! is full; that is how device playback speed propagates back into the audio queue. The
//! callback side only ever calls [`SampleBuffer::pop_available`], which never waits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Capacity in samples for `buffer_ms` of audio. Falls back to 200 ms when zero.
pub fn capacity_samples(rate_hz: u32, channels: u16, buffer_ms: u64) -> usize {
    let ms = if buffer_ms == 0 { 200 } else { buffer_ms };
    let frames = (rate_hz as u64 * ms).div_ceil(1000) as usize;
    frames.max(1).saturating_mul(channels.max(1) as usize)
}

pub struct SampleBuffer {
    channels: usize,
    max_samples: usize,
    inner: Mutex<BufferInner>,
    cv: Condvar,
    played_frames: AtomicU64,
    underruns: AtomicU64,
}

struct BufferInner {
    samples: VecDeque<f32>,
    closed: bool,
}

impl SampleBuffer {
    pub fn new(channels: u16, max_samples: usize) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            channels,
            max_samples: max_samples.max(channels),
            inner: Mutex::new(BufferInner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            played_frames: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().samples.len() / self.channels
    }

    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Reject further pushes and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    /// Append samples, waiting for room as needed.
    ///
    /// Returns `false` if the buffer was closed before everything was accepted; the
    /// remainder is discarded.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.samples.len() >= self.max_samples && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return false;
            }

            let room = self.max_samples - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Take up to `max_frames` whole frames without waiting. `None` when nothing is buffered.
    pub fn pop_available(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let take_frames = (g.samples.len() / self.channels).min(max_frames);
        if take_frames == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take_frames * self.channels).collect();
        drop(g);

        self.played_frames
            .fetch_add(take_frames as u64, Ordering::Relaxed);
        self.cv.notify_all();
        Some(out)
    }

    pub(crate) fn note_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait until the callback has consumed everything, the buffer is closed, or `timeout`
    /// elapses. Returns `true` if the buffer emptied.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.samples.len() < self.channels {
                return true;
            }
            if g.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = self.cv.wait_timeout(g, deadline - now).unwrap().0;
        }
    }
}
