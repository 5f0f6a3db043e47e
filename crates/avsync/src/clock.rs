//! Shared media clock.
//!
//! All per-stream delivery loops read the same [`MediaClock`] to decide whether an item
//! is early, on time, or late. The clock derives media time from a wall-clock source
//! and a start offset that is anchored lazily on the first query after a reset.
//!
//! ## Anchoring
//! - A fresh clock (or one that was [`restart`](MediaClock::restart)ed) anchors so the
//!   first query returns zero.
//! - After [`reset`](MediaClock::reset) the next query anchors so media time continues
//!   from the last value handed out before the reset. A pause gap therefore does not
//!   show up as a jump in media time.
//!
//! Anchoring is a single compare-and-set on the offset, so when several delivery loops
//! race after a reset exactly one of them anchors and the rest observe its value.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::time::MediaTimestamp;

/// Sentinel for "offset not anchored yet".
const UNANCHORED: i64 = i64::MIN;

/// Source of wall-clock time in microseconds.
///
/// Only differences between readings matter; the epoch is arbitrary.
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Wall clock backed by [`Instant`], counting from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(i64::MAX)
    }
}

/// Wall clock that only moves when told to.
///
/// Used by tests and by deterministic harnesses that replay a schedule.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, us: i64) {
        self.now_us.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, us: i64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Process-wide presentation clock, shared by every stream queue.
pub struct MediaClock {
    source: Arc<dyn WallClock>,
    start_offset: AtomicI64,
    last_media_time: AtomicU64,
}

impl MediaClock {
    pub fn new(source: Arc<dyn WallClock>) -> Self {
        Self {
            source,
            start_offset: AtomicI64::new(UNANCHORED),
            last_media_time: AtomicU64::new(0),
        }
    }

    /// Clock driven by [`MonotonicClock`].
    pub fn monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }

    /// Current media time.
    ///
    /// Anchors the offset on the first call after construction or a reset. Returned
    /// values never decrease until [`restart`](Self::restart) clears the position.
    pub fn now(&self) -> MediaTimestamp {
        loop {
            let seen = self.start_offset.load(Ordering::SeqCst);
            let wall = self.source.now_micros();
            let offset = if seen == UNANCHORED {
                self.anchor(wall)
            } else {
                seen
            };

            let media = wall.saturating_sub(offset).max(0) as u64;
            // A reset landed after the offset was read; `media` may include the pause.
            if seen != UNANCHORED && self.start_offset.load(Ordering::SeqCst) != seen {
                continue;
            }
            let prev = self.last_media_time.fetch_max(media, Ordering::SeqCst);
            return MediaTimestamp::from_micros(prev.max(media));
        }
    }

    fn anchor(&self, wall: i64) -> i64 {
        let preserved =
            i64::try_from(self.last_media_time.load(Ordering::SeqCst)).unwrap_or(i64::MAX);
        let candidate = wall.saturating_sub(preserved);
        match self.start_offset.compare_exchange(
            UNANCHORED,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                tracing::debug!(preserved_us = preserved, "media clock anchored");
                candidate
            }
            Err(anchored) => anchored,
        }
    }

    /// Request re-anchoring on the next [`now`](Self::now), preserving the position.
    pub fn reset(&self) {
        self.start_offset.store(UNANCHORED, Ordering::SeqCst);
    }

    /// Re-anchor at zero: a new session starts from the beginning.
    pub fn restart(&self) {
        self.last_media_time.store(0, Ordering::SeqCst);
        self.start_offset.store(UNANCHORED, Ordering::SeqCst);
    }

    /// Last value returned by [`now`](Self::now) (zero before the first query).
    pub fn last_media_time(&self) -> MediaTimestamp {
        MediaTimestamp::from_micros(self.last_media_time.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for MediaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaClock")
            .field("start_offset", &self.start_offset.load(Ordering::Relaxed))
            .field("last_media_time", &self.last_media_time.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manual(start_us: i64) -> (Arc<ManualClock>, MediaClock) {
        let wall = Arc::new(ManualClock::new(start_us));
        let clock = MediaClock::new(wall.clone());
        (wall, clock)
    }

    #[test]
    fn first_query_anchors_at_zero() {
        let (wall, clock) = manual(7_000_000);
        assert_eq!(clock.now().as_micros(), 0);
        wall.advance(16_000);
        assert_eq!(clock.now().as_micros(), 16_000);
    }

    #[test]
    fn reset_preserves_position_across_gap() {
        let (wall, clock) = manual(1_000);
        clock.now();
        wall.advance(500_000);
        assert_eq!(clock.now().as_micros(), 500_000);

        clock.reset();
        // Paused for ten seconds; media time must not jump.
        wall.advance(10_000_000);
        assert_eq!(clock.now().as_micros(), 500_000);
        wall.advance(20_000);
        assert_eq!(clock.now().as_micros(), 520_000);
    }

    #[test]
    fn restart_returns_to_zero() {
        let (wall, clock) = manual(0);
        clock.now();
        wall.advance(300_000);
        clock.now();
        clock.restart();
        wall.advance(5_000);
        assert_eq!(clock.now().as_micros(), 0);
        assert_eq!(clock.last_media_time().as_micros(), 0);
    }

    #[test]
    fn now_never_decreases_when_wall_clock_steps_back() {
        let (wall, clock) = manual(1_000_000);
        clock.now();
        wall.set(1_400_000);
        assert_eq!(clock.now().as_micros(), 400_000);
        wall.set(1_100_000);
        assert_eq!(clock.now().as_micros(), 400_000);
    }

    #[test]
    fn reset_anchors_once_under_contention() {
        let (wall, clock) = manual(0);
        clock.now();
        wall.advance(250_000);
        clock.now();
        clock.reset();
        wall.advance(1_000_000);

        let clock = Arc::new(clock);
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    clock.now().as_micros()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 250_000);
        }
    }

    /// Wall clock that, once armed, jumps forward and resets the media clock from inside
    /// a reading, as a resume would between a delivery loop's offset load and its store.
    struct ResumeDuringRead {
        now_us: AtomicI64,
        gap_us: i64,
        armed: std::sync::atomic::AtomicBool,
        clock: std::sync::OnceLock<std::sync::Weak<MediaClock>>,
    }

    impl WallClock for ResumeDuringRead {
        fn now_micros(&self) -> i64 {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.now_us.fetch_add(self.gap_us, Ordering::SeqCst);
                if let Some(clock) = self.clock.get().and_then(|c| c.upgrade()) {
                    clock.reset();
                }
            }
            self.now_us.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn reset_during_query_does_not_leak_pause() {
        let wall = Arc::new(ResumeDuringRead {
            now_us: AtomicI64::new(0),
            gap_us: 10_000_000,
            armed: std::sync::atomic::AtomicBool::new(false),
            clock: std::sync::OnceLock::new(),
        });
        let clock = Arc::new(MediaClock::new(wall.clone()));
        let _ = wall.clock.set(Arc::downgrade(&clock));

        clock.now();
        wall.now_us.fetch_add(500_000, Ordering::SeqCst);
        assert_eq!(clock.now().as_micros(), 500_000);

        wall.armed.store(true, Ordering::SeqCst);
        assert_eq!(clock.now().as_micros(), 500_000);
        assert_eq!(clock.last_media_time().as_micros(), 500_000);

        wall.now_us.fetch_add(40_000, Ordering::SeqCst);
        assert_eq!(clock.now().as_micros(), 540_000);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MediaClock::monotonic();
        let a = clock.now();
        thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert!(b > a);
    }
}
