//! Playback state shared between the UI side and the decoder thread.
//!
//! The decoder thread calls [`PlaybackControl::wait_while_paused`] between packets: it
//! parks while paused and learns about stops. Every transition into `Started` resets the
//! media clock, so the time spent paused is not counted as presentation time and queued
//! items are not dropped as late after a resume.

use std::sync::{Arc, Condvar, Mutex};

use crate::clock::MediaClock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Started,
    Paused,
}

pub struct PlaybackControl {
    clock: Arc<MediaClock>,
    state: Mutex<PlaybackState>,
    cv: Condvar,
}

impl PlaybackControl {
    pub fn new(clock: Arc<MediaClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(PlaybackState::Stopped),
            cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    /// Start or resume. Returns the previous state.
    pub fn start(&self) -> PlaybackState {
        let mut g = self.state.lock().unwrap();
        let prev = *g;
        *g = PlaybackState::Started;
        drop(g);

        self.clock.reset();
        self.cv.notify_all();
        tracing::info!(from = ?prev, "playback started");
        prev
    }

    /// Pause a started session. Has no effect in any other state.
    pub fn pause(&self) -> bool {
        let mut g = self.state.lock().unwrap();
        if *g != PlaybackState::Started {
            return false;
        }
        *g = PlaybackState::Paused;
        tracing::info!("playback paused");
        true
    }

    /// Stop playback; wakes a paused producer so it can wind down. Idempotent.
    pub fn stop(&self) -> bool {
        let mut g = self.state.lock().unwrap();
        if *g == PlaybackState::Stopped {
            return false;
        }
        *g = PlaybackState::Stopped;
        drop(g);
        self.cv.notify_all();
        tracing::info!("playback stopped");
        true
    }

    /// Producer gate: blocks while paused. Returns `false` once playback is stopped.
    pub fn wait_while_paused(&self) -> bool {
        let mut g = self.state.lock().unwrap();
        while *g == PlaybackState::Paused {
            g = self.cv.wait(g).unwrap();
        }
        *g == PlaybackState::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;
    use std::time::Duration;

    fn control() -> (Arc<ManualClock>, Arc<MediaClock>, Arc<PlaybackControl>) {
        let wall = Arc::new(ManualClock::new(0));
        let clock = Arc::new(MediaClock::new(wall.clone()));
        let control = Arc::new(PlaybackControl::new(clock.clone()));
        (wall, clock, control)
    }

    #[test]
    fn pause_only_applies_to_started_sessions() {
        let (_, _, control) = control();
        assert!(!control.pause());
        assert_eq!(control.state(), PlaybackState::Stopped);

        assert_eq!(control.start(), PlaybackState::Stopped);
        assert!(control.pause());
        assert_eq!(control.state(), PlaybackState::Paused);
    }

    #[test]
    fn stop_is_idempotent() {
        let (_, _, control) = control();
        control.start();
        assert!(control.stop());
        assert!(!control.stop());
        assert!(!control.wait_while_paused());
    }

    #[test]
    fn resume_excludes_paused_time_from_media_time() {
        let (wall, clock, control) = control();
        control.start();
        clock.now();
        wall.advance(400_000);
        assert_eq!(clock.now().as_micros(), 400_000);

        control.pause();
        wall.advance(3_000_000);
        control.start();
        assert_eq!(clock.now().as_micros(), 400_000);
    }

    #[test]
    fn paused_producer_wakes_on_start_and_stop() {
        let (_, _, control) = control();
        control.start();
        control.pause();

        let producer = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        control.start();
        assert!(producer.join().unwrap());

        control.pause();
        let producer = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(30));
        control.stop();
        assert!(!producer.join().unwrap());
    }
}
