//! Synthetic decoder session.
//!
//! A decoder thread owns the [`StreamCoordinator`] and feeds it units from
//! [`SyntheticSource`] as fast as the queues accept them, so the queues' capacity is
//! what keeps it roughly one buffer ahead of the clock.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use avsync::clock::MediaClock;
use avsync::config::SchedulerConfig;
use avsync::control::PlaybackControl;
use avsync::coordinator::{AudioLineProvider, StreamCoordinator};
use avsync::device::CpalLineProvider;
use avsync::media::{
    AudioBlock, DecodedUnit, MediaUnit, PixelFormat, StreamId, StreamInfo, VideoFrame,
};
use avsync::sink::{AudioLine, MediaListener, MediaListeners, NewImage, PacedNullLine};
use avsync::status::StreamStatus;
use avsync::time::TimestampUnit;

use crate::cli::DemoArgs;

const VIDEO_STREAM: StreamId = 0;
const AUDIO_STREAM: StreamId = 1;
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;
const BLOCK_FRAMES: usize = 960;
const TONE_HZ: f32 = 440.0;

/// Where audio goes.
pub struct Output {
    pub device: Option<String>,
    pub audio_buffer_ms: u64,
}

/// Play one synthetic session and return the queue counters as they were at the end.
pub fn run(config: SchedulerConfig, output: Output, opts: &DemoArgs) -> Result<Vec<StreamStatus>> {
    let clock = Arc::new(MediaClock::monotonic());
    let control = Arc::new(PlaybackControl::new(clock.clone()));
    let listeners = MediaListeners::shared();
    let counter = Arc::new(ImageCounter::default());
    listeners.add(counter.clone());

    let lines: Box<dyn AudioLineProvider> = if opts.no_audio {
        Box::new(null_line)
    } else {
        Box::new(CpalLineProvider::new(output.device).with_buffer_ms(output.audio_buffer_ms))
    };

    let stall = opts
        .late_burst
        .then(|| Duration::from_millis(config.video.capacity_ms + 250));
    let source = SyntheticSource::new(opts)?;
    let coordinator = StreamCoordinator::new(config, clock, lines, listeners);

    let control_for_signal = control.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        control_for_signal.stop();
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    control.start();
    let decoder = {
        let control = control.clone();
        thread::Builder::new()
            .name("decoder".into())
            .spawn(move || decode_loop(coordinator, source, &control, stall))
            .context("spawn decoder thread")?
    };
    let status = decoder
        .join()
        .map_err(|_| anyhow!("decoder thread panicked"))?;
    control.stop();

    tracing::info!(
        images = counter.images.load(Ordering::Relaxed),
        ended = counter.ended.load(Ordering::Relaxed),
        "demo finished"
    );
    Ok(status)
}

fn null_line(
    _stream_id: StreamId,
    _sample_rate: u32,
    _channels: u16,
) -> Result<Box<dyn AudioLine>> {
    Ok(Box::new(PacedNullLine::new()))
}

fn decode_loop(
    mut coordinator: StreamCoordinator,
    mut source: SyntheticSource,
    control: &PlaybackControl,
    stall: Option<Duration>,
) -> Vec<StreamStatus> {
    coordinator.stream_opened();
    for (stream_id, info) in source.streams() {
        coordinator.stream_added(stream_id, info);
    }

    let stall_at = source.end_us / 2;
    let mut stall = stall;
    let mut next_report_us = 1_000_000;

    while control.wait_while_paused() {
        let Some(unit) = source.next_unit() else {
            break;
        };
        let pts_us = unit.pts().as_micros();

        if pts_us >= stall_at {
            if let Some(d) = stall.take() {
                tracing::info!(stall_ms = d.as_millis() as u64, "simulating decoder stall");
                thread::sleep(d);
            }
        }

        coordinator.route(unit);

        if pts_us >= next_report_us {
            next_report_us += 1_000_000;
            for s in coordinator.status() {
                tracing::debug!(
                    stream = s.stream_id,
                    kind = %s.kind,
                    buffered_ms = s.buffered_ms,
                    dispatched = s.dispatched,
                    dropped_late = s.dropped_late,
                    "queue status"
                );
            }
        }
    }

    coordinator.flush_all();
    let status = coordinator.status();
    coordinator.stream_closed();
    status
}

/// Counts presented images and notes the end of media.
#[derive(Default)]
struct ImageCounter {
    images: AtomicU64,
    ended: AtomicBool,
}

impl MediaListener for ImageCounter {
    fn on_new_image(&self, event: &NewImage) {
        let n = self.images.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 50 == 0 {
            tracing::debug!(
                stream = event.stream_id,
                pts = %event.pts,
                width = event.image.width,
                height = event.image.height,
                images = n,
                "image presented"
            );
        }
    }

    fn on_end_of_media(&self) {
        self.ended.store(true, Ordering::Relaxed);
        tracing::info!(images = self.images.load(Ordering::Relaxed), "end of media");
    }
}

/// Moving-bar test pattern plus a sine tone, emitted in presentation order.
struct SyntheticSource {
    fps: u32,
    width: u32,
    height: u32,
    end_us: u64,
    next_frame: u64,
    next_block: u64,
    phase: f32,
}

impl SyntheticSource {
    fn new(opts: &DemoArgs) -> Result<Self> {
        if opts.fps == 0 || opts.width == 0 || opts.height == 0 {
            anyhow::bail!("fps, width and height must be non-zero");
        }
        if !opts.seconds.is_finite() || opts.seconds <= 0.0 {
            anyhow::bail!("--seconds must be a positive number");
        }
        Ok(Self {
            fps: opts.fps,
            width: opts.width,
            height: opts.height,
            end_us: (opts.seconds * 1_000_000.0) as u64,
            next_frame: 0,
            next_block: 0,
            phase: 0.0,
        })
    }

    fn streams(&self) -> [(StreamId, StreamInfo); 2] {
        [
            (
                VIDEO_STREAM,
                StreamInfo::Video {
                    width: self.width,
                    height: self.height,
                    format: PixelFormat::Rgb24,
                },
            ),
            (
                AUDIO_STREAM,
                StreamInfo::Audio {
                    sample_rate: SAMPLE_RATE,
                    channels: CHANNELS,
                },
            ),
        ]
    }

    fn frame_pts_us(&self) -> u64 {
        self.next_frame * 1_000_000 / self.fps as u64
    }

    fn block_pts_ns(&self) -> u64 {
        self.next_block * BLOCK_FRAMES as u64 * 1_000_000_000 / SAMPLE_RATE as u64
    }

    fn next_unit(&mut self) -> Option<DecodedUnit> {
        let video_us = self.frame_pts_us();
        let audio_ns = self.block_pts_ns();
        let video_due = video_us < self.end_us;
        let audio_due = audio_ns / 1000 < self.end_us;

        if video_due && (!audio_due || video_us <= audio_ns / 1000) {
            let frame = self.render_frame();
            self.next_frame += 1;
            Some(DecodedUnit {
                stream_id: VIDEO_STREAM,
                payload: MediaUnit::Video(frame),
                timestamp: video_us as i64,
                timestamp_unit: TimestampUnit::Microseconds,
            })
        } else if audio_due {
            let block = self.render_block();
            self.next_block += 1;
            Some(DecodedUnit {
                stream_id: AUDIO_STREAM,
                payload: MediaUnit::Audio(block),
                timestamp: audio_ns as i64,
                timestamp_unit: TimestampUnit::Nanoseconds,
            })
        } else {
            None
        }
    }

    fn render_frame(&self) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_width = (w / 16).max(1);
        let bar_x = (self.next_frame as usize * 4) % w;

        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                if x >= bar_x && x < bar_x + bar_width {
                    data.extend_from_slice(&[255, 255, 255]);
                } else {
                    data.extend_from_slice(&[(x * 255 / w) as u8, (y * 255 / h) as u8, 64]);
                }
            }
        }
        VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgb24,
            data,
        }
    }

    fn render_block(&mut self) -> AudioBlock {
        let step = TAU * TONE_HZ / SAMPLE_RATE as f32;
        let mut samples = Vec::with_capacity(BLOCK_FRAMES * CHANNELS as usize);
        for _ in 0..BLOCK_FRAMES {
            let s = 0.2 * self.phase.sin();
            for _ in 0..CHANNELS {
                samples.push(s);
            }
            self.phase = (self.phase + step) % TAU;
        }
        AudioBlock {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(seconds: f64) -> DemoArgs {
        DemoArgs {
            seconds,
            fps: 25,
            width: 32,
            height: 16,
            no_audio: true,
            late_burst: false,
        }
    }

    #[test]
    fn units_come_out_in_presentation_order() {
        let mut source = SyntheticSource::new(&opts(0.5)).unwrap();
        let mut last = 0;
        let (mut video, mut audio) = (0, 0);
        while let Some(unit) = source.next_unit() {
            let pts = unit.pts().as_micros();
            assert!(pts >= last, "{pts} after {last}");
            last = pts;
            match unit.payload {
                MediaUnit::Video(_) => video += 1,
                MediaUnit::Audio(_) => audio += 1,
            }
        }
        assert_eq!(video, 13);
        assert_eq!(audio, 25);
        assert!(last < 500_000);
    }

    #[test]
    fn frames_match_announced_geometry() {
        let mut source = SyntheticSource::new(&opts(1.0)).unwrap();
        let Some(DecodedUnit {
            payload: MediaUnit::Video(frame),
            ..
        }) = source.next_unit()
        else {
            panic!("first unit should be video");
        };
        assert_eq!(frame.data.len(), 32 * 16 * 3);
        assert_eq!(
            StreamInfo::from_unit(&MediaUnit::Video(frame)),
            source.streams()[0].1
        );
    }

    #[test]
    fn audio_blocks_are_stereo_and_bounded() {
        let mut source = SyntheticSource::new(&opts(1.0)).unwrap();
        let block = source.render_block();
        assert_eq!(block.frames(), BLOCK_FRAMES);
        assert!(block.samples.iter().all(|s| s.abs() <= 0.2));
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(SyntheticSource::new(&opts(0.0)).is_err());
        let mut bad = opts(1.0);
        bad.fps = 0;
        assert!(SyntheticSource::new(&bad).is_err());
    }

    #[test]
    fn null_audio_session_presents_every_frame() {
        let mut config = SchedulerConfig::default();
        config.video.late_window_ms = Some(500);
        let status = run(
            config,
            Output {
                device: None,
                audio_buffer_ms: 100,
            },
            &opts(0.3),
        )
        .unwrap();

        let video = status.iter().find(|s| s.stream_id == VIDEO_STREAM).unwrap();
        assert_eq!(video.enqueued, 8);
        assert_eq!(video.dispatched, 8);
        assert_eq!(video.dropped_late, 0);
        let audio = status.iter().find(|s| s.stream_id == AUDIO_STREAM).unwrap();
        assert_eq!(audio.dispatched, 15);
    }
}
