//! Per-session stream coordination.
//!
//! [`StreamCoordinator`] receives the decoder's callbacks, keeps one
//! [`TimedMediaQueue`] per stream id, and runs the session lifecycle:
//!
//! 1. `stream_opened`: restart the media clock at zero
//! 2. `stream_added`: set up the stream's sink and queue (opening an audio line)
//! 3. `route`: normalize the timestamp and enqueue, creating the queue on first use
//! 4. `stream_closed`: flush every queue, close them, wait for the delivery threads,
//!    release the sinks, then notify listeners of the end of media
//!
//! The coordinator is owned by a single thread (normally the decoder thread), so the
//! stream map needs no lock. Each queue runs independently on its own thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::clock::MediaClock;
use crate::config::SchedulerConfig;
use crate::media::{DecodedUnit, MediaUnit, StreamId, StreamInfo, StreamKind};
use crate::queue::TimedMediaQueue;
use crate::sink::{AudioLine, AudioSink, FrameConverter, MediaListeners, VideoSink};
use crate::status::{QueueCounters, StreamStatus};
use crate::time::{MediaTimestamp, TimestampUnit};

/// Opens an audio output for a stream.
pub trait AudioLineProvider: Send {
    fn open_line(
        &mut self,
        stream_id: StreamId,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioLine>>;
}

impl<F> AudioLineProvider for F
where
    F: FnMut(StreamId, u32, u16) -> Result<Box<dyn AudioLine>> + Send,
{
    fn open_line(
        &mut self,
        stream_id: StreamId,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioLine>> {
        self(stream_id, sample_rate, channels)
    }
}

enum StreamQueue {
    Video(TimedMediaQueue<VideoSink>),
    Audio(TimedMediaQueue<AudioSink>),
}

impl StreamQueue {
    fn kind(&self) -> StreamKind {
        match self {
            StreamQueue::Video(_) => StreamKind::Video,
            StreamQueue::Audio(_) => StreamKind::Audio,
        }
    }

    fn counters(&self) -> &Arc<QueueCounters> {
        match self {
            StreamQueue::Video(q) => q.counters(),
            StreamQueue::Audio(q) => q.counters(),
        }
    }

    fn enqueue(&self, unit: MediaUnit, pts: MediaTimestamp) -> bool {
        match self {
            StreamQueue::Video(q) => q.enqueue(unit, pts),
            StreamQueue::Audio(q) => q.enqueue(unit, pts),
        }
    }

    fn flush(&self) {
        match self {
            StreamQueue::Video(q) => q.flush(),
            StreamQueue::Audio(q) => q.flush(),
        }
    }

    /// Wait for an audio line to play out what it has buffered.
    fn drain_output(&self) {
        if let StreamQueue::Audio(q) = self {
            q.with_sink(|sink: &mut AudioSink| sink.drain());
        }
    }

    fn close(&self) {
        match self {
            StreamQueue::Video(q) => q.close(),
            StreamQueue::Audio(q) => q.close(),
        }
    }

    /// Wait for the delivery thread to stop, then release the sink it owned.
    fn release(self) {
        match self {
            StreamQueue::Video(q) => {
                q.join();
            }
            StreamQueue::Audio(q) => {
                if let Some(sink) = q.join() {
                    sink.release();
                }
            }
        }
    }
}

/// Owns the per-stream queues of one playback session.
pub struct StreamCoordinator {
    config: SchedulerConfig,
    clock: Arc<MediaClock>,
    lines: Box<dyn AudioLineProvider>,
    listeners: Arc<MediaListeners>,
    streams: HashMap<StreamId, StreamQueue>,
    announced: HashMap<StreamId, StreamInfo>,
    skipped: HashSet<StreamId>,
    primary_audio: Option<StreamId>,
}

impl StreamCoordinator {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<MediaClock>,
        lines: Box<dyn AudioLineProvider>,
        listeners: Arc<MediaListeners>,
    ) -> Self {
        Self {
            config,
            clock,
            lines,
            listeners,
            streams: HashMap::new(),
            announced: HashMap::new(),
            skipped: HashSet::new(),
            primary_audio: None,
        }
    }

    pub fn clock(&self) -> &Arc<MediaClock> {
        &self.clock
    }

    pub fn listeners(&self) -> &Arc<MediaListeners> {
        &self.listeners
    }

    /// A new container was opened: media time starts over at zero.
    pub fn stream_opened(&mut self) {
        self.clock.restart();
        tracing::debug!("session opened");
    }

    /// The decoder announced a stream. Sets up its sink and queue right away.
    pub fn stream_added(&mut self, stream_id: StreamId, info: StreamInfo) {
        self.announced.insert(stream_id, info);
        self.ensure_queue(stream_id, info);
    }

    /// Route one decoder callback. Returns `true` if the unit was queued.
    pub fn route(&mut self, unit: DecodedUnit) -> bool {
        self.route_unit(unit.stream_id, unit.payload, unit.timestamp, unit.timestamp_unit)
    }

    /// Route a unit to its stream queue, creating the queue on first use.
    ///
    /// Blocks while that queue is at capacity. Units for streams whose sink could not
    /// be opened are discarded.
    pub fn route_unit(
        &mut self,
        stream_id: StreamId,
        payload: MediaUnit,
        timestamp: i64,
        unit: TimestampUnit,
    ) -> bool {
        let pts = MediaTimestamp::from_unit(timestamp, unit);
        let info = self
            .announced
            .get(&stream_id)
            .copied()
            .unwrap_or_else(|| StreamInfo::from_unit(&payload));

        match self.ensure_queue(stream_id, info) {
            Some(queue) => queue.enqueue(payload, pts),
            None => false,
        }
    }

    fn ensure_queue(&mut self, stream_id: StreamId, info: StreamInfo) -> Option<&StreamQueue> {
        if self.skipped.contains(&stream_id) {
            return None;
        }
        if !self.streams.contains_key(&stream_id) {
            match self.create_queue(stream_id, info) {
                Ok(queue) => {
                    if queue.kind() == StreamKind::Audio && self.primary_audio.is_none() {
                        self.primary_audio = Some(stream_id);
                    }
                    self.streams.insert(stream_id, queue);
                }
                Err(e) => {
                    tracing::warn!(
                        stream = stream_id,
                        kind = %info.kind(),
                        "no sink for stream; skipping it: {e:#}"
                    );
                    self.skipped.insert(stream_id);
                    return None;
                }
            }
        }
        self.streams.get(&stream_id)
    }

    fn create_queue(&mut self, stream_id: StreamId, info: StreamInfo) -> Result<StreamQueue> {
        let params = self.config.for_kind(info.kind()).params();
        let name = format!("{} stream {stream_id}", info.kind());

        let queue = match info {
            StreamInfo::Video {
                width,
                height,
                format,
            } => {
                let sink = VideoSink::new(
                    stream_id,
                    FrameConverter::new(width, height, format),
                    self.listeners.clone(),
                );
                StreamQueue::Video(TimedMediaQueue::spawn(
                    name,
                    stream_id,
                    params,
                    self.clock.clone(),
                    sink,
                )?)
            }
            StreamInfo::Audio {
                sample_rate,
                channels,
            } => {
                let line = self.lines.open_line(stream_id, sample_rate, channels)?;
                let sink = AudioSink::new(stream_id, sample_rate, channels, line);
                StreamQueue::Audio(TimedMediaQueue::spawn(
                    name,
                    stream_id,
                    params,
                    self.clock.clone(),
                    sink,
                )?)
            }
        };

        tracing::info!(stream = stream_id, kind = %info.kind(), "stream queue created");
        Ok(queue)
    }

    /// Block until every queue has handled what it holds, then let audio lines play out.
    pub fn flush_all(&self) {
        for queue in self.streams.values() {
            queue.flush();
        }
        for queue in self.streams.values() {
            queue.drain_output();
        }
    }

    /// Close every queue, wait for each delivery thread, then release the sinks.
    pub fn close_all(&mut self) {
        for queue in self.streams.values() {
            queue.close();
        }
        for (_, queue) in self.streams.drain() {
            queue.release();
        }
        self.primary_audio = None;
    }

    /// The session ended: drain, tear down, and announce the end of media once.
    pub fn stream_closed(&mut self) {
        self.flush_all();
        self.close_all();
        self.announced.clear();
        self.skipped.clear();
        self.listeners.fire_end_of_media();
        tracing::info!("session closed");
    }

    /// First audio stream that got an output line in this session.
    pub fn primary_audio_stream(&self) -> Option<StreamId> {
        self.primary_audio
    }

    /// Whether units for `stream_id` are being discarded for lack of a sink.
    pub fn is_skipped(&self, stream_id: StreamId) -> bool {
        self.skipped.contains(&stream_id)
    }

    pub fn status(&self) -> Vec<StreamStatus> {
        let mut out: Vec<_> = self
            .streams
            .iter()
            .map(|(id, q)| q.counters().snapshot(*id, q.kind()))
            .collect();
        out.sort_by_key(|s| s.stream_id);
        out
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        if !self.streams.is_empty() {
            self.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{AudioBlock, PixelFormat, VideoFrame};
    use crate::sink::audio_tests::RecordingLine;
    use crate::sink::tests::RecordingListener;
    use crate::sink::{MediaListener, NewImage};
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn video(pts_ms: i64) -> DecodedUnit {
        DecodedUnit {
            stream_id: 0,
            payload: MediaUnit::Video(VideoFrame {
                width: 2,
                height: 2,
                format: PixelFormat::Gray8,
                data: vec![0; 4],
            }),
            timestamp: pts_ms,
            timestamp_unit: TimestampUnit::Milliseconds,
        }
    }

    fn audio(stream_id: StreamId, pts_us: i64) -> DecodedUnit {
        DecodedUnit {
            stream_id,
            payload: MediaUnit::Audio(AudioBlock {
                sample_rate: 48_000,
                channels: 2,
                samples: vec![0.0; 960],
            }),
            timestamp: pts_us,
            timestamp_unit: TimestampUnit::Microseconds,
        }
    }

    struct Fixture {
        coordinator: StreamCoordinator,
        listener: Arc<RecordingListener>,
        line_log: Arc<Mutex<Vec<String>>>,
        opened: Arc<AtomicUsize>,
    }

    fn fixture(fail_lines: bool) -> Fixture {
        let wall = Arc::new(ManualClock::new(0));
        let clock = Arc::new(MediaClock::new(wall));
        let listeners = MediaListeners::shared();
        let listener = Arc::new(RecordingListener::default());
        listeners.add(listener.clone() as Arc<dyn MediaListener>);

        let line = RecordingLine::default();
        let line_log = line.log.clone();
        let opened = Arc::new(AtomicUsize::new(0));
        let opened_in = opened.clone();
        let provider = move |_id: StreamId, _rate: u32, _ch: u16| -> Result<Box<dyn AudioLine>> {
            opened_in.fetch_add(1, Ordering::SeqCst);
            if fail_lines {
                return Err(anyhow!("no audio device"));
            }
            Ok(Box::new(line.clone()))
        };

        let mut coordinator = StreamCoordinator::new(
            SchedulerConfig::default(),
            clock,
            Box::new(provider),
            listeners,
        );
        coordinator.stream_opened();
        Fixture {
            coordinator,
            listener,
            line_log,
            opened,
        }
    }

    #[test]
    fn first_unit_creates_queue_and_is_presented() {
        let mut f = fixture(false);
        assert!(f.coordinator.route(video(0)));
        assert!(f.coordinator.route(video(16)));
        f.coordinator.flush_all();

        assert_eq!(*f.listener.images.lock().unwrap(), vec![(0, 0), (0, 16_000)]);
        let status = f.coordinator.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].kind, StreamKind::Video);
        assert_eq!(status[0].dispatched, 2);
    }

    #[test]
    fn stream_added_sets_up_queue_before_first_unit() {
        let mut f = fixture(false);
        f.coordinator.stream_added(
            1,
            StreamInfo::Audio {
                sample_rate: 48_000,
                channels: 2,
            },
        );
        assert_eq!(f.opened.load(Ordering::SeqCst), 1);
        assert_eq!(f.coordinator.status()[0].stream_id, 1);
        assert_eq!(f.coordinator.primary_audio_stream(), Some(1));

        assert!(f.coordinator.route(audio(1, 0)));
        assert_eq!(f.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_audio_device_skips_only_that_stream() {
        let mut f = fixture(true);
        assert!(!f.coordinator.route(audio(1, 0)));
        assert!(!f.coordinator.route(audio(1, 20_000)));
        assert!(f.coordinator.is_skipped(1));
        // The "no sink" warning is logged on the path that calls the provider, so a
        // single open attempt means a single warning.
        assert_eq!(f.opened.load(Ordering::SeqCst), 1);

        assert!(f.coordinator.route(video(0)));
        f.coordinator.flush_all();
        assert_eq!(f.listener.images.lock().unwrap().len(), 1);
        assert_eq!(f.coordinator.primary_audio_stream(), None);
    }

    #[test]
    fn wrong_payload_kind_is_rejected_without_stopping_stream() {
        let mut f = fixture(false);
        assert!(f.coordinator.route(video(0)));
        assert!(f.coordinator.route(audio(0, 1_000)));
        assert!(f.coordinator.route(video(2)));
        f.coordinator.flush_all();

        let status = &f.coordinator.status()[0];
        assert_eq!(status.rejected, 1);
        assert_eq!(status.dispatched, 2);
    }

    /// Records how much line activity happened before end of media was announced.
    struct EndProbe {
        line_log: Arc<Mutex<Vec<String>>>,
        seen: Mutex<Option<Vec<String>>>,
    }

    impl MediaListener for EndProbe {
        fn on_new_image(&self, _event: &NewImage) {}

        fn on_end_of_media(&self) {
            *self.seen.lock().unwrap() = Some(self.line_log.lock().unwrap().clone());
        }
    }

    #[test]
    fn stream_closed_tears_down_in_order() {
        let mut f = fixture(false);
        let probe = Arc::new(EndProbe {
            line_log: f.line_log.clone(),
            seen: Mutex::new(None),
        });
        f.coordinator
            .listeners()
            .add(probe.clone() as Arc<dyn MediaListener>);

        assert!(f.coordinator.route(audio(1, 0)));
        assert!(f.coordinator.route(audio(1, 10_000)));
        assert!(f.coordinator.route(video(0)));
        f.coordinator.stream_closed();

        let seen = probe.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen, vec!["write 480", "write 480", "drain", "drain", "close"]);
        assert_eq!(f.listener.end_of_media.load(Ordering::SeqCst), 1);
        assert!(f.coordinator.status().is_empty());
    }

    #[test]
    fn close_all_then_reopen_starts_fresh_session() {
        let mut f = fixture(false);
        assert!(f.coordinator.route(video(0)));
        f.coordinator.stream_closed();

        f.coordinator.stream_opened();
        assert!(f.coordinator.route(video(0)));
        f.coordinator.flush_all();
        assert_eq!(f.coordinator.status()[0].dispatched, 1);
        assert_eq!(f.listener.images.lock().unwrap().len(), 2);
    }
}
