use std::time::Duration;

use crate::media::{AudioBlock, MediaUnit, StreamId, StreamKind};
use crate::sink::{Sink, SinkError};
use crate::time::MediaTimestamp;

/// An opened audio output for one stream.
///
/// `on_audio_block` is expected to block while the output's own buffer is full. That
/// blocking is the pacing mechanism for audio: audio queues never delay items
/// themselves.
pub trait AudioLine: Send {
    fn on_audio_block(&mut self, block: &AudioBlock) -> anyhow::Result<()>;

    /// Block until everything written so far has been played.
    fn drain(&mut self) {}

    /// Stop output and release the device.
    fn close(self: Box<Self>) {}
}

/// Line that plays nothing but blocks for each block's duration, like a real device.
///
/// Used when no output device is wanted (`--no-audio`, headless runs).
#[derive(Debug, Default)]
pub struct PacedNullLine {
    written_frames: u64,
}

impl PacedNullLine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioLine for PacedNullLine {
    fn on_audio_block(&mut self, block: &AudioBlock) -> anyhow::Result<()> {
        let frames = block.frames() as u64;
        self.written_frames += frames;
        if block.sample_rate > 0 && frames > 0 {
            std::thread::sleep(Duration::from_micros(
                frames.saturating_mul(1_000_000) / block.sample_rate as u64,
            ));
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        tracing::debug!(written_frames = self.written_frames, "null audio line closed");
    }
}

/// Sink for one audio stream.
pub struct AudioSink {
    stream_id: StreamId,
    sample_rate: u32,
    channels: u16,
    line: Box<dyn AudioLine>,
}

impl AudioSink {
    pub fn new(
        stream_id: StreamId,
        sample_rate: u32,
        channels: u16,
        line: Box<dyn AudioLine>,
    ) -> Self {
        Self {
            stream_id,
            sample_rate,
            channels,
            line,
        }
    }

    pub fn drain(&mut self) {
        self.line.drain();
    }

    /// Drain and close the line. Only called once the owning queue has stopped.
    pub fn release(mut self) {
        tracing::debug!(stream = self.stream_id, "releasing audio line");
        self.line.drain();
        self.line.close();
    }

    fn play(&mut self, block: AudioBlock) -> Result<(), SinkError> {
        if block.sample_rate != self.sample_rate || block.channels != self.channels {
            return Err(SinkError::Malformed(format!(
                "block is {} Hz x{} but line was opened for {} Hz x{}",
                block.sample_rate, block.channels, self.sample_rate, self.channels
            )));
        }
        self.line.on_audio_block(&block).map_err(SinkError::Output)
    }
}

impl Sink for AudioSink {
    type Item = MediaUnit;

    fn dispatch(&mut self, item: MediaUnit, _pts: MediaTimestamp) -> Result<(), SinkError> {
        match item {
            MediaUnit::Audio(block) => self.play(block),
            other => Err(SinkError::UnexpectedPayload {
                expected: StreamKind::Audio,
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::{PixelFormat, VideoFrame};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Line that records what happened to it.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingLine {
        pub(crate) log: Arc<Mutex<Vec<String>>>,
    }

    impl AudioLine for RecordingLine {
        fn on_audio_block(&mut self, block: &AudioBlock) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("write {}", block.frames()));
            Ok(())
        }

        fn drain(&mut self) {
            self.log.lock().unwrap().push("drain".to_string());
        }

        fn close(self: Box<Self>) {
            self.log.lock().unwrap().push("close".to_string());
        }
    }

    fn block(frames: usize) -> AudioBlock {
        AudioBlock {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; frames * 2],
        }
    }

    #[test]
    fn dispatch_writes_and_release_drains_then_closes() {
        let line = RecordingLine::default();
        let log = line.log.clone();
        let mut sink = AudioSink::new(1, 48_000, 2, Box::new(line));

        sink.dispatch(MediaUnit::Audio(block(480)), MediaTimestamp::ZERO)
            .unwrap();
        sink.release();

        assert_eq!(*log.lock().unwrap(), vec!["write 480", "drain", "close"]);
    }

    #[test]
    fn format_mismatch_is_rejected() {
        let mut sink = AudioSink::new(1, 44_100, 2, Box::new(RecordingLine::default()));
        let err = sink
            .dispatch(MediaUnit::Audio(block(10)), MediaTimestamp::ZERO)
            .unwrap_err();
        assert!(matches!(err, SinkError::Malformed(_)));
    }

    #[test]
    fn video_payload_is_rejected() {
        let mut sink = AudioSink::new(1, 48_000, 2, Box::new(RecordingLine::default()));
        let frame = VideoFrame {
            width: 1,
            height: 1,
            format: PixelFormat::Gray8,
            data: vec![0],
        };
        let err = sink
            .dispatch(MediaUnit::Video(frame), MediaTimestamp::ZERO)
            .unwrap_err();
        assert!(matches!(err, SinkError::UnexpectedPayload { .. }));
    }

    #[test]
    fn paced_null_line_blocks_for_block_duration() {
        let mut line = PacedNullLine::new();
        let started = Instant::now();
        line.on_audio_block(&block(960)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(line.written_frames, 960);
        Box::new(line).close();
    }
}
