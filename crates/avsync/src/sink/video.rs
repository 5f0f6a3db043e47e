use std::sync::Arc;

use crate::media::{Image, MediaUnit, PixelFormat, StreamId, StreamKind, VideoFrame};
use crate::sink::{MediaListeners, NewImage, Sink, SinkError};
use crate::time::MediaTimestamp;

/// Converts decoded frames of one stream to packed RGB24 images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameConverter {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl FrameConverter {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    fn matches(&self, frame: &VideoFrame) -> bool {
        self.width == frame.width && self.height == frame.height && self.format == frame.format
    }

    /// Convert `frame` to RGB24.
    ///
    /// Frames whose data length does not match their declared geometry are rejected.
    pub fn convert(&self, frame: &VideoFrame) -> Result<Image, SinkError> {
        let pixels = self.width as usize * self.height as usize;
        let expected = pixels * self.format.bytes_per_pixel();
        if frame.data.len() != expected {
            return Err(SinkError::Malformed(format!(
                "{}x{} {:?} frame carries {} bytes, expected {}",
                frame.width,
                frame.height,
                frame.format,
                frame.data.len(),
                expected
            )));
        }

        let rgb = match self.format {
            PixelFormat::Rgb24 => frame.data.clone(),
            PixelFormat::Bgr24 => frame
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Rgba32 => frame
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Gray8 => frame.data.iter().flat_map(|&y| [y, y, y]).collect(),
        };

        Ok(Image {
            width: self.width,
            height: self.height,
            rgb,
        })
    }
}

/// Sink for one video stream: convert, then notify listeners.
pub struct VideoSink {
    stream_id: StreamId,
    converter: FrameConverter,
    listeners: Arc<MediaListeners>,
}

impl VideoSink {
    pub fn new(
        stream_id: StreamId,
        converter: FrameConverter,
        listeners: Arc<MediaListeners>,
    ) -> Self {
        Self {
            stream_id,
            converter,
            listeners,
        }
    }

    fn display(&mut self, frame: VideoFrame, pts: MediaTimestamp) -> Result<(), SinkError> {
        if !self.converter.matches(&frame) {
            tracing::info!(
                stream = self.stream_id,
                width = frame.width,
                height = frame.height,
                format = ?frame.format,
                "video format changed; rebuilding converter"
            );
            self.converter = FrameConverter::new(frame.width, frame.height, frame.format);
        }

        let image = self.converter.convert(&frame)?;
        self.listeners.fire_new_image(&NewImage {
            stream_id: self.stream_id,
            image: Arc::new(image),
            pts,
        });
        Ok(())
    }
}

impl Sink for VideoSink {
    type Item = MediaUnit;

    fn dispatch(&mut self, item: MediaUnit, pts: MediaTimestamp) -> Result<(), SinkError> {
        match item {
            MediaUnit::Video(frame) => self.display(frame, pts),
            other => Err(SinkError::UnexpectedPayload {
                expected: StreamKind::Video,
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioBlock;
    use crate::sink::MediaListener;
    use crate::sink::tests::RecordingListener;

    fn frame(format: PixelFormat, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            width: 2,
            height: 1,
            format,
            data,
        }
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let conv = FrameConverter::new(2, 1, PixelFormat::Bgr24);
        let img = conv
            .convert(&frame(PixelFormat::Bgr24, vec![1, 2, 3, 4, 5, 6]))
            .unwrap();
        assert_eq!(img.rgb, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn rgba_drops_alpha_and_gray_expands() {
        let conv = FrameConverter::new(2, 1, PixelFormat::Rgba32);
        let img = conv
            .convert(&frame(PixelFormat::Rgba32, vec![1, 2, 3, 255, 4, 5, 6, 255]))
            .unwrap();
        assert_eq!(img.rgb, vec![1, 2, 3, 4, 5, 6]);

        let conv = FrameConverter::new(2, 1, PixelFormat::Gray8);
        let img = conv.convert(&frame(PixelFormat::Gray8, vec![7, 9])).unwrap();
        assert_eq!(img.rgb, vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn short_frame_is_malformed() {
        let conv = FrameConverter::new(2, 1, PixelFormat::Rgb24);
        let err = conv
            .convert(&frame(PixelFormat::Rgb24, vec![0; 4]))
            .unwrap_err();
        assert!(matches!(err, SinkError::Malformed(_)));
    }

    #[test]
    fn dispatch_notifies_listeners_with_pts() {
        let listeners = MediaListeners::shared();
        let rec = Arc::new(RecordingListener::default());
        listeners.add(rec.clone() as Arc<dyn MediaListener>);
        let mut sink = VideoSink::new(4, FrameConverter::new(2, 1, PixelFormat::Rgb24), listeners);

        sink.dispatch(
            MediaUnit::Video(frame(PixelFormat::Rgb24, vec![0; 6])),
            MediaTimestamp::from_micros(16_000),
        )
        .unwrap();

        assert_eq!(*rec.images.lock().unwrap(), vec![(4, 16_000)]);
    }

    #[test]
    fn resolution_change_rebuilds_converter() {
        let listeners = MediaListeners::shared();
        let mut sink = VideoSink::new(0, FrameConverter::new(2, 1, PixelFormat::Rgb24), listeners);
        let bigger = VideoFrame {
            width: 1,
            height: 2,
            format: PixelFormat::Gray8,
            data: vec![1, 2],
        };
        sink.dispatch(MediaUnit::Video(bigger), MediaTimestamp::ZERO)
            .unwrap();
        assert_eq!(sink.converter, FrameConverter::new(1, 2, PixelFormat::Gray8));
    }

    #[test]
    fn audio_payload_is_rejected() {
        let mut sink = VideoSink::new(
            0,
            FrameConverter::new(2, 1, PixelFormat::Rgb24),
            MediaListeners::shared(),
        );
        let err = sink
            .dispatch(
                MediaUnit::Audio(AudioBlock {
                    sample_rate: 48_000,
                    channels: 2,
                    samples: vec![],
                }),
                MediaTimestamp::ZERO,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::UnexpectedPayload {
                expected: StreamKind::Video,
                found: StreamKind::Audio
            }
        ));
    }
}
