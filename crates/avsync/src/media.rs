//! Decoded media units handed to the scheduler.
//!
//! The decoder is an external collaborator; these types are the narrow shape the
//! scheduler needs from it: raw pixels or interleaved samples plus enough format
//! information to deliver them.

use std::fmt;

use serde::Serialize;

use crate::time::{MediaTimestamp, TimestampUnit};

/// Small integer identifying a stream inside a container.
pub type StreamId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
        }
    }
}

/// Pixel layouts the frame converter understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One decoded picture, tightly packed (no row padding).
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// One block of decoded audio, interleaved `f32` samples.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBlock {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Displayable RGB24 image produced from a [`VideoFrame`].
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Payload of a decoded unit.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaUnit {
    Video(VideoFrame),
    Audio(AudioBlock),
}

impl MediaUnit {
    pub fn kind(&self) -> StreamKind {
        match self {
            MediaUnit::Video(_) => StreamKind::Video,
            MediaUnit::Audio(_) => StreamKind::Audio,
        }
    }
}

/// Per-stream format information announced when a stream is added.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamInfo {
    Video {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

impl StreamInfo {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamInfo::Video { .. } => StreamKind::Video,
            StreamInfo::Audio { .. } => StreamKind::Audio,
        }
    }

    /// Infer stream format from the first unit seen on a stream that was never announced.
    pub fn from_unit(unit: &MediaUnit) -> Self {
        match unit {
            MediaUnit::Video(f) => StreamInfo::Video {
                width: f.width,
                height: f.height,
                format: f.format,
            },
            MediaUnit::Audio(b) => StreamInfo::Audio {
                sample_rate: b.sample_rate,
                channels: b.channels,
            },
        }
    }
}

/// One decoder callback: a unit, the stream it belongs to, and its raw timestamp.
#[derive(Clone, Debug)]
pub struct DecodedUnit {
    pub stream_id: StreamId,
    pub payload: MediaUnit,
    pub timestamp: i64,
    pub timestamp_unit: TimestampUnit,
}

impl DecodedUnit {
    pub fn pts(&self) -> MediaTimestamp {
        MediaTimestamp::from_unit(self.timestamp, self.timestamp_unit)
    }
}
