//! Scheduler configuration.
//!
//! Loaded from TOML; every field is optional and falls back to defaults tuned for
//! local playback:
//!
//! ```toml
//! [video]
//! capacity_ms = 1000
//! early_window_ms = 50
//! late_window_ms = 50
//!
//! [audio]
//! capacity_ms = 1000
//! # early/late windows omitted: audio is paced by the output line
//! ```
//!
//! `unbounded_windows = true` disables both windows for a section.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::media::StreamKind;
use crate::queue::QueueParams;

/// Tuning for one kind of stream queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum buffered presentation time before the decoder is blocked.
    pub capacity_ms: u64,
    /// Delay items at least this far ahead of the clock. `None` = never delay.
    pub early_window_ms: Option<u64>,
    /// Drop items more than this far behind the clock. `None` = never drop.
    pub late_window_ms: Option<u64>,
    /// Hard bound on queued items regardless of their timestamps.
    pub max_items: usize,
}

impl QueueConfig {
    pub fn video_default() -> Self {
        Self {
            capacity_ms: 1000,
            early_window_ms: Some(50),
            late_window_ms: Some(50),
            max_items: 256,
        }
    }

    pub fn audio_default() -> Self {
        Self {
            capacity_ms: 1000,
            early_window_ms: None,
            late_window_ms: None,
            max_items: 256,
        }
    }

    pub fn params(&self) -> QueueParams {
        QueueParams {
            capacity: Duration::from_millis(self.capacity_ms),
            early_window: self.early_window_ms.map(Duration::from_millis),
            late_window: self.late_window_ms.map(Duration::from_millis),
            max_items: self.max_items.max(1),
        }
    }

    fn apply(mut self, file: Option<&QueueFileConfig>) -> Self {
        let Some(file) = file else {
            return self;
        };
        if let Some(v) = file.capacity_ms {
            self.capacity_ms = v;
        }
        if let Some(v) = file.early_window_ms {
            self.early_window_ms = Some(v);
        }
        if let Some(v) = file.late_window_ms {
            self.late_window_ms = Some(v);
        }
        if file.unbounded_windows == Some(true) {
            self.early_window_ms = None;
            self.late_window_ms = None;
        }
        if let Some(v) = file.max_items {
            self.max_items = v;
        }
        self
    }
}

/// One `[video]` / `[audio]` section as written in TOML.
#[derive(Debug, Default, Deserialize)]
pub struct QueueFileConfig {
    pub capacity_ms: Option<u64>,
    pub early_window_ms: Option<u64>,
    pub late_window_ms: Option<u64>,
    /// Disable both windows (never delay, never drop).
    pub unbounded_windows: Option<bool>,
    pub max_items: Option<usize>,
}

/// Configuration file schema.
#[derive(Debug, Default, Deserialize)]
pub struct SchedulerFileConfig {
    pub video: Option<QueueFileConfig>,
    pub audio: Option<QueueFileConfig>,
}

/// Resolved scheduler configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub video: QueueConfig,
    pub audio: QueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            video: QueueConfig::video_default(),
            audio: QueueConfig::audio_default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse TOML, resolving absent fields to per-kind defaults.
    pub fn parse(raw: &str) -> Result<Self> {
        let file = toml::from_str::<SchedulerFileConfig>(raw)?;
        Ok(Self {
            video: QueueConfig::video_default().apply(file.video.as_ref()),
            audio: QueueConfig::audio_default().apply(file.audio.as_ref()),
        })
    }

    pub fn for_kind(&self, kind: StreamKind) -> &QueueConfig {
        match kind {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }
}
