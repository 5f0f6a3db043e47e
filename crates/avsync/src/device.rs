//! CPAL-backed audio lines.
//!
//! A [`CpalLine`] owns a dedicated thread that builds the output stream and keeps it alive
//! (CPAL streams are not `Send`). Samples reach the device callback through a
//! [`SampleBuffer`]; the sink's write blocks while that buffer is full, which paces the
//! audio queue at the device's playback rate.
//!
//! The line plays at the stream's own sample rate. Devices that cannot do that rate are
//! reported as an error, and the coordinator skips the stream.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{SampleBuffer, capacity_samples};
use crate::coordinator::AudioLineProvider;
use crate::media::{AudioBlock, StreamId};
use crate::sink::AudioLine;

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.to_string(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Names of the host's output devices, in enumeration order.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

/// Choose an output config that runs at exactly `rate`.
///
/// Among ranges covering the rate, prefers a matching channel count, then the sample
/// format that needs the least conversion.
pub fn pick_output_config(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<((bool, u8), cpal::SupportedStreamConfigRange)> = None;
    for range in device.supported_output_configs()? {
        let Some(rank) = rank_range(
            range.min_sample_rate(),
            range.max_sample_rate(),
            range.channels(),
            sample_format_rank(range.sample_format()),
            rate,
            channels,
        ) else {
            continue;
        };
        let replace = match &best {
            None => true,
            Some((b_rank, _)) => is_better_rank(rank, *b_rank),
        };
        if replace {
            best = Some((rank, range));
        }
    }

    match best {
        Some((_, range)) => Ok(range.with_sample_rate(rate)),
        None => bail!("output device cannot play {rate} Hz"),
    }
}

/// Prefer a fixed buffer size if the device advertises one.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

// (channel count differs, format rank); lower is better. `None` if `rate` is out of range.
fn rank_range(
    min_rate: u32,
    max_rate: u32,
    range_channels: u16,
    format_rank: u8,
    rate: u32,
    channels: u16,
) -> Option<(bool, u8)> {
    if rate < min_rate || rate > max_rate || format_rank >= 10 {
        return None;
    }
    Some((range_channels != channels, format_rank))
}

fn is_better_rank(candidate: (bool, u8), best: (bool, u8)) -> bool {
    candidate < best
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Map one source frame to output channel `dst_ch`.
///
/// Mono is duplicated, stereo is averaged down to mono, and other layouts clamp to the
/// last available source channel.
fn map_sample(frame: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    let get = |ch: usize| frame.get(ch).copied().unwrap_or(0.0);
    match (frame.len(), dst_channels) {
        (2, 1) => 0.5 * (get(0) + get(1)),
        (1, _) => get(0),
        (n, _) => get(dst_ch.min(n.saturating_sub(1))),
    }
}

/// Opens a [`CpalLine`] per audio stream on the configured device.
#[derive(Clone, Debug)]
pub struct CpalLineProvider {
    device: Option<String>,
    buffer_ms: u64,
    refill_max_frames: usize,
}

impl CpalLineProvider {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            buffer_ms: 200,
            refill_max_frames: 1024,
        }
    }

    /// Device-side buffering between the sink and the callback.
    pub fn with_buffer_ms(mut self, buffer_ms: u64) -> Self {
        self.buffer_ms = buffer_ms;
        self
    }
}

impl AudioLineProvider for CpalLineProvider {
    fn open_line(
        &mut self,
        stream_id: StreamId,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioLine>> {
        let line = CpalLine::open(stream_id, sample_rate, channels, self)?;
        Ok(Box::new(line))
    }
}

pub struct CpalLine {
    stream_id: StreamId,
    sample_rate: u32,
    buffer: Arc<SampleBuffer>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalLine {
    fn open(
        stream_id: StreamId,
        sample_rate: u32,
        channels: u16,
        opts: &CpalLineProvider,
    ) -> Result<Self> {
        let buffer = Arc::new(SampleBuffer::new(
            channels,
            capacity_samples(sample_rate, channels, opts.buffer_ms),
        ));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let output = OutputThread {
            buffer: buffer.clone(),
            device: opts.device.clone(),
            sample_rate,
            channels,
            refill_max_frames: opts.refill_max_frames.max(1),
        };
        let thread = std::thread::Builder::new()
            .name(format!("audio line {stream_id}"))
            .spawn(move || output.run(ready_tx, shutdown_rx))
            .context("spawn audio line thread")?;

        let opened = ready_rx.recv().context("audio line thread exited");
        let device_name = match opened {
            Ok(Ok(name)) => name,
            Ok(Err(e)) | Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };
        tracing::info!(
            stream = stream_id,
            device = %device_name,
            rate_hz = sample_rate,
            channels,
            "audio line opened"
        );

        Ok(Self {
            stream_id,
            sample_rate,
            buffer,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.buffer.close();
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!(
                stream = self.stream_id,
                played_frames = self.buffer.played_frames(),
                underruns = self.buffer.underruns(),
                "audio line closed"
            );
        }
    }
}

impl AudioLine for CpalLine {
    fn on_audio_block(&mut self, block: &AudioBlock) -> Result<()> {
        if !self.buffer.push_blocking(&block.samples) {
            bail!("audio line is closed");
        }
        Ok(())
    }

    fn drain(&mut self) {
        let buffered = self.buffer.len_frames() as u64 * 1000 / self.sample_rate.max(1) as u64;
        let timeout = Duration::from_millis(buffered + 500);
        if !self.buffer.wait_until_empty(timeout) {
            tracing::warn!(stream = self.stream_id, "audio line did not drain in time");
        }
    }

    fn close(mut self: Box<Self>) {
        self.stop();
    }
}

impl Drop for CpalLine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct OutputThread {
    buffer: Arc<SampleBuffer>,
    device: Option<String>,
    sample_rate: u32,
    channels: u16,
    refill_max_frames: usize,
}

impl OutputThread {
    fn run(self, ready: Sender<Result<String>>, shutdown: Receiver<()>) {
        let stream = match self.open_stream() {
            Ok((stream, name)) => {
                let _ = ready.send(Ok(name));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        // Returns once the line drops its sender.
        let _ = shutdown.recv();
        drop(stream);
    }

    fn open_stream(&self) -> Result<(cpal::Stream, String)> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.device.as_deref())?;
        let name = device.description()?.to_string();

        let config = pick_output_config(&device, self.sample_rate, self.channels)
            .with_context(|| format!("configure {name}"))?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, &stream_config),
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, &stream_config),
            cpal::SampleFormat::I32 => self.build_stream::<i32>(&device, &stream_config),
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, &stream_config),
            other => Err(anyhow!("Unsupported sample format: {other:?}")),
        }?;
        stream.play()?;
        Ok((stream, name))
    }

    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels_out = (config.channels as usize).max(1);
        let src_channels = self.buffer.channels();
        let refill_max_frames = self.refill_max_frames;
        let buffer = self.buffer.clone();

        let mut src: Vec<f32> = Vec::new();
        let mut pos = 0usize;

        let err_fn = |err| tracing::warn!("stream error: {err}");
        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / channels_out;
                for frame in 0..frames {
                    if pos >= src.len() {
                        pos = 0;
                        match buffer.pop_available(refill_max_frames) {
                            Some(v) => src = v,
                            None => {
                                src.clear();
                                buffer.note_underrun();
                                data[frame * channels_out..]
                                    .fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                                return;
                            }
                        }
                    }
                    let source = &src[pos..pos + src_channels];
                    for ch in 0..channels_out {
                        data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(
                            map_sample(source, channels_out, ch),
                        );
                    }
                    pos += src_channels;
                }
            },
            err_fn,
            None,
        )?;
        Ok(stream)
    }
}
