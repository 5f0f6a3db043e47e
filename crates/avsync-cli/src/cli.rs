use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "avsync", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Scheduler config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the buffered presentation time per queue (ms)
    #[arg(long)]
    pub capacity_ms: Option<u64>,

    /// Override how late a video frame may be before it is dropped (ms)
    #[arg(long)]
    pub late_window_ms: Option<u64>,

    /// Audio device buffer between the sink and the output callback (ms)
    #[arg(long, default_value_t = 200)]
    pub audio_buffer_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a synthetic test pattern and tone through the scheduler
    Demo(DemoArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DemoArgs {
    /// Length of the generated media
    #[arg(long, default_value_t = 5.0)]
    pub seconds: f64,

    /// Video frame rate
    #[arg(long, default_value_t = 25)]
    pub fps: u32,

    #[arg(long, default_value_t = 320)]
    pub width: u32,

    #[arg(long, default_value_t = 180)]
    pub height: u32,

    /// Send audio to a silent paced line instead of a device
    #[arg(long)]
    pub no_audio: bool,

    /// Stall the decoder halfway through so a burst of frames arrives late
    #[arg(long)]
    pub late_burst: bool,
}
