//! avsync: drives the presentation scheduler with a synthetic decoder.
//!
//! `avsync demo` generates a moving test pattern and a sine tone, routes them through a
//! [`StreamCoordinator`](avsync::coordinator::StreamCoordinator), and prints the final queue
//! counters as JSON. Use `--late-burst` to watch late frames being dropped and
//! `RUST_LOG=avsync=debug` for per-second queue status.

mod cli;
mod demo;

use anyhow::{Result, bail};
use avsync::config::SchedulerConfig;
use avsync::device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,avsync=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for (i, name) in device::list_devices(&host)?.iter().enumerate() {
            println!("#{i}: {name}");
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    match &args.cmd {
        Some(cli::Command::Demo(opts)) => {
            let status = demo::run(
                config,
                demo::Output {
                    device: args.device.clone(),
                    audio_buffer_ms: args.audio_buffer_ms,
                },
                opts,
            )?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        None => bail!("no command given; try `avsync demo`"),
    }

    Ok(())
}

fn load_config(args: &cli::Args) -> Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(ms) = args.capacity_ms {
        config.video.capacity_ms = ms;
        config.audio.capacity_ms = ms;
    }
    if let Some(ms) = args.late_window_ms {
        config.video.late_window_ms = Some(ms);
    }
    tracing::debug!(?config, "scheduler config");
    Ok(config)
}
