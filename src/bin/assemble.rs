//! assemble - encode a frame directory into a timelapse video
//!
//! Runs the external encoder in the foreground; Ctrl-C stops it gracefully and
//! escalates to a kill after the grace period.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use timelapse_kernel::{
    encoder::{DEFAULT_FRAMERATE, DEFAULT_QUALITY},
    AssemblyRequest, CancelToken, EncoderSettings, EncoderSupervisor, JobState,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Assemble captured frames into a video")]
struct Args {
    /// Output frames per second (<= 0 selects 60).
    #[arg(long, default_value_t = i64::from(DEFAULT_FRAMERATE), allow_negative_numbers = true)]
    framerate: i64,
    /// 1 = medium, 2 = faster, 3 = veryfast.
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    preset: i64,
    /// Constant rate factor, 0-51 (lower is better).
    #[arg(long, default_value_t = i64::from(DEFAULT_QUALITY), allow_negative_numbers = true)]
    quality: i64,
    #[arg(long, env = "CAM_FRAME_PATH")]
    frames_dir: PathBuf,
    #[arg(long, env = "CAM_VIDEO_PATH")]
    video_dir: PathBuf,
    /// Encoder program.
    #[arg(long, env = "TIMELAPSE_ENCODER", default_value = "ffmpeg")]
    encoder: PathBuf,
    /// Seconds to wait after a graceful stop before killing the encoder.
    #[arg(long, default_value_t = 2)]
    grace_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = EncoderSettings::new(args.encoder, args.frames_dir, args.video_dir);
    settings.grace = Duration::from_secs(args.grace_secs);
    let supervisor = EncoderSupervisor::new(settings);
    let request = AssemblyRequest::from_raw(args.framerate, args.preset, args.quality);

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("Ctrl-C received, stopping encoder");
        handler_cancel.cancel();
    })
    .context("set Ctrl-C handler")?;

    let outcome = supervisor.assemble(request, &cancel)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome.state {
        JobState::Succeeded | JobState::Cancelled => Ok(()),
        other => Err(anyhow!("encoder finished with {:?}", other)),
    }
}
