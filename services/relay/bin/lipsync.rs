//! Runs one offline lip-sync render from the command line.
//!
//! Compositor settings come from the same environment variables as the
//! services; the outcome is printed as JSON on stdout.

use anyhow::Context;
use callcenter_relay::{config::Config, lipsync::LipSyncCompositor};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Render a lip-synced video from a source clip and an audio track")]
struct Cli {
    /// Source video of the presenter.
    #[arg(long)]
    video: PathBuf,

    /// Synthesized speech, in any format ffmpeg can read.
    #[arg(long)]
    audio: PathBuf,

    /// Copy the rendered video here instead of leaving it in the temp dir.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let audio = tokio::fs::read(&cli.audio)
        .await
        .with_context(|| format!("Failed to read audio {}", cli.audio.display()))?;

    let compositor = LipSyncCompositor::new(config.lipsync);
    info!(
        engine_ready = compositor.is_engine_ready().await,
        "Starting render."
    );
    let mut outcome = compositor.generate_synced_video(&cli.video, &audio).await;

    if let (Some(dest), Some(rendered)) = (&cli.out, &outcome.video_path) {
        tokio::fs::copy(rendered, dest)
            .await
            .with_context(|| format!("Failed to copy render to {}", dest.display()))?;
        tokio::fs::remove_file(rendered).await.ok();
        outcome.video_path = Some(dest.clone());
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
