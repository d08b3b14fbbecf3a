//! Beacon gateway replay tool
//!
//! Feeds captured advertisements through the full upstream pipeline against
//! a simulated broker and prints every message that would be published.

mod replay;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use settings::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON-lines capture of decoded frames
    Replay {
        /// Capture file, one frame per line
        capture: PathBuf,
        /// Settings file (defaults to the user config directory)
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Playback speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },
    /// Print the effective settings as JSON
    PrintSettings {
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, published messages to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "beacon_gateway=info,beacon_protocol=info,beacon_upstream=info,beacon_sim=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            capture,
            settings,
            speed,
        } => {
            let settings = Settings::load(settings.as_deref())?;
            let frames = replay::load_capture(&capture)?;
            tracing::info!(
                "Starting replay of {} as gateway {}",
                capture.display(),
                settings.upstream.gateway_id
            );
            replay::run(settings, frames, speed).await?;
        }
        Command::PrintSettings { settings } => {
            let settings = Settings::load(settings.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
