use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use harbor_rip::{AppState, SupervisorEvent, EVENT_CHANNEL_CAPACITY};

/// Runs streaming-service downloaders and reports their progress as JSON lines.
#[derive(Parser)]
#[command(name = "harbor-rip")]
#[command(author, version, about)]
struct Cli {
    /// Supervisor configuration (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User settings written by the UI (JSON).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every URL found in the given text.
    Download {
        /// Service key: qobuz, deezer or tidal.
        #[arg(short, long)]
        service: String,

        /// Quality passed through to the downloader.
        #[arg(short, long, default_value = "27")]
        quality: String,

        /// URLs, or text containing them.
        #[arg(value_name = "TEXT", num_args = 1.., required = true)]
        text: Vec<String>,
    },

    /// Show recently completed downloads.
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let state = AppState::init(cli.config, cli.settings)?;

    match cli.command {
        Commands::Download {
            service,
            quality,
            text,
        } => download(&state, &service, &quality, &text.join("\n")).await,
        Commands::History { limit } => {
            for row in state.history(limit).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
    }
}

/// Start one session per URL and print every event until all of them finish.
async fn download(state: &AppState, service: &str, quality: &str, text: &str) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<SupervisorEvent>(EVENT_CHANNEL_CAPACITY);
    let manager = state.download_manager(event_tx)?;

    let orders = manager.start_batch(service, quality, text).await?;
    if orders.is_empty() {
        bail!("No http(s) URLs found in input");
    }

    let mut pending: HashSet<u64> = orders.into_iter().collect();
    let mut failed = 0usize;

    while !pending.is_empty() {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event.to_envelope())?);
                if event.is_terminal() {
                    pending.remove(&event.order());
                    if matches!(event, SupervisorEvent::DownloadError { .. }) {
                        failed += 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted, cancelling {} download(s)", pending.len());
                manager.shutdown().await;
            }
        }
    }

    if failed > 0 {
        bail!("{} download(s) failed", failed);
    }
    Ok(())
}
