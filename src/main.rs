//! Viska CLI entry point.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use viska::cli::{commands, Cli, Commands};
use viska::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("viska={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&std::path::PathBuf::from(path)))?,
        None => Settings::load()?,
    };

    // Execute command
    match &cli.command {
        Commands::Init => {
            commands::run_init(&settings)?;
        }

        Commands::Ingest { url } => {
            commands::run_ingest(url, settings).await?;
        }

        Commands::Ask {
            question,
            videos,
            mode,
        } => {
            commands::run_ask(question, videos, mode, settings).await?;
        }

        Commands::List => {
            commands::run_list(settings).await?;
        }

        Commands::Cancel { video_id, delete } => {
            commands::run_cancel(video_id, *delete, settings).await?;
        }

        Commands::Quota => {
            commands::run_quota(settings).await?;
        }

        Commands::Cleanup => {
            commands::run_cleanup(settings).await?;
        }

        Commands::Insights { videos } => {
            commands::run_insights(videos, settings).await?;
        }

        Commands::Config => {
            commands::run_config(&settings)?;
        }
    }

    Ok(())
}
