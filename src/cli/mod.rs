//! Command-line interface for Viska.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

/// Viska: a RAG platform for video transcripts.
#[derive(Parser)]
#[command(name = "viska", version, about)]
pub struct Cli {
    /// Path to a configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the default configuration file and data directories.
    Init,

    /// Ingest a video: transcribe, chunk, enrich, and index it.
    Ingest {
        /// Video URL.
        url: String,
    },

    /// Ask a question against your indexed videos.
    Ask {
        /// The question.
        question: String,
        /// Restrict to specific video ids (defaults to all completed videos).
        #[arg(short = 'V', long = "video")]
        videos: Vec<String>,
        /// Conversation mode (summarize, deep_dive, compare_sources, ...).
        #[arg(short, long, default_value = "default")]
        mode: String,
    },

    /// List your videos and their processing status.
    List,

    /// Cancel an in-flight video and reclaim its partial data.
    Cancel {
        /// Video id.
        video_id: String,
        /// Also soft-delete the video record.
        #[arg(long)]
        delete: bool,
    },

    /// Show quota usage for the current period.
    Quota,

    /// Run the maintenance sweeps once (stale jobs, orphans, reconciliation,
    /// memory consolidation).
    Cleanup,

    /// Build the topic mind map for a set of videos.
    Insights {
        /// Video ids (defaults to all completed videos).
        #[arg(short = 'V', long = "video")]
        videos: Vec<String>,
    },

    /// Print the active configuration.
    Config,
}
