//! CLI command implementations.

use crate::app::App;
use crate::cli::output;
use crate::config::Settings;
use crate::error::{Result, ViskaError};
use crate::models::{CleanupOption, VideoStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use uuid::Uuid;

fn parse_video_ids(raw: &[String]) -> Result<Vec<Uuid>> {
    raw.iter()
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|_| ViskaError::InvalidInput(format!("Invalid video id: {}", s)))
        })
        .collect()
}

/// All completed videos when no explicit selection was given.
fn resolve_video_ids(app: &App, user_id: Uuid, raw: &[String]) -> Result<Vec<Uuid>> {
    if !raw.is_empty() {
        return parse_video_ids(raw);
    }
    Ok(app
        .db
        .list_user_videos(user_id)?
        .into_iter()
        .filter(|v| v.status == VideoStatus::Completed)
        .map(|v| v.id)
        .collect())
}

pub fn run_init(settings: &Settings) -> Result<()> {
    let path = Settings::default_config_path();
    if path.exists() {
        output::warning(&format!("Configuration already exists at {:?}", path));
    } else {
        settings.save_to(&path)?;
        output::success(&format!("Wrote configuration to {:?}", path));
    }
    std::fs::create_dir_all(settings.data_dir())?;
    std::fs::create_dir_all(settings.storage_dir())?;
    std::fs::create_dir_all(settings.temp_dir())?;
    output::success(&format!("Data directory: {:?}", settings.data_dir()));
    Ok(())
}

pub async fn run_ingest(url: &str, settings: Settings) -> Result<()> {
    let app = App::new(settings)?;
    let user = app.local_user()?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("Submitting video...");

    let (video, job) = app.submit_video(user.id, url).await?;
    spinner.set_message(format!("Processing \"{}\"...", video.title));

    // Follow the job until it reaches a terminal state.
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(current) = app.db.get_video(video.id)? else {
            break;
        };
        spinner.set_message(format!(
            "{} ({:.0}%)",
            current.status, current.progress_percent
        ));
        if current.status.is_terminal() {
            spinner.finish_and_clear();
            match current.status {
                VideoStatus::Completed => {
                    output::success(&format!(
                        "Indexed \"{}\" ({} chunks, source: {})",
                        current.title,
                        current.chunk_count,
                        current.transcript_source.as_deref().unwrap_or("unknown")
                    ));
                }
                VideoStatus::Canceled => {
                    output::warning("Processing was canceled");
                }
                _ => {
                    return Err(ViskaError::ToolFailed(
                        current
                            .error_message
                            .unwrap_or_else(|| "Processing failed".to_string()),
                    ));
                }
            }
            break;
        }
    }

    output::field("video", &video.id.to_string());
    output::field("job", &job.id.to_string());
    Ok(())
}

pub async fn run_ask(
    question: &str,
    videos: &[String],
    mode: &str,
    settings: Settings,
) -> Result<()> {
    let app = App::new(settings)?;
    let user = app.local_user()?;
    let video_ids = resolve_video_ids(&app, user.id, videos)?;

    if video_ids.is_empty() {
        return Err(ViskaError::InvalidInput(
            "No indexed videos. Run `viska ingest <url>` first.".to_string(),
        ));
    }

    let response = app
        .ask(user.id, None, &video_ids, question, mode)
        .await?;

    println!("{}", response.answer);
    println!();
    output::field("intent", &response.intent.intent.to_string());
    output::field("retrieval", &response.retrieval.retrieval_type.to_string());
    output::field("model", &response.model);
    if !response.retrieval.chunks.is_empty() {
        output::heading("Sources");
        for (i, chunk) in response.retrieval.chunks.iter().enumerate() {
            println!(
                "  [{}] video {} @ {} (score {:.2})",
                i + 1,
                chunk.payload.video_id,
                crate::models::format_time_range(
                    chunk.payload.start_timestamp,
                    chunk.payload.end_timestamp
                ),
                chunk.score
            );
        }
    }
    Ok(())
}

pub async fn run_list(settings: Settings) -> Result<()> {
    let app = App::new(settings)?;
    let user = app.local_user()?;
    let videos = app.db.list_user_videos(user.id)?;

    if videos.is_empty() {
        println!("No videos yet.");
        return Ok(());
    }

    output::heading("Videos");
    for video in videos {
        println!(
            "  {}  {:<12} {:>4.0}%  {} chunks  {}",
            video.id,
            video.status.to_string(),
            video.progress_percent,
            video.chunk_count,
            video.title
        );
    }
    Ok(())
}

pub async fn run_cancel(video_id: &str, delete: bool, settings: Settings) -> Result<()> {
    let app = App::new(settings)?;
    let id = Uuid::parse_str(video_id)
        .map_err(|_| ViskaError::InvalidInput(format!("Invalid video id: {}", video_id)))?;

    let option = if delete {
        CleanupOption::FullDelete
    } else {
        CleanupOption::KeepVideo
    };
    let result = app.canceller.cancel(id, option).await?;

    output::success(&format!(
        "Canceled video {} ({} -> {})",
        result.video_id, result.previous_status, result.new_status
    ));
    output::field("revoked", &result.task_revoked.to_string());
    output::field(
        "freed",
        &format!("{:.2} MB", result.cleanup.storage_freed_mb),
    );
    output::field("chunks deleted", &result.cleanup.chunks_deleted.to_string());
    Ok(())
}

pub async fn run_quota(settings: Settings) -> Result<()> {
    let app = App::new(settings)?;
    let user = app.local_user()?;
    let quota = app.tracker.get_or_create_quota(user.id)?;

    output::heading("Quota (30-day period)");
    output::field(
        "period",
        &format!(
            "{} - {}",
            quota.period_start.format("%Y-%m-%d"),
            quota.period_end.format("%Y-%m-%d")
        ),
    );
    output::quota_line("videos", quota.videos_used as f64, quota.videos_limit as f64);
    output::quota_line("minutes", quota.minutes_used, quota.minutes_limit);
    output::quota_line(
        "messages",
        quota.messages_used as f64,
        quota.messages_limit as f64,
    );
    output::quota_line("storage MB", quota.storage_mb_used, quota.storage_mb_limit);
    Ok(())
}

pub async fn run_cleanup(settings: Settings) -> Result<()> {
    let app = App::new(settings)?;

    let stale = app.scheduler.cleanup_stale_videos().await?;
    output::success(&format!("Stale videos canceled: {}", stale.canceled));

    let orphans = app.scheduler.cleanup_orphaned_files().await?;
    output::success(&format!(
        "Orphaned dirs removed: {} (freed {:.2} MB)",
        orphans.orphaned_audio_dirs + orphans.orphaned_transcript_dirs,
        orphans.freed_mb
    ));

    let reconciled = app.scheduler.reconcile_storage_quotas().await?;
    output::success(&format!(
        "Quotas reconciled: {} corrected of {}",
        reconciled.corrections, reconciled.users_checked
    ));

    let memory = app.scheduler.consolidate_memories().await?;
    output::success(&format!(
        "Memory consolidated: {} conversations (merged {}, decayed {}, pruned {})",
        memory.conversations, memory.merged, memory.decayed, memory.pruned
    ));
    Ok(())
}

pub async fn run_insights(videos: &[String], settings: Settings) -> Result<()> {
    let app = App::new(settings)?;
    let user = app.local_user()?;
    let video_ids = resolve_video_ids(&app, user.id, videos)?;

    if video_ids.is_empty() {
        return Err(ViskaError::InvalidInput(
            "No indexed videos to analyze.".to_string(),
        ));
    }

    let graph = app
        .insights
        .get_or_generate(user.id, &video_ids, "Library insights")
        .await?;

    output::heading("Topic map");
    for node in &graph.nodes {
        let indent = match node.node_type.as_str() {
            "root" => 0,
            "topic" => 1,
            "subtopic" => 2,
            "point" => 3,
            _ => 4,
        };
        println!(
            "{}{} {}",
            "  ".repeat(indent),
            if indent == 0 { "*" } else { "-" },
            node.label
        );
    }
    output::field("nodes", &graph.nodes.len().to_string());
    output::field("edges", &graph.edges.len().to_string());
    Ok(())
}

pub fn run_config(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(settings)
        .map_err(|e| ViskaError::Config(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}
