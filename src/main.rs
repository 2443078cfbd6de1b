use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use training_replay::provider::decode_envelope;
use training_replay::{
    init_logging, open_provider, set_debug_logging, Database, PlaybackSpeed, RecordingEvent, ReplayData, ReplayViewer,
    SettingsStore,
};

#[derive(Parser)]
#[command(name = "training-replay")]
#[command(author, version)]
#[command(about = "Replay finished training sessions and record them to video")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (created with defaults on first save)
    #[arg(long, global = true, default_value = "replay-settings.json")]
    settings: PathBuf,

    /// Replay API root; overrides the settings file
    #[arg(long, global = true, env = "REPLAY_API_URL")]
    api: Option<String>,

    /// Debug logging for this crate
    #[arg(long, global = true, env = "REPLAY_DEBUG")]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Store a replay record (raw or wrapped in an API envelope) in the archive
    Import {
        /// JSON file holding the record
        file: PathBuf,
    },

    /// List archived sessions, newest first
    Sessions,

    /// Play a session from the start and record the view until it ends
    Record {
        session_id: String,

        /// Playback speed: 0.5, 1, 1.5 or 2
        #[arg(long, default_value = "1")]
        speed: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Settings loading warns about unreadable files.
    init_logging(cli.debug);

    let store = SettingsStore::new(cli.settings.clone())?;
    let mut settings = store.effective();
    if settings.debug_logging && !cli.debug {
        set_debug_logging(true);
    }
    if let Some(api) = cli.api.filter(|a| !a.trim().is_empty()) {
        settings.api_base_url = Some(api);
    }

    match cli.command {
        Commands::Import { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let replay = parse_record(&body)?;
            let db = Database::new(settings.archive_path.clone())?;
            db.upsert_replay(&replay).await?;
            println!(
                "Imported {} ({} operation logs, {} KPI entries)",
                replay.session_id,
                replay.operation_logs.len(),
                replay.kpi_timeline.len()
            );
        }
        Commands::Sessions => {
            let db = Database::new(settings.archive_path.clone())?;
            let sessions = db.list_sessions().await?;
            if sessions.is_empty() {
                println!("No archived sessions");
            }
            for s in sessions {
                println!(
                    "{}\t{}\t{:>6.1}s\t{} ops\t{}",
                    s.session_id,
                    s.started_at.to_rfc3339(),
                    s.duration_seconds.unwrap_or_default(),
                    s.operation_count,
                    s.status.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Record { session_id, speed } => {
            let speed = PlaybackSpeed::try_from(speed).map_err(anyhow::Error::msg)?;
            settings.stop_on_playback_end = true;
            let viewer = ReplayViewer::new(open_provider(&settings)?, &settings)?;
            record(viewer, &session_id, speed).await?;
        }
    }

    Ok(())
}

fn parse_record(body: &str) -> Result<ReplayData> {
    let value: Value = serde_json::from_str(body).context("replay file is not JSON")?;
    if value.get("success").is_some() {
        return Ok(decode_envelope(body)?);
    }
    serde_json::from_value(value).context("replay file is not a replay record")
}

async fn record(viewer: ReplayViewer, session_id: &str, speed: PlaybackSpeed) -> Result<()> {
    let session = viewer.open(session_id).await?;
    info!("Recording {} ({} ms at {}x)", session.id, session.duration_ms, speed.multiplier());

    viewer.set_speed(speed).await;
    let mut events = viewer.recorder().subscribe();
    viewer.start_recording().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RecordingEvent::Finished(artifact)) => {
                    println!("{} ({} bytes, {})", artifact.path.display(), artifact.bytes, artifact.format);
                    break;
                }
                Ok(RecordingEvent::Failed(message)) => bail!(message),
                Ok(RecordingEvent::Degraded(health)) => {
                    warn!("Capture degraded: {:.1} fps, {:.0}% dropped", health.effective_fps, health.drop_ratio * 100.0);
                }
                Ok(RecordingEvent::Started { .. }) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("recorder went away"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; finalizing recording");
                match viewer.stop_recording().await? {
                    Some(artifact) => println!("{} ({} bytes, {})", artifact.path.display(), artifact.bytes, artifact.format),
                    None => println!("Nothing recorded"),
                }
                break;
            }
        }
    }

    viewer.close().await?;
    Ok(())
}
