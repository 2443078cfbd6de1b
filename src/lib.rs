//! Replay and recording engine for finished training sessions.
//!
//! A session record (operation log, KPI timeline and scores) is loaded from
//! the replay API or the local archive and driven by a virtual playback
//! clock. The rendered replay view can be recorded to a video file while it
//! plays.

pub mod capture;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod playback;
pub mod provider;
pub mod recording;
pub mod settings;
pub mod utils;
pub mod viewer;

use std::sync::Arc;

use anyhow::Result;

pub use db::Database;
pub use error::{RecordingError, ReplayError};
pub use models::{ReplayData, Session};
pub use playback::{PlaybackEngine, PlaybackSpeed, PlaybackState, PlaybackStatus};
pub use provider::{ArchiveReplayProvider, HttpReplayProvider, ReplayProvider};
pub use recording::{EncoderFormat, RecordingArtifact, RecordingController, RecordingEvent};
pub use settings::{ReplaySettings, SettingsStore};
pub use viewer::{CommandReply, ControlCommand, ReplayViewer, ViewSnapshot};

/// Reads `RUST_LOG`; defaults to info. Debug records of this crate pass the
/// logger filter, and the global max level decides whether they are emitted,
/// so `debug` can still be switched on once settings are loaded.
pub fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .filter_level(log::LevelFilter::Info)
        .filter_module("training_replay", log::LevelFilter::Debug);
    // A second init (tests, embedding hosts) is harmless.
    if builder.try_init().is_ok() {
        set_debug_logging(debug);
    }
}

pub fn set_debug_logging(enabled: bool) {
    log::set_max_level(if enabled {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}

/// Picks the replay source: the HTTP API when configured, else the archive.
pub fn open_provider(settings: &ReplaySettings) -> Result<Arc<dyn ReplayProvider>> {
    match settings.api_base_url.as_deref() {
        Some(url) => {
            log::info!("Fetching replays from {url}");
            Ok(Arc::new(HttpReplayProvider::new(url, settings.request_timeout())?))
        }
        None => {
            log::info!("Reading replays from archive {}", settings.archive_path.display());
            let db = Database::new(settings.archive_path.clone())?;
            Ok(Arc::new(ArchiveReplayProvider::new(db)))
        }
    }
}
