//! The replay view: one loaded session, its playback clock, the rendered
//! panel and the recorder, behind a single handle.

pub mod commands;

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::capture::{FrameSource, ReplayViewRenderer};
use crate::error::{RecordingError, ReplayError};
use crate::models::{KpiScores, KpiTimelineEntry, OperationLogEntry, Session};
use crate::playback::{PlaybackEngine, PlaybackSnapshot, PlaybackSpeed};
use crate::provider::ReplayProvider;
use crate::recording::{EncoderRegistry, RecordingArtifact, RecordingConfig, RecordingController, RecordingStatus};
use crate::settings::ReplaySettings;

pub use commands::{CommandReply, ControlCommand};

/// What the replay panel shows at the current cursor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub session: Option<Session>,
    pub playback: PlaybackSnapshot,
    pub visible_logs: Vec<OperationLogEntry>,
    pub visible_log_count: usize,
    pub current_kpi: Option<KpiTimelineEntry>,
    pub kpi_scores: Option<KpiScores>,
    pub recording: RecordingStatus,
}

pub struct ReplayViewer {
    provider: Arc<dyn ReplayProvider>,
    playback: PlaybackEngine,
    renderer: Arc<ReplayViewRenderer>,
    recorder: RecordingController,
    tail_rows: usize,
}

impl ReplayViewer {
    pub fn new(provider: Arc<dyn ReplayProvider>, settings: &ReplaySettings) -> anyhow::Result<Self> {
        let playback = PlaybackEngine::new(settings.playback_tick());
        let renderer = Arc::new(ReplayViewRenderer::new(playback.clone()).with_tail_rows(settings.log_tail_rows));
        Ok(Self::from_parts(
            provider,
            playback,
            renderer,
            settings.encoder_registry(),
            settings.recording_config()?,
            settings.log_tail_rows,
        ))
    }

    pub fn from_parts(
        provider: Arc<dyn ReplayProvider>,
        playback: PlaybackEngine,
        renderer: Arc<ReplayViewRenderer>,
        encoders: EncoderRegistry,
        config: RecordingConfig,
        tail_rows: usize,
    ) -> Self {
        let recorder = RecordingController::new(
            playback.clone(),
            Arc::clone(&renderer) as Arc<dyn FrameSource>,
            encoders,
            config,
        );
        Self {
            provider,
            playback,
            renderer,
            recorder,
            tail_rows: tail_rows.max(1),
        }
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn recorder(&self) -> &RecordingController {
        &self.recorder
    }

    pub fn renderer(&self) -> &ReplayViewRenderer {
        &self.renderer
    }

    /// Fetches and loads a session. On failure nothing stays loaded.
    pub async fn open(&self, session_id: &str) -> Result<Session, ReplayError> {
        if self.recorder.is_recording().await {
            info!("Stopping active recording before loading {}", session_id);
            if let Err(err) = self.recorder.stop().await {
                warn!("recording did not finish cleanly: {err}");
            }
        }

        match self.provider.get_replay(session_id).await {
            Ok(replay) => {
                let timeline = self.playback.load(replay).await;
                self.renderer.mount();
                Ok(timeline.session())
            }
            Err(err) => {
                self.playback.unload().await;
                self.renderer.unmount();
                warn!("Failed to load replay {}: {}", session_id, err);
                Err(err)
            }
        }
    }

    pub async fn play(&self) -> Result<PlaybackSnapshot, ReplayError> {
        self.playback.play().await.map_err(|_| ReplayError::NotLoaded)?;
        Ok(self.playback.get_snapshot().await)
    }

    pub async fn pause(&self) -> PlaybackSnapshot {
        self.playback.pause().await;
        self.playback.get_snapshot().await
    }

    pub async fn seek(&self, time_ms: i64) -> PlaybackSnapshot {
        self.playback.seek(time_ms).await;
        self.playback.get_snapshot().await
    }

    pub async fn set_speed(&self, speed: PlaybackSpeed) -> PlaybackSnapshot {
        self.playback.set_speed(speed).await;
        self.playback.get_snapshot().await
    }

    pub async fn start_recording(&self) -> Result<RecordingStatus, RecordingError> {
        self.recorder.start().await
    }

    pub async fn stop_recording(&self) -> Result<Option<RecordingArtifact>, RecordingError> {
        self.recorder.stop().await
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        let playback = self.playback.get_snapshot().await;
        let recording = self.recorder.status().await;
        match self.playback.visible().await {
            Some(window) => ViewSnapshot {
                session: Some(window.timeline().session()),
                visible_logs: window.tail(self.tail_rows).to_vec(),
                visible_log_count: window.log_count,
                current_kpi: window.kpi().cloned(),
                kpi_scores: window.timeline().kpi_scores().cloned(),
                playback,
                recording,
            },
            None => ViewSnapshot {
                session: None,
                playback,
                visible_logs: Vec::new(),
                visible_log_count: 0,
                current_kpi: None,
                kpi_scores: None,
                recording,
            },
        }
    }

    /// Teardown: finishes any recording, stops the clock and unmounts the view.
    pub async fn close(&self) -> Result<Option<RecordingArtifact>, RecordingError> {
        let result = self.recorder.shutdown().await;
        self.playback.unload().await;
        self.renderer.unmount();
        result
    }
}

impl Drop for ReplayViewer {
    fn drop(&mut self) {
        // Best effort: a recording still running gets its stop sequence.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let recorder = self.recorder.clone();
            handle.spawn(async move {
                if let Err(err) = recorder.shutdown().await {
                    warn!("recording teardown failed: {err}");
                }
            });
        }
    }
}
