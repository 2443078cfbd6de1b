use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::CaptureConfig;
use crate::metrics::{DegradationPolicy, RecordingHealth, SystemMetrics};

use super::encoder::EncoderFormat;

pub const DEFAULT_ENCODER_FPS: u32 = 10;
pub const DEFAULT_BITRATE: u32 = 2_500_000;

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub capture: CaptureConfig,
    pub encoder_fps: u32,
    pub bitrate: u32,
    pub output_dir: PathBuf,
    pub stop_on_playback_end: bool,
    pub degradation: DegradationPolicy,
    /// Upper bound on waiting for the encoder to flush its last chunks.
    pub finalize_timeout: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            encoder_fps: DEFAULT_ENCODER_FPS,
            bitrate: DEFAULT_BITRATE,
            output_dir: PathBuf::from("recordings"),
            stop_on_playback_end: true,
            degradation: DegradationPolicy::default(),
            finalize_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordingPhase {
    Idle,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub phase: RecordingPhase,
    pub session_id: Option<String>,
    pub format: Option<EncoderFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub health: Option<RecordingHealth>,
    /// Process CPU and memory, sampled when the status is read.
    pub system: Option<SystemMetrics>,
}

impl RecordingStatus {
    pub fn idle(phase: RecordingPhase) -> Self {
        Self {
            phase,
            session_id: None,
            format: None,
            width: None,
            height: None,
            started_at: None,
            health: None,
            system: None,
        }
    }
}

/// The finished recording, already written to disk.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub session_id: String,
    pub format: EncoderFormat,
    pub mime_type: String,
    pub bytes: u64,
    pub chunk_count: usize,
    pub width: u32,
    pub height: u32,
    pub health: RecordingHealth,
    pub system: SystemMetrics,
    /// False when the encoder failed or stalled while finalizing and only
    /// the output produced up to that point was saved.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub enum RecordingEvent {
    Started {
        session_id: String,
        format: EncoderFormat,
        width: u32,
        height: u32,
    },
    Degraded(RecordingHealth),
    Finished(RecordingArtifact),
    Failed(String),
}
