use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CaptureOutcome {
    Completed,
    Failed,
    TimedOut,
    /// Tick dropped because a previous capture was still in flight.
    SkippedBusy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetrics {
    pub timestamp: DateTime<Utc>,
    pub outcome: CaptureOutcome,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// When a recording counts as degraded. Degradation is reported, never fatal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DegradationPolicy {
    /// Ticks observed before the verdict is taken.
    pub min_ticks: u64,
    pub max_drop_ratio: f64,
    pub min_effective_fps: f64,
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self {
            min_ticks: 20,
            max_drop_ratio: 0.5,
            min_effective_fps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHealth {
    pub ticks: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped_busy: u64,
    pub elapsed_ms: u64,
    pub drop_ratio: f64,
    pub effective_fps: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_captures: Vec<CaptureMetrics>,
    pub health: RecordingHealth,
}
