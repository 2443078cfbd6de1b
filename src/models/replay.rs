//! Replay record as delivered by the replay endpoint.
//!
//! Field names follow the wire format (`snake_case`) so records round-trip
//! through the HTTP provider and the local archive unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::timestamp;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Error,
    Achievement,
    #[serde(other)]
    Operation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

/// Spatial/velocity snapshot attached to an operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub velocity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationLogEntry {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub operation_value: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error_event: bool,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub achievement_event: bool,
    #[serde(default)]
    pub achievement_description: Option<String>,
    #[serde(default)]
    pub event_type: Option<EventKind>,
    #[serde(default)]
    pub state_log: Option<StateSnapshot>,
    #[serde(default)]
    pub equipment_state: Option<Value>,
}

impl OperationLogEntry {
    /// Explicit `event_type` wins; otherwise the flagged sub-events decide.
    pub fn kind(&self) -> EventKind {
        if let Some(kind) = self.event_type {
            return kind;
        }
        if self.error_event {
            EventKind::Error
        } else if self.achievement_event {
            EventKind::Achievement
        } else {
            EventKind::Operation
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiTimelineEntry {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error_event: bool,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub achievement_event: bool,
    #[serde(default)]
    pub achievement_description: Option<String>,
}

/// Whole-session metrics; computed once, not time-indexed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KpiScores {
    #[serde(default)]
    pub safety_score: Option<f64>,
    #[serde(default)]
    pub error_count: Option<u32>,
    #[serde(default)]
    pub procedure_compliance_rate: Option<f64>,
    #[serde(default)]
    pub work_time_seconds: Option<f64>,
    #[serde(default)]
    pub achievement_rate: Option<f64>,
    #[serde(default)]
    pub accuracy_score: Option<f64>,
    #[serde(default)]
    pub efficiency_score: Option<f64>,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayData {
    pub session_id: String,
    #[serde(default)]
    pub worker_id: Option<i64>,
    #[serde(with = "timestamp")]
    pub session_start_time: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub session_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub operation_logs: Vec<OperationLogEntry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kpi_timeline: Vec<KpiTimelineEntry>,
    #[serde(default)]
    pub kpi_scores: Option<KpiScores>,
    #[serde(default)]
    pub ai_evaluation: Value,
    #[serde(default)]
    pub replay_data: Value,
}

impl ReplayData {
    /// Duration in milliseconds; missing, negative or non-finite values read as zero.
    pub fn duration_ms(&self) -> u64 {
        match self.duration_seconds {
            Some(secs) if secs.is_finite() && secs > 0.0 => (secs * 1000.0).round() as u64,
            _ => 0,
        }
    }

    pub fn session(&self) -> Session {
        Session {
            id: self.session_id.clone(),
            worker_id: self.worker_id,
            started_at: self.session_start_time,
            ended_at: self.session_end_time,
            duration_ms: self.duration_ms(),
            status: self.status.clone(),
        }
    }
}

/// Session header derived from a replay record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub worker_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub status: Option<String>,
}
