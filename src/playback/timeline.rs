//! Time-indexed view over a loaded replay record.
//!
//! Offsets are precomputed once per load, in microseconds so sub-millisecond
//! timestamps never round into view early; every query is a binary search
//! over them. Operation logs accumulate as a growing prefix, while the KPI view is
//! a point-in-time snapshot (the last entry at or before the cursor).

use std::sync::Arc;

use crate::models::{KpiScores, KpiTimelineEntry, OperationLogEntry, ReplayData, Session};

#[derive(Debug)]
pub struct ReplayTimeline {
    replay: ReplayData,
    log_offsets_us: Vec<i64>,
    kpi_offsets_us: Vec<i64>,
}

impl ReplayTimeline {
    pub fn new(mut replay: ReplayData) -> Self {
        let start = replay.session_start_time;
        // Stable: entries sharing a timestamp keep producer order.
        replay.operation_logs.sort_by_key(|entry| entry.timestamp);
        replay.kpi_timeline.sort_by_key(|entry| entry.timestamp);

        let log_offsets_us = replay
            .operation_logs
            .iter()
            .map(|entry| offset_us(entry.timestamp - start))
            .collect();
        let kpi_offsets_us = replay
            .kpi_timeline
            .iter()
            .map(|entry| offset_us(entry.timestamp - start))
            .collect();

        Self {
            replay,
            log_offsets_us,
            kpi_offsets_us,
        }
    }

    pub fn replay(&self) -> &ReplayData {
        &self.replay
    }

    pub fn session(&self) -> Session {
        self.replay.session()
    }

    pub fn session_id(&self) -> &str {
        &self.replay.session_id
    }

    pub fn duration_ms(&self) -> u64 {
        self.replay.duration_ms()
    }

    pub fn kpi_scores(&self) -> Option<&KpiScores> {
        self.replay.kpi_scores.as_ref()
    }

    pub fn operation_logs(&self) -> &[OperationLogEntry] {
        &self.replay.operation_logs
    }

    pub fn kpi_timeline(&self) -> &[KpiTimelineEntry] {
        &self.replay.kpi_timeline
    }

    pub fn visible_log_count(&self, current_ms: u64) -> usize {
        let cursor = cursor(current_ms);
        self.log_offsets_us.partition_point(|&offset| offset <= cursor)
    }

    pub fn visible_logs(&self, current_ms: u64) -> &[OperationLogEntry] {
        &self.replay.operation_logs[..self.visible_log_count(current_ms)]
    }

    pub fn current_kpi_index(&self, current_ms: u64) -> Option<usize> {
        let cursor = cursor(current_ms);
        self.kpi_offsets_us
            .partition_point(|&offset| offset <= cursor)
            .checked_sub(1)
    }

    pub fn current_kpi(&self, current_ms: u64) -> Option<&KpiTimelineEntry> {
        self.current_kpi_index(current_ms)
            .map(|index| &self.replay.kpi_timeline[index])
    }

    /// Offset of a KPI entry from the session start, used for timeline markers.
    pub fn kpi_offset_ms(&self, index: usize) -> Option<i64> {
        self.kpi_offsets_us.get(index).map(|us| us.div_euclid(1_000))
    }
}

fn offset_us(delta: chrono::Duration) -> i64 {
    delta.num_microseconds().unwrap_or(if delta < chrono::Duration::zero() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// The cursor in microseconds.
fn cursor(current_ms: u64) -> i64 {
    i64::try_from(current_ms)
        .unwrap_or(i64::MAX)
        .saturating_mul(1_000)
}

/// Borrow-free window handed to renderers and UI layers.
#[derive(Debug, Clone)]
pub struct VisibleWindow {
    timeline: Arc<ReplayTimeline>,
    pub current_ms: u64,
    pub log_count: usize,
    pub kpi_index: Option<usize>,
}

impl VisibleWindow {
    pub fn new(timeline: Arc<ReplayTimeline>, current_ms: u64) -> Self {
        let log_count = timeline.visible_log_count(current_ms);
        let kpi_index = timeline.current_kpi_index(current_ms);
        Self {
            timeline,
            current_ms,
            log_count,
            kpi_index,
        }
    }

    pub fn timeline(&self) -> &ReplayTimeline {
        &self.timeline
    }

    pub fn logs(&self) -> &[OperationLogEntry] {
        &self.timeline.operation_logs()[..self.log_count]
    }

    /// The most recent `limit` visible rows, oldest first.
    pub fn tail(&self, limit: usize) -> &[OperationLogEntry] {
        let logs = self.logs();
        &logs[logs.len().saturating_sub(limit)..]
    }

    pub fn kpi(&self) -> Option<&KpiTimelineEntry> {
        self.kpi_index
            .map(|index| &self.timeline.kpi_timeline()[index])
    }

    pub fn progress_percent(&self) -> f64 {
        let duration = self.timeline.duration_ms();
        if duration == 0 {
            0.0
        } else {
            (self.current_ms.min(duration) as f64 / duration as f64) * 100.0
        }
    }
}
