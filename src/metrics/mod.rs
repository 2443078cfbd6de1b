mod types;

pub use types::{
    CaptureMetrics, CaptureOutcome, DegradationPolicy, MetricsSnapshot, RecordingHealth,
    SystemMetrics,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tokio::time::Instant;

const MAX_RECENT_CAPTURES: usize = 20;

/// Capture health for one recording.
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_captures: Vec<CaptureMetrics>,
    completed: u64,
    failed: u64,
    timed_out: u64,
    skipped_busy: u64,
    started_at: Instant,
    degraded: bool,
    policy: DegradationPolicy,
    system: System,
    pid: Pid,
}

impl MetricsState {
    fn health(&self) -> RecordingHealth {
        let ticks = self.completed + self.failed + self.timed_out + self.skipped_busy;
        let elapsed = self.started_at.elapsed();
        let dropped = ticks - self.completed;
        RecordingHealth {
            ticks,
            completed: self.completed,
            failed: self.failed,
            timed_out: self.timed_out,
            skipped_busy: self.skipped_busy,
            elapsed_ms: elapsed.as_millis() as u64,
            drop_ratio: if ticks == 0 { 0.0 } else { dropped as f64 / ticks as f64 },
            effective_fps: effective_fps(self.completed, elapsed),
            degraded: self.degraded,
        }
    }

    fn evaluate(&self, health: &RecordingHealth) -> bool {
        health.ticks >= self.policy.min_ticks
            && (health.drop_ratio > self.policy.max_drop_ratio
                || health.effective_fps < self.policy.min_effective_fps)
    }

    fn sample_system(&mut self) -> SystemMetrics {
        let pid = self.pid;
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match self.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
        }
    }
}

fn effective_fps(completed: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        completed as f64 / secs
    }
}

impl MetricsCollector {
    pub fn new(policy: DegradationPolicy) -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_captures: Vec::with_capacity(MAX_RECENT_CAPTURES),
                completed: 0,
                failed: 0,
                timed_out: 0,
                skipped_busy: 0,
                started_at: Instant::now(),
                degraded: false,
                policy,
                system,
                pid,
            })),
        }
    }

    /// Records one tick. Returns the health report the first time the
    /// recording crosses into degraded territory.
    pub async fn record(&self, outcome: CaptureOutcome, duration: Option<Duration>) -> Option<RecordingHealth> {
        let mut state = self.inner.lock().await;

        match outcome {
            CaptureOutcome::Completed => state.completed += 1,
            CaptureOutcome::Failed => state.failed += 1,
            CaptureOutcome::TimedOut => state.timed_out += 1,
            CaptureOutcome::SkippedBusy => state.skipped_busy += 1,
        }

        state.recent_captures.push(CaptureMetrics {
            timestamp: Utc::now(),
            outcome,
            duration_ms: duration.map(|d| d.as_millis() as u64),
        });
        if state.recent_captures.len() > MAX_RECENT_CAPTURES {
            state.recent_captures.remove(0);
        }

        if state.degraded {
            return None;
        }
        let mut health = state.health();
        if state.evaluate(&health) {
            state.degraded = true;
            health.degraded = true;
            return Some(health);
        }
        None
    }

    pub async fn health(&self) -> RecordingHealth {
        self.inner.lock().await.health()
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample_system();
        MetricsSnapshot {
            system,
            recent_captures: state.recent_captures.clone(),
            health: state.health(),
        }
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
