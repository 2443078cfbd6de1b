//! Off-screen renderer of the replay panel.
//!
//! Draws the same information the replay view shows (progress, the tail of
//! visible operation rows, KPI markers, score bars and the current KPI
//! snapshot) as flat shapes, so recordings carry the replay state without a
//! browser.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};

use crate::models::{EventKind, KpiScores};
use crate::playback::{PlaybackEngine, VisibleWindow};

use super::source::{FrameSource, ViewBounds};

pub const DEFAULT_VIEW_WIDTH: f64 = 1280.0;
pub const DEFAULT_VIEW_HEIGHT: f64 = 720.0;
pub const DEFAULT_TAIL_ROWS: usize = 20;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const HEADER: Rgba<u8> = Rgba([79, 70, 229, 255]);
const TRACK: Rgba<u8> = Rgba([229, 231, 235, 255]);
const LOG_PANEL: Rgba<u8> = Rgba([17, 24, 39, 255]);
const ROW_OPERATION: Rgba<u8> = Rgba([30, 58, 138, 255]);
const ROW_ERROR: Rgba<u8> = Rgba([127, 29, 29, 255]);
const ROW_ACHIEVEMENT: Rgba<u8> = Rgba([20, 83, 45, 255]);
const MARKER_NEUTRAL: Rgba<u8> = Rgba([107, 114, 128, 255]);
const MARKER_ERROR: Rgba<u8> = Rgba([220, 38, 38, 255]);
const MARKER_ACHIEVEMENT: Rgba<u8> = Rgba([22, 163, 74, 255]);
const SCORE_SAFETY: Rgba<u8> = Rgba([20, 184, 166, 255]);
const SCORE_COMPLIANCE: Rgba<u8> = Rgba([59, 130, 246, 255]);
const SCORE_OVERALL: Rgba<u8> = Rgba([139, 92, 246, 255]);
const SNAPSHOT_EMPTY: Rgba<u8> = Rgba([243, 244, 246, 255]);
const SNAPSHOT_ERROR: Rgba<u8> = Rgba([254, 226, 226, 255]);
const SNAPSHOT_ACHIEVEMENT: Rgba<u8> = Rgba([220, 252, 231, 255]);

pub struct ReplayViewRenderer {
    playback: PlaybackEngine,
    bounds: ViewBounds,
    tail_rows: usize,
    mounted: AtomicBool,
}

impl ReplayViewRenderer {
    pub fn new(playback: PlaybackEngine) -> Self {
        Self {
            playback,
            bounds: ViewBounds::new(DEFAULT_VIEW_WIDTH, DEFAULT_VIEW_HEIGHT),
            tail_rows: DEFAULT_TAIL_ROWS,
            mounted: AtomicBool::new(true),
        }
    }

    pub fn with_bounds(mut self, bounds: ViewBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_tail_rows(mut self, rows: usize) -> Self {
        self.tail_rows = rows.max(1);
        self
    }

    pub fn mount(&self) {
        self.mounted.store(true, Ordering::Release);
    }

    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
    }
}

#[async_trait]
impl FrameSource for ReplayViewRenderer {
    async fn bounds(&self) -> Option<ViewBounds> {
        if !self.mounted.load(Ordering::Acquire) {
            return None;
        }
        // Nothing is rendered until a session is loaded.
        self.playback.timeline().await.map(|_| self.bounds)
    }

    async fn capture(&self, width: u32, height: u32) -> Result<RgbaImage> {
        if !self.mounted.load(Ordering::Acquire) {
            return Err(anyhow!("replay view is not mounted"));
        }
        let window = self
            .playback
            .visible()
            .await
            .ok_or_else(|| anyhow!("no replay session loaded"))?;
        let tail_rows = self.tail_rows;

        tokio::task::spawn_blocking(move || render_view(&window, width, height, tail_rows))
            .await
            .context("render worker join failed")
    }
}

pub fn render_view(window: &VisibleWindow, width: u32, height: u32, tail_rows: usize) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(width.max(1), height.max(1), BACKGROUND);
    let (w, h) = (width as i64, height as i64);
    let margin = (w / 40).max(4);

    let header_h = (h / 12).max(8);
    fill_rect(&mut canvas, 0, 0, w, header_h, HEADER);

    // Progress track with KPI markers.
    let track_y = header_h + margin;
    let track_h = (h / 60).max(4);
    let track_w = w - 2 * margin;
    fill_rect(&mut canvas, margin, track_y, track_w, track_h, TRACK);
    let progress_w = (track_w as f64 * window.progress_percent() / 100.0).round() as i64;
    fill_rect(&mut canvas, margin, track_y, progress_w, track_h, HEADER);

    let timeline = window.timeline();
    let duration = timeline.duration_ms();
    if duration > 0 {
        for (index, entry) in timeline.kpi_timeline().iter().enumerate() {
            let Some(offset) = timeline.kpi_offset_ms(index) else {
                continue;
            };
            let ratio = offset.clamp(0, duration as i64) as f64 / duration as f64;
            let x = margin + (track_w as f64 * ratio).round() as i64;
            let color = marker_color(entry.error_event, entry.achievement_event);
            fill_rect(&mut canvas, x - 1, track_y - track_h, 3, track_h * 3, color);
        }
    }

    // Operation log panel: the most recent rows, oldest at the top.
    let body_y = track_y + track_h * 3 + margin;
    let body_h = h - body_y - margin;
    let panel_w = (w - 3 * margin) * 2 / 3;
    fill_rect(&mut canvas, margin, body_y, panel_w, body_h, LOG_PANEL);

    let rows = window.tail(tail_rows);
    let row_pitch = (body_h / tail_rows.max(1) as i64).max(2);
    let row_inset = (row_pitch / 6).max(1);
    for (slot, entry) in rows.iter().enumerate() {
        let color = match entry.kind() {
            EventKind::Error => ROW_ERROR,
            EventKind::Achievement => ROW_ACHIEVEMENT,
            EventKind::Operation => ROW_OPERATION,
        };
        let y = body_y + slot as i64 * row_pitch + row_inset;
        fill_rect(
            &mut canvas,
            margin + row_inset * 2,
            y,
            panel_w - row_inset * 4,
            row_pitch - row_inset * 2,
            color,
        );
    }

    // KPI column: whole-session score bars, then the current snapshot.
    let side_x = margin * 2 + panel_w;
    let side_w = w - side_x - margin;
    let bar_h = (body_h / 18).max(2);
    let mut bar_y = body_y;
    for (value, color) in score_bars(timeline.kpi_scores()) {
        fill_rect(&mut canvas, side_x, bar_y, side_w, bar_h, TRACK);
        let filled = (side_w as f64 * value.clamp(0.0, 100.0) / 100.0).round() as i64;
        fill_rect(&mut canvas, side_x, bar_y, filled, bar_h, color);
        bar_y += bar_h * 2;
    }

    let snapshot_color = match window.kpi() {
        Some(kpi) if kpi.error_event => SNAPSHOT_ERROR,
        Some(kpi) if kpi.achievement_event => SNAPSHOT_ACHIEVEMENT,
        Some(_) => TRACK,
        None => SNAPSHOT_EMPTY,
    };
    fill_rect(&mut canvas, side_x, bar_y + margin, side_w, body_h / 3, snapshot_color);

    canvas
}

fn score_bars(scores: Option<&KpiScores>) -> Vec<(f64, Rgba<u8>)> {
    let Some(scores) = scores else {
        return Vec::new();
    };
    [
        (scores.safety_score, SCORE_SAFETY),
        (scores.procedure_compliance_rate, SCORE_COMPLIANCE),
        (scores.overall_score, SCORE_OVERALL),
    ]
    .into_iter()
    .filter_map(|(value, color)| value.map(|v| (v, color)))
    .collect()
}

fn marker_color(error: bool, achievement: bool) -> Rgba<u8> {
    if error {
        MARKER_ERROR
    } else if achievement {
        MARKER_ACHIEVEMENT
    } else {
        MARKER_NEUTRAL
    }
}

fn fill_rect(canvas: &mut RgbaImage, x: i64, y: i64, width: i64, height: i64, color: Rgba<u8>) {
    let x0 = x.clamp(0, canvas.width() as i64) as u32;
    let y0 = y.clamp(0, canvas.height() as i64) as u32;
    let x1 = (x + width.max(0)).clamp(0, canvas.width() as i64) as u32;
    let y1 = (y + height.max(0)).clamp(0, canvas.height() as i64) as u32;
    for py in y0..y1 {
        for px in x0..x1 {
            canvas.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::timeline::tests::scenario_replay;

    #[tokio::test]
    async fn bounds_require_a_loaded_and_mounted_view() {
        let playback = PlaybackEngine::default();
        let renderer = ReplayViewRenderer::new(playback.clone());
        assert!(renderer.bounds().await.is_none());

        playback.load(scenario_replay()).await;
        assert_eq!(
            renderer.bounds().await,
            Some(ViewBounds::new(DEFAULT_VIEW_WIDTH, DEFAULT_VIEW_HEIGHT))
        );

        renderer.unmount();
        assert!(renderer.bounds().await.is_none());
        assert!(renderer.capture(64, 36).await.is_err());
    }

    #[tokio::test]
    async fn rendered_frames_change_with_the_cursor() {
        let playback = PlaybackEngine::default();
        playback.load(scenario_replay()).await;
        let renderer = ReplayViewRenderer::new(playback.clone());

        let early = renderer.capture(320, 180).await.unwrap();
        playback.seek(9_500).await;
        let late = renderer.capture(320, 180).await.unwrap();

        assert_eq!(early.dimensions(), (320, 180));
        assert_ne!(early, late);
    }

    #[test]
    fn error_rows_use_error_colour() {
        let timeline = std::sync::Arc::new(crate::playback::ReplayTimeline::new(scenario_replay()));
        // Only the 1s and 4s rows are visible; the 4s row is an error.
        let window = VisibleWindow::new(timeline, 6_000);
        let frame = render_view(&window, 400, 400, 2);
        assert!(frame.pixels().any(|pixel| *pixel == ROW_ERROR));
        assert!(frame.pixels().any(|pixel| *pixel == ROW_OPERATION));
        assert!(!frame.pixels().any(|pixel| *pixel == ROW_ACHIEVEMENT));
    }
}
