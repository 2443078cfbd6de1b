use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use image::RgbaImage;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::{CaptureOutcome, MetricsCollector, RecordingHealth};

use super::guard::{CaptureGuard, CapturePermit};
use super::source::FrameSource;
use super::surface::CaptureSurface;

// Set to false to silence per-tick logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub type DegradedHook = Arc<dyn Fn(&RecordingHealth) + Send + Sync>;

/// Everything a single capture needs; cloned into each capture task.
#[derive(Clone)]
pub struct CaptureContext {
    pub source: Arc<dyn FrameSource>,
    pub surface: Arc<StdMutex<CaptureSurface>>,
    pub guard: CaptureGuard,
    pub metrics: MetricsCollector,
    pub width: u32,
    pub height: u32,
    pub timeout: Duration,
    pub on_degraded: Option<DegradedHook>,
}

impl CaptureContext {
    async fn record(&self, outcome: CaptureOutcome, duration: Option<Duration>) {
        if let Some(health) = self.metrics.record(outcome, duration).await {
            log_warn!(
                "recording degraded: {} of {} ticks dropped, {:.1} fps effective",
                health.ticks - health.completed,
                health.ticks,
                health.effective_fps
            );
            if let Some(hook) = &self.on_degraded {
                hook(&health);
            }
        }
    }
}

pub type InFlightCapture = Arc<Mutex<Option<JoinHandle<CaptureOutcome>>>>;

/// Periodic capture; a tick that finds a capture in flight is dropped.
///
/// Exits when `cancel_token` fires or the encoder reports inactive, checked at
/// the top of each iteration. In-flight captures are left to finish.
pub async fn capture_loop(
    ctx: CaptureContext,
    interval: Duration,
    in_flight: InFlightCapture,
    cancel_token: CancellationToken,
    encoder_active: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cancel_token.is_cancelled() {
                    break;
                }
                if !*encoder_active.borrow() {
                    log_info!("encoder no longer active; capture loop exiting");
                    break;
                }

                match ctx.guard.try_acquire() {
                    Some(permit) => {
                        let task_ctx = ctx.clone();
                        let handle = tokio::spawn(async move { capture_frame(&task_ctx, permit).await });
                        *in_flight.lock().await = Some(handle);
                    }
                    None => {
                        log_debug!("previous capture still in flight; dropping frame");
                        ctx.record(CaptureOutcome::SkippedBusy, None).await;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        }
    }
}

/// Runs one capture under `permit` and draws the result onto the surface.
/// Failures and timeouts are logged and counted as dropped frames.
pub async fn capture_frame(ctx: &CaptureContext, permit: CapturePermit) -> CaptureOutcome {
    let _permit = permit;
    let started = Instant::now();

    let outcome = match tokio::time::timeout(ctx.timeout, ctx.source.capture(ctx.width, ctx.height)).await {
        Ok(Ok(frame)) => match draw_frame(&ctx.surface, frame).await {
            Ok(()) => CaptureOutcome::Completed,
            Err(err) => {
                log_warn!("failed to draw captured frame: {err:#}");
                CaptureOutcome::Failed
            }
        },
        Ok(Err(err)) => {
            log_warn!("frame capture failed: {err:#}");
            CaptureOutcome::Failed
        }
        Err(_) => {
            log_warn!("frame capture timeout (> {}ms)", ctx.timeout.as_millis());
            CaptureOutcome::TimedOut
        }
    };

    let elapsed = started.elapsed();
    log_debug!("capture {:?} in {}ms", outcome, elapsed.as_millis());
    ctx.record(outcome, Some(elapsed)).await;
    outcome
}

async fn draw_frame(surface: &Arc<StdMutex<CaptureSurface>>, frame: RgbaImage) -> Result<()> {
    let surface = Arc::clone(surface);
    tokio::task::spawn_blocking(move || {
        let mut guard = match surface.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.draw(&frame);
    })
    .await
    .context("surface draw worker join failed")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::source::ViewBounds;
    use crate::metrics::DegradationPolicy;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Frame source with scripted per-call delays and failures.
    pub(crate) struct ScriptedSource {
        pub delays: StdMutex<Vec<Duration>>,
        pub fail_calls: Vec<usize>,
        pub calls: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
        pub bounds: Option<ViewBounds>,
    }

    impl ScriptedSource {
        pub(crate) fn new(delays: Vec<Duration>) -> Self {
            Self {
                delays: StdMutex::new(delays),
                fail_calls: Vec::new(),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                bounds: Some(ViewBounds::new(640.0, 360.0)),
            }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn bounds(&self) -> Option<ViewBounds> {
            self.bounds
        }

        async fn capture(&self, width: u32, height: u32) -> Result<RgbaImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let delay = {
                let mut delays = self.delays.lock().unwrap();
                if delays.is_empty() {
                    Duration::from_millis(10)
                } else {
                    delays.remove(0)
                }
            };
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_calls.contains(&call) {
                return Err(anyhow!("scripted failure on call {call}"));
            }
            Ok(RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255])))
        }
    }

    fn context(source: Arc<ScriptedSource>, timeout: Duration) -> CaptureContext {
        CaptureContext {
            source,
            surface: Arc::new(StdMutex::new(CaptureSurface::new(8, 8, Rgba([255, 255, 255, 255])))),
            guard: CaptureGuard::new(),
            metrics: MetricsCollector::new(DegradationPolicy::default()),
            width: 8,
            height: 8,
            timeout,
            on_degraded: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_capture_skips_following_ticks() {
        let source = Arc::new(ScriptedSource::new(vec![Duration::from_millis(250)]));
        let ctx = context(Arc::clone(&source), Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let (_active_tx, active_rx) = watch::channel(true);
        let in_flight: InFlightCapture = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(capture_loop(
            ctx.clone(),
            Duration::from_millis(100),
            Arc::clone(&in_flight),
            cancel.clone(),
            active_rx,
        ));

        // Tick at 100ms starts a 250ms capture; 200ms and 300ms are dropped.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let health = ctx.metrics.health().await;
        assert_eq!(health.skipped_busy, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // 400ms finds the guard idle again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_capture_is_dropped_and_loop_continues() {
        let mut scripted = ScriptedSource::new(Vec::new());
        scripted.fail_calls = vec![0];
        let source = Arc::new(scripted);
        let ctx = context(Arc::clone(&source), Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let (_active_tx, active_rx) = watch::channel(true);

        let handle = tokio::spawn(capture_loop(
            ctx.clone(),
            Duration::from_millis(100),
            Arc::new(Mutex::new(None)),
            cancel.clone(),
            active_rx,
        ));

        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        handle.await.unwrap();

        let health = ctx.metrics.health().await;
        assert_eq!(health.failed, 1);
        assert_eq!(health.completed, 3);
        assert_eq!(ctx.surface.lock().unwrap().frames_drawn(), 3);
        assert_eq!(ctx.guard.state(), crate::capture::GuardState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_capture_releases_the_guard() {
        let source = Arc::new(ScriptedSource::new(vec![Duration::from_secs(5)]));
        let ctx = context(source, Duration::from_millis(300));
        let permit = ctx.guard.try_acquire().unwrap();

        let outcome = capture_frame(&ctx, permit).await;
        assert_eq!(outcome, CaptureOutcome::TimedOut);
        assert_eq!(ctx.guard.state(), crate::capture::GuardState::Idle);
        assert_eq!(ctx.metrics.health().await.timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_encoder_goes_inactive() {
        let source = Arc::new(ScriptedSource::new(Vec::new()));
        let ctx = context(source, Duration::from_secs(2));
        let (active_tx, active_rx) = watch::channel(true);

        let handle = tokio::spawn(capture_loop(
            ctx,
            Duration::from_millis(100),
            Arc::new(Mutex::new(None)),
            CancellationToken::new(),
            active_rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        active_tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
