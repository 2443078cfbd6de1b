use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::{Rgba, RgbaImage};
use log::{info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::{CaptureOutcome, MetricsCollector};

use super::guard::CaptureGuard;
use super::loop_worker::{capture_frame, capture_loop, CaptureContext, DegradedHook, InFlightCapture};
use super::source::{FrameSource, ViewBounds};
use super::surface::{surface_dimensions, CaptureSurface};

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub min_width: u32,
    pub min_height: u32,
    pub background: Rgba<u8>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
            min_width: super::surface::MIN_SURFACE_WIDTH,
            min_height: super::surface::MIN_SURFACE_HEIGHT,
            background: Rgba([255, 255, 255, 255]),
        }
    }
}

/// Owns the destination surface and the capture loop for one recording.
pub struct CapturePipeline {
    ctx: CaptureContext,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    in_flight: InFlightCapture,
}

impl CapturePipeline {
    /// Allocates the surface from the measured view; it is never resized.
    pub fn new(
        source: Arc<dyn FrameSource>,
        bounds: ViewBounds,
        config: &CaptureConfig,
        metrics: MetricsCollector,
        on_degraded: Option<DegradedHook>,
    ) -> Self {
        let (width, height) = surface_dimensions(bounds, config.min_width, config.min_height);
        info!(
            "Allocated {}x{} capture surface (view measured {:.0}x{:.0})",
            width, height, bounds.width, bounds.height
        );

        Self {
            ctx: CaptureContext {
                source,
                surface: Arc::new(StdMutex::new(CaptureSurface::new(width, height, config.background))),
                guard: CaptureGuard::new(),
                metrics,
                width,
                height,
                timeout: config.timeout,
                on_degraded,
            },
            interval: config.interval,
            handle: None,
            cancel_token: None,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.ctx.width, self.ctx.height)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.ctx.metrics
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Shared handle to the surface, for the encoder feed.
    pub fn surface(&self) -> Arc<StdMutex<CaptureSurface>> {
        Arc::clone(&self.ctx.surface)
    }

    pub fn snapshot(&self) -> RgbaImage {
        read_surface(&self.ctx.surface)
    }

    /// One capture right now, so the first encoded frame is not blank.
    /// Returns `None` when a capture is already in flight.
    pub async fn capture_now(&self) -> Option<CaptureOutcome> {
        let permit = self.ctx.guard.try_acquire()?;
        Some(capture_frame(&self.ctx, permit).await)
    }

    pub fn start(&mut self, encoder_active: watch::Receiver<bool>) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture loop already active");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            self.ctx.clone(),
            self.interval,
            Arc::clone(&self.in_flight),
            cancel_token.clone(),
            encoder_active,
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Stops the loop. A capture already in flight is allowed to finish.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("capture loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Teardown: stop the loop and abort whatever capture is still running.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.stop().await {
            warn!("capture loop ended abnormally: {err:#}");
        }
        if let Some(handle) = self.in_flight.lock().await.take() {
            if !handle.is_finished() {
                info!("Aborting in-flight capture on teardown");
            }
            handle.abort();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub fn read_surface(surface: &Arc<StdMutex<CaptureSurface>>) -> RgbaImage {
    match surface.lock() {
        Ok(guard) => guard.snapshot(),
        Err(poisoned) => poisoned.into_inner().snapshot(),
    }
}
