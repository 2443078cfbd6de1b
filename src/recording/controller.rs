use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbaImage;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, broadcast::error::RecvError, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::capture::{read_surface, CapturePipeline, CaptureSurface, DegradedHook, FrameSource};
use crate::error::RecordingError;
use crate::metrics::{CaptureOutcome, MetricsCollector};
use crate::playback::{PlaybackEngine, PlaybackEvent};

use super::artifact::{accumulate_chunks, artifact_file_name, write_artifact};
use super::encoder::{ChunkReceiver, EncoderConfig, EncoderFormat, EncoderRegistry, VideoEncoder};
use super::state::{RecordingArtifact, RecordingConfig, RecordingEvent, RecordingPhase, RecordingStatus};

// Set to false to silence per-frame encoder feed logging
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const EVENT_CAPACITY: usize = 32;

/// Everything owned by one recording, from start until the file is emitted.
struct ActiveRecording {
    session_id: String,
    format: EncoderFormat,
    started_at: DateTime<Utc>,
    pipeline: CapturePipeline,
    metrics: MetricsCollector,
    feed: JoinHandle<Box<dyn VideoEncoder>>,
    feed_cancel: CancellationToken,
    accumulator: JoinHandle<Vec<Vec<u8>>>,
    accumulator_cancel: CancellationToken,
    watcher_cancel: CancellationToken,
}

enum Phase {
    Idle,
    Recording(Box<ActiveRecording>),
    Finalizing,
}

impl Phase {
    fn kind(&self) -> RecordingPhase {
        match self {
            Phase::Idle => RecordingPhase::Idle,
            Phase::Recording(_) => RecordingPhase::Recording,
            Phase::Finalizing => RecordingPhase::Finalizing,
        }
    }
}

/// Starts and stops recordings of the replay view.
///
/// Owns the capture pipeline and encoder for the lifetime of a recording and
/// drives playback so the whole replay ends up in the file. Cloning is cheap;
/// all clones share one recording.
#[derive(Clone)]
pub struct RecordingController {
    playback: PlaybackEngine,
    source: Arc<dyn FrameSource>,
    encoders: Arc<EncoderRegistry>,
    config: Arc<RecordingConfig>,
    phase: Arc<Mutex<Phase>>,
    events: broadcast::Sender<RecordingEvent>,
}

impl RecordingController {
    pub fn new(
        playback: PlaybackEngine,
        source: Arc<dyn FrameSource>,
        encoders: EncoderRegistry,
        config: RecordingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            playback,
            source,
            encoders: Arc::new(encoders),
            config: Arc::new(config),
            phase: Arc::new(Mutex::new(Phase::Idle)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub async fn phase(&self) -> RecordingPhase {
        self.phase.lock().await.kind()
    }

    pub async fn is_recording(&self) -> bool {
        matches!(*self.phase.lock().await, Phase::Recording(_))
    }

    pub async fn status(&self) -> RecordingStatus {
        let phase = self.phase.lock().await;
        match &*phase {
            Phase::Recording(active) => {
                let (width, height) = active.pipeline.dimensions();
                let snapshot = active.metrics.get_snapshot().await;
                RecordingStatus {
                    phase: RecordingPhase::Recording,
                    session_id: Some(active.session_id.clone()),
                    format: Some(active.format),
                    width: Some(width),
                    height: Some(height),
                    started_at: Some(active.started_at),
                    health: Some(snapshot.health),
                    system: Some(snapshot.system),
                }
            }
            other => RecordingStatus::idle(other.kind()),
        }
    }

    /// Begins recording the currently loaded replay.
    ///
    /// Nothing is spawned unless every precondition holds: the view is
    /// mounted, a session is loaded and some encoder starts.
    pub async fn start(&self) -> Result<RecordingStatus, RecordingError> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Idle) {
            return Err(RecordingError::AlreadyRecording);
        }

        let bounds = self.source.bounds().await.ok_or(RecordingError::TargetMissing)?;
        let session_id = self
            .playback
            .session_id()
            .await
            .ok_or(RecordingError::NoSessionLoaded)?;

        let metrics = MetricsCollector::new(self.config.degradation);
        let mut pipeline = CapturePipeline::new(
            Arc::clone(&self.source),
            bounds,
            &self.config.capture,
            metrics.clone(),
            Some(self.degraded_hook()),
        );
        let (width, height) = pipeline.dimensions();

        let (encoder, chunk_rx) = self.start_encoder(width, height).await?;
        let format = encoder.format();
        let accumulator_cancel = CancellationToken::new();
        let accumulator = tokio::spawn(accumulate_chunks(chunk_rx, accumulator_cancel.clone()));

        // Subscribe before play() so a replay that ends at once is still seen.
        let watcher_cancel = CancellationToken::new();
        if self.config.stop_on_playback_end {
            self.spawn_end_watcher(watcher_cancel.clone());
        }

        if !self.playback.is_playing().await {
            if let Err(err) = self.playback.play().await {
                watcher_cancel.cancel();
                encoder.abort();
                accumulator.abort();
                warn!("could not start playback for recording: {err:#}");
                return Err(RecordingError::NoSessionLoaded);
            }
        }

        // First frame now, so the encoder never starts on a blank surface.
        if let Some(outcome) = pipeline.capture_now().await {
            if outcome != CaptureOutcome::Completed {
                warn!("initial capture {:?}; recording starts on a blank surface", outcome);
            }
        }

        let (active_tx, active_rx) = watch::channel(true);
        if let Err(err) = pipeline.start(active_rx) {
            watcher_cancel.cancel();
            encoder.abort();
            accumulator.abort();
            return Err(RecordingError::Capture(format!("{err:#}")));
        }

        let feed_cancel = CancellationToken::new();
        let feed = tokio::spawn(encoder_feed(
            encoder,
            pipeline.surface(),
            self.config.encoder_fps,
            feed_cancel.clone(),
            active_tx,
        ));

        let started_at = Utc::now();
        info!(
            "Recording session {} as {} at {}x{} ({} fps)",
            session_id, format, width, height, self.config.encoder_fps
        );
        let _ = self.events.send(RecordingEvent::Started {
            session_id: session_id.clone(),
            format,
            width,
            height,
        });

        let status = RecordingStatus {
            phase: RecordingPhase::Recording,
            session_id: Some(session_id.clone()),
            format: Some(format),
            width: Some(width),
            height: Some(height),
            started_at: Some(started_at),
            health: None,
            system: None,
        };
        *phase = Phase::Recording(Box::new(ActiveRecording {
            session_id,
            format,
            started_at,
            pipeline,
            metrics,
            feed,
            feed_cancel,
            accumulator,
            accumulator_cancel,
            watcher_cancel,
        }));
        Ok(status)
    }

    /// Stops recording and writes the file. `Ok(None)` when not recording.
    pub async fn stop(&self) -> Result<Option<RecordingArtifact>, RecordingError> {
        self.finish_recording(false).await
    }

    /// Teardown: stops any recording, aborting in-flight captures, and halts
    /// playback.
    pub async fn shutdown(&self) -> Result<Option<RecordingArtifact>, RecordingError> {
        let result = self.finish_recording(true).await;
        self.playback.shutdown().await;
        result
    }

    async fn finish_recording(&self, teardown: bool) -> Result<Option<RecordingArtifact>, RecordingError> {
        let active = {
            let mut phase = self.phase.lock().await;
            match std::mem::replace(&mut *phase, Phase::Finalizing) {
                Phase::Recording(active) => active,
                other => {
                    *phase = other;
                    return Ok(None);
                }
            }
        };

        let result = self.finalize(*active, teardown).await;
        *self.phase.lock().await = Phase::Idle;

        match &result {
            Ok(artifact) => {
                info!(
                    "Recording saved to {} ({} bytes, {} chunks)",
                    artifact.path.display(),
                    artifact.bytes,
                    artifact.chunk_count
                );
                let _ = self.events.send(RecordingEvent::Finished(artifact.clone()));
            }
            Err(err) => {
                error!("Recording failed: {err}");
                let _ = self.events.send(RecordingEvent::Failed(err.to_string()));
            }
        }
        result.map(Some)
    }

    async fn finalize(&self, active: ActiveRecording, teardown: bool) -> Result<RecordingArtifact, RecordingError> {
        let ActiveRecording {
            session_id,
            format,
            mut pipeline,
            metrics,
            mut feed,
            feed_cancel,
            mut accumulator,
            accumulator_cancel,
            watcher_cancel,
            ..
        } = active;

        watcher_cancel.cancel();
        if teardown {
            pipeline.shutdown().await;
        } else if let Err(err) = pipeline.stop().await {
            warn!("capture loop ended abnormally: {err:#}");
        }

        // One deadline covers the feed, the encoder flush and the last chunks.
        let limit = self.config.finalize_timeout;
        let deadline = Instant::now() + limit;

        feed_cancel.cancel();
        let encoder_error = match time::timeout_at(deadline, &mut feed).await {
            Ok(Ok(encoder)) => match time::timeout_at(deadline, encoder.finish()).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                // The pending finish owns the encoder; dropping it releases the
                // encoder (ffmpeg children are killed on drop).
                Err(_) => Some(format!("encoder did not finish within {}s", limit.as_secs())),
            },
            Ok(Err(err)) => Some(format!("encoder feed task failed: {err}")),
            Err(_) => {
                feed.abort();
                Some(format!("encoder feed did not stop within {}s", limit.as_secs()))
            }
        };

        if encoder_error.is_some() {
            accumulator_cancel.cancel();
        }
        let mut complete = encoder_error.is_none();
        let collected = match time::timeout_at(deadline, &mut accumulator).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("encoder output still open after {}s; keeping what arrived", limit.as_secs());
                complete = false;
                accumulator_cancel.cancel();
                accumulator.await
            }
        };
        let chunks = collected
            .map_err(|err| RecordingError::Finalize(format!("chunk accumulator failed: {err}")))?;

        if chunks.is_empty() {
            return Err(match encoder_error {
                Some(message) => RecordingError::Finalize(message),
                None => RecordingError::NoDataCaptured,
            });
        }
        if let Some(message) = &encoder_error {
            warn!("Saving partial recording of {session_id}: {message}");
        }

        let file_name = artifact_file_name(&session_id, Utc::now().timestamp_millis(), format);
        let path = write_artifact(&self.config.output_dir, &file_name, &chunks)
            .await
            .map_err(|e| RecordingError::Finalize(format!("{e:#}")))?;

        let (width, height) = pipeline.dimensions();
        let snapshot = metrics.get_snapshot().await;
        if snapshot.health.degraded {
            warn!(
                "Recording {} was degraded: {:.0}% of ticks dropped (cpu {:.0}%, {:.0} MB)",
                file_name,
                snapshot.health.drop_ratio * 100.0,
                snapshot.system.cpu_percent,
                snapshot.system.memory_mb
            );
        }

        Ok(RecordingArtifact {
            bytes: chunks.iter().map(|c| c.len() as u64).sum(),
            chunk_count: chunks.len(),
            path,
            file_name,
            session_id,
            format,
            mime_type: format.mime_type().to_string(),
            width,
            height,
            health: snapshot.health,
            system: snapshot.system,
            complete,
        })
    }

    /// Walks the candidates in preference order until one starts.
    async fn start_encoder(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(Box<dyn VideoEncoder>, ChunkReceiver), RecordingError> {
        let candidates = self.encoders.candidates().await;
        if candidates.is_empty() {
            return Err(RecordingError::NoEncoder(format!(
                "no backend handles any of {:?}",
                self.encoders.preference()
            )));
        }

        let mut last_error = None;
        for candidate in candidates {
            let config = EncoderConfig {
                format: candidate.format,
                width,
                height,
                fps: self.config.encoder_fps.max(1),
                bitrate: self.config.bitrate,
            };
            match candidate.backend.start(&config).await {
                Ok(started) => return Ok(started),
                Err(err) => {
                    warn!("{} encoder failed to start, trying next: {err:#}", candidate.format);
                    last_error = Some(RecordingError::EncoderStart {
                        format: candidate.format.to_string(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RecordingError::NoEncoder("no encoder candidates".into())))
    }

    fn degraded_hook(&self) -> DegradedHook {
        let events = self.events.clone();
        Arc::new(move |health| {
            let _ = events.send(RecordingEvent::Degraded(health.clone()));
        })
    }

    fn spawn_end_watcher(&self, cancel: CancellationToken) {
        let mut playback_events = self.playback.subscribe();
        let controller = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = playback_events.recv() => match event {
                        Ok(PlaybackEvent::Ended(_)) => {
                            info!("Playback ended; stopping recording");
                            if let Err(err) = controller.stop().await {
                                debug!("stop after playback end failed: {err}");
                            }
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("end watcher lagged by {skipped} playback events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Samples the surface at the encoder frame rate, the way a canvas capture
/// stream would, and hands the encoder back when cancelled.
async fn encoder_feed(
    mut encoder: Box<dyn VideoEncoder>,
    surface: Arc<StdMutex<CaptureSurface>>,
    fps: u32,
    cancel: CancellationToken,
    active_tx: watch::Sender<bool>,
) -> Box<dyn VideoEncoder> {
    let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame: RgbaImage = read_surface(&surface);
                if let Err(err) = encoder.push_frame(frame).await {
                    log_warn!("encoder rejected frame {frames}; stopping capture: {err:#}");
                    active_tx.send_replace(false);
                    break;
                }
                frames += 1;
                log_debug!("fed frame {frames} to encoder");
            }
        }
    }

    encoder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::loop_worker::tests::ScriptedSource;
    use crate::capture::CaptureConfig;
    use crate::playback::timeline::tests::scenario_replay;
    use crate::recording::encoder::tests::{FakeBackend, FinishBehavior};
    use crate::recording::encoder::EncoderBackend;
    use std::sync::atomic::Ordering;

    struct Harness {
        controller: RecordingController,
        playback: PlaybackEngine,
        backend: Arc<FakeBackend>,
        source: Arc<ScriptedSource>,
        dir: tempfile::TempDir,
    }

    async fn harness_with(backend: FakeBackend, source: ScriptedSource, load: bool) -> Harness {
        harness_custom(backend, source, load, |_| {}).await
    }

    async fn harness_custom(
        backend: FakeBackend,
        source: ScriptedSource,
        load: bool,
        tweak: impl FnOnce(&mut RecordingConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let playback = PlaybackEngine::default();
        if load {
            playback.load(scenario_replay()).await;
        }
        let backend = Arc::new(backend);
        let source = Arc::new(source);
        let mut config = RecordingConfig {
            capture: CaptureConfig::default(),
            output_dir: dir.path().join("out"),
            ..RecordingConfig::default()
        };
        tweak(&mut config);
        let registry = EncoderRegistry::new(vec![Arc::clone(&backend) as Arc<dyn EncoderBackend>]);
        let controller = RecordingController::new(
            playback.clone(),
            Arc::clone(&source) as Arc<dyn FrameSource>,
            registry,
            config,
        );
        Harness {
            controller,
            playback,
            backend,
            source,
            dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            FakeBackend::supporting(&EncoderFormat::PREFERENCE),
            ScriptedSource::new(Vec::new()),
            true,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn records_and_writes_artifact_on_stop() {
        let h = harness().await;
        let status = h.controller.start().await.unwrap();
        assert_eq!(status.phase, RecordingPhase::Recording);
        assert_eq!(status.format, Some(EncoderFormat::WebmVp9));
        assert_eq!((status.width, status.height), (Some(1280), Some(720)));
        assert!(h.playback.is_playing().await);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let live = h.controller.status().await;
        assert!(live.health.is_some());
        assert!(live.system.is_some());

        let artifact = h.controller.stop().await.unwrap().expect("artifact");
        assert!(artifact.complete);

        assert!(artifact.file_name.starts_with("replay-S-100-"));
        assert!(artifact.file_name.ends_with(".webm"));
        assert_eq!(artifact.mime_type, "video/webm;codecs=vp9");
        assert!(artifact.chunk_count > 1);
        let written = std::fs::read(&artifact.path).unwrap();
        assert_eq!(written.len() as u64, artifact.bytes);
        assert!(written.ends_with(b"END"));
        assert!(artifact.health.completed >= 10);
        assert!(h.backend.frames.load(Ordering::SeqCst) >= 10);
        assert!(!h.controller.is_recording().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_target_spawns_nothing() {
        let mut source = ScriptedSource::new(Vec::new());
        source.bounds = None;
        let h = harness_with(FakeBackend::supporting(&EncoderFormat::PREFERENCE), source, true).await;

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, RecordingError::TargetMissing));
        assert!(!h.controller.is_recording().await);
        assert!(h.backend.started.lock().unwrap().is_empty());
        assert!(!h.playback.is_playing().await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_session_is_rejected() {
        let h = harness_with(
            FakeBackend::supporting(&EncoderFormat::PREFERENCE),
            ScriptedSource::new(Vec::new()),
            false,
        )
        .await;
        assert!(matches!(
            h.controller.start().await.unwrap_err(),
            RecordingError::NoSessionLoaded
        ));
        assert_eq!(h.controller.phase().await, RecordingPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_recording() {
        let h = harness().await;
        h.controller.start().await.unwrap();
        assert!(matches!(
            h.controller.start().await.unwrap_err(),
            RecordingError::AlreadyRecording
        ));
        assert_eq!(h.backend.started.lock().unwrap().len(), 1);
        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_no_op() {
        let h = harness().await;
        let mut events = h.controller.subscribe();
        assert!(h.controller.stop().await.unwrap().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_recording_reports_no_data() {
        let backend = FakeBackend {
            silent: true,
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;
        let mut events = h.controller.subscribe();

        h.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = h.controller.stop().await.unwrap_err();
        assert!(matches!(err, RecordingError::NoDataCaptured));
        assert!(!h.controller.is_recording().await);
        assert!(!h.dir.path().join("out").exists());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let RecordingEvent::Failed(message) = event {
                assert!(message.contains("no data"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_preferred_encoder_fails_to_start() {
        let backend = FakeBackend {
            failing_start: vec![EncoderFormat::WebmVp9, EncoderFormat::WebmVp8],
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;

        let status = h.controller.start().await.unwrap();
        assert_eq!(status.format, Some(EncoderFormat::Mp4H264));
        assert_eq!(
            *h.backend.started.lock().unwrap(),
            vec![EncoderFormat::WebmVp9, EncoderFormat::WebmVp8, EncoderFormat::Mp4H264]
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let artifact = h.controller.stop().await.unwrap().unwrap();
        assert!(artifact.file_name.ends_with(".mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_encoder_failing_surfaces_the_last_error() {
        let backend = FakeBackend {
            failing_start: EncoderFormat::PREFERENCE.to_vec(),
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, RecordingError::EncoderStart { ref format, .. } if format == "gif"));
        assert!(!h.playback.is_playing().await);
        assert_eq!(h.controller.phase().await, RecordingPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_end_stops_recording() {
        let h = harness().await;
        let mut events = h.controller.subscribe();
        h.playback.set_speed(crate::playback::PlaybackSpeed::Double).await;

        h.controller.start().await.unwrap();
        // 10 s of replay at 2x.
        tokio::time::sleep(Duration::from_millis(5300)).await;

        assert!(!h.controller.is_recording().await);
        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let RecordingEvent::Finished(artifact) = event {
                finished = Some(artifact);
            }
        }
        let artifact = finished.expect("recording finished on playback end");
        assert!(artifact.path.exists());
        assert_eq!(h.playback.current_ms().await, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_failure_stops_capture_but_not_recording() {
        let backend = FakeBackend {
            fail_push: true,
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;
        h.controller.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.controller.is_recording().await);
        // One immediate capture, and at most one tick before the loop sees the
        // encoder is gone.
        assert!(h.source.calls.load(Ordering::SeqCst) <= 2);

        // The trailer still arrives on finish.
        let artifact = h.controller.stop().await.unwrap().unwrap();
        assert_eq!(artifact.chunk_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_halts_playback_and_recording() {
        let h = harness().await;
        h.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let artifact = h.controller.shutdown().await.unwrap();
        assert!(artifact.is_some());
        assert!(!h.playback.is_playing().await);
        assert_eq!(h.controller.phase().await, RecordingPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_encoder_cannot_wedge_teardown() {
        let backend = FakeBackend {
            finish: FinishBehavior::Hang,
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_custom(backend, ScriptedSource::new(Vec::new()), true, |config| {
            config.finalize_timeout = Duration::from_secs(5);
        })
        .await;
        let mut events = h.controller.subscribe();

        h.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let artifact = tokio::time::timeout(Duration::from_secs(60), h.controller.shutdown())
            .await
            .expect("teardown finished")
            .unwrap()
            .expect("frames already encoded are kept");
        assert!(!artifact.complete);
        assert!(artifact.chunk_count >= 1);
        assert!(!std::fs::read(&artifact.path).unwrap().ends_with(b"END"));
        assert_eq!(h.controller.phase().await, RecordingPhase::Idle);

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= matches!(event, RecordingEvent::Finished(_));
        }
        assert!(finished);

        // The controller is usable again.
        h.controller.start().await.unwrap();
        assert!(h.controller.is_recording().await);
        tokio::time::timeout(Duration::from_secs(60), h.controller.shutdown())
            .await
            .expect("second teardown finished")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_the_partial_recording() {
        let backend = FakeBackend {
            finish: FinishBehavior::Fail,
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;

        h.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let artifact = h.controller.stop().await.unwrap().expect("partial artifact");

        assert!(!artifact.complete);
        let written = std::fs::read(&artifact.path).unwrap();
        assert_eq!(written.len() as u64, artifact.bytes);
        assert!(!written.ends_with(b"END"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_without_output_reports_the_encoder_error() {
        let backend = FakeBackend {
            finish: FinishBehavior::Fail,
            silent: true,
            ..FakeBackend::supporting(&EncoderFormat::PREFERENCE)
        };
        let h = harness_with(backend, ScriptedSource::new(Vec::new()), true).await;

        h.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = h.controller.stop().await.unwrap_err();
        assert!(matches!(err, RecordingError::Finalize(ref message) if message.contains("crashed")));
        assert!(!h.dir.path().join("out").exists());
        assert_eq!(h.controller.phase().await, RecordingPhase::Idle);
    }
}
