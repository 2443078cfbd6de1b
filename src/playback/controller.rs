use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::{debug, info};
use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::models::ReplayData;

use super::{
    state::{PlaybackSpeed, PlaybackState},
    timeline::{ReplayTimeline, VisibleWindow},
};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub state: PlaybackState,
    pub progress_percent: f64,
}

impl From<&PlaybackState> for PlaybackSnapshot {
    fn from(state: &PlaybackState) -> Self {
        Self {
            progress_percent: state.progress_percent(),
            state: state.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    StateChanged(PlaybackSnapshot),
    Tick(PlaybackSnapshot),
    /// The virtual clock reached the session duration and auto-paused.
    Ended(PlaybackSnapshot),
}

/// Virtual clock over one loaded replay.
///
/// Cloning is cheap and every clone drives the same clock.
#[derive(Clone)]
pub struct PlaybackEngine {
    state: Arc<Mutex<PlaybackState>>,
    timeline: Arc<Mutex<Option<Arc<ReplayTimeline>>>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    events: broadcast::Sender<PlaybackEvent>,
}

impl PlaybackEngine {
    pub fn new(tick_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(PlaybackState::new())),
            timeline: Arc::new(Mutex::new(None)),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Replaces the loaded session and rewinds to zero, paused.
    pub async fn load(&self, replay: ReplayData) -> Arc<ReplayTimeline> {
        let timeline = Arc::new(ReplayTimeline::new(replay));
        {
            let mut ticker = self.ticker.lock().await;
            abort_ticker(&mut ticker);
            let mut state = self.state.lock().await;
            state.load(timeline.session_id().to_string(), timeline.duration_ms());
        }
        *self.timeline.lock().await = Some(Arc::clone(&timeline));

        info!(
            "Loaded replay {} ({} ms, {} operation logs, {} KPI entries)",
            timeline.session_id(),
            timeline.duration_ms(),
            timeline.operation_logs().len(),
            timeline.kpi_timeline().len()
        );

        self.emit_state_changed().await;
        timeline
    }

    pub async fn unload(&self) {
        {
            let mut ticker = self.ticker.lock().await;
            abort_ticker(&mut ticker);
            self.state.lock().await.unload();
        }
        *self.timeline.lock().await = None;
        self.emit_state_changed().await;
    }

    pub async fn timeline(&self) -> Option<Arc<ReplayTimeline>> {
        self.timeline.lock().await.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session_id.clone()
    }

    pub async fn get_state(&self) -> PlaybackState {
        self.state.lock().await.clone()
    }

    pub async fn get_snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot::from(&*self.state.lock().await)
    }

    pub async fn current_ms(&self) -> u64 {
        self.state.lock().await.current_ms
    }

    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.is_playing()
    }

    /// Entries visible at the current cursor, or `None` with nothing loaded.
    pub async fn visible(&self) -> Option<VisibleWindow> {
        let timeline = self.timeline().await?;
        let current_ms = self.current_ms().await;
        Some(VisibleWindow::new(timeline, current_ms))
    }

    pub async fn play(&self) -> Result<PlaybackState> {
        // Lock order is ticker, then state, for every transition.
        let (started, ended) = {
            let mut ticker = self.ticker.lock().await;
            let mut state = self.state.lock().await;
            if state.session_id.is_none() {
                return Err(anyhow!("no replay session loaded"));
            }
            if !state.play() {
                return Ok(state.clone());
            }
            // Nothing to play: reach the end without waiting for a tick.
            let ended = state.duration_ms == 0 && state.advance(0);
            if !ended {
                self.spawn_ticker(&mut ticker);
            }
            (state.clone(), ended)
        };

        if ended {
            self.emit_state_changed().await;
            let _ = self.events.send(PlaybackEvent::Ended(PlaybackSnapshot::from(&started)));
            return Ok(self.get_state().await);
        }

        debug!("Playback started at {} ms ({}x)", started.current_ms, started.speed.multiplier());
        self.emit_state_changed().await;
        Ok(self.get_state().await)
    }

    pub async fn pause(&self) -> PlaybackState {
        {
            let mut ticker = self.ticker.lock().await;
            self.state.lock().await.pause();
            abort_ticker(&mut ticker);
        }
        self.emit_state_changed().await;
        self.get_state().await
    }

    /// Moves the cursor and stops autoplay, whatever the previous state.
    pub async fn seek(&self, target_ms: i64) -> PlaybackState {
        {
            let mut ticker = self.ticker.lock().await;
            self.state.lock().await.seek(target_ms);
            abort_ticker(&mut ticker);
        }
        self.emit_state_changed().await;
        self.get_state().await
    }

    pub async fn set_speed(&self, speed: PlaybackSpeed) -> PlaybackState {
        self.state.lock().await.speed = speed;
        self.emit_state_changed().await;
        self.get_state().await
    }

    pub async fn shutdown(&self) {
        let mut ticker = self.ticker.lock().await;
        self.state.lock().await.pause();
        abort_ticker(&mut ticker);
    }

    /// Replaces the ticker in `slot`; the caller holds the ticker lock.
    fn spawn_ticker(&self, slot: &mut Option<JoinHandle<()>>) {
        abort_ticker(slot);

        let state = self.state.clone();
        let events = self.events.clone();
        let tick_interval = self.tick_interval;
        let wall_ms = tick_interval.as_millis() as u64;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let (snapshot, ended) = {
                    let mut guard = state.lock().await;
                    if !guard.is_playing() {
                        break;
                    }
                    let ended = guard.advance(wall_ms);
                    (PlaybackSnapshot::from(&*guard), ended)
                };

                if ended {
                    info!(
                        "Playback reached the end of session {}",
                        snapshot.state.session_id.as_deref().unwrap_or("-")
                    );
                    let _ = events.send(PlaybackEvent::StateChanged(snapshot.clone()));
                    let _ = events.send(PlaybackEvent::Ended(snapshot));
                    break;
                }

                let _ = events.send(PlaybackEvent::Tick(snapshot));
            }
        });

        *slot = Some(handle);
    }

    async fn emit_state_changed(&self) {
        let snapshot = self.get_snapshot().await;
        let _ = self.events.send(PlaybackEvent::StateChanged(snapshot));
    }
}

fn abort_ticker(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::timeline::tests::scenario_replay;
    use crate::playback::PlaybackStatus;

    async fn engine_with(duration_seconds: f64) -> PlaybackEngine {
        let engine = PlaybackEngine::default();
        let mut replay = scenario_replay();
        replay.duration_seconds = Some(duration_seconds);
        engine.load(replay).await;
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn double_speed_reaches_end_in_half_the_wall_time() {
        let engine = engine_with(5.0).await;
        let mut events = engine.subscribe();
        engine.set_speed(PlaybackSpeed::Double).await;
        engine.play().await.unwrap();

        time::sleep(Duration::from_millis(2_400)).await;
        assert!(engine.is_playing().await);
        assert!(engine.current_ms().await < 5_000);

        time::sleep(Duration::from_millis(200)).await;
        let state = engine.get_state().await;
        assert_eq!(state.current_ms, 5_000);
        assert_eq!(state.status, PlaybackStatus::Paused);

        let mut saw_end = false;
        while let Ok(event) = events.try_recv() {
            if let PlaybackEvent::Ended(snapshot) = event {
                assert_eq!(snapshot.state.current_ms, 5_000);
                saw_end = true;
            }
        }
        assert!(saw_end);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_always_pauses() {
        let engine = engine_with(10.0).await;
        engine.play().await.unwrap();
        time::sleep(Duration::from_millis(350)).await;

        let state = engine.seek(6_000).await;
        assert_eq!(state.status, PlaybackStatus::Paused);
        assert_eq!(state.current_ms, 6_000);

        // The clock must not keep running after a manual seek.
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.current_ms().await, 6_000);

        let state = engine.seek(3_000).await;
        assert_eq!(state.status, PlaybackStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_then_visible_matches_scenario() {
        let engine = engine_with(10.0).await;
        engine.seek(6_000).await;
        let window = engine.visible().await.unwrap();
        assert_eq!(window.logs().len(), 2);
        assert!(window.kpi().unwrap().error_event);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_change_keeps_cursor_and_affects_future_ticks() {
        let engine = engine_with(10.0).await;
        engine.play().await.unwrap();
        time::sleep(Duration::from_millis(1_050)).await;
        let before = engine.current_ms().await;
        assert_eq!(before, 1_000);

        let state = engine.set_speed(PlaybackSpeed::Half).await;
        assert_eq!(state.current_ms, before);
        assert!(state.is_playing());

        time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(engine.current_ms().await, 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_the_clock_and_play_is_idempotent() {
        let engine = engine_with(10.0).await;
        engine.play().await.unwrap();
        engine.play().await.unwrap();
        time::sleep(Duration::from_millis(550)).await;
        assert_eq!(engine.current_ms().await, 500);

        engine.pause().await;
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.current_ms().await, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_ends_immediately() {
        let engine = engine_with(0.0).await;
        let state = engine.play().await.unwrap();
        assert!(!state.is_playing());
        assert_eq!(state.current_ms, 0);
    }

    #[tokio::test]
    async fn play_without_session_is_an_error() {
        let engine = PlaybackEngine::default();
        assert!(engine.play().await.is_err());
        assert!(engine.visible().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn loading_resets_to_zero() {
        let engine = engine_with(10.0).await;
        engine.seek(4_000).await;
        engine.load(scenario_replay()).await;
        let state = engine.get_state().await;
        assert_eq!(state.current_ms, 0);
        assert!(!state.is_playing());
    }

    /// Playing exactly when a live ticker exists.
    async fn clock_is_consistent(engine: &PlaybackEngine) -> bool {
        let ticker = engine.ticker.lock().await;
        let playing = engine.state.lock().await.is_playing();
        let ticking = ticker.as_ref().is_some_and(|handle| !handle.is_finished());
        playing == ticking
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_play_against_pause_and_seek_never_freezes_the_clock() {
        let engine = engine_with(600.0).await;
        for round in 0..200 {
            let (a, b, c) = (engine.clone(), engine.clone(), engine.clone());
            let play = tokio::spawn(async move { a.play().await.map(|_| ()) });
            let pause = tokio::spawn(async move {
                b.pause().await;
            });
            let seek = tokio::spawn(async move {
                if round % 2 == 0 {
                    c.seek(round * 10).await;
                }
            });
            play.await.unwrap().unwrap();
            pause.await.unwrap();
            seek.await.unwrap();
            assert!(clock_is_consistent(&engine).await, "round {round}");
        }

        engine.play().await.unwrap();
        let before = engine.current_ms().await;
        time::sleep(Duration::from_millis(350)).await;
        assert!(engine.current_ms().await > before);
        engine.shutdown().await;
    }
}
