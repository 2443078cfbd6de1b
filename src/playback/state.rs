use serde::{Deserialize, Serialize};
use std::cmp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackStatus {
    Paused,
    Playing,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        PlaybackStatus::Paused
    }
}

/// Discrete playback rates offered by the speed selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "f64", into = "f64")]
pub enum PlaybackSpeed {
    Half,
    Normal,
    OneAndHalf,
    Double,
}

impl PlaybackSpeed {
    pub const ALL: [PlaybackSpeed; 4] = [
        PlaybackSpeed::Half,
        PlaybackSpeed::Normal,
        PlaybackSpeed::OneAndHalf,
        PlaybackSpeed::Double,
    ];

    pub fn multiplier(self) -> f64 {
        match self {
            PlaybackSpeed::Half => 0.5,
            PlaybackSpeed::Normal => 1.0,
            PlaybackSpeed::OneAndHalf => 1.5,
            PlaybackSpeed::Double => 2.0,
        }
    }

    /// Virtual milliseconds covered by one wall-clock tick at this speed.
    pub fn scale(self, wall_ms: u64) -> u64 {
        (wall_ms as f64 * self.multiplier()).round() as u64
    }
}

impl Default for PlaybackSpeed {
    fn default() -> Self {
        PlaybackSpeed::Normal
    }
}

impl TryFrom<f64> for PlaybackSpeed {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|speed| (speed.multiplier() - value).abs() < f64::EPSILON)
            .ok_or_else(|| format!("unsupported playback speed {value}x (expected 0.5, 1, 1.5 or 2)"))
    }
}

impl From<PlaybackSpeed> for f64 {
    fn from(speed: PlaybackSpeed) -> Self {
        speed.multiplier()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub speed: PlaybackSpeed,
    pub session_id: Option<String>,
    pub current_ms: u64,
    pub duration_ms: u64,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    pub fn is_at_end(&self) -> bool {
        self.current_ms >= self.duration_ms
    }

    /// Loading keeps the chosen speed but rewinds and pauses.
    pub fn load(&mut self, session_id: String, duration_ms: u64) {
        *self = Self {
            status: PlaybackStatus::Paused,
            speed: self.speed,
            session_id: Some(session_id),
            current_ms: 0,
            duration_ms,
        };
    }

    /// Returns false when already playing.
    pub fn play(&mut self) -> bool {
        if self.is_playing() {
            return false;
        }
        if self.is_at_end() {
            self.current_ms = 0;
        }
        self.status = PlaybackStatus::Playing;
        true
    }

    pub fn pause(&mut self) {
        self.status = PlaybackStatus::Paused;
    }

    pub fn seek(&mut self, target_ms: i64) {
        self.current_ms = cmp::min(cmp::max(target_ms, 0) as u64, self.duration_ms);
        self.status = PlaybackStatus::Paused;
    }

    /// Advances by one tick; returns true when the run reached the end.
    pub fn advance(&mut self, wall_ms: u64) -> bool {
        if !self.is_playing() {
            return false;
        }
        let next = self.current_ms.saturating_add(self.speed.scale(wall_ms));
        if next >= self.duration_ms {
            self.current_ms = self.duration_ms;
            self.status = PlaybackStatus::Paused;
            true
        } else {
            self.current_ms = next;
            false
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.duration_ms == 0 {
            0.0
        } else {
            self.current_ms as f64 / self.duration_ms as f64 * 100.0
        }
    }

    pub fn unload(&mut self) {
        *self = Self {
            speed: self.speed,
            ..Self::default()
        };
    }
}
