use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::capture::{parse_hex_color, CaptureConfig, DEFAULT_TAIL_ROWS, MIN_SURFACE_HEIGHT, MIN_SURFACE_WIDTH};
use crate::metrics::DegradationPolicy;
use crate::playback::DEFAULT_TICK_INTERVAL;
use crate::recording::{
    EncoderFormat, EncoderRegistry, RecordingConfig, DEFAULT_BITRATE, DEFAULT_ENCODER_FPS,
};

pub const ENV_API_URL: &str = "REPLAY_API_URL";
pub const ENV_OUTPUT_DIR: &str = "REPLAY_OUTPUT_DIR";
pub const ENV_DEBUG: &str = "REPLAY_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplaySettings {
    /// Replay API root; when unset records come from the local archive.
    pub api_base_url: Option<String>,
    pub archive_path: PathBuf,
    pub output_dir: PathBuf,
    pub playback_tick_ms: u64,
    pub capture_interval_ms: u64,
    pub capture_timeout_ms: u64,
    pub encoder_fps: u32,
    pub encoder_bitrate: u32,
    pub min_surface_width: u32,
    pub min_surface_height: u32,
    pub background_color: String,
    pub format_preference: Vec<EncoderFormat>,
    pub stop_on_playback_end: bool,
    pub request_timeout_secs: u64,
    pub log_tail_rows: usize,
    pub debug_logging: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            archive_path: PathBuf::from("replays.db"),
            output_dir: PathBuf::from("recordings"),
            playback_tick_ms: DEFAULT_TICK_INTERVAL.as_millis() as u64,
            capture_interval_ms: 100,
            capture_timeout_ms: 2_000,
            encoder_fps: DEFAULT_ENCODER_FPS,
            encoder_bitrate: DEFAULT_BITRATE,
            min_surface_width: MIN_SURFACE_WIDTH,
            min_surface_height: MIN_SURFACE_HEIGHT,
            background_color: "#ffffff".into(),
            format_preference: EncoderFormat::PREFERENCE.to_vec(),
            stop_on_playback_end: true,
            request_timeout_secs: 30,
            log_tail_rows: DEFAULT_TAIL_ROWS,
            debug_logging: false,
        }
    }
}

impl ReplaySettings {
    /// Applies `REPLAY_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = Some(url.trim().to_string());
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            self.output_dir = PathBuf::from(dir.trim());
        }
        if let Some(flag) = lookup(ENV_DEBUG) {
            self.debug_logging = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true");
        }
    }

    pub fn playback_tick(&self) -> Duration {
        Duration::from_millis(self.playback_tick_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn recording_config(&self) -> Result<RecordingConfig> {
        let background = parse_hex_color(&self.background_color)
            .with_context(|| format!("invalid background_color '{}'", self.background_color))?;

        Ok(RecordingConfig {
            capture: CaptureConfig {
                interval: Duration::from_millis(self.capture_interval_ms.max(1)),
                timeout: Duration::from_millis(self.capture_timeout_ms.max(1)),
                min_width: self.min_surface_width,
                min_height: self.min_surface_height,
                background,
            },
            encoder_fps: self.encoder_fps.max(1),
            bitrate: self.encoder_bitrate,
            output_dir: self.output_dir.clone(),
            stop_on_playback_end: self.stop_on_playback_end,
            degradation: DegradationPolicy::default(),
            ..RecordingConfig::default()
        })
    }

    pub fn encoder_registry(&self) -> EncoderRegistry {
        EncoderRegistry::with_defaults().with_preference(self.format_preference.clone())
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<ReplaySettings>,
}

impl SettingsStore {
    /// Loads `path`; a missing or unreadable file yields defaults.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring unreadable settings in {}: {err}", path.display());
                ReplaySettings::default()
            })
        } else {
            ReplaySettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored settings with environment overrides applied.
    pub fn effective(&self) -> ReplaySettings {
        let mut settings = self.read().clone();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    pub fn stored(&self) -> ReplaySettings {
        self.read().clone()
    }

    pub fn update(&self, settings: ReplaySettings) -> Result<()> {
        let mut guard = self.write();
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &ReplaySettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, ReplaySettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ReplaySettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
