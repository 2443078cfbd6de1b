//! Video encoders behind a common trait, and the registry that picks one.
//!
//! An encoder consumes RGBA frames and emits container bytes in chunks on an
//! unbounded channel. The channel closes once the encoder has flushed its
//! trailer, which is how the recording controller knows the output is whole.

mod ffmpeg;
mod gif;

pub use ffmpeg::FfmpegBackend;
pub use gif::GifBackend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::RgbaImage;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type ChunkSender = mpsc::UnboundedSender<Vec<u8>>;
pub type ChunkReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderFormat {
    WebmVp9,
    WebmVp8,
    Mp4H264,
    Gif,
}

impl EncoderFormat {
    /// Best quality first.
    pub const PREFERENCE: [EncoderFormat; 4] = [
        EncoderFormat::WebmVp9,
        EncoderFormat::WebmVp8,
        EncoderFormat::Mp4H264,
        EncoderFormat::Gif,
    ];

    pub const DEFAULT: EncoderFormat = EncoderFormat::Gif;

    pub fn mime_type(self) -> &'static str {
        match self {
            EncoderFormat::WebmVp9 => "video/webm;codecs=vp9",
            EncoderFormat::WebmVp8 => "video/webm;codecs=vp8",
            EncoderFormat::Mp4H264 => "video/mp4;codecs=avc1",
            EncoderFormat::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            EncoderFormat::WebmVp9 | EncoderFormat::WebmVp8 => "webm",
            EncoderFormat::Mp4H264 => "mp4",
            EncoderFormat::Gif => "gif",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EncoderFormat::WebmVp9 => "webm-vp9",
            EncoderFormat::WebmVp8 => "webm-vp8",
            EncoderFormat::Mp4H264 => "mp4-h264",
            EncoderFormat::Gif => "gif",
        }
    }
}

impl fmt::Display for EncoderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EncoderFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        EncoderFormat::PREFERENCE
            .into_iter()
            .find(|format| format.label().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| anyhow!("unknown encoder format '{value}'"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub format: EncoderFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
}

/// A running encoder session.
#[async_trait]
pub trait VideoEncoder: Send {
    fn format(&self) -> EncoderFormat;

    async fn push_frame(&mut self, frame: RgbaImage) -> Result<()>;

    /// Flushes the container and closes the chunk channel.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Drops pending output without finalizing.
    fn abort(self: Box<Self>);
}

/// Something that can start encoders for one or more formats.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Formats this backend knows how to drive at all.
    fn handles(&self, format: EncoderFormat) -> bool;

    /// Whether the format is usable in this environment right now.
    async fn supports(&self, format: EncoderFormat) -> bool;

    async fn start(&self, config: &EncoderConfig) -> Result<(Box<dyn VideoEncoder>, ChunkReceiver)>;
}

#[derive(Clone)]
pub struct EncoderCandidate {
    pub format: EncoderFormat,
    pub backend: Arc<dyn EncoderBackend>,
}

impl fmt::Debug for EncoderCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderCandidate")
            .field("format", &self.format)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[derive(Clone)]
pub struct EncoderRegistry {
    backends: Vec<Arc<dyn EncoderBackend>>,
    preference: Vec<EncoderFormat>,
}

impl EncoderRegistry {
    pub fn new(backends: Vec<Arc<dyn EncoderBackend>>) -> Self {
        Self {
            backends,
            preference: EncoderFormat::PREFERENCE.to_vec(),
        }
    }

    /// ffmpeg for the video containers, in-process GIF as the last resort.
    pub fn with_defaults() -> Self {
        Self::new(vec![Arc::new(FfmpegBackend::default()), Arc::new(GifBackend)])
    }

    pub fn with_preference(mut self, preference: Vec<EncoderFormat>) -> Self {
        if !preference.is_empty() {
            self.preference = preference;
        }
        self
    }

    pub fn preference(&self) -> &[EncoderFormat] {
        &self.preference
    }

    /// Supported formats in preference order. When nothing reports support
    /// the final default is returned alone, if any backend handles it.
    pub async fn candidates(&self) -> Vec<EncoderCandidate> {
        let mut candidates = Vec::new();
        for &format in &self.preference {
            for backend in &self.backends {
                if backend.handles(format) && backend.supports(format).await {
                    debug!("encoder {} supported by {}", format, backend.name());
                    candidates.push(EncoderCandidate {
                        format,
                        backend: Arc::clone(backend),
                    });
                    break;
                }
            }
        }

        if candidates.is_empty() {
            if let Some(backend) = self.backends.iter().find(|b| b.handles(EncoderFormat::DEFAULT)) {
                info!("no encoder reported support; falling back to {}", EncoderFormat::DEFAULT);
                candidates.push(EncoderCandidate {
                    format: EncoderFormat::DEFAULT,
                    backend: Arc::clone(backend),
                });
            }
        }

        candidates
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory encoder: one chunk per frame, plus a trailer on finish.
    pub(crate) struct FakeEncoder {
        format: EncoderFormat,
        tx: Option<ChunkSender>,
        frames: Arc<AtomicUsize>,
        fail_push: bool,
        emit: bool,
        finish: FinishBehavior,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    pub(crate) enum FinishBehavior {
        #[default]
        Flush,
        /// Returns an error without writing the trailer.
        Fail,
        /// Never returns, like an encoder process that hangs on exit.
        Hang,
    }

    #[async_trait]
    impl VideoEncoder for FakeEncoder {
        fn format(&self) -> EncoderFormat {
            self.format
        }

        async fn push_frame(&mut self, frame: RgbaImage) -> Result<()> {
            if self.fail_push {
                return Err(anyhow!("encoder rejected frame"));
            }
            self.frames.fetch_add(1, Ordering::SeqCst);
            if self.emit {
                if let Some(tx) = &self.tx {
                    let _ = tx.send(vec![frame.get_pixel(0, 0).0[0]; 4]);
                    // Empty chunks are legal and must be skipped downstream.
                    let _ = tx.send(Vec::new());
                }
            }
            Ok(())
        }

        async fn finish(mut self: Box<Self>) -> Result<()> {
            match self.finish {
                FinishBehavior::Flush => {}
                FinishBehavior::Fail => return Err(anyhow!("encoder crashed while flushing")),
                FinishBehavior::Hang => std::future::pending::<()>().await,
            }
            if self.emit {
                if let Some(tx) = self.tx.take() {
                    let _ = tx.send(b"END".to_vec());
                }
            }
            Ok(())
        }

        fn abort(self: Box<Self>) {}
    }

    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub supported: Vec<EncoderFormat>,
        pub failing_start: Vec<EncoderFormat>,
        pub fail_push: bool,
        pub silent: bool,
        pub finish: FinishBehavior,
        pub frames: Arc<AtomicUsize>,
        pub started: Mutex<Vec<EncoderFormat>>,
    }

    impl FakeBackend {
        pub(crate) fn supporting(formats: &[EncoderFormat]) -> Self {
            Self {
                supported: formats.to_vec(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl EncoderBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn handles(&self, _format: EncoderFormat) -> bool {
            true
        }

        async fn supports(&self, format: EncoderFormat) -> bool {
            self.supported.contains(&format)
        }

        async fn start(&self, config: &EncoderConfig) -> Result<(Box<dyn VideoEncoder>, ChunkReceiver)> {
            self.started.lock().unwrap().push(config.format);
            if self.failing_start.contains(&config.format) {
                return Err(anyhow!("{} refused to start", config.format));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let encoder = FakeEncoder {
                format: config.format,
                tx: Some(tx),
                frames: Arc::clone(&self.frames),
                fail_push: self.fail_push,
                emit: !self.silent,
                finish: self.finish,
            };
            Ok((Box::new(encoder), rx))
        }
    }

    #[test]
    fn format_metadata_and_parsing() {
        assert_eq!(EncoderFormat::WebmVp9.extension(), "webm");
        assert_eq!(EncoderFormat::Mp4H264.extension(), "mp4");
        assert_eq!(EncoderFormat::Gif.mime_type(), "image/gif");
        assert_eq!("WEBM-VP8".parse::<EncoderFormat>().unwrap(), EncoderFormat::WebmVp8);
        assert!("avi".parse::<EncoderFormat>().is_err());
        assert_eq!(serde_json::to_string(&EncoderFormat::Mp4H264).unwrap(), "\"mp4-h264\"");
    }

    #[tokio::test]
    async fn candidates_follow_preference_order() {
        let backend = Arc::new(FakeBackend::supporting(&[EncoderFormat::Gif, EncoderFormat::WebmVp8]));
        let registry = EncoderRegistry::new(vec![backend]);
        let formats: Vec<_> = registry.candidates().await.into_iter().map(|c| c.format).collect();
        assert_eq!(formats, vec![EncoderFormat::WebmVp8, EncoderFormat::Gif]);
    }

    #[tokio::test]
    async fn nothing_supported_falls_back_to_default() {
        let backend = Arc::new(FakeBackend::supporting(&[]));
        let registry = EncoderRegistry::new(vec![backend]);
        let candidates = registry.candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].format, EncoderFormat::DEFAULT);
    }

    #[tokio::test]
    async fn custom_preference_is_respected() {
        let backend = Arc::new(FakeBackend::supporting(&EncoderFormat::PREFERENCE));
        let registry = EncoderRegistry::new(vec![backend])
            .with_preference(vec![EncoderFormat::Mp4H264, EncoderFormat::WebmVp9]);
        let formats: Vec<_> = registry.candidates().await.into_iter().map(|c| c.format).collect();
        assert_eq!(formats, vec![EncoderFormat::Mp4H264, EncoderFormat::WebmVp9]);
    }
}
