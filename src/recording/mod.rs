//! Recording the replay view to a video file.

pub mod artifact;
pub mod controller;
pub(crate) mod encoder;
pub mod state;

pub use controller::RecordingController;
pub use encoder::{
    EncoderBackend, EncoderCandidate, EncoderConfig, EncoderFormat, EncoderRegistry, FfmpegBackend, GifBackend,
    VideoEncoder,
};
pub use state::{
    RecordingArtifact, RecordingConfig, RecordingEvent, RecordingPhase, RecordingStatus, DEFAULT_BITRATE,
    DEFAULT_ENCODER_FPS,
};
