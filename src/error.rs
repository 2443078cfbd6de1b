use thiserror::Error;

/// Failure loading a replay record. Fatal for the view: nothing is rendered.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("{0}")]
    Load(String),

    #[error("malformed replay record: {0}")]
    Malformed(String),

    #[error("no replay session loaded")]
    NotLoaded,
}

impl From<anyhow::Error> for ReplayError {
    fn from(err: anyhow::Error) -> Self {
        ReplayError::Load(format!("{err:#}"))
    }
}

/// Boundary errors of the recording controller.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording target view is not mounted")]
    TargetMissing,

    #[error("recording already in progress")]
    AlreadyRecording,

    #[error("no replay session loaded")]
    NoSessionLoaded,

    #[error("no usable video encoder: {0}")]
    NoEncoder(String),

    #[error("failed to start encoder {format}: {message}")]
    EncoderStart { format: String, message: String },

    #[error("capture pipeline failed: {0}")]
    Capture(String),

    #[error("no data was captured; nothing to save")]
    NoDataCaptured,

    #[error("failed to finalize recording: {0}")]
    Finalize(String),
}
