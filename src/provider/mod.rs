//! Where replay records come from.

mod archive;
mod http;

pub use archive::ArchiveReplayProvider;
pub use http::HttpReplayProvider;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ReplayError;
use crate::models::ReplayData;

pub const DEFAULT_LOAD_ERROR: &str = "Failed to fetch replay data";

/// One round trip per call; no retries, no partial results.
#[async_trait]
pub trait ReplayProvider: Send + Sync {
    async fn get_replay(&self, session_id: &str) -> Result<ReplayData, ReplayError>;
}

/// `{ success, data, error }` wrapper used by the replay endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiEnvelope<Value> {
    /// Unwraps a successful envelope into a replay record.
    pub fn into_replay(self) -> Result<ReplayData, ReplayError> {
        if !self.success {
            return Err(ReplayError::Load(
                self.error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_LOAD_ERROR.to_string()),
            ));
        }
        match self.data {
            Some(Value::Null) | None => Err(ReplayError::Load(DEFAULT_LOAD_ERROR.to_string())),
            Some(data) => {
                serde_json::from_value(data).map_err(|err| ReplayError::Malformed(err.to_string()))
            }
        }
    }
}

pub fn decode_envelope(body: &str) -> Result<ReplayData, ReplayError> {
    let envelope: ApiEnvelope<Value> =
        serde_json::from_str(body).map_err(|err| ReplayError::Malformed(err.to_string()))?;
    envelope.into_replay()
}
