use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::error::ReplayError;
use crate::models::ReplayData;

use super::{ApiEnvelope, ReplayProvider, DEFAULT_LOAD_ERROR};

/// Fetches records from `GET {base}/api/replay/{session_id}`.
#[derive(Debug, Clone)]
pub struct HttpReplayProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReplayProvider {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("training-replay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn replay_url(&self, session_id: &str) -> String {
        format!("{}/api/replay/{}", self.base_url, session_id)
    }
}

#[async_trait]
impl ReplayProvider for HttpReplayProvider {
    async fn get_replay(&self, session_id: &str) -> Result<ReplayData, ReplayError> {
        let url = self.replay_url(session_id);
        debug!("Fetching replay from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("{DEFAULT_LOAD_ERROR}: request to {url} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        match serde_json::from_str::<ApiEnvelope<Value>>(&body) {
            Ok(envelope) if status.is_success() => envelope.into_replay(),
            Ok(envelope) => Err(ReplayError::Load(
                envelope
                    .error
                    .unwrap_or_else(|| format!("{DEFAULT_LOAD_ERROR} (HTTP {status})")),
            )),
            Err(_) if !status.is_success() => {
                Err(ReplayError::Load(format!("{DEFAULT_LOAD_ERROR} (HTTP {status})")))
            }
            Err(err) => Err(ReplayError::Malformed(err.to_string())),
        }
    }
}
