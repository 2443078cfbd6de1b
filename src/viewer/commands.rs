use serde::{Deserialize, Serialize};

use crate::models::Session;
use crate::playback::{PlaybackSnapshot, PlaybackSpeed};
use crate::recording::{RecordingArtifact, RecordingStatus};

use super::{ReplayViewer, ViewSnapshot};

/// Control surface of the replay view, as sent by a UI or script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Open { session_id: String },
    Play,
    Pause,
    Seek { time_ms: i64 },
    SetSpeed { speed: PlaybackSpeed },
    StartRecording,
    StopRecording,
    Snapshot,
    Close,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandReply {
    Session(Session),
    Playback(PlaybackSnapshot),
    Recording(RecordingStatus),
    Artifact(Option<RecordingArtifact>),
    View(Box<ViewSnapshot>),
}

impl ReplayViewer {
    /// Runs one command; failures come back as user-facing messages.
    pub async fn dispatch(&self, command: ControlCommand) -> Result<CommandReply, String> {
        match command {
            ControlCommand::Open { session_id } => self
                .open(&session_id)
                .await
                .map(CommandReply::Session)
                .map_err(|e| e.to_string()),
            ControlCommand::Play => self
                .play()
                .await
                .map(CommandReply::Playback)
                .map_err(|e| e.to_string()),
            ControlCommand::Pause => Ok(CommandReply::Playback(self.pause().await)),
            ControlCommand::Seek { time_ms } => Ok(CommandReply::Playback(self.seek(time_ms).await)),
            ControlCommand::SetSpeed { speed } => Ok(CommandReply::Playback(self.set_speed(speed).await)),
            ControlCommand::StartRecording => self
                .start_recording()
                .await
                .map(CommandReply::Recording)
                .map_err(|e| e.to_string()),
            ControlCommand::StopRecording => self
                .stop_recording()
                .await
                .map(CommandReply::Artifact)
                .map_err(|e| e.to_string()),
            ControlCommand::Snapshot => Ok(CommandReply::View(Box::new(self.snapshot().await))),
            ControlCommand::Close => self
                .close()
                .await
                .map(CommandReply::Artifact)
                .map_err(|e| e.to_string()),
        }
    }
}
