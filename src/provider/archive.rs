use async_trait::async_trait;

use crate::db::Database;
use crate::error::ReplayError;
use crate::models::ReplayData;

use super::ReplayProvider;

/// Serves records from the local SQLite archive.
#[derive(Clone)]
pub struct ArchiveReplayProvider {
    db: Database,
}

impl ArchiveReplayProvider {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ReplayProvider for ArchiveReplayProvider {
    async fn get_replay(&self, session_id: &str) -> Result<ReplayData, ReplayError> {
        self.db
            .get_replay(session_id)
            .await?
            .ok_or_else(|| ReplayError::Load("Session not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::timeline::tests::scenario_replay;

    #[tokio::test]
    async fn serves_archived_sessions_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("replays.db")).unwrap();
        db.upsert_replay(&scenario_replay()).await.unwrap();
        let provider = ArchiveReplayProvider::new(db);

        assert_eq!(provider.get_replay("S-100").await.unwrap().session_id, "S-100");
        let err = provider.get_replay("S-404").await.unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
    }
}
