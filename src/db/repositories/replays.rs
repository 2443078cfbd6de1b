use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::{
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_i64, to_usize},
    Database,
};
use crate::models::ReplayData;

/// Archive listing row; the full record stays in the database.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub worker_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: Option<String>,
    pub operation_count: usize,
    pub kpi_event_count: usize,
    pub imported_at: DateTime<Utc>,
}

fn row_to_summary(row: &Row) -> Result<SessionSummary> {
    let started_at: String = row.get("session_start_time")?;
    let ended_at: Option<String> = row.get("session_end_time")?;
    let imported_at: String = row.get("imported_at")?;
    let operation_count: i64 = row.get("operation_count")?;
    let kpi_event_count: i64 = row.get("kpi_event_count")?;

    Ok(SessionSummary {
        session_id: row.get("session_id")?,
        worker_id: row.get("worker_id")?,
        started_at: parse_datetime(&started_at, "session_start_time")?,
        ended_at: parse_optional_datetime(ended_at, "session_end_time")?,
        duration_seconds: row.get("duration_seconds")?,
        status: row.get("status")?,
        operation_count: to_usize(operation_count, "operation_count")?,
        kpi_event_count: to_usize(kpi_event_count, "kpi_event_count")?,
        imported_at: parse_datetime(&imported_at, "imported_at")?,
    })
}

impl Database {
    /// Inserts or replaces the record for `replay.session_id`, keeping the
    /// original import time on replace.
    pub async fn upsert_replay(&self, replay: &ReplayData) -> Result<()> {
        let record = replay.clone();
        let body = serde_json::to_string(&record).context("failed to serialize replay record")?;
        let now = format_datetime(&Utc::now());

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO replay_sessions (
                    session_id, worker_id, session_start_time, session_end_time, duration_seconds,
                    status, operation_count, kpi_event_count, record, imported_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(session_id) DO UPDATE SET
                    worker_id = excluded.worker_id,
                    session_start_time = excluded.session_start_time,
                    session_end_time = excluded.session_end_time,
                    duration_seconds = excluded.duration_seconds,
                    status = excluded.status,
                    operation_count = excluded.operation_count,
                    kpi_event_count = excluded.kpi_event_count,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![
                    record.session_id,
                    record.worker_id,
                    format_datetime(&record.session_start_time),
                    record.session_end_time.as_ref().map(format_datetime),
                    record.duration_seconds,
                    record.status,
                    to_i64(record.operation_logs.len())?,
                    to_i64(record.kpi_timeline.len())?,
                    body,
                    now,
                ],
            )
            .with_context(|| format!("failed to store replay {}", record.session_id))?;
            Ok(())
        })
        .await
    }

    pub async fn get_replay(&self, session_id: &str) -> Result<Option<ReplayData>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT record FROM replay_sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;

            body.map(|raw| {
                serde_json::from_str::<ReplayData>(&raw)
                    .with_context(|| format!("archived record for {session_id} is corrupt"))
            })
            .transpose()
        })
        .await
    }

    /// Newest sessions first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, worker_id, session_start_time, session_end_time, duration_seconds,
                        status, operation_count, kpi_event_count, imported_at
                 FROM replay_sessions
                 ORDER BY session_start_time DESC",
            )?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_summary(row)?);
            }
            Ok(sessions)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::timeline::tests::scenario_replay;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("archive").join("replays.db")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn stores_and_reads_back_full_record() {
        let (_dir, db) = open();
        let replay = scenario_replay();
        db.upsert_replay(&replay).await.unwrap();

        let loaded = db.get_replay("S-100").await.unwrap().expect("stored");
        assert_eq!(loaded, replay);
        assert!(db.get_replay("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_and_listing_orders_newest_first() {
        let (_dir, db) = open();
        let older = scenario_replay();
        let mut newer = scenario_replay();
        newer.session_id = "S-200".into();
        newer.session_start_time = older.session_start_time + chrono::Duration::days(1);
        db.upsert_replay(&older).await.unwrap();
        db.upsert_replay(&newer).await.unwrap();

        let mut changed = older.clone();
        changed.status = Some("COMPLETED".into());
        db.upsert_replay(&changed).await.unwrap();

        let sessions = db.list_sessions().await.unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["S-200", "S-100"]);
        assert_eq!(sessions[1].status.as_deref(), Some("COMPLETED"));
        assert_eq!(sessions[1].operation_count, 3);
        assert_eq!(sessions[1].kpi_event_count, 1);
    }
}
