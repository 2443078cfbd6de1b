//! Turning accumulated encoder chunks into a file on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::encoder::{ChunkReceiver, EncoderFormat};

/// Drains the encoder output until the channel closes, keeping non-empty
/// chunks in arrival order. On cancel, whatever is already queued is taken
/// and the rest abandoned.
pub async fn accumulate_chunks(mut rx: ChunkReceiver, cancel: CancellationToken) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) if !chunk.is_empty() => chunks.push(chunk),
                Some(_) => {}
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(chunk) = rx.try_recv() {
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                }
                break;
            }
        }
    }
    chunks
}

/// `replay-{session}-{unix_ms}.{ext}`, with path separators in the session
/// id replaced so the name stays inside the output directory.
pub fn artifact_file_name(session_id: &str, unix_ms: i64, format: EncoderFormat) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' || c.is_control() { '_' } else { c })
        .collect();
    format!("replay-{}-{}.{}", safe, unix_ms, format.extension())
}

pub async fn write_artifact(output_dir: &Path, file_name: &str, chunks: &[Vec<u8>]) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let path = output_dir.join(file_name);
    fs::write(&path, chunks.concat())
        .await
        .with_context(|| format!("Failed to write recording to {}", path.display()))?;
    Ok(path)
}
