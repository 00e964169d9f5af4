//! Append-only regression log.
//!
//! Every first patch of a rhythm class snapshots up to five of its current
//! Tier-1 events into a line-delimited JSON log. Each line is a
//! self-contained test input: replaying its events into a fresh instance
//! with the patch applied must yield no anomaly for that hash.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use via_types::{LogEvent, RhythmHash};

/// Maximum events snapshotted per case.
pub const MAX_SNAPSHOT_EVENTS: usize = 5;

/// One recorded regression case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionCase {
    /// Patched rhythm class.
    pub rhythm_hash: RhythmHash,
    /// Up to five representative events captured at patch time.
    pub events: Vec<LogEvent>,
    /// Patch epoch.
    pub patched_at: i64,
    /// Operator who issued the patch.
    pub operator_id: String,
}

/// Durable, append-only recorder of regression cases.
pub struct RegressionRecorder {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RegressionRecorder {
    /// Recorder appending to `path`; the file is created on first write.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one case as a single JSON line.
    pub async fn record(&self, mut case: RegressionCase) -> Result<()> {
        case.events.truncate(MAX_SNAPSHOT_EVENTS);
        let mut line = serde_json::to_string(&case)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening regression log at {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        info!(
            rhythm_hash = case.rhythm_hash,
            events = case.events.len(),
            "regression case recorded"
        );
        Ok(())
    }

    /// Read every recorded case back, oldest first.
    pub async fn load_all(&self) -> Result<Vec<RegressionCase>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading regression log"),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("malformed regression log line"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use via_types::Level;

    fn event(i: i64) -> LogEvent {
        LogEvent {
            ts: 1_700_000_000 + i,
            service: "auth".into(),
            level: Level::Error,
            message: format!("assertion failed at /src/io.c:{i}"),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn records_round_trip_through_the_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = RegressionRecorder::new(dir.path().join("regressions.jsonl"));

        let case = RegressionCase {
            rhythm_hash: 42,
            events: (0..3).map(event).collect(),
            patched_at: 1_700_000_100,
            operator_id: "op-1".into(),
        };
        recorder.record(case.clone()).await?;

        let loaded = recorder.load_all().await?;
        assert_eq!(loaded, vec![case]);
        Ok(())
    }

    #[tokio::test]
    async fn snapshots_are_capped_at_five_events() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = RegressionRecorder::new(dir.path().join("regressions.jsonl"));

        recorder
            .record(RegressionCase {
                rhythm_hash: 1,
                events: (0..9).map(event).collect(),
                patched_at: 0,
                operator_id: String::new(),
            })
            .await?;

        assert_eq!(recorder.load_all().await?[0].events.len(), MAX_SNAPSHOT_EVENTS);
        Ok(())
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = RegressionRecorder::new(dir.path().join("absent.jsonl"));
        assert!(recorder.load_all().await?.is_empty());
        Ok(())
    }
}
