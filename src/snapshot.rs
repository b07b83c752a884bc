//! Persisted run snapshots: one directory per suspended run.
//!
//! When a run suspends, everything needed to continue it is written under
//! `<state_dir>/<run_id>/snapshot.json`: the memory plane, the visit
//! counter, the pause node, the payload presented to the user, and — for a
//! client-facing node parked mid-conversation — its transcript and buffered
//! outputs. Saves go through a temp file and an atomic rename so a crash
//! never leaves a half-written snapshot behind.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::llm::ChatMessage;

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("no snapshot exists for run `{run_id}`")]
    #[diagnostic(code(hivegraph::snapshot::not_found))]
    NotFound { run_id: String },

    #[error("snapshot io error: {0}")]
    #[diagnostic(code(hivegraph::snapshot::io))]
    Io(#[from] std::io::Error),

    #[error("snapshot is corrupt: {0}")]
    #[diagnostic(code(hivegraph::snapshot::corrupt))]
    Corrupt(#[from] serde_json::Error),
}

/// Everything a suspended run needs to continue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    /// Header id of the graph this run executes.
    pub graph_id: String,
    /// The node whose completion (or mid-loop suspension) parked the run.
    pub pause_node: String,
    pub memory: FxHashMap<String, Value>,
    pub visits: FxHashMap<String, u32>,
    /// What the pause node emitted to the user.
    pub pending: Value,
    /// In-progress conversation of a client-facing node, when one is parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Vec<ChatMessage>>,
    /// Outputs the parked node had already committed via `set_output`.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub buffered: FxHashMap<String, Value>,
    /// Sequence number the recorder continues from.
    pub next_seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Directory-per-run snapshot storage.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Persist a snapshot, replacing any prior one for the run.
    #[tracing::instrument(skip(self, snapshot), fields(run_id = %snapshot.run_id))]
    pub async fn save(&self, snapshot: &RunSnapshot) -> Result<(), SnapshotError> {
        let dir = self.run_dir(&snapshot.run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, dir.join(SNAPSHOT_FILE)).await?;
        Ok(())
    }

    pub async fn load(&self, run_id: &str) -> Result<RunSnapshot, SnapshotError> {
        let path = self.run_dir(run_id).join(SNAPSHOT_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn exists(&self, run_id: &str) -> bool {
        tokio::fs::try_exists(self.run_dir(run_id).join(SNAPSHOT_FILE))
            .await
            .unwrap_or(false)
    }

    /// Delete a run's snapshot directory, if present.
    pub async fn remove(&self, run_id: &str) -> Result<(), SnapshotError> {
        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run ids with a persisted snapshot.
    pub async fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if tokio::fs::try_exists(entry.path().join(SNAPSHOT_FILE))
                .await
                .unwrap_or(false)
            {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }
}
