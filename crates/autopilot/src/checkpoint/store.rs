//! Durable storage for checkpoint blobs and their sequence index.
//!
//! A [`CheckpointStore`] is a key-value-like store addressed by session id.
//! It holds opaque blobs keyed by sequence number plus an append-only index.
//! [`FsCheckpointStore`] keeps one directory per session:
//!
//! ```text
//! root/
//!   ses-19a0c3f2e41-0000/
//!     ckpt-000001.json
//!     ckpt-000002.json
//!     index.jsonl
//!     STOP            (optional stop marker)
//! ```
//!
//! Blobs are written to a temp file, fsynced, then renamed over the
//! canonical name, so a reader never sees a partial blob. Index entries are
//! appended one line at a time and fsynced.

use crate::CheckpointError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    /// Session created or resumed.
    Start,
    /// A tool-call batch completed.
    ToolBatch,
    /// The context manager folded turns into the summary.
    Summarization,
    /// The budget crossed a threshold.
    BudgetThreshold,
    /// The session is waiting on a human.
    AwaitingHuman,
    /// The session paused (budget or turn limit).
    Paused,
    /// A turn without tool calls was recorded.
    Turn,
    /// Final write on abort or shutdown.
    Shutdown,
    /// The session reached a final state.
    Terminal,
    /// Changed offline through the budget control boundary.
    External,
}

/// One line of a session's checkpoint index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the blob.
    pub checksum: String,
    pub bytes: u64,
    pub reason: CheckpointReason,
}

/// The checkpoint storage boundary.
pub trait CheckpointStore: Send + Sync {
    /// Atomically store the blob for `seq`, replacing any previous blob.
    fn put(&self, session_id: &str, seq: u64, blob: &[u8]) -> Result<(), CheckpointError>;

    /// Read the blob for `seq`, if present.
    fn get(&self, session_id: &str, seq: u64) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Sequence numbers with a stored blob, ascending.
    fn list(&self, session_id: &str) -> Result<Vec<u64>, CheckpointError>;

    /// Append an entry to the session's index.
    fn append_index(&self, session_id: &str, entry: &IndexEntry) -> Result<(), CheckpointError>;

    /// All readable index entries, in append order.
    fn read_index(&self, session_id: &str) -> Result<Vec<IndexEntry>, CheckpointError>;

    /// Ids of all sessions with at least one stored blob or index entry.
    fn sessions(&self) -> Result<Vec<String>, CheckpointError>;
}

/// Filesystem-backed [`CheckpointStore`].
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

const INDEX_FILE: &str = "index.jsonl";
const STOP_MARKER: &str = "STOP";

impl FsCheckpointStore {
    /// Open a store, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CheckpointError::io(&root, &e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn blob_path(&self, session_id: &str, seq: u64) -> PathBuf {
        self.session_dir(session_id).join(format!("ckpt-{seq:06}.json"))
    }

    fn index_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(INDEX_FILE)
    }

    fn ensure_dir(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, &e))?;
        Ok(dir)
    }

    // ── Stop marker ────────────────────────────────────────────────

    /// Path of the marker file a running orchestrator polls for.
    pub fn stop_marker(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(STOP_MARKER)
    }

    /// Ask the process running `session_id` to stop.
    pub fn request_stop(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.ensure_dir(session_id)?;
        let path = self.stop_marker(session_id);
        fs::write(&path, Utc::now().to_rfc3339()).map_err(|e| CheckpointError::io(&path, &e))
    }

    pub fn stop_requested(&self, session_id: &str) -> bool {
        self.stop_marker(session_id).exists()
    }

    /// Remove a stale stop marker before a session starts running again.
    pub fn clear_stop(&self, session_id: &str) -> Result<(), CheckpointError> {
        let path = self.stop_marker(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(&path, &e)),
        }
    }
}

/// Flush a directory entry so a completed rename survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CheckpointError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| CheckpointError::io(dir, &e))
}

/// No directory handle to sync on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

impl CheckpointStore for FsCheckpointStore {
    fn put(&self, session_id: &str, seq: u64, blob: &[u8]) -> Result<(), CheckpointError> {
        let dir = self.ensure_dir(session_id)?;
        let final_path = self.blob_path(session_id, seq);
        let tmp_path = dir.join(format!(".ckpt-{seq:06}.json.tmp"));

        let mut file = fs::File::create(&tmp_path).map_err(|e| CheckpointError::io(&tmp_path, &e))?;
        file.write_all(blob)
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::io(&tmp_path, &e))?;
        drop(file);
        fs::rename(&tmp_path, &final_path).map_err(|e| CheckpointError::io(&final_path, &e))?;
        sync_dir(&dir)?;

        trace!("Wrote {} ({} bytes)", final_path.display(), blob.len());
        Ok(())
    }

    fn get(&self, session_id: &str, seq: u64) -> Result<Option<Vec<u8>>, CheckpointError> {
        let path = self.blob_path(session_id, seq);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::io(&path, &e)),
        }
    }

    fn list(&self, session_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.session_dir(session_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&dir, &e)),
        };
        let mut seqs: Vec<u64> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("ckpt-")?
                    .strip_suffix(".json")?
                    .parse()
                    .ok()
            })
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn append_index(&self, session_id: &str, entry: &IndexEntry) -> Result<(), CheckpointError> {
        self.ensure_dir(session_id)?;
        let path = self.index_path(session_id);
        // Start on a fresh line if a crash left the last one torn.
        let torn = fs::read(&path).is_ok_and(|bytes| bytes.last().is_some_and(|&b| b != b'\n'));
        let mut line = if torn { "\n".to_string() } else { String::new() };
        line.push_str(&serde_json::to_string(entry)?);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CheckpointError::io(&path, &e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::io(&path, &e))
    }

    fn read_index(&self, session_id: &str) -> Result<Vec<IndexEntry>, CheckpointError> {
        let path = self.index_path(session_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&path, &e)),
        };
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append.
                Err(e) => warn!(
                    "Skipping unreadable index line {} in {}: {e}",
                    lineno + 1,
                    path.display()
                ),
            }
        }
        Ok(entries)
    }

    fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = fs::read_dir(&self.root).map_err(|e| CheckpointError::io(&self.root, &e))?;
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|ft| ft.is_dir()))
            .filter(|entry| entry.path().join(INDEX_FILE).exists())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
