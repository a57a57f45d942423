//! Sequenced, checksummed checkpoints on top of a [`CheckpointStore`].

use super::store::{CheckpointReason, CheckpointStore, IndexEntry};
use crate::CheckpointError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Address of a single checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub session_id: String,
    pub seq: u64,
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.seq)
    }
}

/// Envelope around a serialized session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<T> {
    pub seq: u64,
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    pub state: T,
}

/// Writes and recovers checkpoints.
///
/// Sequence numbers are strictly increasing per session. Each blob is
/// written before its index entry, so an index entry always names a blob
/// that was fully written. Nothing is ever deleted: older checkpoints are
/// the fallback when the newest one fails verification.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist `state` as the next checkpoint of `session_id`.
    pub fn save<T: Serialize>(
        &self,
        session_id: &str,
        reason: CheckpointReason,
        state: &T,
    ) -> Result<CheckpointId, CheckpointError> {
        let index = self.store.read_index(session_id)?;
        let last_indexed = index.iter().map(|e| e.seq).max().unwrap_or(0);
        // Orphan blobs (written, never indexed) are skipped over, not reused.
        let last_blob = self.store.list(session_id)?.last().copied().unwrap_or(0);
        let seq = last_indexed.max(last_blob) + 1;

        let saved_at = Utc::now();
        let envelope = Checkpoint {
            seq,
            session_id: session_id.to_string(),
            saved_at,
            reason,
            state,
        };
        let blob = serde_json::to_vec(&envelope)?;

        self.store.put(session_id, seq, &blob)?;
        self.store.append_index(
            session_id,
            &IndexEntry {
                seq,
                timestamp: saved_at,
                checksum: checksum(&blob),
                bytes: blob.len() as u64,
                reason,
            },
        )?;

        debug!(
            "Checkpoint {session_id}#{seq} saved ({reason:?}, {} bytes)",
            blob.len()
        );
        Ok(CheckpointId {
            session_id: session_id.to_string(),
            seq,
        })
    }

    /// Load the most recent checkpoint that verifies.
    ///
    /// Walks the index from newest to oldest. An entry whose blob is
    /// missing, fails its checksum, or does not deserialize is skipped with
    /// a warning. Returns `Ok(None)` when the session has no index at all
    /// and [`CheckpointError::Corrupt`] when it has entries but none verify.
    pub fn load_latest<T: DeserializeOwned>(
        &self,
        session_id: &str,
    ) -> Result<Option<Checkpoint<T>>, CheckpointError> {
        let mut index = self.store.read_index(session_id)?;
        if index.is_empty() {
            return Ok(None);
        }
        index.sort_by_key(|e| e.seq);

        let mut last_problem = String::new();
        for entry in index.iter().rev() {
            match self.verify::<T>(session_id, entry) {
                Ok(checkpoint) => {
                    if entry.seq != index[index.len() - 1].seq {
                        info!(
                            "Recovered session {session_id} from fallback checkpoint #{}",
                            entry.seq
                        );
                    }
                    return Ok(Some(checkpoint));
                }
                Err(problem) => {
                    warn!("Checkpoint {session_id}#{} rejected: {problem}", entry.seq);
                    last_problem = problem;
                }
            }
        }

        Err(CheckpointError::Corrupt {
            session_id: session_id.to_string(),
            detail: format!(
                "{} indexed checkpoints, none valid (last: {last_problem})",
                index.len()
            ),
        })
    }

    fn verify<T: DeserializeOwned>(
        &self,
        session_id: &str,
        entry: &IndexEntry,
    ) -> Result<Checkpoint<T>, String> {
        let blob = self
            .store
            .get(session_id, entry.seq)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "blob missing".to_string())?;
        let actual = checksum(&blob);
        if actual != entry.checksum {
            return Err(format!(
                "checksum mismatch (expected {}, got {actual})",
                entry.checksum
            ));
        }
        let checkpoint: Checkpoint<T> =
            serde_json::from_slice(&blob).map_err(|e| format!("undecodable: {e}"))?;
        if checkpoint.seq != entry.seq {
            return Err(format!(
                "sequence mismatch (index {}, blob {})",
                entry.seq, checkpoint.seq
            ));
        }
        Ok(checkpoint)
    }

    /// Index entries for a session, oldest first.
    pub fn list_checkpoints(&self, session_id: &str) -> Result<Vec<IndexEntry>, CheckpointError> {
        let mut index = self.store.read_index(session_id)?;
        index.sort_by_key(|e| e.seq);
        Ok(index)
    }

    pub fn latest_id(&self, session_id: &str) -> Result<Option<CheckpointId>, CheckpointError> {
        Ok(self
            .store
            .read_index(session_id)?
            .iter()
            .map(|e| e.seq)
            .max()
            .map(|seq| CheckpointId {
                session_id: session_id.to_string(),
                seq,
            }))
    }

    pub fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        self.store.sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FsCheckpointStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct State {
        turn: u32,
        note: String,
    }

    fn state(turn: u32) -> State {
        State {
            turn,
            note: format!("after turn {turn}"),
        }
    }

    fn manager() -> (tempfile::TempDir, FsCheckpointStore, CheckpointManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        let mgr = CheckpointManager::new(Arc::new(store.clone()));
        (dir, store, mgr)
    }

    #[test]
    fn sequence_numbers_increase() {
        let (_dir, _store, mgr) = manager();
        let a = mgr.save("s", CheckpointReason::Start, &state(0)).unwrap();
        let b = mgr.save("s", CheckpointReason::ToolBatch, &state(1)).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(b.to_string(), "s#2");

        let other = mgr.save("t", CheckpointReason::Start, &state(0)).unwrap();
        assert_eq!(other.seq, 1);
    }

    #[test]
    fn load_latest_returns_newest_state() {
        let (_dir, _store, mgr) = manager();
        mgr.save("s", CheckpointReason::Start, &state(0)).unwrap();
        mgr.save("s", CheckpointReason::ToolBatch, &state(4)).unwrap();

        let ckpt = mgr.load_latest::<State>("s").unwrap().unwrap();
        assert_eq!(ckpt.seq, 2);
        assert_eq!(ckpt.state, state(4));
        assert_eq!(ckpt.reason, CheckpointReason::ToolBatch);
    }

    #[test]
    fn missing_session_is_none() {
        let (_dir, _store, mgr) = manager();
        assert!(mgr.load_latest::<State>("nope").unwrap().is_none());
    }

    #[test]
    fn corrupt_latest_falls_back() {
        let (_dir, store, mgr) = manager();
        mgr.save("s", CheckpointReason::Start, &state(1)).unwrap();
        mgr.save("s", CheckpointReason::ToolBatch, &state(2)).unwrap();
        store.put("s", 2, b"{\"garbage\":").unwrap();

        let ckpt = mgr.load_latest::<State>("s").unwrap().unwrap();
        assert_eq!(ckpt.seq, 1);
        assert_eq!(ckpt.state, state(1));
    }

    #[test]
    fn all_corrupt_is_an_error() {
        let (_dir, store, mgr) = manager();
        mgr.save("s", CheckpointReason::Start, &state(1)).unwrap();
        store.put("s", 1, b"tampered").unwrap();

        let err = mgr.load_latest::<State>("s").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn orphan_blob_is_ignored_and_skipped() {
        let (_dir, store, mgr) = manager();
        mgr.save("s", CheckpointReason::Start, &state(1)).unwrap();
        // Crash between blob write and index append.
        store.put("s", 2, b"half-committed").unwrap();

        let ckpt = mgr.load_latest::<State>("s").unwrap().unwrap();
        assert_eq!(ckpt.seq, 1);

        let next = mgr.save("s", CheckpointReason::ToolBatch, &state(2)).unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(mgr.load_latest::<State>("s").unwrap().unwrap().seq, 3);
    }

    #[test]
    fn list_and_latest_id() {
        let (_dir, _store, mgr) = manager();
        assert!(mgr.latest_id("s").unwrap().is_none());
        mgr.save("s", CheckpointReason::Start, &state(0)).unwrap();
        mgr.save("s", CheckpointReason::Terminal, &state(9)).unwrap();

        let list = mgr.list_checkpoints("s").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].reason, CheckpointReason::Terminal);
        assert_eq!(mgr.latest_id("s").unwrap().unwrap().seq, 2);
        assert_eq!(mgr.sessions().unwrap(), vec!["s".to_string()]);
    }
}
