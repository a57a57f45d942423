//! Files touched by tool calls, kept through summarization.
//!
//! When older turns are folded into a summary their tool calls disappear from
//! the payload. The [`FileAccessTracker`] pulls file paths out of tool call
//! arguments so the summary can still list which files the agent read and
//! changed.

use crate::ToolCall;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// How a file was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessType {
    Read,
    Write,
    List,
}

impl fmt::Display for FileAccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAccessType::Read => write!(f, "read"),
            FileAccessType::Write => write!(f, "write"),
            FileAccessType::List => write!(f, "list"),
        }
    }
}

impl FileAccessType {
    /// Access type for a tool name, or `None` if the tool does not touch files.
    pub fn for_tool(tool_name: &str) -> Option<Self> {
        match tool_name {
            "read_file" => Some(FileAccessType::Read),
            "write_file" | "edit_file" => Some(FileAccessType::Write),
            "list_files" => Some(FileAccessType::List),
            _ => None,
        }
    }
}

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccess {
    pub path: String,
    pub access: FileAccessType,
    pub turn: u32,
}

/// Most recently touched files, oldest first, one entry per path.
#[derive(Debug, Clone)]
pub struct FileAccessTracker {
    recent: VecDeque<FileAccess>,
    max_preserved: usize,
}

impl FileAccessTracker {
    pub fn new(max_preserved: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(max_preserved),
            max_preserved,
        }
    }

    /// Seed a tracker with previously tracked files.
    pub fn from_entries(entries: &[FileAccess], max_preserved: usize) -> Self {
        let mut tracker = Self::new(max_preserved);
        for entry in entries {
            tracker.record(entry.clone());
        }
        tracker
    }

    /// Record the file a tool call touches, if any.
    ///
    /// A write wins over a read of the same file in the same turn, so
    /// "read then edit" reports as a write.
    pub fn record_call(&mut self, call: &ToolCall, turn: u32) {
        let Some(access) = FileAccessType::for_tool(call.name()) else {
            return;
        };
        let Some(path) = extract_path(&call.function.arguments) else {
            return;
        };
        self.record(FileAccess { path, access, turn });
    }

    /// Record an access. Moves an already tracked path to the end.
    pub fn record(&mut self, entry: FileAccess) {
        let access = match self.recent.iter().find(|f| f.path == entry.path) {
            Some(prev)
                if prev.turn == entry.turn
                    && prev.access == FileAccessType::Write
                    && entry.access != FileAccessType::Write =>
            {
                FileAccessType::Write
            }
            _ => entry.access,
        };
        self.recent.retain(|f| f.path != entry.path);
        self.recent.push_back(FileAccess { access, ..entry });

        while self.recent.len() > self.max_preserved {
            self.recent.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<FileAccess> {
        self.recent.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// Human-readable list of tracked files. Empty if nothing is tracked.
    pub fn build_preservation_note(&self) -> String {
        if self.recent.is_empty() {
            return String::new();
        }
        let mut note = String::from("Files touched:\n");
        for access in &self.recent {
            note.push_str(&format!(
                "- {} ({}, turn {})\n",
                access.path, access.access, access.turn
            ));
        }
        note
    }
}

/// Extract a file path from JSON tool arguments.
///
/// Tries the common keys `path`, `file_path` and `file`.
pub fn extract_path(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let obj = value.as_object()?;

    for key in &["path", "file_path", "file"] {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::function("c", name, args)
    }

    #[test]
    fn new_tracker_is_empty() {
        let tracker = FileAccessTracker::new(5);
        assert!(tracker.is_empty());
        assert_eq!(tracker.build_preservation_note(), "");
    }

    #[test]
    fn records_reads_and_writes() {
        let mut tracker = FileAccessTracker::new(5);
        tracker.record_call(&call("read_file", r#"{"path":"src/main.rs"}"#), 1);
        tracker.record_call(&call("write_file", r#"{"path":"src/lib.rs"}"#), 2);

        let note = tracker.build_preservation_note();
        assert!(note.contains("- src/main.rs (read, turn 1)"));
        assert!(note.contains("- src/lib.rs (write, turn 2)"));
    }

    #[test]
    fn deduplication_moves_to_end() {
        let mut tracker = FileAccessTracker::new(5);
        tracker.record_call(&call("read_file", r#"{"path":"a.rs"}"#), 1);
        tracker.record_call(&call("read_file", r#"{"path":"b.rs"}"#), 2);
        tracker.record_call(&call("edit_file", r#"{"path":"a.rs"}"#), 3);

        let entries = tracker.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].path, "a.rs");
        assert_eq!(entries[1].access, FileAccessType::Write);
        assert_eq!(entries[1].turn, 3);
    }

    #[test]
    fn write_wins_within_a_turn() {
        let mut tracker = FileAccessTracker::new(5);
        tracker.record_call(&call("edit_file", r#"{"path":"a.rs"}"#), 4);
        tracker.record_call(&call("read_file", r#"{"path":"a.rs"}"#), 4);
        assert_eq!(tracker.entries()[0].access, FileAccessType::Write);
    }

    #[test]
    fn max_capacity_evicts_oldest() {
        let mut tracker = FileAccessTracker::new(2);
        for (i, path) in ["a.rs", "b.rs", "c.rs"].iter().enumerate() {
            tracker.record_call(&call("read_file", &format!(r#"{{"path":"{path}"}}"#)), i as u32);
        }
        let paths: Vec<String> = tracker.entries().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["b.rs", "c.rs"]);
    }

    #[test]
    fn unrelated_tools_and_bad_args_ignored() {
        let mut tracker = FileAccessTracker::new(5);
        tracker.record_call(&call("run_command", r#"{"command":"ls"}"#), 1);
        tracker.record_call(&call("read_file", "not json"), 2);
        tracker.record_call(&call("read_file", r#"{"other":"x"}"#), 3);
        assert!(tracker.is_empty());
    }

    #[test]
    fn from_entries_roundtrip() {
        let mut tracker = FileAccessTracker::new(5);
        tracker.record_call(&call("list_files", r#"{"path":"src/"}"#), 1);
        let rebuilt = FileAccessTracker::from_entries(&tracker.entries(), 5);
        assert_eq!(rebuilt.entries(), tracker.entries());
    }
}
