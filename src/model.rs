//! Shared data types for snapshots, file states, manifests, and rollback
//! plans — the nouns every component passes between each other.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::ContentHash;

/// Opaque, short, repository-unique snapshot identifier: `cr_` followed
/// by 8 random hex characters. Not totally ordered; `timestamp` is
/// authoritative for ordering.
pub fn generate_snapshot_id() -> String {
    format!("cr_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Opaque session identifier used to correlate a run of related actions.
pub fn generate_session_id() -> String {
    format!("session_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// The state of a single path at a point in time. `exists=false` marks a
/// tombstone: the path was deleted by the time this snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub relative_path: String,
    pub content_hash: Option<ContentHash>,
    pub size_bytes: u64,
    pub modified_time: DateTime<Utc>,
    pub permission_bits: u32,
    pub exists: bool,
}

impl FileState {
    pub fn tombstone(relative_path: String) -> Self {
        Self {
            relative_path,
            content_hash: None,
            size_bytes: 0,
            modified_time: Utc::now(),
            permission_bits: 0,
            exists: false,
        }
    }
}

/// Per-path state map produced by one scan or reconstructed from one
/// manifest.
pub type FileStateMap = BTreeMap<String, FileState>;

/// Per-snapshot document naming every path's state, stored alongside the
/// snapshot's directory under `snapshots/<id>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub files: FileStateMap,
    pub total_size: u64,
    pub compressed_size: u64,
}

impl Manifest {
    pub fn new(snapshot_id: String, files: FileStateMap, compressed_size: u64) -> Self {
        let total_size = files.values().map(|f| f.size_bytes).sum();
        Self {
            snapshot_id,
            created_at: Utc::now(),
            file_count: files.len(),
            files,
            total_size,
            compressed_size,
        }
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.total_size as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One row per changed path per snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub snapshot_id: String,
    pub path: String,
    pub change_kind: ChangeKind,
    pub before_hash: Option<ContentHash>,
    pub after_hash: Option<ContentHash>,
}

/// Metadata describing the triggering event for a snapshot, supplied by
/// an external interceptor collaborator.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub action_type: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_context: Option<String>,
    pub affected_files: Vec<String>,
    pub tool_name: Option<String>,
    pub session_id: Option<String>,
}

impl ActionContext {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            timestamp: Utc::now(),
            prompt_context: None,
            affected_files: Vec::new(),
            tool_name: None,
            session_id: None,
        }
    }
}

/// Durable metadata for one snapshot, independent of its manifest.
#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub prompt_context: Option<String>,
    pub files_affected: Vec<String>,
    pub total_size: u64,
    pub compression_ratio: f64,
    pub parent_snapshot: Option<String>,
    pub bookmark_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Bookmark {
    pub snapshot_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A fully reconstructed snapshot: its durable metadata plus the file
/// state map recovered from its manifest.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub file_states: FileStateMap,
}

/// Predicates ANDed together when listing or filtering snapshots.
#[derive(Debug, Clone, Default)]
pub struct TimelineFilters {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub action_types: Option<Vec<String>>,
    pub path_patterns: Option<Vec<String>>,
    pub bookmarked_only: bool,
}

/// Options governing a rollback preview/execute call.
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub selective_files: Option<Vec<String>>,
    pub preserve_manual_changes: bool,
    pub create_backup: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    AdditionsOnly,
    DeletionsOnly,
    CommentsOnly,
    WhitespaceOnly,
    FileAdded,
    FileDeleted,
    ContentMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepCurrent,
    UseSnapshot,
    ThreeWayMerge,
}

#[derive(Debug, Clone)]
pub struct FileConflict {
    pub path: String,
    pub kind: ConflictKind,
    pub resolution: ConflictResolution,
    pub similarity: f64,
    pub minor: bool,
}

/// What `preview` computed, before any writes happen.
#[derive(Debug, Clone, Default)]
pub struct RollbackPlan {
    pub target_snapshot: String,
    pub files_to_restore: Vec<String>,
    pub files_to_delete: Vec<String>,
    pub conflicts: Vec<FileConflict>,
}

/// What `execute` actually did.
#[derive(Debug, Clone, Default)]
pub struct RollbackResult {
    pub success: bool,
    pub files_restored: Vec<String>,
    pub files_deleted: Vec<String>,
    pub conflicts_resolved: Vec<FileConflict>,
    pub backup_id: Option<String>,
    pub errors: Vec<String>,
}

impl RollbackResult {
    pub fn finalize(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ids_have_expected_shape() {
        let id = generate_snapshot_id();
        assert!(id.starts_with("cr_"));
        assert_eq!(id.len(), 3 + 8);
    }

    #[test]
    fn snapshot_ids_are_distinct() {
        assert_ne!(generate_snapshot_id(), generate_snapshot_id());
    }

    #[test]
    fn manifest_computes_totals() {
        let mut files = FileStateMap::new();
        files.insert(
            "a.txt".to_string(),
            FileState {
                relative_path: "a.txt".to_string(),
                content_hash: Some(ContentHash::of_bytes(b"hi")),
                size_bytes: 10,
                modified_time: Utc::now(),
                permission_bits: 0o644,
                exists: true,
            },
        );
        let manifest = Manifest::new("cr_deadbeef".to_string(), files, 4);
        assert_eq!(manifest.total_size, 10);
        assert_eq!(manifest.file_count, 1);
        assert_eq!(manifest.compression_ratio(), 0.4);
    }
}
