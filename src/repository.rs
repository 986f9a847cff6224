//! Owns every long-lived collaborator for one project: there is no
//! global mutable state, only a `Repository` handle whose lifetime runs
//! `init()` … `close()`. Background retention is owned here and joined
//! on close.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RewindConfig;
use crate::content_store::ContentStore;
use crate::diff::{DiffEngine, DiffItem, DiffMode};
use crate::engine::{IntegrityIssue, SnapshotEngine};
use crate::errors::{Result, RewindError};
use crate::metadata_store::MetadataStore;
use crate::model::{
    ActionContext, Bookmark, FileChange, RollbackOptions, RollbackPlan, RollbackResult, Snapshot,
    SnapshotMetadata, TimelineFilters,
};
use crate::retention::{RetentionController, RetentionStats};
use crate::rollback::RollbackPlanner;
use crate::scanner::{RESERVED_DIR_NAME, Scanner};

pub struct Repository {
    project_root: PathBuf,
    config: RewindConfig,
    engine: Arc<SnapshotEngine>,
    retention: Arc<RetentionController>,
    rollback: RollbackPlanner,
}

/// The reserved area's `status.json`: a small marker recording when the
/// project was first initialized and under what crate version, so an
/// external collaborator (CLI, dashboard) can tell a fresh init from a
/// reopened one without parsing the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoStatus {
    initialized_at: DateTime<Utc>,
    version: String,
    project_root: PathBuf,
}

impl RepoStatus {
    const FILE_NAME: &'static str = "status.json";

    /// Load the existing status (preserving its `initialized_at`) or
    /// start a fresh one if this is the first `init` for this project.
    fn load_or_create(reserved_dir: &Path, project_root: &Path) -> Self {
        let path = reserved_dir.join(Self::FILE_NAME);
        let initialized_at = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<RepoStatus>(&bytes).ok())
            .map(|existing| existing.initialized_at)
            .unwrap_or_else(Utc::now);
        Self {
            initialized_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
            project_root: project_root.to_path_buf(),
        }
    }

    fn write(&self, reserved_dir: &Path) -> Result<()> {
        let path = reserved_dir.join(Self::FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::utils::atomic_write(&path, &bytes)?;
        Ok(())
    }
}

impl Repository {
    /// Open (creating if missing) the reserved directory under
    /// `project_root`, load config, and wire up the Scanner, Content
    /// Store, Metadata Store, Engine, and Retention Controller. Starts
    /// the retention background worker.
    pub fn init(project_root: impl Into<PathBuf>) -> Result<Self> {
        let project_root = project_root.into();
        let reserved_dir = project_root.join(RESERVED_DIR_NAME);
        std::fs::create_dir_all(&reserved_dir)?;

        let config_path = reserved_dir.join(RewindConfig::FILE_NAME);
        let config = RewindConfig::load(&config_path)?;
        config.save(&config_path)?;

        let status = RepoStatus::load_or_create(&reserved_dir, &project_root);
        status.write(&reserved_dir)?;

        let content_store = ContentStore::open(
            reserved_dir.join("content"),
            config.storage.compression_level,
        )?;
        content_store.set_compression_enabled(config.storage.compression_enabled);
        let metadata_store = MetadataStore::open(&reserved_dir.join("metadata.sqlite3"))?;
        let engine = Arc::new(SnapshotEngine::new(
            reserved_dir.join("snapshots"),
            Scanner::new(),
            content_store,
            metadata_store,
            config.performance.memory_limit_mb,
        ));

        let retention = Arc::new(RetentionController::new(reserved_dir.clone()));
        retention.start_background(Arc::clone(&engine), config.clone());

        let rollback = RollbackPlanner::new(project_root.clone(), reserved_dir.clone());

        info!(root = %project_root.display(), "repository initialized");

        Ok(Self {
            project_root,
            config,
            engine,
            retention,
            rollback,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    pub fn create_snapshot(&self, context: ActionContext) -> Result<String> {
        self.run_hook(&self.config.hooks.pre_snapshot_script, "pre_snapshot");
        self.engine
            .create_snapshot(&self.project_root, context, &self.config, &self.retention)
    }

    /// Best-effort hook invocation: a missing or failing script is
    /// logged, never fatal to the operation it guards. Config
    /// validation already rejects a dangling path at load time, so a
    /// failure observed here means the script itself misbehaved.
    fn run_hook(&self, script: &Option<PathBuf>, label: &str) {
        let Some(script) = script else { return };
        let status = Command::new(script).current_dir(&self.project_root).status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(hook = label, %status, "hook script exited non-zero"),
            Err(e) => warn!(hook = label, error = %e, "failed to run hook script"),
        }
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.engine.get_snapshot(id)
    }

    pub fn list_snapshots(&self, filters: &TimelineFilters) -> Result<Vec<SnapshotMetadata>> {
        self.engine.list_snapshots(filters)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        self.engine.delete_snapshot(id)
    }

    pub fn file_changes(&self, id: &str) -> Result<Vec<FileChange>> {
        self.engine.file_changes(id)
    }

    pub fn search(&self, query: &str) -> Result<Vec<SnapshotMetadata>> {
        self.engine.search(query)
    }

    pub fn add_bookmark(&self, snapshot_id: &str, name: &str, description: Option<&str>) -> Result<()> {
        self.engine.add_bookmark(snapshot_id, name, description)
    }

    pub fn remove_bookmark(&self, snapshot_id: &str) -> Result<bool> {
        self.engine.remove_bookmark(snapshot_id)
    }

    pub fn get_bookmark(&self, snapshot_id: &str) -> Result<Option<Bookmark>> {
        self.engine.get_bookmark(snapshot_id)
    }

    pub fn list_bookmarks(&self) -> Result<Vec<Bookmark>> {
        self.engine.list_bookmarks()
    }

    pub fn preview_rollback(&self, target_id: &str, options: &RollbackOptions) -> Result<RollbackPlan> {
        self.rollback
            .preview(&self.engine, &self.config, target_id, options)
    }

    pub fn execute_rollback(&self, target_id: &str, options: &RollbackOptions) -> Result<RollbackResult> {
        let result = self
            .rollback
            .execute(&self.engine, &self.config, target_id, options)?;
        if !options.dry_run {
            self.run_hook(&self.config.hooks.post_rollback_script, "post_rollback");
        }
        Ok(result)
    }

    pub fn retention_stats(&self) -> Result<RetentionStats> {
        self.retention.stats(&self.engine, &self.config)
    }

    pub fn check_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        self.engine.check_integrity()
    }

    /// Diff one path as it stood in `snapshot_id` against its current
    /// state in the working tree. The path need not currently exist
    /// (shows as deleted) or have existed in the snapshot (shows as
    /// added).
    pub fn diff_against_working_tree(
        &self,
        snapshot_id: &str,
        path: &str,
        mode: DiffMode,
        context_lines: usize,
    ) -> Result<DiffItem> {
        let snapshot = self
            .engine
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| RewindError::not_found(format!("snapshot {snapshot_id}")))?;
        let old_state = snapshot.file_states.get(path);
        let old_hash = old_state.and_then(|s| s.content_hash);
        let old_bytes = match old_hash {
            Some(_) => Some(self.engine.load_content(snapshot_id, path)?),
            None => None,
        };

        let abs = self.project_root.join(path);
        let new_bytes = std::fs::read(&abs).ok();
        let new_hash = new_bytes.as_ref().map(|b| crate::hash::ContentHash::of_bytes(b));

        Ok(DiffEngine::diff_file(
            path,
            old_hash.as_ref(),
            new_hash.as_ref(),
            old_bytes.as_deref(),
            new_bytes.as_deref(),
            mode,
            context_lines,
        ))
    }

    /// Diff one path between two snapshots.
    pub fn diff_snapshots(
        &self,
        from_id: &str,
        to_id: &str,
        path: &str,
        mode: DiffMode,
        context_lines: usize,
    ) -> Result<DiffItem> {
        let from = self
            .engine
            .get_snapshot(from_id)?
            .ok_or_else(|| RewindError::not_found(format!("snapshot {from_id}")))?;
        let to = self
            .engine
            .get_snapshot(to_id)?
            .ok_or_else(|| RewindError::not_found(format!("snapshot {to_id}")))?;

        let old_hash = from.file_states.get(path).and_then(|s| s.content_hash);
        let new_hash = to.file_states.get(path).and_then(|s| s.content_hash);
        let old_bytes = match old_hash {
            Some(_) => Some(self.engine.load_content(from_id, path)?),
            None => None,
        };
        let new_bytes = match new_hash {
            Some(_) => Some(self.engine.load_content(to_id, path)?),
            None => None,
        };

        Ok(DiffEngine::diff_file(
            path,
            old_hash.as_ref(),
            new_hash.as_ref(),
            old_bytes.as_deref(),
            new_bytes.as_deref(),
            mode,
            context_lines,
        ))
    }

    /// Stop the background retention worker and drop collaborators. Safe
    /// to call once; dropping the `Repository` without calling `close`
    /// still joins the worker via `RetentionController`'s `Drop`.
    pub fn close(self) {
        self.retention.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_reserved_layout_and_defaults() {
        crate::init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(dir.path().join(".claude-rewind/config.toml").exists());
        assert!(dir.path().join(".claude-rewind/status.json").exists());
        assert_eq!(repo.config().storage.max_snapshots, 100);
        repo.close();
    }

    #[test]
    fn reopening_preserves_initialized_at() {
        let dir = tempfile::tempdir().unwrap();
        let first = Repository::init(dir.path()).unwrap();
        first.close();

        let status_path = dir.path().join(".claude-rewind/status.json");
        let first_status: RepoStatus =
            serde_json::from_slice(&std::fs::read(&status_path).unwrap()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = Repository::init(dir.path()).unwrap();
        second.close();
        let second_status: RepoStatus =
            serde_json::from_slice(&std::fs::read(&status_path).unwrap()).unwrap();

        assert_eq!(first_status.initialized_at, second_status.initialized_at);
    }

    #[test]
    #[cfg(unix)]
    fn pre_snapshot_hook_runs_before_snapshot_is_taken() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let reserved = dir.path().join(".claude-rewind");
        std::fs::create_dir_all(&reserved).unwrap();

        let hook_path = dir.path().join("hook.sh");
        std::fs::write(&hook_path, "#!/bin/sh\ntouch hook_ran\n").unwrap();
        let mut perms = std::fs::metadata(&hook_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&hook_path, perms).unwrap();

        let mut config = RewindConfig::default();
        config.hooks.pre_snapshot_script = Some(hook_path);
        config.save(&reserved.join("config.toml")).unwrap();

        let repo = Repository::init(dir.path()).unwrap();
        repo.create_snapshot(ActionContext::new("edit")).unwrap();
        assert!(dir.path().join("hook_ran").exists());
        repo.close();
    }

    #[test]
    fn create_and_list_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi\n").unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let id = repo.create_snapshot(ActionContext::new("edit")).unwrap();
        let listed = repo.list_snapshots(&TimelineFilters::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        repo.close();
    }
}
