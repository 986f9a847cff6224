//! Plans and executes rollback of the working tree to a target snapshot:
//! diffs target against the current tree, classifies divergences into
//! the conflict taxonomy, optionally three-way-merges, and applies the
//! result under a scoped backup.

mod conflict;
mod merge;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::config::RewindConfig;
use crate::engine::SnapshotEngine;
use crate::errors::{Result, RewindError};
use crate::model::{
    ConflictKind, ConflictResolution, FileConflict, RollbackOptions, RollbackPlan, RollbackResult,
};

pub use conflict::MINOR_SIMILARITY_THRESHOLD;
pub use merge::BASE_APPROXIMATION_MIN_SHARED_RATIO;

/// Holds the paths a backup/restore needs; stateless otherwise — all
/// snapshot data comes from the `SnapshotEngine` passed to each call.
pub struct RollbackPlanner {
    project_root: PathBuf,
    backups_dir: PathBuf,
}

struct PlanComputation {
    plan: RollbackPlan,
    /// Three-way-merged text for conflicts whose resolution is
    /// `ThreeWayMerge` and whose merge succeeded; looked up by path
    /// during `apply_plan` so `compute_plan` doesn't need to run twice.
    merged_content: HashMap<String, String>,
    /// Target snapshot's recorded `permission_bits` per path, applied to
    /// every restored/merged/use-snapshot write so a restore reproduces
    /// the snapshot's mode instead of the umask/tempfile default.
    permissions: HashMap<String, u32>,
}

impl RollbackPlanner {
    pub fn new(project_root: PathBuf, reserved_dir: PathBuf) -> Self {
        Self {
            project_root,
            backups_dir: reserved_dir.join("backups"),
        }
    }

    #[instrument(skip(self, engine, config, options), fields(target = %target_id))]
    pub fn preview(
        &self,
        engine: &SnapshotEngine,
        config: &RewindConfig,
        target_id: &str,
        options: &RollbackOptions,
    ) -> Result<RollbackPlan> {
        Ok(self.compute_plan(engine, config, target_id, options)?.plan)
    }

    #[instrument(skip(self, engine, config, options), fields(target = %target_id))]
    pub fn execute(
        &self,
        engine: &SnapshotEngine,
        config: &RewindConfig,
        target_id: &str,
        options: &RollbackOptions,
    ) -> Result<RollbackResult> {
        let computation = self.compute_plan(engine, config, target_id, options)?;
        let plan = &computation.plan;

        if options.dry_run {
            return Ok(RollbackResult {
                success: true,
                files_restored: plan.files_to_restore.clone(),
                files_deleted: plan.files_to_delete.clone(),
                conflicts_resolved: plan.conflicts.clone(),
                backup_id: None,
                errors: Vec::new(),
            }
            .finalize());
        }

        let mut result = RollbackResult::default();

        let backup_id = if options.create_backup {
            match self.create_backup() {
                Ok(id) => Some(id),
                Err(e) => {
                    result.errors.push(format!("backup failed: {e}"));
                    return Ok(result.finalize());
                }
            }
        } else {
            None
        };
        result.backup_id = backup_id.clone();

        if let Err(e) = self.apply_plan(engine, target_id, &computation, &mut result) {
            warn!(error = %e, "rollback execution failed, attempting recovery");
            result.errors.push(e.to_string());
            if let Some(id) = &backup_id {
                if let Err(restore_err) = self.restore_backup(id) {
                    result
                        .errors
                        .push(format!("backup restore failed: {restore_err}"));
                }
            }
        } else {
            info!(
                restored = result.files_restored.len(),
                deleted = result.files_deleted.len(),
                "rollback executed"
            );
        }

        Ok(result.finalize())
    }

    fn compute_plan(
        &self,
        engine: &SnapshotEngine,
        config: &RewindConfig,
        target_id: &str,
        options: &RollbackOptions,
    ) -> Result<PlanComputation> {
        let target = engine
            .get_snapshot(target_id)?
            .ok_or_else(|| RewindError::not_found(format!("snapshot {target_id}")))?;
        let current = engine.scanner().scan(&self.project_root, config)?;

        let selective: Option<BTreeSet<&str>> = options
            .selective_files
            .as_ref()
            .map(|paths| paths.iter().map(|p| p.as_str()).collect());

        let mut plan = RollbackPlan {
            target_snapshot: target_id.to_string(),
            ..Default::default()
        };
        let mut merged_content = HashMap::new();
        let mut permissions = HashMap::new();

        for (path, target_state) in &target.file_states {
            if let Some(selective) = &selective {
                if !selective.contains(path.as_str()) {
                    continue;
                }
            }

            if target_state.exists {
                permissions.insert(path.clone(), target_state.permission_bits);
            }

            if !target_state.exists {
                if current.contains_key(path) {
                    self.plan_deletion_of_restored_tombstone(
                        engine, target_id, path, options, &mut plan,
                    )?;
                }
                continue;
            }

            let Some(current_state) = current.get(path) else {
                plan.files_to_restore.push(path.clone());
                continue;
            };
            if current_state.content_hash == target_state.content_hash {
                continue;
            }

            if !options.preserve_manual_changes {
                plan.files_to_restore.push(path.clone());
                continue;
            }

            let current_bytes = std::fs::read(self.project_root.join(path)).unwrap_or_default();
            let target_bytes = engine.load_content(target_id, path)?;
            self.classify_and_record(path, &current_bytes, &target_bytes, &mut plan, &mut merged_content);
        }

        if selective.is_none() {
            for path in current.keys() {
                if target.file_states.contains_key(path) {
                    continue;
                }
                if options.preserve_manual_changes {
                    plan.conflicts.push(conflict::classify_file_added(path));
                } else {
                    plan.files_to_delete.push(path.clone());
                }
            }
        }

        Ok(PlanComputation {
            plan,
            merged_content,
            permissions,
        })
    }

    fn plan_deletion_of_restored_tombstone(
        &self,
        _engine: &SnapshotEngine,
        _target_id: &str,
        path: &str,
        options: &RollbackOptions,
        plan: &mut RollbackPlan,
    ) -> Result<()> {
        if !options.preserve_manual_changes {
            plan.files_to_delete.push(path.to_string());
            return Ok(());
        }
        let current_text = std::fs::read_to_string(self.project_root.join(path)).unwrap_or_default();
        let conflict = conflict::classify_file_deleted(path, &current_text);
        let resolved_to_delete = conflict.resolution == ConflictResolution::UseSnapshot;
        plan.conflicts.push(conflict);
        if resolved_to_delete {
            plan.files_to_delete.push(path.to_string());
        }
        Ok(())
    }

    fn classify_and_record(
        &self,
        path: &str,
        current_bytes: &[u8],
        target_bytes: &[u8],
        plan: &mut RollbackPlan,
        merged_content: &mut HashMap<String, String>,
    ) {
        let (current_text, target_text) = match (
            std::str::from_utf8(current_bytes),
            std::str::from_utf8(target_bytes),
        ) {
            (Ok(c), Ok(t)) => (c, t),
            _ => {
                // Binary divergence: never merged, default to keeping the
                // working tree's copy.
                plan.conflicts.push(FileConflict {
                    path: path.to_string(),
                    kind: ConflictKind::ContentMismatch,
                    resolution: ConflictResolution::KeepCurrent,
                    similarity: 0.0,
                    minor: false,
                });
                return;
            }
        };

        let mut fc = conflict::classify_content_mismatch(path, current_text, target_text);
        if fc.minor {
            // Suppressed: treat as no-conflict, restore proceeds.
            plan.files_to_restore.push(path.to_string());
            return;
        }

        if fc.resolution == ConflictResolution::ThreeWayMerge {
            match merge::approximate_base(current_text, target_text)
                .and_then(|base| merge::three_way_merge(base, current_text, target_text))
            {
                Some(merged) => {
                    merged_content.insert(path.to_string(), merged);
                }
                None => fc.resolution = ConflictResolution::KeepCurrent,
            }
        }

        plan.conflicts.push(fc);
    }

    fn apply_plan(
        &self,
        engine: &SnapshotEngine,
        target_id: &str,
        computation: &PlanComputation,
        result: &mut RollbackResult,
    ) -> Result<()> {
        for path in &computation.plan.files_to_restore {
            let bytes = engine.load_content(target_id, path)?;
            let mode = computation.permissions.get(path).copied();
            self.write_file(path, &bytes, mode)?;
            result.files_restored.push(path.clone());
        }

        for conflict in &computation.plan.conflicts {
            match conflict.resolution {
                ConflictResolution::UseSnapshot => {
                    let bytes = engine.load_content(target_id, &conflict.path)?;
                    let mode = computation.permissions.get(&conflict.path).copied();
                    self.write_file(&conflict.path, &bytes, mode)?;
                    result.files_restored.push(conflict.path.clone());
                }
                ConflictResolution::ThreeWayMerge => {
                    if let Some(merged) = computation.merged_content.get(&conflict.path) {
                        let mode = computation.permissions.get(&conflict.path).copied();
                        self.write_file(&conflict.path, merged.as_bytes(), mode)?;
                        result.files_restored.push(conflict.path.clone());
                    }
                }
                ConflictResolution::KeepCurrent => {}
            }
            result.conflicts_resolved.push(conflict.clone());
        }

        for path in &computation.plan.files_to_delete {
            let abs = self.project_root.join(path);
            match std::fs::remove_file(&abs) {
                Ok(()) => result.files_deleted.push(path.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RewindError::Io(e)),
            }
        }

        Ok(())
    }

    /// Write `bytes` to `path` and, when the snapshot recorded a mode for
    /// it, restore that mode. `atomic_write`'s temp-file-then-rename
    /// leaves the new file with the umask/tempfile default permissions,
    /// not the snapshot's, so this is a required second step, not an
    /// optional one.
    fn write_file(&self, path: &str, bytes: &[u8], permission_bits: Option<u32>) -> Result<()> {
        let abs = self.project_root.join(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        crate::utils::atomic_write(&abs, bytes)?;
        #[cfg(unix)]
        if let Some(mode) = permission_bits {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = permission_bits;
        Ok(())
    }

    fn create_backup(&self) -> Result<String> {
        let id = format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let dest = self.backups_dir.join(&id);
        std::fs::create_dir_all(&dest)?;
        copy_tree_excluding_reserved(&self.project_root, &dest, &self.backups_dir)?;
        Ok(id)
    }

    fn restore_backup(&self, backup_id: &str) -> Result<()> {
        let src = self.backups_dir.join(backup_id);
        if !src.exists() {
            return Err(RewindError::not_found(format!("backup {backup_id}")));
        }
        copy_tree_excluding_reserved(&src, &self.project_root, &self.backups_dir)?;
        Ok(())
    }
}

fn copy_tree_excluding_reserved(src: &Path, dest: &Path, reserved_ancestor: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path().starts_with(reserved_ancestor) {
            continue;
        }
        let relative = entry.path().strip_prefix(src).unwrap();
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::ContentStore;
    use crate::metadata_store::MetadataStore;
    use crate::model::ActionContext;
    use crate::retention::RetentionController;
    use crate::scanner::Scanner;

    fn setup(project: &Path, reserved: &Path) -> (SnapshotEngine, RetentionController, RewindConfig) {
        let engine = SnapshotEngine::new(
            reserved.join("snapshots"),
            Scanner::new(),
            ContentStore::open(reserved.join("content"), 3).unwrap(),
            MetadataStore::open(&reserved.join("metadata.sqlite3")).unwrap(),
            500,
        );
        let retention = RetentionController::new(reserved.to_path_buf());
        let _ = project;
        (engine, retention, RewindConfig::default())
    }

    #[test]
    fn clean_hash_match_is_skipped() {
        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let (engine, retention, config) = setup(project.path(), reserved.path());

        std::fs::write(project.path().join("a.txt"), "unchanged\n").unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();

        let planner = RollbackPlanner::new(project.path().to_path_buf(), reserved.path().to_path_buf());
        let plan = planner
            .preview(&engine, &config, &id, &RollbackOptions::default())
            .unwrap();
        assert!(plan.files_to_restore.is_empty());
        assert!(plan.files_to_delete.is_empty());
    }

    #[test]
    fn non_preserving_rollback_restores_modified_file() {
        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let (engine, retention, config) = setup(project.path(), reserved.path());

        std::fs::write(project.path().join("a.txt"), "v1\n").unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();
        std::fs::write(project.path().join("a.txt"), "v2\n").unwrap();

        let planner = RollbackPlanner::new(project.path().to_path_buf(), reserved.path().to_path_buf());
        let result = planner
            .execute(&engine, &config, &id, &RollbackOptions::default())
            .unwrap();
        assert!(result.success);
        assert_eq!(result.files_restored, vec!["a.txt".to_string()]);
        assert_eq!(std::fs::read_to_string(project.path().join("a.txt")).unwrap(), "v1\n");
    }

    #[test]
    #[cfg(unix)]
    fn restore_reapplies_snapshots_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let (engine, retention, config) = setup(project.path(), reserved.path());

        let file = project.path().join("a.sh");
        std::fs::write(&file, "v1\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();

        std::fs::write(&file, "v2\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();

        let planner = RollbackPlanner::new(project.path().to_path_buf(), reserved.path().to_path_buf());
        let result = planner
            .execute(&engine, &config, &id, &RollbackOptions::default())
            .unwrap();
        assert!(result.success);

        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn preserving_rollback_classifies_additions_only_and_keeps_current() {
        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let (engine, retention, config) = setup(project.path(), reserved.path());

        std::fs::write(project.path().join("file.py"), "L1\nL2\nL3\n").unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();
        std::fs::write(project.path().join("file.py"), "L1\nL2\nL3\nL4\n").unwrap();

        let planner = RollbackPlanner::new(project.path().to_path_buf(), reserved.path().to_path_buf());
        let options = RollbackOptions {
            preserve_manual_changes: true,
            ..Default::default()
        };
        let plan = planner.preview(&engine, &config, &id, &options).unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].kind, ConflictKind::AdditionsOnly);
        assert_eq!(plan.conflicts[0].resolution, ConflictResolution::KeepCurrent);
        assert!(!plan.files_to_restore.contains(&"file.py".to_string()));
    }

    #[test]
    fn dry_run_performs_no_writes() {
        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let (engine, retention, config) = setup(project.path(), reserved.path());

        std::fs::write(project.path().join("a.txt"), "v1\n").unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();
        std::fs::write(project.path().join("a.txt"), "v2\n").unwrap();

        let planner = RollbackPlanner::new(project.path().to_path_buf(), reserved.path().to_path_buf());
        let options = RollbackOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = planner.execute(&engine, &config, &id, &options).unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(project.path().join("a.txt")).unwrap(), "v2\n");
    }
}
