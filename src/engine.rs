//! Orchestrates scan → store → index for one project, and maintains the
//! incremental "last snapshot" cache that makes a touch-one-file
//! operation cheap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru_mem::LruCache;
use tracing::{info, instrument, warn};

use crate::config::RewindConfig;
use crate::content_store::ContentStore;
use crate::errors::{Result, RewindError};
use crate::hash::ContentHash;
use crate::metadata_store::MetadataStore;
use crate::model::{
    ActionContext, ChangeKind, FileChange, FileStateMap, Manifest, Snapshot, SnapshotMetadata,
    TimelineFilters, generate_snapshot_id,
};
use crate::retention::RetentionController;
use crate::scanner::Scanner;

/// Entries larger than this are not worth caching; the content store
/// read is cheap enough to repeat and a single large blob would blow
/// the cache's byte budget.
const CONTENT_CACHE_ENTRY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// One blob that failed self-verification (or went missing) while
/// checking a snapshot's manifest, surfaced by `check_integrity`
/// instead of aborting the whole scan.
#[derive(Debug, Clone)]
pub struct IntegrityIssue {
    pub snapshot_id: String,
    pub path: String,
    pub hash: ContentHash,
    pub error: String,
}

struct LastSnapshot {
    id: String,
    files: FileStateMap,
}

pub struct SnapshotEngine {
    manifests_dir: PathBuf,
    scanner: Scanner,
    content_store: ContentStore,
    metadata_store: Mutex<MetadataStore>,
    last: Mutex<Option<LastSnapshot>>,
    content_cache: Mutex<LruCache<(String, String), Vec<u8>>>,
}

impl SnapshotEngine {
    /// `memory_limit_mb` is the advisory budget for the lazy
    /// per-path content cache (`performance.memory_limit_mb`).
    pub fn new(
        manifests_dir: PathBuf,
        scanner: Scanner,
        content_store: ContentStore,
        metadata_store: MetadataStore,
        memory_limit_mb: u64,
    ) -> Self {
        let cache_budget_bytes = (memory_limit_mb as usize).saturating_mul(1024 * 1024);
        Self {
            manifests_dir,
            scanner,
            content_store,
            metadata_store: Mutex::new(metadata_store),
            last: Mutex::new(None),
            content_cache: Mutex::new(LruCache::new(cache_budget_bytes)),
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content_store
    }

    pub fn metadata_store(&self) -> &Mutex<MetadataStore> {
        &self.metadata_store
    }

    #[instrument(skip(self, context, project_root, config))]
    pub fn create_snapshot(
        &self,
        project_root: &Path,
        context: ActionContext,
        config: &RewindConfig,
        retention: &RetentionController,
    ) -> Result<String> {
        let id = generate_snapshot_id();
        let current = self.scanner.scan(project_root, config)?;

        let parent_id = self.last.lock().unwrap().as_ref().map(|l| l.id.clone());
        let baseline: FileStateMap = self
            .last
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.files.clone())
            .unwrap_or_default();

        let changes = diff_against_baseline(&id, &baseline, &current);

        let result = self.write_snapshot(
            project_root,
            &id,
            parent_id.clone(),
            &context,
            &current,
            &changes,
        );

        match result {
            Ok(()) => {
                *self.last.lock().unwrap() = Some(LastSnapshot {
                    id: id.clone(),
                    files: current,
                });
                info!(snapshot_id = %id, changes = changes.len(), "created snapshot");
                retention.enforce_after_snapshot(self, config, &id)?;
                Ok(id)
            }
            Err(e) => {
                self.cleanup_partial(&id);
                Err(RewindError::snapshot_create(e))
            }
        }
    }

    fn write_snapshot(
        &self,
        project_root: &Path,
        id: &str,
        parent_id: Option<String>,
        context: &ActionContext,
        current: &FileStateMap,
        changes: &[FileChange],
    ) -> Result<()> {
        for change in changes {
            if matches!(change.change_kind, ChangeKind::Deleted) {
                continue;
            }
            let Some(state) = current.get(&change.path) else {
                continue;
            };
            if let Some(hash) = state.content_hash {
                if !self.content_store.has(&hash) {
                    let abs = project_root.join(&change.path);
                    let bytes = std::fs::read(&abs)?;
                    self.content_store.put(&bytes)?;
                }
            }
        }

        // compressed_size covers every blob this manifest references, not just
        // the ones touched by this snapshot, so an incremental snapshot still
        // reports the tree's full compressed footprint.
        let compressed_size: u64 = current
            .values()
            .filter_map(|state| state.content_hash)
            .map(|hash| self.content_store.blob_len(&hash).unwrap_or(0))
            .sum();

        let manifest = Manifest::new(id.to_string(), current.clone(), compressed_size);
        self.write_manifest(id, &manifest)?;

        let metadata = SnapshotMetadata {
            id: id.to_string(),
            timestamp: context.timestamp,
            action_type: context.action_type.clone(),
            prompt_context: context.prompt_context.clone(),
            files_affected: changes.iter().map(|c| c.path.clone()).collect(),
            total_size: manifest.total_size,
            compression_ratio: manifest.compression_ratio(),
            parent_snapshot: parent_id,
            bookmark_name: None,
        };

        self.metadata_store
            .lock()
            .unwrap()
            .create_snapshot(&metadata, changes)?;
        Ok(())
    }

    fn cleanup_partial(&self, id: &str) {
        let _ = self.metadata_store.lock().unwrap().delete_snapshot(id);
        let dir = self.manifest_dir_for(id);
        let _ = std::fs::remove_dir_all(dir);
    }

    fn manifest_dir_for(&self, id: &str) -> PathBuf {
        self.manifests_dir.join(id)
    }

    fn manifest_path_for(&self, id: &str) -> PathBuf {
        self.manifest_dir_for(id).join("manifest.json")
    }

    fn write_manifest(&self, id: &str, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path_for(id);
        let bytes = serde_json::to_vec_pretty(manifest)?;
        crate::utils::atomic_write(&path, &bytes)?;
        Ok(())
    }

    fn read_manifest(&self, id: &str) -> Result<Manifest> {
        let path = self.manifest_path_for(id);
        let bytes = std::fs::read(&path)
            .map_err(|_| RewindError::not_found(format!("manifest for snapshot {id}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let metadata = self.metadata_store.lock().unwrap().get_snapshot(id)?;
        let Some(metadata) = metadata else {
            return Ok(None);
        };
        let manifest = self.read_manifest(id)?;
        Ok(Some(Snapshot {
            metadata,
            file_states: manifest.files,
        }))
    }

    pub fn list_snapshots(&self, filters: &TimelineFilters) -> Result<Vec<SnapshotMetadata>> {
        self.metadata_store.lock().unwrap().list_snapshots(filters)
    }

    /// Per-file change rows recorded for `id`, ordered by path.
    pub fn file_changes(&self, id: &str) -> Result<Vec<FileChange>> {
        self.metadata_store.lock().unwrap().file_changes(id)
    }

    pub fn search(&self, query: &str) -> Result<Vec<SnapshotMetadata>> {
        self.metadata_store.lock().unwrap().search(query)
    }

    pub fn add_bookmark(&self, snapshot_id: &str, name: &str, description: Option<&str>) -> Result<()> {
        self.metadata_store
            .lock()
            .unwrap()
            .add_bookmark(snapshot_id, name, description)
    }

    pub fn remove_bookmark(&self, snapshot_id: &str) -> Result<bool> {
        self.metadata_store.lock().unwrap().remove_bookmark(snapshot_id)
    }

    pub fn get_bookmark(&self, snapshot_id: &str) -> Result<Option<crate::model::Bookmark>> {
        self.metadata_store.lock().unwrap().get_bookmark(snapshot_id)
    }

    pub fn list_bookmarks(&self) -> Result<Vec<crate::model::Bookmark>> {
        self.metadata_store.lock().unwrap().list_bookmarks()
    }

    /// Re-verify every blob referenced by every snapshot's manifest.
    /// A corrupt or missing blob is reported per affected snapshot and
    /// path rather than aborting the scan; other snapshots remain
    /// operable and are still checked.
    #[instrument(skip(self))]
    pub fn check_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        let snapshots = self.list_snapshots(&TimelineFilters::default())?;
        let mut issues = Vec::new();
        for snapshot in snapshots {
            let Ok(Some(full)) = self.get_snapshot(&snapshot.id) else {
                continue;
            };
            for (path, state) in &full.file_states {
                let Some(hash) = state.content_hash else {
                    continue;
                };
                if let Err(e) = self.content_store.get(&hash) {
                    warn!(snapshot_id = %snapshot.id, path, error = %e, "integrity check failed");
                    issues.push(IntegrityIssue {
                        snapshot_id: snapshot.id.clone(),
                        path: path.clone(),
                        hash,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(issues)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let deleted = self.metadata_store.lock().unwrap().delete_snapshot(id)?;
        if deleted {
            let _ = std::fs::remove_dir_all(self.manifest_dir_for(id));
            let mut last = self.last.lock().unwrap();
            if last.as_ref().map(|l| l.id.as_str()) == Some(id) {
                *last = None;
            }
        }
        Ok(deleted)
    }

    /// Reset the incremental baseline, e.g. after retention reclaims the
    /// snapshot currently cached as "last".
    pub fn reset_baseline_if(&self, id: &str) {
        let mut last = self.last.lock().unwrap();
        if last.as_ref().map(|l| l.id.as_str()) == Some(id) {
            *last = None;
        }
    }

    /// Fetch a single file's bytes from `snapshot` by path, bypassing
    /// full snapshot reification. Repeated reads of small files during
    /// diff/preview are served from a bounded in-process cache.
    pub fn load_content(&self, snapshot_id: &str, path: &str) -> Result<Vec<u8>> {
        let cache_key = (snapshot_id.to_string(), path.to_string());
        if let Some(bytes) = self.content_cache.lock().unwrap().get(&cache_key) {
            return Ok(bytes.clone());
        }
        let manifest = self.read_manifest(snapshot_id)?;
        let state = manifest
            .files
            .get(path)
            .ok_or_else(|| RewindError::not_found(format!("path {path} in snapshot {snapshot_id}")))?;
        let Some(hash) = state.content_hash else {
            return Ok(Vec::new());
        };
        let bytes = self.content_store.get(&hash)?;
        if bytes.len() <= CONTENT_CACHE_ENTRY_LIMIT_BYTES {
            let mut cache = self.content_cache.lock().unwrap();
            let _ = cache.insert(cache_key, bytes.clone());
        }
        Ok(bytes)
    }
}

fn diff_against_baseline(
    snapshot_id: &str,
    baseline: &FileStateMap,
    current: &FileStateMap,
) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let mut seen: HashMap<&str, ()> = HashMap::new();

    for (path, state) in current {
        seen.insert(path.as_str(), ());
        match baseline.get(path) {
            None => changes.push(FileChange {
                snapshot_id: snapshot_id.to_string(),
                path: path.clone(),
                change_kind: ChangeKind::Added,
                before_hash: None,
                after_hash: state.content_hash,
            }),
            Some(prev) if prev.content_hash != state.content_hash => {
                changes.push(FileChange {
                    snapshot_id: snapshot_id.to_string(),
                    path: path.clone(),
                    change_kind: ChangeKind::Modified,
                    before_hash: prev.content_hash,
                    after_hash: state.content_hash,
                });
            }
            _ => {}
        }
    }

    for (path, prev) in baseline {
        if !seen.contains_key(path.as_str()) {
            changes.push(FileChange {
                snapshot_id: snapshot_id.to_string(),
                path: path.clone(),
                change_kind: ChangeKind::Deleted,
                before_hash: prev.content_hash,
                after_hash: None,
            });
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileState;
    use chrono::Utc;

    fn state(hash: Option<&str>) -> crate::model::FileState {
        FileState {
            relative_path: "x".to_string(),
            content_hash: hash.map(|h| ContentHash::of_bytes(h.as_bytes())),
            size_bytes: 1,
            modified_time: Utc::now(),
            permission_bits: 0o644,
            exists: true,
        }
    }

    #[test]
    fn diff_detects_added_modified_deleted() {
        let mut baseline = FileStateMap::new();
        baseline.insert("a.txt".to_string(), state(Some("hi")));
        baseline.insert("b.txt".to_string(), state(Some("bye")));

        let mut current = FileStateMap::new();
        current.insert("a.txt".to_string(), state(Some("hello")));
        current.insert("c.txt".to_string(), state(Some("new")));

        let changes = diff_against_baseline("cr_x", &baseline, &current);
        let kinds: Vec<_> = changes
            .iter()
            .map(|c| (c.path.clone(), c.change_kind))
            .collect();
        assert!(kinds.contains(&("a.txt".to_string(), ChangeKind::Modified)));
        assert!(kinds.contains(&("b.txt".to_string(), ChangeKind::Deleted)));
        assert!(kinds.contains(&("c.txt".to_string(), ChangeKind::Added)));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn unchanged_file_produces_no_change() {
        let mut baseline = FileStateMap::new();
        baseline.insert("a.txt".to_string(), state(Some("hi")));
        let current = baseline.clone();
        assert!(diff_against_baseline("cr_x", &baseline, &current).is_empty());
    }

    #[test]
    fn check_integrity_reports_tampered_blob_without_failing_other_snapshots() {
        let project = tempfile::tempdir().unwrap();
        let reserved = tempfile::tempdir().unwrap();
        let engine = SnapshotEngine::new(
            reserved.path().join("snapshots"),
            Scanner::new(),
            ContentStore::open(reserved.path().join("content"), 3).unwrap(),
            MetadataStore::open(&reserved.path().join("metadata.sqlite3")).unwrap(),
            500,
        );
        let retention = RetentionController::new(reserved.path().to_path_buf());
        let config = RewindConfig::default();

        std::fs::write(project.path().join("a.txt"), "hello\n").unwrap();
        let id = engine
            .create_snapshot(project.path(), ActionContext::new("edit"), &config, &retention)
            .unwrap();

        let hash = engine
            .get_snapshot(&id)
            .unwrap()
            .unwrap()
            .file_states
            .get("a.txt")
            .unwrap()
            .content_hash
            .unwrap();
        let blob_path = reserved
            .path()
            .join("content")
            .join(hash.fan_out_prefix())
            .join(format!("{hash}.zst"));
        let tampered = zstd::stream::encode_all(&b"tampered"[..], 3).unwrap();
        std::fs::write(&blob_path, tampered).unwrap();

        let issues = engine.check_integrity().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].snapshot_id, id);
        assert_eq!(issues[0].path, "a.txt");

        // list_snapshots still succeeds despite the corrupt blob.
        assert_eq!(engine.list_snapshots(&TimelineFilters::default()).unwrap().len(), 1);
    }
}
