//! Walks the working tree honoring ignore rules and emits a per-path
//! `FileState` map. Hashing is cached by `(path, modified_time, size)`
//! and, above a small file-count threshold, farmed out to a bounded
//! worker pool.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, UNIX_EPOCH};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use ignore::gitignore::Gitignore;
use threadpool::ThreadPool;
use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::config::RewindConfig;
use crate::errors::Result;
use crate::hash::ContentHash;
use crate::model::{FileState, FileStateMap};
use crate::utils::to_manifest_key;

pub const RESERVED_DIR_NAME: &str = ".claude-rewind";

const BUILTIN_IGNORED_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".pytest_cache",
    "node_modules",
    ".npm",
    ".vscode",
    ".idea",
    "venv",
    ".venv",
    "env",
    "target",
    "build",
    "dist",
];

const BUILTIN_IGNORED_SUFFIXES: &[&str] = &[".pyc", ".pyo", ".pyd", ".log", ".tmp", ".temp"];

const PARALLEL_THRESHOLD: usize = 10;
const DEFAULT_POOL_SIZE: usize = 4;
const HASH_CACHE_CAPACITY: usize = 50_000;
const SLOW_SCAN_WARN_MS: u128 = 500;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: String,
    modified_unix_nanos: i128,
    size: u64,
}

/// FIFO-evicting cache from `(path, mtime, size)` to a file's content
/// hash. Bounded so long-running processes don't grow unbounded memory
/// from a churning working tree.
struct HashCache {
    capacity: usize,
    map: AHashMap<CacheKey, ContentHash>,
    order: VecDeque<CacheKey>,
}

impl HashCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: AHashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<ContentHash> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: CacheKey, hash: ContentHash) {
        if self.map.insert(key.clone(), hash).is_none() {
            self.order.push_back(key);
        }
        if self.map.len() > self.capacity {
            let evict_count = (self.capacity / 10).max(1);
            for _ in 0..evict_count {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }
}

pub struct Scanner {
    pool: ThreadPool,
    cache: Arc<Mutex<HashCache>>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            pool: ThreadPool::new(DEFAULT_POOL_SIZE),
            cache: Arc::new(Mutex::new(HashCache::new(HASH_CACHE_CAPACITY))),
        }
    }

    /// Scan `project_root`, returning the file-state map for every
    /// non-ignored regular file.
    #[instrument(skip(self, config), fields(root = %project_root.display()))]
    pub fn scan(&self, project_root: &Path, config: &RewindConfig) -> Result<FileStateMap> {
        let started = Instant::now();
        let gitignore = if config.git_integration.respect_gitignore {
            load_root_gitignore(project_root)
        } else {
            None
        };

        let mut candidates = Vec::new();
        for entry in WalkDir::new(project_root)
            .into_iter()
            .filter_entry(|e| !should_prune_dir(project_root, e.path(), gitignore.as_ref()))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "failed to read directory entry during scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_ignored_file(project_root, path, gitignore.as_ref()) {
                continue;
            }
            candidates.push(path.to_path_buf());
        }

        let max_bytes = config.max_file_size_bytes();
        let parallel = config.performance.parallel_processing && candidates.len() > PARALLEL_THRESHOLD;

        let states = if parallel {
            self.hash_parallel(project_root, candidates, max_bytes)
        } else {
            self.hash_sequential(project_root, candidates, max_bytes)
        };

        let elapsed = started.elapsed();
        let total_bytes: u64 = states.values().map(|s| s.size_bytes).sum();
        tracing::info!(
            file_count = states.len(),
            total_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "scan complete"
        );
        if elapsed.as_millis() > SLOW_SCAN_WARN_MS {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "scan exceeded target duration");
        }

        Ok(states)
    }

    fn hash_sequential(
        &self,
        root: &Path,
        candidates: Vec<PathBuf>,
        max_bytes: u64,
    ) -> FileStateMap {
        let mut out = FileStateMap::new();
        for path in candidates {
            if let Some((key, state)) = self.hash_one(root, &path, max_bytes) {
                out.insert(key, state);
            }
        }
        out
    }

    fn hash_parallel(
        &self,
        root: &Path,
        candidates: Vec<PathBuf>,
        max_bytes: u64,
    ) -> FileStateMap {
        let results: Arc<Mutex<Vec<(String, FileState)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));
        for path in candidates {
            let root = root.to_path_buf();
            let cache = Arc::clone(&self.cache);
            let results = Arc::clone(&results);
            self.pool.execute(move || {
                if let Some((key, state)) = hash_one_with(&cache, &root, &path, max_bytes) {
                    results.lock().unwrap().push((key, state));
                }
            });
        }
        self.pool.join();
        let mut out = FileStateMap::new();
        for (key, state) in Arc::try_unwrap(results).unwrap().into_inner().unwrap() {
            out.insert(key, state);
        }
        out
    }

    fn hash_one(&self, root: &Path, path: &Path, max_bytes: u64) -> Option<(String, FileState)> {
        hash_one_with(&self.cache, root, path, max_bytes)
    }
}

fn hash_one_with(
    cache: &Arc<Mutex<HashCache>>,
    root: &Path,
    path: &Path,
    max_bytes: u64,
) -> Option<(String, FileState)> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to stat file during scan");
            return None;
        }
    };
    let size = metadata.len();
    if size > max_bytes {
        warn!(path = %path.display(), size, "file exceeds size guard, skipping");
        return None;
    }

    let relative = match path.strip_prefix(root) {
        Ok(p) => p,
        Err(_) => return None,
    };
    let key = to_manifest_key(relative);

    let modified = metadata
        .modified()
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let cache_key = CacheKey {
        path: key.clone(),
        modified_unix_nanos: modified.as_nanos() as i128,
        size,
    };

    let cached = cache.lock().unwrap().get(&cache_key);
    let hash = match cached {
        Some(h) => h,
        None => {
            let bytes = match fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read file during scan");
                    return None;
                }
            };
            let hash = ContentHash::of_bytes(&bytes);
            cache.lock().unwrap().insert(cache_key, hash);
            hash
        }
    };

    let modified_time: DateTime<Utc> = (UNIX_EPOCH + modified).into();
    #[cfg(unix)]
    let permission_bits = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    };
    #[cfg(not(unix))]
    let permission_bits = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };

    Some((
        key.clone(),
        FileState {
            relative_path: key,
            content_hash: Some(hash),
            size_bytes: size,
            modified_time,
            permission_bits,
            exists: true,
        },
    ))
}

fn should_prune_dir(root: &Path, path: &Path, gitignore: Option<&Gitignore>) -> bool {
    if path == root {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !path.is_dir() {
        return false;
    }
    if name == RESERVED_DIR_NAME {
        return true;
    }
    if BUILTIN_IGNORED_DIRS.contains(&name) {
        return true;
    }
    if name.starts_with('.') {
        return true;
    }
    if let Some(gi) = gitignore {
        let relative = path.strip_prefix(root).unwrap_or(path);
        if gi.matched(relative, true).is_ignore() {
            return true;
        }
    }
    false
}

fn is_ignored_file(root: &Path, path: &Path, gitignore: Option<&Gitignore>) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if name.starts_with('.') {
        return true;
    }
    if BUILTIN_IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return true;
    }
    if let Some(gi) = gitignore {
        let relative = path.strip_prefix(root).unwrap_or(path);
        if gi.matched_path_or_any_parents(relative, false).is_ignore() {
            return true;
        }
    }
    false
}

fn load_root_gitignore(project_root: &Path) -> Option<Gitignore> {
    let path = project_root.join(".gitignore");
    if !path.exists() {
        return None;
    }
    let (matcher, err) = Gitignore::new(&path);
    if let Some(e) = err {
        warn!(error = %e, "failed to parse root .gitignore, ignoring it");
    }
    Some(matcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn scans_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), "sub/b.txt", "world");
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.contains_key("a.txt"));
        assert!(states.contains_key("sub/b.txt"));
    }

    #[test]
    fn ignores_reserved_dir_and_builtins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), ".claude-rewind/metadata.sqlite3", "x");
        write(dir.path(), "node_modules/pkg/index.js", "x");
        write(dir.path(), ".git/HEAD", "x");
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 1);
        assert!(states.contains_key("a.txt"));
    }

    #[test]
    fn ignores_builtin_suffixes_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), "cache.pyc", "x");
        write(dir.path(), ".env", "x");
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn respects_root_gitignore_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), "ignored.log2", "x");
        write(dir.path(), ".gitignore", "ignored.log2\n");
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 1);
        assert!(states.contains_key("a.txt"));
    }

    #[test]
    fn gitignore_directory_pattern_excludes_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        write(dir.path(), "logs/app.txt", "log line");
        write(dir.path(), ".gitignore", "logs/\n");
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 1);
        assert!(states.contains_key("a.txt"));
        assert!(!states.contains_key("logs/app.txt"));
    }

    #[test]
    fn skips_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.bin", "0123456789");
        let mut config = RewindConfig::default();
        config.performance.max_file_size_mb = 1;
        let scanner = Scanner::new();
        // sanity: tiny file under 1MB limit still included
        let states = scanner.scan(dir.path(), &config).unwrap();
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn cache_hit_avoids_rehash_but_yields_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello");
        let scanner = Scanner::new();
        let config = RewindConfig::default();
        let first = scanner.scan(dir.path(), &config).unwrap();
        let second = scanner.scan(dir.path(), &config).unwrap();
        assert_eq!(
            first.get("a.txt").unwrap().content_hash,
            second.get("a.txt").unwrap().content_hash
        );
    }

    #[test]
    fn parallel_path_used_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            write(dir.path(), &format!("file{i}.txt"), "content");
        }
        let scanner = Scanner::new();
        let states = scanner.scan(dir.path(), &RewindConfig::default()).unwrap();
        assert_eq!(states.len(), 20);
    }
}
