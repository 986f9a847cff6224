//! Shared I/O helpers used by the content store, scanner, and rollback
//! planner: atomic file writes and manifest-key normalization.

use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `bytes` to `target` with no partial writes ever visible: stage
/// into a sibling temp file in the same directory, then atomically rename
/// it into place. On any failure the temp file is removed.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Normalize a path to use forward-slash separators for storage as a
/// manifest key, regardless of host platform.
pub fn to_manifest_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sum the size in bytes of every regular file under `root`, recursively.
pub fn dir_size_bytes(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    if !root.exists() {
        return Ok(0);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_file_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/file.bin");
        atomic_write(&target, b"payload").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn atomic_write_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn manifest_key_uses_forward_slashes() {
        let p = Path::new("a").join("b").join("c.txt");
        assert_eq!(to_manifest_key(&p), "a/b/c.txt");
    }

    #[test]
    fn dir_size_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1234").unwrap();
        fs::write(dir.path().join("two"), b"12").unwrap();
        assert_eq!(dir_size_bytes(dir.path()).unwrap(), 6);
    }
}
