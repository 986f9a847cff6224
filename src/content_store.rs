//! Deduplicated, compressed blob store keyed by content hash.
//!
//! Blobs live under `content/<hh>/<full-hash>.zst`, where `<hh>` is the
//! first two hex characters of the hash (prefix fan-out keeps any one
//! directory small). Writes stage into a sibling temp file and rename
//! into place, so a reader never observes a partially written blob;
//! reads re-hash the decompressed bytes and fail closed on mismatch.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::{debug, instrument, warn};

use crate::errors::{Result, RewindError};
use crate::hash::ContentHash;
use crate::utils::atomic_write;

const COMPRESSED_EXT: &str = "zst";
const RAW_EXT: &str = "raw";

pub struct ContentStore {
    root: PathBuf,
    compression_level: AtomicI32,
    compression_enabled: AtomicBool,
}

impl ContentStore {
    /// `root` is the `content/` directory under the reserved area; it is
    /// created if missing. Blobs are zstd-compressed unless the caller
    /// later disables compression via [`Self::set_compression_enabled`].
    pub fn open(root: PathBuf, compression_level: i32) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            compression_level: AtomicI32::new(compression_level),
            compression_enabled: AtomicBool::new(true),
        })
    }

    pub fn set_compression_level(&self, level: i32) {
        self.compression_level.store(level, Ordering::Relaxed);
    }

    /// Gate toggle for new writes; existing blobs keep whatever format
    /// they were written in and are still read correctly either way.
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Relaxed);
    }

    fn blob_path(&self, hash: &ContentHash, ext: &str) -> PathBuf {
        self.root
            .join(hash.fan_out_prefix())
            .join(format!("{}.{}", hash.to_hex(), ext))
    }

    /// Locate a blob on disk regardless of which format it was written
    /// in, since the compression gate may have changed since it landed.
    fn existing_blob_path(&self, hash: &ContentHash) -> Option<(PathBuf, bool)> {
        let compressed = self.blob_path(hash, COMPRESSED_EXT);
        if compressed.exists() {
            return Some((compressed, true));
        }
        let raw = self.blob_path(hash, RAW_EXT);
        if raw.exists() {
            return Some((raw, false));
        }
        None
    }

    /// Temp files created by `tempfile` inside the fan-out directory use
    /// a different extension/prefix, so the orphan sweep can recognize
    /// and skip a blob that is mid-write.
    fn is_blob_file(name: &str) -> bool {
        name.ends_with(&format!(".{COMPRESSED_EXT}")) || name.ends_with(&format!(".{RAW_EXT}"))
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of_bytes(bytes);
        if self.existing_blob_path(&hash).is_some() {
            debug!(%hash, "blob already present, skipping write");
            return Ok(hash);
        }
        if self.compression_enabled.load(Ordering::Relaxed) {
            let level = self.compression_level.load(Ordering::Relaxed);
            let compressed = zstd::stream::encode_all(bytes, level)?;
            atomic_write(&self.blob_path(&hash, COMPRESSED_EXT), &compressed)?;
        } else {
            atomic_write(&self.blob_path(&hash, RAW_EXT), bytes)?;
        }
        Ok(hash)
    }

    #[instrument(skip(self))]
    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let (path, compressed) = self
            .existing_blob_path(hash)
            .ok_or_else(|| RewindError::not_found(format!("blob {hash}")))?;
        let stored = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RewindError::not_found(format!("blob {hash}"))
            } else {
                RewindError::Io(e)
            }
        })?;
        let bytes = if compressed {
            zstd::stream::decode_all(stored.as_slice())?
        } else {
            stored
        };
        if !hash.verify(&bytes) {
            warn!(%hash, "recomputed hash disagrees with stored key");
            return Err(RewindError::corruption(format!(
                "blob {hash} failed self-verification on read"
            )));
        }
        Ok(bytes)
    }

    /// Stream a blob without materializing the whole buffer twice; still
    /// re-hashes before returning to preserve the self-verification
    /// guarantee.
    pub fn get_reader(&self, hash: &ContentHash) -> Result<impl Read> {
        let bytes = self.get(hash)?;
        Ok(std::io::Cursor::new(bytes))
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.existing_blob_path(hash).is_some()
    }

    pub fn delete(&self, hash: &ContentHash) -> Result<bool> {
        let Some((path, _)) = self.existing_blob_path(hash) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RewindError::Io(e)),
        }
    }

    /// Every blob hash currently on disk; used by the retention
    /// controller's orphan sweep.
    pub fn iter_blobs(&self) -> Result<Vec<ContentHash>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for prefix_entry in fs::read_dir(&self.root)? {
            let prefix_entry = prefix_entry?;
            if !prefix_entry.file_type()?.is_dir() {
                continue;
            }
            for blob_entry in fs::read_dir(prefix_entry.path())? {
                let blob_entry = blob_entry?;
                let name = blob_entry.file_name();
                let name = name.to_string_lossy();
                if !Self::is_blob_file(&name) {
                    continue;
                }
                let hex_part = name
                    .trim_end_matches(&format!(".{COMPRESSED_EXT}"))
                    .trim_end_matches(&format!(".{RAW_EXT}"));
                if let Ok(hash) = hex_part.parse::<ContentHash>() {
                    out.push(hash);
                }
            }
        }
        Ok(out)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk size in bytes of the compressed blob, used to accumulate
    /// a manifest's `compressed_size` total. `None` if the blob is
    /// missing (should not happen for a blob just written).
    pub fn blob_len(&self, hash: &ContentHash) -> Option<u64> {
        let (path, _) = self.existing_blob_path(hash)?;
        fs::metadata(path).ok().map(|m| m.len())
    }
}
