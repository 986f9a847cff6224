//! Durable, transactional index of snapshot metadata, per-file change
//! records, and bookmarks, backed by a single embedded SQLite file.
//! Every multi-row mutation runs inside one transaction; foreign keys
//! are enforced on every connection so `file_changes`/`bookmarks`
//! cascade-delete with their owning snapshot.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, instrument};

use crate::errors::Result;
use crate::hash::ContentHash;
use crate::model::{Bookmark, ChangeKind, FileChange, SnapshotMetadata, TimelineFilters};

const SCHEMA_VERSION: i64 = 1;

pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::backup_before_migration(db_path);
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Take a sibling copy of an existing store file before running any
    /// migration, so a failed migration leaves a recovery point behind.
    /// A no-op for a fresh (nonexistent) store file.
    fn backup_before_migration(db_path: &Path) {
        if !db_path.exists() {
            return;
        }
        let backup_path = db_path.with_extension("sqlite3.bak");
        if let Err(e) = std::fs::copy(db_path, &backup_path) {
            tracing::warn!(error = %e, "failed to back up metadata store before migration check");
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let current = self.schema_version()?;
        if current >= SCHEMA_VERSION {
            return Ok(());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(crate::errors::RewindError::Metadata)?;
        tx.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                prompt_context TEXT,
                files_affected_count INTEGER NOT NULL DEFAULT 0,
                total_size INTEGER NOT NULL DEFAULT 0,
                compression_ratio REAL NOT NULL DEFAULT 1.0,
                parent_snapshot TEXT REFERENCES snapshots(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS file_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                change_kind TEXT NOT NULL,
                before_hash TEXT,
                after_hash TEXT
            );

            CREATE TABLE IF NOT EXISTS bookmarks (
                snapshot_id TEXT PRIMARY KEY REFERENCES snapshots(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_info (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_file_changes_snapshot ON file_changes(snapshot_id);
            CREATE INDEX IF NOT EXISTS idx_file_changes_path ON file_changes(path);
            CREATE INDEX IF NOT EXISTS idx_bookmarks_snapshot ON bookmarks(snapshot_id);
            ",
        )
        .map_err(crate::errors::RewindError::Metadata)?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_info (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, Utc::now().timestamp()],
        )
        .map_err(crate::errors::RewindError::Metadata)?;
        tx.commit().map_err(crate::errors::RewindError::Metadata)?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_info'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);
        if !exists {
            return Ok(0);
        }
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM schema_info ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    /// Insert a snapshot's metadata and all of its file-change rows in
    /// one transaction.
    #[instrument(skip(self, metadata, changes), fields(snapshot_id = %metadata.id))]
    pub fn create_snapshot(
        &mut self,
        metadata: &SnapshotMetadata,
        changes: &[FileChange],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots (
                id, timestamp, action_type, prompt_context,
                files_affected_count, total_size, compression_ratio, parent_snapshot
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metadata.id,
                metadata.timestamp.timestamp(),
                metadata.action_type,
                metadata.prompt_context,
                metadata.files_affected.len() as i64,
                metadata.total_size as i64,
                metadata.compression_ratio,
                metadata.parent_snapshot,
            ],
        )?;
        for change in changes {
            tx.execute(
                "INSERT INTO file_changes (snapshot_id, path, change_kind, before_hash, after_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    change.snapshot_id,
                    change.path,
                    change.change_kind.to_string(),
                    change.before_hash.map(|h| h.to_hex()),
                    change.after_hash.map(|h| h.to_hex()),
                ],
            )?;
        }
        tx.commit()?;
        debug!(changes = changes.len(), "recorded snapshot");
        Ok(())
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<SnapshotMetadata>> {
        let row = self
            .conn
            .query_row(
                "SELECT s.id, s.timestamp, s.action_type, s.prompt_context,
                        s.total_size, s.compression_ratio, s.parent_snapshot, b.name
                 FROM snapshots s LEFT JOIN bookmarks b ON s.id = b.snapshot_id
                 WHERE s.id = ?1",
                params![id],
                Self::row_to_metadata,
            )
            .optional()?;
        let Some(mut metadata) = row else {
            return Ok(None);
        };
        metadata.files_affected = self.file_change_paths(id)?;
        Ok(Some(metadata))
    }

    pub fn list_snapshots(&self, filters: &TimelineFilters) -> Result<Vec<SnapshotMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.timestamp, s.action_type, s.prompt_context,
                    s.total_size, s.compression_ratio, s.parent_snapshot, b.name
             FROM snapshots s LEFT JOIN bookmarks b ON s.id = b.snapshot_id
             ORDER BY s.timestamp DESC, s.id DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_metadata)?;
        let mut out = Vec::new();
        for row in rows {
            let mut metadata = row?;
            if !Self::passes_filters(&metadata, filters) {
                continue;
            }
            metadata.files_affected = self.file_change_paths(&metadata.id)?;
            if let Some(patterns) = &filters.path_patterns {
                if !patterns.is_empty()
                    && !metadata
                        .files_affected
                        .iter()
                        .any(|p| patterns.iter().any(|pat| glob_match(pat, p)))
                {
                    continue;
                }
            }
            out.push(metadata);
        }
        Ok(out)
    }

    fn passes_filters(metadata: &SnapshotMetadata, filters: &TimelineFilters) -> bool {
        if let Some(from) = filters.date_from {
            if metadata.timestamp < from {
                return false;
            }
        }
        if let Some(to) = filters.date_to {
            if metadata.timestamp > to {
                return false;
            }
        }
        if let Some(types) = &filters.action_types {
            if !types.is_empty() && !types.contains(&metadata.action_type) {
                return false;
            }
        }
        if filters.bookmarked_only && metadata.bookmark_name.is_none() {
            return false;
        }
        true
    }

    pub fn delete_snapshot(&mut self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn file_changes(&self, snapshot_id: &str) -> Result<Vec<FileChange>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, path, change_kind, before_hash, after_hash
             FROM file_changes WHERE snapshot_id = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            let change_kind: String = row.get(2)?;
            let before_hash: Option<String> = row.get(3)?;
            let after_hash: Option<String> = row.get(4)?;
            Ok(FileChange {
                snapshot_id: row.get(0)?,
                path: row.get(1)?,
                change_kind: parse_change_kind(&change_kind),
                before_hash: before_hash.and_then(|h| h.parse::<ContentHash>().ok()),
                after_hash: after_hash.and_then(|h| h.parse::<ContentHash>().ok()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn file_change_paths(&self, snapshot_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM file_changes WHERE snapshot_id = ?1 ORDER BY path")?;
        let rows = stmt.query_map(params![snapshot_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn add_bookmark(&self, snapshot_id: &str, name: &str, description: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO bookmarks (snapshot_id, name, description, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot_id, name, description, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn remove_bookmark(&self, snapshot_id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM bookmarks WHERE snapshot_id = ?1",
            params![snapshot_id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_bookmark(&self, snapshot_id: &str) -> Result<Option<Bookmark>> {
        let row = self
            .conn
            .query_row(
                "SELECT snapshot_id, name, description, created_at FROM bookmarks WHERE snapshot_id = ?1",
                params![snapshot_id],
                Self::row_to_bookmark,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_bookmarks(&self) -> Result<Vec<Bookmark>> {
        let mut stmt = self
            .conn
            .prepare("SELECT snapshot_id, name, description, created_at FROM bookmarks ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Self::row_to_bookmark)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Substring search over id, action_type, prompt_context, and any
    /// attached bookmark's name/description, case-insensitive, newest
    /// first.
    pub fn search(&self, query: &str) -> Result<Vec<SnapshotMetadata>> {
        let pattern = format!("%{query}%");
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.id, s.timestamp, s.action_type, s.prompt_context,
                    s.total_size, s.compression_ratio, s.parent_snapshot, b.name
             FROM snapshots s LEFT JOIN bookmarks b ON s.id = b.snapshot_id
             WHERE s.prompt_context LIKE ?1 COLLATE NOCASE
                OR s.action_type LIKE ?1 COLLATE NOCASE
                OR s.id LIKE ?1 COLLATE NOCASE
                OR b.name LIKE ?1 COLLATE NOCASE
                OR b.description LIKE ?1 COLLATE NOCASE
             ORDER BY s.timestamp DESC",
        )?;
        let rows = stmt.query_map(params![pattern], Self::row_to_metadata)?;
        let mut out = Vec::new();
        for row in rows {
            let mut metadata = row?;
            metadata.files_affected = self.file_change_paths(&metadata.id)?;
            out.push(metadata);
        }
        Ok(out)
    }

    pub fn storage_stats(&self) -> Result<MetadataStats> {
        let snapshot_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
        let file_change_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM file_changes", [], |r| r.get(0))?;
        let bookmark_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM bookmarks", [], |r| r.get(0))?;
        let total_size: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(total_size), 0) FROM snapshots", [], |r| {
                r.get(0)
            })?;
        Ok(MetadataStats {
            snapshot_count: snapshot_count as u64,
            file_change_count: file_change_count as u64,
            bookmark_count: bookmark_count as u64,
            total_content_size: total_size as u64,
        })
    }

    fn row_to_metadata(row: &rusqlite::Row) -> rusqlite::Result<SnapshotMetadata> {
        let ts: i64 = row.get(1)?;
        Ok(SnapshotMetadata {
            id: row.get(0)?,
            timestamp: timestamp_from_epoch(ts),
            action_type: row.get(2)?,
            prompt_context: row.get(3)?,
            files_affected: Vec::new(),
            total_size: row.get::<_, i64>(4)? as u64,
            compression_ratio: row.get(5)?,
            parent_snapshot: row.get(6)?,
            bookmark_name: row.get(7)?,
        })
    }

    fn row_to_bookmark(row: &rusqlite::Row) -> rusqlite::Result<Bookmark> {
        let created_at: i64 = row.get(3)?;
        Ok(Bookmark {
            snapshot_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: timestamp_from_epoch(created_at),
        })
    }
}

pub struct MetadataStats {
    pub snapshot_count: u64,
    pub file_change_count: u64,
    pub bookmark_count: u64,
    pub total_content_size: u64,
}

fn timestamp_from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn parse_change_kind(s: &str) -> ChangeKind {
    match s {
        "added" => ChangeKind::Added,
        "deleted" => ChangeKind::Deleted,
        _ => ChangeKind::Modified,
    }
}

/// Minimal gitignore-style glob match used for the `path_patterns`
/// timeline filter: `*` matches within a path segment, `**` matches
/// across segments.
fn glob_match(pattern: &str, path: &str) -> bool {
    let builder = ignore::gitignore::GitignoreBuilder::new(".");
    let mut builder = builder;
    if builder.add_line(None, pattern).is_err() {
        return false;
    }
    match builder.build() {
        Ok(matcher) => matcher.matched(path, false).is_ignore(),
        Err(_) => false,
    }
}
