//! Conflict taxonomy for the rollback planner. Each classifier compares
//! current working-tree text against a target snapshot's text and picks
//! one bucket plus its default resolution; `preview`/`execute` only
//! override the default when a caller-supplied option says to.

use crate::diff::DiffEngine;
use crate::model::{ConflictKind, ConflictResolution, FileConflict};

/// Above this line-similarity ratio, a conflict is downgraded to
/// "minor" and treated as no-conflict (restore proceeds normally).
pub const MINOR_SIMILARITY_THRESHOLD: f64 = 0.95;

const GENERATED_PATH_HINTS: &[&str] = &[
    "__pycache__",
    "node_modules",
    ".pyc",
    ".min.js",
    "build/",
    "dist/",
    "target/",
    ".egg-info",
];

const FILE_DELETED_SMALL_CHARS: usize = 50;

pub fn classify_file_added(path: &str) -> FileConflict {
    FileConflict {
        path: path.to_string(),
        kind: ConflictKind::FileAdded,
        resolution: ConflictResolution::KeepCurrent,
        similarity: 0.0,
        minor: false,
    }
}

pub fn classify_file_deleted(path: &str, current_text: &str) -> FileConflict {
    let small = current_text.trim().len() < FILE_DELETED_SMALL_CHARS;
    let generated = GENERATED_PATH_HINTS.iter().any(|hint| path.contains(hint));
    let resolution = if small || generated {
        ConflictResolution::UseSnapshot
    } else {
        ConflictResolution::KeepCurrent
    };
    FileConflict {
        path: path.to_string(),
        kind: ConflictKind::FileDeleted,
        resolution,
        similarity: 0.0,
        minor: false,
    }
}

pub fn classify_content_mismatch(path: &str, current_text: &str, target_text: &str) -> FileConflict {
    let similarity = DiffEngine::similarity_ratio(current_text, target_text);
    let minor = similarity > MINOR_SIMILARITY_THRESHOLD;

    let (kind, resolution) = if is_line_prefix(current_text, target_text) {
        (ConflictKind::AdditionsOnly, ConflictResolution::KeepCurrent)
    } else if is_line_prefix(target_text, current_text) {
        (ConflictKind::DeletionsOnly, ConflictResolution::UseSnapshot)
    } else if strip_comments(current_text) == strip_comments(target_text) {
        (ConflictKind::CommentsOnly, ConflictResolution::KeepCurrent)
    } else if normalize_whitespace(current_text) == normalize_whitespace(target_text) {
        (ConflictKind::WhitespaceOnly, ConflictResolution::KeepCurrent)
    } else {
        (ConflictKind::ContentMismatch, ConflictResolution::ThreeWayMerge)
    };

    FileConflict {
        path: path.to_string(),
        kind,
        resolution,
        similarity,
        minor,
    }
}

/// True if `prefix_of`'s lines are exactly `whole`'s leading lines, i.e.
/// `whole` is `prefix_of` plus one or more appended lines.
fn is_line_prefix(whole: &str, prefix_of: &str) -> bool {
    let whole_lines: Vec<&str> = whole.lines().collect();
    let prefix_lines: Vec<&str> = prefix_of.lines().collect();
    if prefix_lines.len() >= whole_lines.len() {
        return false;
    }
    whole_lines[..prefix_lines.len()] == prefix_lines[..]
}

fn strip_comments(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with('#') || trimmed.starts_with("//"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additions_only_keeps_current() {
        let current = "L1\nL2\nL3\nL4\n";
        let target = "L1\nL2\nL3\n";
        let conflict = classify_content_mismatch("file.py", current, target);
        assert_eq!(conflict.kind, ConflictKind::AdditionsOnly);
        assert_eq!(conflict.resolution, ConflictResolution::KeepCurrent);
    }

    #[test]
    fn deletions_only_uses_snapshot() {
        let current = "L1\nL2\n";
        let target = "L1\nL2\nL3\n";
        let conflict = classify_content_mismatch("file.py", current, target);
        assert_eq!(conflict.kind, ConflictKind::DeletionsOnly);
        assert_eq!(conflict.resolution, ConflictResolution::UseSnapshot);
    }

    #[test]
    fn whitespace_only_is_minor_and_keeps_current() {
        let current = "a  b\nc\n";
        let target = "a b\nc\n";
        let conflict = classify_content_mismatch("file.py", current, target);
        assert_eq!(conflict.kind, ConflictKind::WhitespaceOnly);
        assert!(conflict.minor);
    }

    #[test]
    fn unrelated_edits_are_content_mismatch() {
        let current = "apple\nbanana\n";
        let target = "kiwi\nmango\n";
        let conflict = classify_content_mismatch("file.py", current, target);
        assert_eq!(conflict.kind, ConflictKind::ContentMismatch);
        assert_eq!(conflict.resolution, ConflictResolution::ThreeWayMerge);
    }

    #[test]
    fn generated_deleted_file_uses_snapshot() {
        let conflict = classify_file_deleted("build/out.min.js", "x".repeat(200).as_str());
        assert_eq!(conflict.resolution, ConflictResolution::UseSnapshot);
    }

    #[test]
    fn small_deleted_file_uses_snapshot() {
        let conflict = classify_file_deleted("src/tiny.txt", "hi");
        assert_eq!(conflict.resolution, ConflictResolution::UseSnapshot);
    }

    #[test]
    fn large_non_generated_deleted_file_keeps_current() {
        let body = "line\n".repeat(50);
        let conflict = classify_file_deleted("src/big.rs", &body);
        assert_eq!(conflict.resolution, ConflictResolution::KeepCurrent);
    }
}
