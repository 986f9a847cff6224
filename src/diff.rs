//! Diff production for snapshot content. Three output modes share one
//! Myers line-diff core: `unified` (plain contextual hunks), `patch`
//! (unified with `a/`/`b/` path prefixes, safe to feed to `patch(1)`),
//! and `side_by_side` (two aligned columns). Binary content is detected
//! by UTF-8 decode failure and rendered as a size marker, never diffed
//! line-by-line.

use std::collections::VecDeque;
use std::fmt::Write as _;

use similar::{Algorithm, ChangeTag, TextDiff};

use crate::hash::ContentHash;

const MAX_DIFF_LINES: usize = 10_000;
const SHORT_HASH_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    Unified,
    SideBySide,
    Patch,
}

#[derive(Debug, Clone)]
pub struct DiffItem {
    pub path: String,
    pub text: String,
}

/// Per-line classification used by the rollback conflict classifier to
/// align parent/child content without re-deriving a full diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOperation {
    Insert { line: usize, content: String },
    Delete { line: usize },
    Equal { old_line: usize, new_line: usize },
}

#[derive(Debug, Clone, Copy)]
enum EditLine<'a> {
    // old_line, new_line, text
    Context(Option<usize>, Option<usize>, &'a str),
    // old_line, text
    Delete(usize, &'a str),
    // new_line, text
    Insert(usize, &'a str),
}

pub struct DiffEngine;

impl DiffEngine {
    /// Produce one file's diff text under `mode`. `old`/`new` are `None`
    /// for an added/deleted file. Binary content (fails UTF-8 decode) is
    /// rendered as a size marker on each side and never line-diffed.
    pub fn diff_file(
        path: &str,
        old_hash: Option<&ContentHash>,
        new_hash: Option<&ContentHash>,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        mode: DiffMode,
        context: usize,
    ) -> DiffItem {
        let old_bytes = old.unwrap_or(&[]);
        let new_bytes = new.unwrap_or(&[]);

        let text = match (
            std::str::from_utf8(old_bytes),
            std::str::from_utf8(new_bytes),
        ) {
            (Ok(old_text), Ok(new_text)) => {
                let total_lines = old_text.lines().count() + new_text.lines().count();
                if total_lines > MAX_DIFF_LINES {
                    format!(
                        "<LargeFile>{path}:{total_lines}:{MAX_DIFF_LINES}</LargeFile>\n"
                    )
                } else {
                    match mode {
                        DiffMode::Unified => {
                            Self::unified(path, old_hash, new_hash, old_text, new_text, context, false)
                        }
                        DiffMode::Patch => {
                            Self::unified(path, old_hash, new_hash, old_text, new_text, context, true)
                        }
                        DiffMode::SideBySide => Self::side_by_side(old_text, new_text),
                    }
                }
            }
            _ => format!(
                "<Binary file: {} bytes>\n<Binary file: {} bytes>\n",
                old_bytes.len(),
                new_bytes.len()
            ),
        };

        DiffItem {
            path: path.to_string(),
            text,
        }
    }

    fn short_hash(hash: Option<&ContentHash>) -> String {
        hash.map(|h| h.to_hex()[..SHORT_HASH_LEN].to_string())
            .unwrap_or_else(|| "0".repeat(SHORT_HASH_LEN))
    }

    fn unified(
        path: &str,
        old_hash: Option<&ContentHash>,
        new_hash: Option<&ContentHash>,
        old_text: &str,
        new_text: &str,
        context: usize,
        patch_style: bool,
    ) -> String {
        let mut out = String::new();

        if patch_style {
            let _ = writeln!(out, "diff --git a/{path} b/{path}");
            if old_hash.is_none() {
                let _ = writeln!(out, "new file mode 100644");
            } else if new_hash.is_none() {
                let _ = writeln!(out, "deleted file mode 100644");
            }
            let _ = writeln!(
                out,
                "index {}..{} 100644",
                Self::short_hash(old_hash),
                Self::short_hash(new_hash)
            );
        }

        let (old_pref, new_pref) = if patch_style {
            if old_text.is_empty() {
                ("/dev/null".to_string(), format!("b/{path}"))
            } else if new_text.is_empty() {
                (format!("a/{path}"), "/dev/null".to_string())
            } else {
                (format!("a/{path}"), format!("b/{path}"))
            }
        } else if old_text.is_empty() {
            ("/dev/null".to_string(), path.to_string())
        } else if new_text.is_empty() {
            (path.to_string(), "/dev/null".to_string())
        } else {
            (path.to_string(), path.to_string())
        };

        let _ = writeln!(out, "--- {old_pref}");
        let _ = writeln!(out, "+++ {new_pref}");
        out.push_str(&Self::compute_unified_diff(old_text, new_text, context));
        out
    }

    /// Streaming unified diff that minimizes allocations by borrowing lines.
    fn compute_unified_diff(old_text: &str, new_text: &str, context: usize) -> String {
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_lines(old_text, new_text);

        let mut out = String::with_capacity(((old_text.len() + new_text.len()) / 16).max(4096));

        let mut prefix_ctx: VecDeque<EditLine> = VecDeque::with_capacity(context);
        let mut cur_hunk: Vec<EditLine> = Vec::new();
        let mut eq_run: Vec<EditLine> = Vec::new();
        let mut in_hunk = false;

        let mut last_old_seen = 0usize;
        let mut last_new_seen = 0usize;
        let mut old_line_no = 1usize;
        let mut new_line_no = 1usize;

        for change in diff.iter_all_changes() {
            let line = change.value().trim_end_matches(['\r', '\n']);
            match change.tag() {
                ChangeTag::Equal => {
                    let entry = EditLine::Context(Some(old_line_no), Some(new_line_no), line);
                    old_line_no += 1;
                    new_line_no += 1;
                    if in_hunk {
                        eq_run.push(entry);
                        if eq_run.len() > context * 2 {
                            Self::flush_hunk_to_out(
                                &mut out,
                                &mut cur_hunk,
                                &mut eq_run,
                                &mut prefix_ctx,
                                context,
                                &mut last_old_seen,
                                &mut last_new_seen,
                            );
                            in_hunk = false;
                        }
                    } else {
                        if prefix_ctx.len() == context {
                            prefix_ctx.pop_front();
                        }
                        prefix_ctx.push_back(entry);
                    }
                }
                ChangeTag::Delete => {
                    let entry = EditLine::Delete(old_line_no, line);
                    old_line_no += 1;
                    if !in_hunk {
                        cur_hunk.extend(prefix_ctx.iter().copied());
                        prefix_ctx.clear();
                        in_hunk = true;
                    }
                    if !eq_run.is_empty() {
                        cur_hunk.append(&mut eq_run);
                    }
                    cur_hunk.push(entry);
                }
                ChangeTag::Insert => {
                    let entry = EditLine::Insert(new_line_no, line);
                    new_line_no += 1;
                    if !in_hunk {
                        cur_hunk.extend(prefix_ctx.iter().copied());
                        prefix_ctx.clear();
                        in_hunk = true;
                    }
                    if !eq_run.is_empty() {
                        cur_hunk.append(&mut eq_run);
                    }
                    cur_hunk.push(entry);
                }
            }
        }

        if in_hunk {
            Self::flush_hunk_to_out(
                &mut out,
                &mut cur_hunk,
                &mut eq_run,
                &mut prefix_ctx,
                context,
                &mut last_old_seen,
                &mut last_new_seen,
            );
        }

        out
    }

    fn flush_hunk_to_out<'a>(
        out: &mut String,
        cur_hunk: &mut Vec<EditLine<'a>>,
        eq_run: &mut Vec<EditLine<'a>>,
        prefix_ctx: &mut VecDeque<EditLine<'a>>,
        context: usize,
        last_old_seen: &mut usize,
        last_new_seen: &mut usize,
    ) {
        let trail_to_take = eq_run.len().min(context);
        for entry in eq_run.iter().take(trail_to_take) {
            cur_hunk.push(*entry);
        }

        let mut old_first: Option<usize> = None;
        let mut old_count: usize = 0;
        let mut new_first: Option<usize> = None;
        let mut new_count: usize = 0;

        for e in cur_hunk.iter() {
            match *e {
                EditLine::Context(o, n, _) => {
                    if let Some(o) = o {
                        old_first.get_or_insert(o);
                        old_count += 1;
                    }
                    if let Some(n) = n {
                        new_first.get_or_insert(n);
                        new_count += 1;
                    }
                }
                EditLine::Delete(o, _) => {
                    old_first.get_or_insert(o);
                    old_count += 1;
                }
                EditLine::Insert(n, _) => {
                    new_first.get_or_insert(n);
                    new_count += 1;
                }
            }
        }

        if old_count == 0 && new_count == 0 {
            cur_hunk.clear();
            eq_run.clear();
            return;
        }

        let old_start = old_first.unwrap_or(*last_old_seen + 1);
        let new_start = new_first.unwrap_or(*last_new_seen + 1);

        let _ = writeln!(
            out,
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@"
        );

        for &e in cur_hunk.iter() {
            match e {
                EditLine::Context(o, n, txt) => {
                    let _ = writeln!(out, " {txt}");
                    if let Some(o) = o {
                        *last_old_seen = (*last_old_seen).max(o);
                    }
                    if let Some(n) = n {
                        *last_new_seen = (*last_new_seen).max(n);
                    }
                }
                EditLine::Delete(o, txt) => {
                    let _ = writeln!(out, "-{txt}");
                    *last_old_seen = (*last_old_seen).max(o);
                }
                EditLine::Insert(n, txt) => {
                    let _ = writeln!(out, "+{txt}");
                    *last_new_seen = (*last_new_seen).max(n);
                }
            }
        }

        prefix_ctx.clear();
        if context > 0 {
            let keep_start = eq_run.len().saturating_sub(context);
            for entry in eq_run.iter().skip(keep_start) {
                prefix_ctx.push_back(*entry);
            }
        }

        cur_hunk.clear();
        eq_run.clear();
    }

    /// Two-column layout: each row pairs one old line with one new line
    /// using the same change-tag alignment the unified path uses, padding
    /// the shorter side with blanks inside a replace run so both columns
    /// stay synchronized top to bottom.
    fn side_by_side(old_text: &str, new_text: &str) -> String {
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_lines(old_text, new_text);

        let mut out = String::new();
        let mut old_no = 1usize;
        let mut new_no = 1usize;
        let mut pending_delete: Vec<(usize, String)> = Vec::new();
        let mut pending_insert: Vec<(usize, String)> = Vec::new();

        let flush = |out: &mut String,
                     pending_delete: &mut Vec<(usize, String)>,
                     pending_insert: &mut Vec<(usize, String)>| {
            let rows = pending_delete.len().max(pending_insert.len());
            for i in 0..rows {
                let left = pending_delete
                    .get(i)
                    .map(|(n, t)| format!("{n:>5} -{t}"))
                    .unwrap_or_else(|| " ".repeat(6));
                let right = pending_insert
                    .get(i)
                    .map(|(n, t)| format!("{n:>5} +{t}"))
                    .unwrap_or_default();
                let _ = writeln!(out, "{left:<40} | {right}");
            }
            pending_delete.clear();
            pending_insert.clear();
        };

        for change in diff.iter_all_changes() {
            let line = change.value().trim_end_matches(['\r', '\n']);
            match change.tag() {
                ChangeTag::Equal => {
                    flush(&mut out, &mut pending_delete, &mut pending_insert);
                    let _ = writeln!(
                        out,
                        "{:<40} | {:>5}  {line}",
                        format!("{old_no:>5}  {line}"),
                        new_no
                    );
                    old_no += 1;
                    new_no += 1;
                }
                ChangeTag::Delete => {
                    pending_delete.push((old_no, line.to_string()));
                    old_no += 1;
                }
                ChangeTag::Insert => {
                    pending_insert.push((new_no, line.to_string()));
                    new_no += 1;
                }
            }
        }
        flush(&mut out, &mut pending_delete, &mut pending_insert);
        out
    }

    /// Myers line operations (equal/insert/delete), used by the rollback
    /// conflict classifier to find the similarity ratio and the three-way
    /// merge's shared-base approximation.
    pub fn line_operations(old_lines: &[String], new_lines: &[String]) -> Vec<DiffOperation> {
        if old_lines.is_empty() && new_lines.is_empty() {
            return Vec::new();
        }

        let old_refs: Vec<&str> = old_lines.iter().map(|s| s.as_str()).collect();
        let new_refs: Vec<&str> = new_lines.iter().map(|s| s.as_str()).collect();

        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_slices(&old_refs, &new_refs);

        let mut operations = Vec::with_capacity(old_lines.len() + new_lines.len());
        let mut old_line_no = 1usize;
        let mut new_line_no = 1usize;

        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Equal => {
                    operations.push(DiffOperation::Equal {
                        old_line: old_line_no,
                        new_line: new_line_no,
                    });
                    old_line_no += 1;
                    new_line_no += 1;
                }
                ChangeTag::Delete => {
                    operations.push(DiffOperation::Delete { line: old_line_no });
                    old_line_no += 1;
                }
                ChangeTag::Insert => {
                    operations.push(DiffOperation::Insert {
                        line: new_line_no,
                        content: change.value().to_string(),
                    });
                    new_line_no += 1;
                }
            }
        }

        operations
    }

    /// Ratio of unchanged lines to total lines, `1.0` for two empty
    /// inputs. Used by the rollback conflict classifier to suppress
    /// "minor" whitespace-only divergences (ratio > 0.95).
    pub fn similarity_ratio(old_text: &str, new_text: &str) -> f64 {
        TextDiff::from_lines(old_text, new_text).ratio() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_diff_basic_changes() {
        let old = "a\nb\nc\n";
        let new = "a\nB\nc\nd\n";
        let item = DiffEngine::diff_file(
            "foo.txt",
            Some(&ContentHash::of_bytes(old.as_bytes())),
            Some(&ContentHash::of_bytes(new.as_bytes())),
            Some(old.as_bytes()),
            Some(new.as_bytes()),
            DiffMode::Unified,
            3,
        );
        assert!(item.text.contains("--- foo.txt"));
        assert!(item.text.contains("+++ foo.txt"));
        assert!(item.text.contains("@@"));
        assert!(item.text.contains("-b"));
        assert!(item.text.contains("+B"));
        assert!(item.text.contains("+d"));
    }

    #[test]
    fn patch_mode_uses_ab_prefixes_and_git_header() {
        let old = "one\n";
        let new = "two\n";
        let item = DiffEngine::diff_file(
            "bar.txt",
            Some(&ContentHash::of_bytes(old.as_bytes())),
            Some(&ContentHash::of_bytes(new.as_bytes())),
            Some(old.as_bytes()),
            Some(new.as_bytes()),
            DiffMode::Patch,
            3,
        );
        assert!(item.text.contains("diff --git a/bar.txt b/bar.txt"));
        assert!(item.text.contains("--- a/bar.txt"));
        assert!(item.text.contains("+++ b/bar.txt"));
    }

    #[test]
    fn binary_content_is_not_line_diffed() {
        let old_bytes = vec![0u8, 159, 146, 150];
        let new_bytes = vec![0xFF, 0x00, 0x01];
        let item = DiffEngine::diff_file(
            "bin.dat",
            None,
            None,
            Some(&old_bytes),
            Some(&new_bytes),
            DiffMode::Unified,
            3,
        );
        assert!(item.text.contains("<Binary file: 4 bytes>"));
        assert!(item.text.contains("<Binary file: 3 bytes>"));
    }

    #[test]
    fn added_file_has_no_old_side() {
        let new = "hello\n";
        let item = DiffEngine::diff_file(
            "new.txt",
            None,
            Some(&ContentHash::of_bytes(new.as_bytes())),
            None,
            Some(new.as_bytes()),
            DiffMode::Unified,
            3,
        );
        assert!(item.text.contains("--- /dev/null"));
        assert!(item.text.contains("+hello"));
    }

    #[test]
    fn side_by_side_contains_both_line_numbers() {
        let old = "same\nold line\n";
        let new = "same\nnew line\n";
        let item = DiffEngine::diff_file(
            "x.txt", None, None,
            Some(old.as_bytes()),
            Some(new.as_bytes()),
            DiffMode::SideBySide,
            3,
        );
        assert!(item.text.contains("old line"));
        assert!(item.text.contains("new line"));
    }

    #[test]
    fn similarity_ratio_is_one_for_identical_text() {
        assert_eq!(DiffEngine::similarity_ratio("abc\n", "abc\n"), 1.0);
    }

    #[test]
    fn line_operations_basic_mapping() {
        let old_lines = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let new_lines = vec![
            "a".to_string(),
            "B".to_string(),
            "c".to_string(),
            "d".to_string(),
        ];
        let ops = DiffEngine::line_operations(&old_lines, &new_lines);
        let expected = vec![
            DiffOperation::Equal { old_line: 1, new_line: 1 },
            DiffOperation::Delete { line: 2 },
            DiffOperation::Insert { line: 2, content: "B".to_string() },
            DiffOperation::Equal { old_line: 3, new_line: 3 },
            DiffOperation::Insert { line: 4, content: "d".to_string() },
        ];
        assert_eq!(ops, expected);
    }
}
