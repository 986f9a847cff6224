//! Line-based three-way merge used when a `content_mismatch` conflict's
//! default resolution is attempted before falling back to keep-current.

use std::collections::HashSet;

use similar::{ChangeTag, TextDiff};

/// Minimum shared-line fraction between current and target below which
/// no `base` approximation is attempted and the merge is skipped.
pub const BASE_APPROXIMATION_MIN_SHARED_RATIO: f64 = 0.70;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineEdit {
    /// Remove the base line at this 1-based index.
    Delete(usize),
    /// Insert `content` immediately after this 1-based base index (0 =
    /// before the first line).
    Insert(usize, String),
}

fn affected_index(edit: &LineEdit) -> usize {
    match edit {
        LineEdit::Delete(i) => *i,
        LineEdit::Insert(i, _) => *i,
    }
}

fn edits_from_base(base: &[&str], other: &[&str]) -> Vec<LineEdit> {
    let diff = TextDiff::from_slices(base, other);
    let mut out = Vec::new();
    let mut base_idx = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => base_idx += 1,
            ChangeTag::Delete => {
                base_idx += 1;
                out.push(LineEdit::Delete(base_idx));
            }
            ChangeTag::Insert => {
                let text = change.value().trim_end_matches(['\r', '\n']).to_string();
                out.push(LineEdit::Insert(base_idx, text));
            }
        }
    }
    out
}

/// Approximate a merge base from two candidate texts when no true
/// ancestor is tracked: if they share at least 70% of their lines, the
/// shorter text is used as `base`. Returns `None` when they diverge too
/// much to approximate safely.
pub fn approximate_base<'a>(current: &'a str, target: &'a str) -> Option<&'a str> {
    let ratio = crate::diff::DiffEngine::similarity_ratio(current, target);
    if ratio < BASE_APPROXIMATION_MIN_SHARED_RATIO {
        return None;
    }
    if current.lines().count() <= target.lines().count() {
        Some(current)
    } else {
        Some(target)
    }
}

/// Merge `current` and `target`'s independent edits against `base`.
/// Returns `None` if either side's edits touch an overlapping base line
/// (unmergeable), in which case the caller falls back to keep-current.
pub fn three_way_merge(base: &str, current: &str, target: &str) -> Option<String> {
    let base_lines: Vec<&str> = base.lines().collect();
    let current_lines: Vec<&str> = current.lines().collect();
    let target_lines: Vec<&str> = target.lines().collect();

    let current_edits = edits_from_base(&base_lines, &current_lines);
    let target_edits = edits_from_base(&base_lines, &target_lines);

    let current_touched: HashSet<usize> = current_edits.iter().map(affected_index).collect();
    let target_touched: HashSet<usize> = target_edits.iter().map(affected_index).collect();
    if current_touched.intersection(&target_touched).next().is_some() {
        return None;
    }

    let mut lines: Vec<String> = base_lines.iter().map(|s| s.to_string()).collect();
    let mut all_edits: Vec<LineEdit> = current_edits.into_iter().chain(target_edits).collect();
    // Apply in descending base-index order so earlier indices stay valid.
    all_edits.sort_by(|a, b| affected_index(b).cmp(&affected_index(a)));

    for edit in all_edits {
        match edit {
            LineEdit::Delete(idx) => {
                if idx >= 1 && idx <= lines.len() {
                    lines.remove(idx - 1);
                }
            }
            LineEdit::Insert(after_idx, content) => {
                let pos = after_idx.min(lines.len());
                lines.insert(pos, content);
            }
        }
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_edits_merge_cleanly() {
        let base = "L1\nL2\nL3\n";
        let current = "new-first\nL1\nL2\nL3\n";
        let target = "L1\nL2\nL3\nnew-last\n";
        let merged = three_way_merge(base, current, target).expect("mergeable");
        assert_eq!(merged, "new-first\nL1\nL2\nL3\nnew-last\n");
    }

    #[test]
    fn overlapping_edits_are_unmergeable() {
        let base = "L1\nL2\nL3\n";
        let current = "L1\nchanged-by-current\nL3\n";
        let target = "L1\nchanged-by-target\nL3\n";
        assert!(three_way_merge(base, current, target).is_none());
    }

    #[test]
    fn approximate_base_picks_shorter_when_similar_enough() {
        let current = "a\nb\nc\n";
        let target = "a\nb\nc\nd\n";
        assert_eq!(approximate_base(current, target), Some(current));
    }

    #[test]
    fn approximate_base_none_when_too_different() {
        let current = "totally\nunrelated\n";
        let target = "completely\ndifferent\ntext\nhere\n";
        assert_eq!(approximate_base(current, target), None);
    }

    /// Two independent single-line insertions at distinct base positions
    /// must merge to the same text regardless of which side is called
    /// `current` and which `target` — the function only cares about
    /// each side's edits against `base`, not which argument position
    /// they arrived in.
    quickcheck::quickcheck! {
        fn merge_is_commutative_on_disjoint_single_line_inserts(
            base_lines: Vec<String>,
            a_idx: usize,
            a_content: String,
            b_idx: usize,
            b_content: String
        ) -> quickcheck::TestResult {
            if base_lines.is_empty() || base_lines.len() > 20 {
                return quickcheck::TestResult::discard();
            }
            if base_lines.iter().any(|l| l.is_empty() || l.contains('\n') || l.contains('\r')) {
                return quickcheck::TestResult::discard();
            }
            if a_content.is_empty() || a_content.contains('\n') || a_content.contains('\r')
                || b_content.is_empty() || b_content.contains('\n') || b_content.contains('\r')
                || a_content == b_content
                || base_lines.contains(&a_content)
                || base_lines.contains(&b_content)
            {
                return quickcheck::TestResult::discard();
            }

            let n = base_lines.len();
            let ai = a_idx % (n + 1);
            let bi = b_idx % (n + 1);
            if ai == bi {
                return quickcheck::TestResult::discard();
            }

            let base = base_lines.join("\n") + "\n";

            let mut current_lines = base_lines.clone();
            current_lines.insert(ai, a_content.clone());
            let current = current_lines.join("\n") + "\n";

            let mut target_lines = base_lines.clone();
            target_lines.insert(bi, b_content.clone());
            let target = target_lines.join("\n") + "\n";

            match (
                three_way_merge(&base, &current, &target),
                three_way_merge(&base, &target, &current),
            ) {
                (Some(m1), Some(m2)) => quickcheck::TestResult::from_bool(m1 == m2),
                (None, None) => quickcheck::TestResult::passed(),
                _ => quickcheck::TestResult::failed(),
            }
        }
    }
}
