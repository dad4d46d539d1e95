use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineChange {
    Unchanged,
    Added,
    Removed,
}

/// One line of a text diff with its 1-based position in each version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub change: LineChange,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_line: Option<usize>,
}

/// Line diff of two generated documents, for display only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeDiff {
    pub lines: Vec<DiffLine>,
    pub added: usize,
    pub removed: usize,
}

/// Longest-common-subsequence line diff. Within a changed region removed lines come before
/// added ones.
pub fn line_diff(old: &str, new: &str) -> CodeDiff {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();
    let (n, m) = (old.len(), new.len());

    // lcs[i][j]: common subsequence length of old[i..] and new[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut diff = CodeDiff::default();
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            diff.lines.push(DiffLine {
                change: LineChange::Unchanged,
                text: old[i].to_string(),
                old_line: Some(i + 1),
                new_line: Some(j + 1),
            });
            i += 1;
            j += 1;
        } else if i < n && (j == m || lcs[i + 1][j] >= lcs[i][j + 1]) {
            diff.lines.push(DiffLine {
                change: LineChange::Removed,
                text: old[i].to_string(),
                old_line: Some(i + 1),
                new_line: None,
            });
            diff.removed += 1;
            i += 1;
        } else {
            diff.lines.push(DiffLine {
                change: LineChange::Added,
                text: new[j].to_string(),
                old_line: None,
                new_line: Some(j + 1),
            });
            diff.added += 1;
            j += 1;
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text_has_no_changes() {
        let diff = line_diff("a\nb\n", "a\nb\n");
        assert_eq!((diff.added, diff.removed), (0, 0));
        assert!(diff.lines.iter().all(|l| l.change == LineChange::Unchanged));
    }

    #[test]
    fn test_replaced_line_is_removed_then_added() {
        let diff = line_diff("a\nb\nc", "a\nB\nc\nd");
        let summary: Vec<(LineChange, &str)> = diff
            .lines
            .iter()
            .map(|l| (l.change, l.text.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (LineChange::Unchanged, "a"),
                (LineChange::Removed, "b"),
                (LineChange::Added, "B"),
                (LineChange::Unchanged, "c"),
                (LineChange::Added, "d"),
            ]
        );
        assert_eq!((diff.added, diff.removed), (2, 1));
        assert_eq!(diff.lines[3].old_line, Some(3));
        assert_eq!(diff.lines[3].new_line, Some(3));
        assert_eq!(diff.lines[4].new_line, Some(4));
    }

    #[test]
    fn test_empty_sides() {
        assert_eq!(line_diff("", "x\ny").added, 2);
        assert_eq!(line_diff("x", "").removed, 1);
    }
}
