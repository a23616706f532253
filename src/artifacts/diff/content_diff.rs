//! Line-level diff of one file between two revisions.
//!
//! Output follows the classic unified format: a `---`/`+++` header carrying
//! the file name and the revision in parentheses, then hunks with three lines
//! of context. A side that has no file at its revision is shown as
//! [`DEV_NULL`] with empty content.

use bytes::Bytes;
use derive_new::new;
use similar::{ChangeTag, DiffOp, TextDiff};

pub const DEV_NULL: &str = "/dev/null";
const CONTEXT_LINES: usize = 3;

/// Before and after content of one path, with the revisions they came from.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Diff {
    a: Bytes,
    b: Bytes,
    fromfile: String,
    tofile: String,
    fromfile_revision: String,
    tofile_revision: String,
}

impl Diff {
    pub fn a(&self) -> &Bytes {
        &self.a
    }

    pub fn b(&self) -> &Bytes {
        &self.b
    }

    pub fn fromfile(&self) -> &str {
        &self.fromfile
    }

    pub fn tofile(&self) -> &str {
        &self.tofile
    }

    pub fn fromfile_revision(&self) -> &str {
        &self.fromfile_revision
    }

    pub fn tofile_revision(&self) -> &str {
        &self.tofile_revision
    }

    pub fn is_addition(&self) -> bool {
        self.fromfile == DEV_NULL
    }

    pub fn is_deletion(&self) -> bool {
        self.tofile == DEV_NULL
    }

    /// Unified diff text without a trailing newline; empty when both sides
    /// hold the same lines.
    pub fn udiff(&self) -> String {
        let old = String::from_utf8_lossy(&self.a);
        let new = String::from_utf8_lossy(&self.b);
        let old_lines = old.lines().collect::<Vec<_>>();
        let new_lines = new.lines().collect::<Vec<_>>();

        let text_diff = TextDiff::from_slices(&old_lines, &new_lines);
        let groups = text_diff.grouped_ops(CONTEXT_LINES);
        if groups.is_empty() {
            return String::new();
        }

        let mut output = vec![
            format!("--- {}\t({})", self.fromfile, self.fromfile_revision),
            format!("+++ {}\t({})", self.tofile, self.tofile_revision),
        ];

        for group in &groups {
            output.push(hunk_header(group));
            for op in group {
                for change in text_diff.iter_changes(op) {
                    let sign = match change.tag() {
                        ChangeTag::Equal => ' ',
                        ChangeTag::Delete => '-',
                        ChangeTag::Insert => '+',
                    };
                    output.push(format!("{sign}{}", change.value()));
                }
            }
        }

        output.join("\n")
    }
}

impl std::fmt::Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.udiff())
    }
}

fn hunk_header(group: &[DiffOp]) -> String {
    let (Some(first), Some(last)) = (group.first(), group.last()) else {
        return "@@ -0,0 +0,0 @@".to_string();
    };

    format!(
        "@@ -{} +{} @@",
        format_range(first.old_range().start, last.old_range().end),
        format_range(first.new_range().start, last.new_range().end)
    )
}

/// `start,length` with 1-based start; a single line drops the length and an
/// empty range points at the line before it.
fn format_range(start: usize, end: usize) -> String {
    let length = end - start;
    match length {
        1 => format!("{}", start + 1),
        0 => format!("{start},0"),
        _ => format!("{},{length}", start + 1),
    }
}
