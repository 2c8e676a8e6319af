//! driftlog diff: character-level edit scripts between two snapshot texts and
//! the compact, colored rendering written to audit files.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag, TextDiff};
use tracing::debug;

pub const INSERT_OPEN: &str = "\x1b[32m";
pub const DELETE_OPEN: &str = "\x1b[31m";
pub const MARK_CLOSE: &str = "\x1b[0m";

/// One contiguous span of a diff result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffFragment {
    Equal(String),
    Insert(String),
    Delete(String),
}

impl DiffFragment {
    pub fn text(&self) -> &str {
        match self {
            DiffFragment::Equal(t) | DiffFragment::Insert(t) | DiffFragment::Delete(t) => t,
        }
    }

    pub fn is_change(&self) -> bool { !matches!(self, DiffFragment::Equal(_)) }
}

/// Myers diff over characters with an upper bound on computation time. Past the
/// deadline the result is still a valid edit script, just less minimal.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine {
    timeout: Duration,
}

impl Default for DiffEngine {
    fn default() -> Self { Self { timeout: Duration::from_secs(1) } }
}

impl DiffEngine {
    pub fn new(timeout: Duration) -> Self { Self { timeout } }

    pub fn diff(&self, old: &str, new: &str) -> Vec<DiffFragment> {
        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .timeout(self.timeout)
            .diff_chars(old, new);
        let old_slices = diff.old_slices();
        let new_slices = diff.new_slices();
        let mut out: Vec<DiffFragment> = Vec::new();
        for op in diff.ops() {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => push(&mut out, DiffFragment::Equal(old_slices[old_range].concat())),
                DiffTag::Delete => push(&mut out, DiffFragment::Delete(old_slices[old_range].concat())),
                DiffTag::Insert => push(&mut out, DiffFragment::Insert(new_slices[new_range].concat())),
                DiffTag::Replace => {
                    push(&mut out, DiffFragment::Delete(old_slices[old_range].concat()));
                    push(&mut out, DiffFragment::Insert(new_slices[new_range].concat()));
                }
            }
        }
        debug!(fragments = out.len(), old_len = old.len(), new_len = new.len(), "diff computed");
        out
    }
}

// Adjacent fragments of the same kind are merged; empty ones dropped.
fn push(out: &mut Vec<DiffFragment>, frag: DiffFragment) {
    if frag.text().is_empty() { return; }
    match (out.last_mut(), &frag) {
        (Some(DiffFragment::Equal(a)), DiffFragment::Equal(b))
        | (Some(DiffFragment::Insert(a)), DiffFragment::Insert(b))
        | (Some(DiffFragment::Delete(a)), DiffFragment::Delete(b)) => a.push_str(b),
        _ => out.push(frag),
    }
}

/// Keep the first line (with its line break) and whatever follows the last line
/// break; drop everything in between. Single-line text is returned unchanged.
pub fn compact_equal(text: &str) -> Cow<'_, str> {
    let (Some(first), Some(last)) = (text.find('\n'), text.rfind('\n')) else {
        return Cow::Borrowed(text);
    };
    if first == last && first + 1 == text.len() {
        return Cow::Borrowed(text);
    }
    let mut s = String::with_capacity(first + 1 + text.len() - last - 1);
    s.push_str(&text[..=first]);
    s.push_str(&text[last + 1..]);
    Cow::Owned(s)
}

/// Render fragments: inserts green, deletes red, equal spans compacted.
pub fn render(fragments: &[DiffFragment]) -> String {
    let mut buf = String::new();
    for frag in fragments {
        match frag {
            DiffFragment::Insert(t) => {
                buf.push_str(INSERT_OPEN);
                buf.push_str(t);
                buf.push_str(MARK_CLOSE);
            }
            DiffFragment::Delete(t) => {
                buf.push_str(DELETE_OPEN);
                buf.push_str(t);
                buf.push_str(MARK_CLOSE);
            }
            DiffFragment::Equal(t) => buf.push_str(&compact_equal(t)),
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "annotations: null\nspec:\n  replicas: 3\nstatus:\n  ready: 3\n";
    const B: &str = "annotations: null\nspec:\n  replicas: 3\nstatus:\n  ready: 2\n";

    #[test]
    fn only_changed_value_is_marked() {
        let frags = DiffEngine::default().diff(A, B);
        let changes: Vec<_> = frags.iter().filter(|f| f.is_change()).cloned().collect();
        assert_eq!(changes, vec![DiffFragment::Delete("3".into()), DiffFragment::Insert("2".into())]);
        assert_eq!(
            frags.first(),
            Some(&DiffFragment::Equal("annotations: null\nspec:\n  replicas: 3\nstatus:\n  ready: ".into()))
        );
        assert_eq!(frags.last(), Some(&DiffFragment::Equal("\n".into())));
    }

    #[test]
    fn render_compacts_and_marks() {
        let out = render(&DiffEngine::default().diff(A, B));
        assert_eq!(out, "annotations: null\n  ready: \x1b[31m3\x1b[0m\x1b[32m2\x1b[0m\n");
    }

    #[test]
    fn identical_texts_have_no_changes() {
        let frags = DiffEngine::default().diff(A, A);
        assert_eq!(frags, vec![DiffFragment::Equal(A.into())]);
    }

    #[test]
    fn compaction_keeps_first_and_last_line_only() {
        let text = "line-1\nline-2\nline-3\nline-4\nline-5";
        let out = compact_equal(text);
        assert_eq!(out, "line-1\nline-5");
        for middle in ["line-2", "line-3", "line-4"] {
            assert!(!out.contains(middle));
        }
    }

    #[test]
    fn compaction_edge_cases() {
        assert_eq!(compact_equal("no break"), "no break");
        assert_eq!(compact_equal("one\n"), "one\n");
        assert_eq!(compact_equal("one\ntwo"), "one\ntwo");
        assert_eq!(compact_equal("a\nb\n"), "a\n");
        assert_eq!(compact_equal("\ntail"), "\ntail");
    }

    #[test]
    fn pure_insert_and_delete() {
        let frags = DiffEngine::default().diff("", "abc");
        assert_eq!(frags, vec![DiffFragment::Insert("abc".into())]);
        let frags = DiffEngine::default().diff("abc", "");
        assert_eq!(frags, vec![DiffFragment::Delete("abc".into())]);
    }

    #[test]
    fn fragments_reassemble_both_sides() {
        let old = "spec:\n  image: es:7.10\n  replicas: 3\n";
        let new = "spec:\n  image: es:7.17\n  replicas: 5\n  paused: true\n";
        let frags = DiffEngine::default().diff(old, new);
        let left: String = frags.iter().filter(|f| !matches!(f, DiffFragment::Insert(_))).map(|f| f.text()).collect();
        let right: String = frags.iter().filter(|f| !matches!(f, DiffFragment::Delete(_))).map(|f| f.text()).collect();
        assert_eq!(left, old);
        assert_eq!(right, new);
    }
}
