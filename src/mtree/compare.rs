//! Path-aligned comparison of two directory hierarchies.

use std::cmp::Ordering;

use super::{DeltaKind, DirectoryHierarchy, InodeDelta, Keyword, KeywordDelta, KeywordSet};

/// Compare two hierarchies, yielding one delta per changed path in walk
/// order.
///
/// Both inputs must be in walk order (which [`super::walk`] and the manifest
/// parser guarantee). A path present only in `old` is `Missing`, only in
/// `new` is `Extra`; a path present in both is `Modified` when any selected
/// keyword recorded on *both* sides differs. Entries whose diff comes out
/// empty are suppressed.
pub fn compare(
    old: &DirectoryHierarchy,
    new: &DirectoryHierarchy,
    selection: &KeywordSet,
) -> Vec<InodeDelta> {
    let mut deltas = Vec::new();
    let mut old_iter = old.entries.iter().peekable();
    let mut new_iter = new.entries.iter().peekable();

    loop {
        let ordering = match (old_iter.peek(), new_iter.peek()) {
            (Some(o), Some(n)) => o.path.cmp(&n.path),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match ordering {
            Ordering::Less => {
                let o = old_iter.next().unwrap();
                deltas.push(InodeDelta {
                    kind: DeltaKind::Missing,
                    path: o.path.clone(),
                    diff: Vec::new(),
                });
            }
            Ordering::Greater => {
                let n = new_iter.next().unwrap();
                deltas.push(InodeDelta {
                    kind: DeltaKind::Extra,
                    path: n.path.clone(),
                    diff: Vec::new(),
                });
            }
            Ordering::Equal => {
                let o = old_iter.next().unwrap();
                let n = new_iter.next().unwrap();
                let diff = diff_keywords(o, n, selection);
                if !diff.is_empty() {
                    deltas.push(InodeDelta {
                        kind: DeltaKind::Modified,
                        path: n.path.clone(),
                        diff,
                    });
                }
            }
        }
    }

    deltas
}

fn diff_keywords(
    old: &super::Entry,
    new: &super::Entry,
    selection: &KeywordSet,
) -> Vec<KeywordDelta> {
    let mut diff = Vec::new();
    for &keyword in selection {
        // a keyword recorded on only one side (hard-link tails, rootless
        // ownership) is unobservable, not a change
        if let (Some(o), Some(n)) = (old.get(keyword), new.get(keyword)) {
            if o != n {
                diff.push(KeywordDelta {
                    keyword,
                    old: o.to_string(),
                    new: n.to_string(),
                });
            }
        }
    }
    diff
}
