//! Metadata manifests: persisted records of a filesystem tree's per-inode
//! metadata and content hashes, used to detect changes between an unpacked
//! bundle and its source image.
//!
//! A [`DirectoryHierarchy`] is produced by [`walk`]ing a rootfs with a
//! selected [`Keyword`] set, persisted in a scoped `keyword=value` text
//! format alongside the bundle, and later [`compare`]d against a fresh walk
//! of the same tree to yield the [`InodeDelta`]s a new layer must contain.

mod compare;
mod format;
mod walk;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use oci_spec::image::Digest;

pub use compare::compare;
pub use walk::walk;

/// A metadata keyword recorded per inode.
///
/// Variant order is the order keywords appear on a manifest line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Keyword {
    Type,
    Mode,
    Uid,
    Gid,
    Nlink,
    Size,
    Link,
    Sha256Digest,
    Time,
}

impl Keyword {
    /// The keywords recorded by default when a bundle is unpacked.
    ///
    /// `time` is deliberately not selected: writing a directory's children
    /// perturbs its mtime, which would make an untouched bundle repack
    /// non-empty.
    pub const DEFAULT: &'static [Keyword] = &[
        Keyword::Type,
        Keyword::Mode,
        Keyword::Uid,
        Keyword::Gid,
        Keyword::Nlink,
        Keyword::Size,
        Keyword::Link,
        Keyword::Sha256Digest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Type => "type",
            Keyword::Mode => "mode",
            Keyword::Uid => "uid",
            Keyword::Gid => "gid",
            Keyword::Nlink => "nlink",
            Keyword::Size => "size",
            Keyword::Link => "link",
            Keyword::Sha256Digest => "sha256digest",
            Keyword::Time => "time",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "type" => Keyword::Type,
            "mode" => Keyword::Mode,
            "uid" => Keyword::Uid,
            "gid" => Keyword::Gid,
            "nlink" => Keyword::Nlink,
            "size" => Keyword::Size,
            "link" => Keyword::Link,
            "sha256digest" => Keyword::Sha256Digest,
            "time" => Keyword::Time,
            _ => return None,
        })
    }
}

/// A set of selected keywords.
pub type KeywordSet = BTreeSet<Keyword>;

/// Build a [`KeywordSet`] from a keyword slice.
pub fn keyword_set(keywords: &[Keyword]) -> KeywordSet {
    keywords.iter().copied().collect()
}

/// The kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Link,
    Block,
    Char,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Dir => "dir",
            FileKind::Link => "link",
            FileKind::Block => "block",
            FileKind::Char => "char",
            FileKind::Fifo => "fifo",
            FileKind::Socket => "socket",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "file" => FileKind::File,
            "dir" => FileKind::Dir,
            "link" => FileKind::Link,
            "block" => FileKind::Block,
            "char" => FileKind::Char,
            "fifo" => FileKind::Fifo,
            "socket" => FileKind::Socket,
            _ => return None,
        })
    }
}

/// One inode in a [`DirectoryHierarchy`]: a path relative to the walk root
/// (`.` for the root itself) and its recorded keyword values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub keywords: BTreeMap<Keyword, String>,
}

impl Entry {
    pub fn get(&self, keyword: Keyword) -> Option<&str> {
        self.keywords.get(&keyword).map(String::as_str)
    }

    pub fn kind(&self) -> Option<FileKind> {
        self.get(Keyword::Type).and_then(FileKind::from_str)
    }
}

/// An ordered description of a filesystem tree, one entry per inode at its
/// first-seen path, in lexicographic (component-wise) walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryHierarchy {
    pub entries: Vec<Entry>,
}

impl DirectoryHierarchy {
    /// The union of keywords recorded by any entry.
    pub fn used_keywords(&self) -> KeywordSet {
        self.entries
            .iter()
            .flat_map(|e| e.keywords.keys().copied())
            .collect()
    }
}

/// What happened to one path between two hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Present in the reference only: the path was removed.
    Missing,
    /// Present in the new tree only: the path was added.
    Extra,
    /// Present in both with differing keyword values.
    Modified,
}

/// A single differing keyword of a [`DeltaKind::Modified`] entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordDelta {
    pub keyword: Keyword,
    pub old: String,
    pub new: String,
}

/// One changed inode, in walk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeDelta {
    pub kind: DeltaKind,
    pub path: PathBuf,
    /// Per-keyword changes; empty unless `kind` is `Modified`.
    pub diff: Vec<KeywordDelta>,
}

/// The bundle file name a hierarchy is persisted under for a given source
/// manifest digest (`:` is unusable in file names).
pub fn hierarchy_file_name(manifest_digest: &Digest) -> String {
    format!("{}.mtree", manifest_digest.to_string().replace(':', "_"))
}

/// True if a root-level directory entry is bundle state rather than tree
/// content and must be excluded from walks.
pub(crate) fn is_hierarchy_file(name: &std::ffi::OsStr) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == "mtree")
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_hierarchy_file_name() {
        let digest: Digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(
            hierarchy_file_name(&digest),
            "sha256_e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855.mtree"
        );
    }

    #[test]
    fn test_keyword_names_roundtrip() {
        for kw in [
            Keyword::Type,
            Keyword::Mode,
            Keyword::Uid,
            Keyword::Gid,
            Keyword::Nlink,
            Keyword::Size,
            Keyword::Link,
            Keyword::Sha256Digest,
            Keyword::Time,
        ] {
            assert_eq!(Keyword::from_str(kw.as_str()), Some(kw));
        }
        assert_eq!(Keyword::from_str("flags"), None);
    }
}
