//! Deterministic filesystem walks producing a [`DirectoryHierarchy`].

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};

use super::{is_hierarchy_file, DirectoryHierarchy, Entry, FileKind, Keyword, KeywordSet};
use crate::error::Result;

/// Walk a directory tree, recording the selected keywords per inode.
///
/// The walk is a pure function of the tree state and the selection: directory
/// entries are visited in byte order of their names, symlinks are not
/// followed, and every inode appears once at its first-seen path (later
/// hard-link paths omit `size` and `sha256digest`). When `rootless`, file
/// ownership is unobservable and the `uid`/`gid` keywords are omitted.
/// Root-level `*.mtree` files are bundle state, not content, and are skipped.
pub fn walk(root: &Path, selection: &KeywordSet, rootless: bool) -> Result<DirectoryHierarchy> {
    let mut walker = Walker {
        selection,
        rootless,
        seen: HashMap::new(),
        entries: Vec::new(),
    };

    let meta = fs::symlink_metadata(root)?;
    walker.push_entry(root, PathBuf::from("."), &meta, true)?;
    walker.walk_dir(root, Path::new(""))?;

    Ok(DirectoryHierarchy {
        entries: walker.entries,
    })
}

struct Walker<'a> {
    selection: &'a KeywordSet,
    rootless: bool,
    /// (dev, ino) of non-directories with multiple links, keyed to the
    /// first path they were seen at.
    seen: HashMap<(u64, u64), PathBuf>,
    entries: Vec<Entry>,
}

impl Walker<'_> {
    fn walk_dir(&mut self, dir: &Path, rel: &Path) -> Result<()> {
        let mut names: Vec<_> = fs::read_dir(dir)?
            .map(|res| res.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()?;
        names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        for name in names {
            if rel.as_os_str().is_empty() && is_hierarchy_file(&name) {
                continue;
            }
            let abs = dir.join(&name);
            let rpath = rel.join(&name);
            let meta = fs::symlink_metadata(&abs)?;

            let first_seen = if !meta.is_dir() && meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if self.seen.contains_key(&key) {
                    false
                } else {
                    self.seen.insert(key, rpath.clone());
                    true
                }
            } else {
                true
            };

            self.push_entry(&abs, rpath.clone(), &meta, first_seen)?;
            if meta.is_dir() {
                self.walk_dir(&abs, &rpath)?;
            }
        }
        Ok(())
    }

    fn push_entry(&mut self, abs: &Path, path: PathBuf, meta: &Metadata, first_seen: bool) -> Result<()> {
        let kind = file_kind(meta);
        let mut entry = Entry {
            path,
            keywords: Default::default(),
        };

        for &keyword in self.selection {
            let value = match keyword {
                Keyword::Type => Some(kind.as_str().to_string()),
                Keyword::Mode => Some(format!("{:04o}", meta.mode() & 0o7777)),
                Keyword::Uid if !self.rootless => Some(meta.uid().to_string()),
                Keyword::Gid if !self.rootless => Some(meta.gid().to_string()),
                Keyword::Uid | Keyword::Gid => None,
                Keyword::Nlink => Some(meta.nlink().to_string()),
                Keyword::Size if kind == FileKind::File && first_seen => {
                    Some(meta.len().to_string())
                }
                Keyword::Size => None,
                Keyword::Link if kind == FileKind::Link => {
                    Some(String::from_utf8_lossy(fs::read_link(abs)?.as_os_str().as_bytes()).into_owned())
                }
                Keyword::Link => None,
                Keyword::Sha256Digest if kind == FileKind::File && first_seen => {
                    Some(file_sha256(abs)?)
                }
                Keyword::Sha256Digest => None,
                Keyword::Time => Some(format!("{}.{:09}", meta.mtime(), meta.mtime_nsec())),
            };
            if let Some(value) = value {
                entry.keywords.insert(keyword, value);
            }
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn file_kind(meta: &Metadata) -> FileKind {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileKind::Dir
    } else if ft.is_symlink() {
        FileKind::Link
    } else if ft.is_block_device() {
        FileKind::Block
    } else if ft.is_char_device() {
        FileKind::Char
    } else if ft.is_fifo() {
        FileKind::Fifo
    } else if ft.is_socket() {
        FileKind::Socket
    } else {
        FileKind::File
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::symlink;

    use similar_asserts::assert_eq;

    use super::super::keyword_set;
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/host.conf"), "multi on\n").unwrap();
        fs::write(dir.path().join("hello"), "hello, world!").unwrap();
        symlink("hello", dir.path().join("greeting")).unwrap();
        dir
    }

    #[test]
    fn test_walk_order_and_keywords() {
        let dir = fixture();
        let selection = keyword_set(Keyword::DEFAULT);
        let dh = walk(dir.path(), &selection, false).unwrap();

        let paths: Vec<_> = dh
            .entries
            .iter()
            .map(|e| e.path.to_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, [".", "etc", "etc/host.conf", "greeting", "hello"]);

        let hello = &dh.entries[4];
        assert_eq!(hello.get(Keyword::Type), Some("file"));
        assert_eq!(hello.get(Keyword::Size), Some("13"));
        assert_eq!(
            hello.get(Keyword::Sha256Digest),
            // sha256 of "hello, world!"
            Some("68e656b251e67e8358bef8483ab0d51c6619f3e7a1a9f0e75838d41ff368f728")
        );

        let greeting = &dh.entries[3];
        assert_eq!(greeting.get(Keyword::Type), Some("link"));
        assert_eq!(greeting.get(Keyword::Link), Some("hello"));
        assert_eq!(greeting.get(Keyword::Size), None);
    }

    #[test]
    fn test_walk_is_deterministic() {
        let dir = fixture();
        let selection = keyword_set(Keyword::DEFAULT);
        let a = walk(dir.path(), &selection, false).unwrap();
        let b = walk(dir.path(), &selection, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_walk_rootless_omits_ownership() {
        let dir = fixture();
        let selection = keyword_set(Keyword::DEFAULT);
        let dh = walk(dir.path(), &selection, true).unwrap();
        for entry in &dh.entries {
            assert_eq!(entry.get(Keyword::Uid), None, "{:?}", entry.path);
            assert_eq!(entry.get(Keyword::Gid), None, "{:?}", entry.path);
        }
    }

    #[test]
    fn test_walk_hardlinks_once() {
        let dir = fixture();
        fs::hard_link(dir.path().join("hello"), dir.path().join("also-hello")).unwrap();
        let selection = keyword_set(Keyword::DEFAULT);
        let dh = walk(dir.path(), &selection, false).unwrap();

        // "also-hello" sorts before "hello", so it is the first-seen path
        let first = dh.entries.iter().find(|e| e.path.ends_with("also-hello")).unwrap();
        let second = dh.entries.iter().find(|e| e.path == Path::new("hello")).unwrap();
        assert_eq!(first.get(Keyword::Nlink), Some("2"));
        assert!(first.get(Keyword::Sha256Digest).is_some());
        assert_eq!(second.get(Keyword::Sha256Digest), None);
        assert_eq!(second.get(Keyword::Size), None);
    }

    #[test]
    fn test_walk_excludes_bundle_state() {
        let dir = fixture();
        fs::write(dir.path().join("sha256_0011.mtree"), "#mtree\n").unwrap();
        let selection = keyword_set(Keyword::DEFAULT);
        let dh = walk(dir.path(), &selection, false).unwrap();
        assert!(dh.entries.iter().all(|e| !e.path.ends_with("sha256_0011.mtree")));
    }
}
