//! The metadata manifest text format.
//!
//! One entry per line: an escaped name followed by space-separated
//! `keyword=value` pairs. A `dir` entry opens a scope containing its
//! children; a line consisting of `..` closes the innermost scope. The walk
//! root appears first as `.`. Lines starting with `#` are comments.
//!
//! Names and `link` values escape bytes outside the printable ASCII range
//! (and `\`, `#`, space) as three-digit octal `\ooo` sequences.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use super::{DirectoryHierarchy, Entry, FileKind, Keyword};
use crate::error::{Error, Result};

impl DirectoryHierarchy {
    /// Serialize in walk order.
    pub fn to_writer(&self, mut w: impl Write) -> Result<()> {
        writeln!(w, "#mtree")?;

        let mut stack: Vec<PathBuf> = Vec::new();
        for entry in &self.entries {
            let (parent, name) = split_entry_path(&entry.path);
            while stack.last().map(PathBuf::as_path) != parent {
                if stack.pop().is_none() {
                    // entries out of walk order
                    return Err(Error::MalformedManifestFile {
                        line: 0,
                        reason: format!("entry {:?} does not follow its parent", entry.path),
                    });
                }
                writeln!(w, "..")?;
            }

            write!(w, "{}", escape(&name))?;
            for (keyword, value) in &entry.keywords {
                match keyword {
                    Keyword::Link => write!(w, " link={}", escape(value))?,
                    _ => write!(w, " {}={}", keyword.as_str(), value)?,
                }
            }
            writeln!(w)?;

            if entry.kind() == Some(FileKind::Dir) {
                stack.push(entry.path.clone());
            }
        }
        Ok(())
    }

    /// Parse a manifest back into walk order.
    pub fn from_reader(r: impl BufRead) -> Result<Self> {
        let mut entries = Vec::new();
        let mut stack: Vec<PathBuf> = Vec::new();

        for (idx, line) in r.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let malformed = |reason: String| Error::MalformedManifestFile {
                line: line_no,
                reason,
            };

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_ascii_whitespace();
            let name = tokens.next().expect("non-empty line");

            if name == ".." {
                if stack.pop().is_none() {
                    return Err(malformed("unbalanced \"..\"".into()));
                }
                continue;
            }

            let path = if name == "." {
                if !stack.is_empty() || !entries.is_empty() {
                    return Err(malformed("\".\" is only valid as the first entry".into()));
                }
                PathBuf::from(".")
            } else {
                let name = unescape(name).map_err(|reason| malformed(reason))?;
                match stack.last() {
                    Some(dir) if dir == Path::new(".") => PathBuf::from(name),
                    Some(dir) => dir.join(name),
                    None => return Err(malformed("entry before the root entry".into())),
                }
            };

            let mut entry = Entry {
                path,
                keywords: Default::default(),
            };
            for token in tokens {
                let (key, value) = token
                    .split_once('=')
                    .ok_or_else(|| malformed(format!("bare token {token:?}")))?;
                // unknown keywords from newer writers are skipped, not fatal
                let Some(keyword) = Keyword::from_str(key) else {
                    continue;
                };
                let value = match keyword {
                    Keyword::Link => unescape(value).map_err(|reason| malformed(reason))?,
                    _ => value.to_string(),
                };
                entry.keywords.insert(keyword, value);
            }

            let is_dir = entry.kind() == Some(FileKind::Dir);
            let path = entry.path.clone();
            entries.push(entry);
            if is_dir {
                stack.push(path);
            }
        }

        Ok(DirectoryHierarchy { entries })
    }
}

/// Split an entry path into (parent scope, display name). The root entry
/// `.` has no parent; top-level entries live in the `.` scope.
fn split_entry_path(path: &Path) -> (Option<&Path>, String) {
    if path == Path::new(".") {
        return (None, ".".to_string());
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => Path::new("."),
    };
    (Some(parent), name)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_graphic() && b != b'\\' && b != b'#' && b != b'=' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:03o}"));
        }
    }
    out
}

fn unescape(s: &str) -> std::result::Result<String, String> {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let mut value: u32 = 0;
        for _ in 0..3 {
            match bytes.next() {
                Some(d @ b'0'..=b'7') => value = value * 8 + u32::from(d - b'0'),
                _ => return Err(format!("truncated escape in {s:?}")),
            }
        }
        let byte =
            u8::try_from(value).map_err(|_| format!("escape out of range in {s:?}"))?;
        out.push(byte);
    }
    String::from_utf8(out).map_err(|_| format!("invalid UTF-8 in {s:?}"))
}

#[cfg(test)]
mod test {
    use std::io::BufReader;
    use std::path::PathBuf;

    use similar_asserts::assert_eq;

    use super::super::keyword_set;
    use super::*;

    fn entry(path: &str, keywords: &[(Keyword, &str)]) -> Entry {
        Entry {
            path: PathBuf::from(path),
            keywords: keywords
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        }
    }

    fn sample() -> DirectoryHierarchy {
        DirectoryHierarchy {
            entries: vec![
                entry(".", &[(Keyword::Type, "dir"), (Keyword::Mode, "0755")]),
                entry("etc", &[(Keyword::Type, "dir"), (Keyword::Mode, "0755")]),
                entry(
                    "etc/host.conf",
                    &[
                        (Keyword::Type, "file"),
                        (Keyword::Mode, "0644"),
                        (Keyword::Size, "9"),
                    ],
                ),
                entry(
                    "greeting",
                    &[(Keyword::Type, "link"), (Keyword::Link, "with space")],
                ),
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let dh = sample();
        let mut buf = Vec::new();
        dh.to_writer(&mut buf).unwrap();
        let parsed = DirectoryHierarchy::from_reader(BufReader::new(&buf[..])).unwrap();
        assert_eq!(parsed, dh);
    }

    #[test]
    fn test_serialized_shape() {
        let mut buf = Vec::new();
        sample().to_writer(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "#mtree\n\
             . type=dir mode=0755\n\
             etc type=dir mode=0755\n\
             host.conf type=file mode=0644 size=9\n\
             ..\n\
             greeting type=link link=with\\040space\n"
        );
    }

    #[test]
    fn test_used_keywords_recovered() {
        let mut buf = Vec::new();
        sample().to_writer(&mut buf).unwrap();
        let parsed = DirectoryHierarchy::from_reader(BufReader::new(&buf[..])).unwrap();
        assert_eq!(
            parsed.used_keywords(),
            keyword_set(&[Keyword::Type, Keyword::Mode, Keyword::Size, Keyword::Link])
        );
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let text = "#mtree\n. type=dir\n..\n..\n";
        let err = DirectoryHierarchy::from_reader(BufReader::new(text.as_bytes())).unwrap_err();
        match err {
            Error::MalformedManifestFile { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error {other:?}"),
        }

        let text = ". type=dir\nbroken token\n";
        let err = DirectoryHierarchy::from_reader(BufReader::new(text.as_bytes())).unwrap_err();
        match err {
            Error::MalformedManifestFile { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unknown_keywords_skipped() {
        let text = ". type=dir flags=uchg\n";
        let parsed = DirectoryHierarchy::from_reader(BufReader::new(text.as_bytes())).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].get(Keyword::Type), Some("dir"));
    }

    #[test]
    fn test_escape_roundtrip() {
        for name in ["plain", "with space", "tab\tname", "back\\slash", "#lead", "a=b"] {
            let escaped = escape(name);
            assert!(!escaped.contains(' '), "{escaped:?}");
            assert_eq!(unescape(&escaped).unwrap(), name);
        }
    }
}
