//! Unpacking an image into a runtime bundle.
//!
//! A bundle is a directory holding `rootfs/` (the extracted layer stack),
//! `config.json` (a minimal runtime-spec document derived from the image
//! configuration), and the metadata manifest recording the tree as
//! extracted, which `repack` later diffs against.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use oci_spec::image::MediaType;
use tar::{Archive, EntryType};
use tracing::debug;

use crate::cas::{Blob, Cas};
use crate::digest::HashingReader;
use crate::error::{Error, Result};
use crate::idmap::{to_host, MapOptions};
use crate::mtree::{self, hierarchy_file_name, keyword_set, Keyword};
use crate::{OPAQUE_WHITEOUT, ROOTFS_NAME, WHITEOUT_PREFIX};

/// Unpack the image `from` points at into a fresh bundle directory.
pub fn unpack_bundle(cas: &Cas, from: &str, bundle: &Path, options: &MapOptions) -> Result<()> {
    let descriptor = cas.get_reference(from)?;
    if *descriptor.media_type() != MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(descriptor.media_type().clone()));
    }

    let manifest = cas.read_manifest(&descriptor)?;
    let config = cas.read_config(manifest.config())?;
    let diff_ids = config.rootfs().diff_ids();
    if manifest.layers().len() != diff_ids.len() {
        return Err(Error::InvalidImage(format!(
            "manifest has {} layers but config has {} diff IDs",
            manifest.layers().len(),
            diff_ids.len()
        )));
    }

    if bundle.exists() && fs::read_dir(bundle)?.next().is_some() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("bundle directory {} is not empty", bundle.display()),
        )));
    }
    let rootfs = bundle.join(ROOTFS_NAME);
    fs::create_dir_all(&rootfs)?;

    debug!(
        "unpacking {from:?} ({} layers) into {}",
        manifest.layers().len(),
        bundle.display()
    );
    for (layer_descriptor, diff_id) in manifest.layers().iter().zip(diff_ids) {
        let Blob::Layer(blob) = cas.read_blob(layer_descriptor)? else {
            return Err(Error::UnsupportedMediaType(
                layer_descriptor.media_type().clone(),
            ));
        };

        // hash the uncompressed stream while extracting; the diff-ID must
        // cover every byte, including the terminator the archive reader
        // does not consume
        let mut tar_stream = HashingReader::new(GzDecoder::new(BufReader::new(blob)));
        extract_layer(&mut tar_stream, &rootfs, options)?;
        io::copy(&mut tar_stream, &mut io::sink())?;

        let found = format!("sha256:{}", tar_stream.finish());
        if &found != diff_id {
            return Err(Error::DigestMismatch {
                expected: diff_id.clone(),
                found,
            });
        }
    }

    let spec = crate::runtime::RuntimeSpec::from_image_config(&config, ROOTFS_NAME)?;
    let config_file = File::create(bundle.join("config.json"))?;
    serde_json::to_writer_pretty(BufWriter::new(config_file), &spec)?;

    // record the tree exactly as extracted, under the source manifest digest
    let hierarchy = mtree::walk(&rootfs, &keyword_set(Keyword::DEFAULT), options.rootless)?;
    let state_file = File::create(bundle.join(hierarchy_file_name(descriptor.digest())))?;
    let mut state_writer = BufWriter::new(state_file);
    hierarchy.to_writer(&mut state_writer)?;

    debug!("unpacked {from:?} into {}", bundle.display());
    Ok(())
}

/// Apply one layer archive to the rootfs.
fn extract_layer(tar_stream: &mut impl Read, rootfs: &Path, options: &MapOptions) -> Result<()> {
    let mut archive = Archive::new(tar_stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name == OPAQUE_WHITEOUT {
            let dir = rootfs.join(path.parent().unwrap_or(Path::new("")));
            clear_directory(&dir)?;
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            remove_path(&victim)?;
            continue;
        }

        let entry_type = entry.header().entry_type();
        let uid = entry.header().uid()? as u32;
        let gid = entry.header().gid()? as u32;

        if !entry.unpack_in(rootfs)? {
            return Err(Error::InvalidImage(format!(
                "layer entry {path:?} escapes the rootfs"
            )));
        }

        // tar IDs are container-namespace; the bundle lives on the host.
        // Rootless processes cannot chown at all, so ownership is left to
        // the extracting user there.
        if !options.rootless && entry_type != EntryType::Link {
            let unpacked = rootfs.join(&path);
            std::os::unix::fs::lchown(
                &unpacked,
                Some(to_host(uid, &options.uid_mappings)),
                Some(to_host(gid, &options.gid_mappings)),
            )?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        // whiting out something that never existed is harmless
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn tar_with(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in entries {
            let mut header = tar::Header::new_ustar();
            header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_mode(0o755);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            match contents {
                Some(data) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_cksum();
                    builder.append(&header, data.as_bytes()).unwrap();
                }
                None => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn rootless() -> MapOptions {
        MapOptions {
            rootless: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_plain_layer() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = tar_with(&[
            ("etc", None),
            ("etc/host.conf", Some("multi on\n")),
            ("hello", Some("hi")),
        ]);
        extract_layer(&mut &tar_bytes[..], dir.path(), &rootless()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/host.conf")).unwrap(),
            "multi on\n"
        );
        assert_eq!(fs::read_to_string(dir.path().join("hello")).unwrap(), "hi");
    }

    #[test]
    fn test_extract_applies_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/host.conf"), "multi on\n").unwrap();
        fs::write(dir.path().join("keep"), "kept").unwrap();

        let tar_bytes = tar_with(&[("etc/.wh.host.conf", Some(""))]);
        extract_layer(&mut &tar_bytes[..], dir.path(), &rootless()).unwrap();
        assert!(!dir.path().join("etc/host.conf").exists());
        assert!(dir.path().join("keep").exists());
    }

    #[test]
    fn test_extract_applies_opaque_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("opt/app")).unwrap();
        fs::write(dir.path().join("opt/app/stale"), "x").unwrap();

        let tar_bytes = tar_with(&[("opt/app/.wh..wh..opq", Some(""))]);
        extract_layer(&mut &tar_bytes[..], dir.path(), &rootless()).unwrap();
        assert!(dir.path().join("opt/app").exists());
        assert!(!dir.path().join("opt/app/stale").exists());
    }

    #[test]
    fn test_extract_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let tar_bytes = tar_with(&[("../escape", Some("boom"))]);
        assert!(extract_layer(&mut &tar_bytes[..], dir.path(), &rootless()).is_err());
    }
}
