//! Layer generation: turning a list of inode deltas into a `tar+gzip` blob.
//!
//! The blob digest (of the gzipped bytes) and the diff-ID (of the raw tar
//! bytes) must be computed over identical data in a single pass, so the tar
//! stream is produced into a duplicating writer chain: every byte updates the
//! diff-ID hasher and feeds the gzip encoder, whose output streams into the
//! store's hashing blob writer. A failure anywhere in the chain surfaces as
//! the producer's write error and the partial temp blob is removed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{Descriptor, MediaType};
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::cas::{BlobWriter, Cas};
use crate::digest::{new_descriptor, sha256_digest};
use crate::error::{Error, Result};
use crate::idmap::{to_container, MapOptions};
use crate::mtree::{DeltaKind, InodeDelta};
use crate::WHITEOUT_PREFIX;

/// A completed layer blob: its store descriptor plus the uncompressed
/// digest that belongs in `rootfs.diff_ids`.
#[derive(Debug)]
pub struct Layer {
    pub descriptor: Descriptor,
    pub diff_id: oci_spec::image::Digest,
}

/// Writes a gzip-compressed layer blob while hashing the uncompressed bytes.
pub struct GzipLayerWriter {
    encoder: GzEncoder<BlobWriter>,
    diff_hasher: Sha256,
}

impl GzipLayerWriter {
    pub fn new(cas: &Cas) -> Result<Self> {
        Ok(Self {
            encoder: GzEncoder::new(cas.blob_writer()?, Compression::default()),
            diff_hasher: Sha256::new(),
        })
    }

    /// Flush the compressor and move the blob into place.
    pub fn complete(self) -> Result<Layer> {
        let blob_writer = self.encoder.finish()?;
        let (digest, size) = blob_writer.complete()?;
        let diff_id = sha256_digest(&hex::encode(self.diff_hasher.finalize()))?;
        debug!("generated layer {digest} ({size} bytes, diff-ID {diff_id})");
        Ok(Layer {
            descriptor: new_descriptor(MediaType::ImageLayerGzip, digest, size)?,
            diff_id,
        })
    }
}

impl Write for GzipLayerWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.encoder.write(buf)?;
        self.diff_hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.flush()
    }
}

/// Append one tar entry per delta, in delta order.
///
/// `Extra` and `Modified` paths are archived with their current on-disk
/// state, ownership translated into the container namespace (or forced to
/// `0:0` when rootless). `Missing` paths become `.wh.<name>` whiteout
/// markers; descendants of a whited-out directory are covered by the
/// directory's own marker and skipped.
pub fn append_deltas<W: Write>(
    builder: &mut Builder<W>,
    rootfs: &Path,
    deltas: &[InodeDelta],
    options: &MapOptions,
) -> Result<()> {
    let mut emitter = Emitter {
        rootfs,
        options,
        seen_inodes: HashMap::new(),
        whiteout_cover: None,
    };
    for delta in deltas {
        match delta.kind {
            DeltaKind::Missing => emitter.append_whiteout(builder, &delta.path)?,
            DeltaKind::Extra | DeltaKind::Modified => emitter.append_path(builder, &delta.path)?,
        }
    }
    Ok(())
}

struct Emitter<'a> {
    rootfs: &'a Path,
    options: &'a MapOptions,
    /// (dev, ino) already archived this layer, for hard-link emission.
    seen_inodes: HashMap<(u64, u64), PathBuf>,
    /// The last whited-out path; deltas are path-ordered, so a removed
    /// directory's descendants follow it directly.
    whiteout_cover: Option<PathBuf>,
}

impl Emitter<'_> {
    fn append_whiteout<W: Write>(&mut self, builder: &mut Builder<W>, path: &Path) -> Result<()> {
        if let Some(cover) = &self.whiteout_cover {
            if path.starts_with(cover) {
                return Ok(());
            }
        }

        let name = path
            .file_name()
            .ok_or_else(|| Error::InvalidImage(format!("cannot white out {path:?}")))?;
        let mut marker = String::from(WHITEOUT_PREFIX);
        marker.push_str(&name.to_string_lossy());
        let whiteout = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(marker),
            _ => PathBuf::from(marker),
        };

        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, &whiteout, std::io::empty())?;

        self.whiteout_cover = Some(path.to_path_buf());
        Ok(())
    }

    fn append_path<W: Write>(&mut self, builder: &mut Builder<W>, path: &Path) -> Result<()> {
        let abs = self.rootfs.join(path);
        let meta = fs::symlink_metadata(&abs)?;
        let file_type = meta.file_type();

        let mut header = Header::new_ustar();
        header.set_mode(meta.mode() & 0o7777);
        header.set_mtime(meta.mtime().max(0) as u64);
        let (uid, gid) = if self.options.rootless {
            // attributable only to the single mappable user
            (0, 0)
        } else {
            (
                to_container(meta.uid(), &self.options.uid_mappings),
                to_container(meta.gid(), &self.options.gid_mappings),
            )
        };
        header.set_uid(uid.into());
        header.set_gid(gid.into());
        header.set_size(0);

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            builder.append_data(&mut header, path, std::io::empty())?;
        } else if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            let target = fs::read_link(&abs)?;
            builder.append_link(&mut header, path, target)?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.seen_inodes.get(&key) {
                    header.set_entry_type(EntryType::Link);
                    builder.append_link(&mut header, path, first)?;
                    return Ok(());
                }
                self.seen_inodes.insert(key, path.to_path_buf());
            }
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            builder.append_data(&mut header, path, File::open(&abs)?)?;
        } else if file_type.is_block_device() || file_type.is_char_device() {
            header.set_entry_type(if file_type.is_block_device() {
                EntryType::Block
            } else {
                EntryType::Char
            });
            header.set_device_major(rustix::fs::major(meta.rdev()))?;
            header.set_device_minor(rustix::fs::minor(meta.rdev()))?;
            builder.append_data(&mut header, path, std::io::empty())?;
        } else if file_type.is_fifo() {
            header.set_entry_type(EntryType::Fifo);
            builder.append_data(&mut header, path, std::io::empty())?;
        } else {
            // tar has no representation for sockets
            debug!("skipping unrepresentable entry {}", path.display());
        }
        Ok(())
    }
}
