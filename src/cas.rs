//! The content-addressable image store.
//!
//! An image lives in an OCI image layout directory:
//!
//! ```text
//! <root>/oci-layout          {"imageLayoutVersion":"1.0.0"}
//! <root>/blobs/sha256/<hex>  one file per blob, named by its content digest
//! <root>/refs/<name>         JSON-encoded descriptor per named reference
//! ```
//!
//! Blobs are immutable: writes stream through a temporary file in the blobs
//! directory while hashing, then rename to the digest name. Writing a blob
//! that already exists is a no-op. References are replaced atomically the
//! same way.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use oci_spec::image::{
    Descriptor, Digest, ImageConfiguration, ImageManifest, MediaType, OciLayout, OciLayoutBuilder,
};
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::digest::{sha256_digest, sha256_hex};
use crate::error::{Error, Result};

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = "1.0.0";
const BLOB_DIR: &str = "blobs/sha256";
const REF_DIR: &str = "refs";

/// A handle on an image store rooted at a layout directory.
#[derive(Debug)]
pub struct Cas {
    root: PathBuf,
}

/// A blob parsed according to its descriptor's media type.
pub enum Blob {
    Manifest(ImageManifest),
    Config(ImageConfiguration),
    /// Raw (compressed) layer bytes, digest-verified on open.
    Layer(File),
}

impl Cas {
    /// Open an existing store, validating the layout.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let corrupt = |reason: String| Error::CorruptLayout {
            path: root.clone(),
            reason,
        };

        let layout_file = File::open(root.join(LAYOUT_FILE))
            .map_err(|e| corrupt(format!("cannot open {LAYOUT_FILE}: {e}")))?;
        let layout: OciLayout = serde_json::from_reader(BufReader::new(layout_file))
            .map_err(|e| corrupt(format!("cannot parse {LAYOUT_FILE}: {e}")))?;
        if layout.image_layout_version() != LAYOUT_VERSION {
            return Err(corrupt(format!(
                "unsupported layout version {:?}",
                layout.image_layout_version()
            )));
        }
        if !root.join(BLOB_DIR).is_dir() {
            return Err(corrupt(format!("missing {BLOB_DIR} directory")));
        }

        Ok(Self { root })
    }

    /// Initialize a fresh layout and open it.
    ///
    /// The target directory is created if necessary but must not already
    /// contain a layout.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        if root.join(LAYOUT_FILE).exists() {
            return Err(Error::InvalidImage(format!(
                "{} already contains an image layout",
                root.display()
            )));
        }

        let layout = OciLayoutBuilder::default()
            .image_layout_version(LAYOUT_VERSION.to_string())
            .build()?;
        fs::write(root.join(LAYOUT_FILE), serde_json::to_vec(&layout)?)?;
        fs::create_dir_all(root.join(BLOB_DIR))?;
        fs::create_dir_all(root.join(REF_DIR))?;

        debug!("created image layout at {}", root.display());
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> Result<PathBuf> {
        Ok(self.root.join(BLOB_DIR).join(sha256_hex(digest)?))
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf> {
        // a reference is a single file name under refs/
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
        {
            return Err(Error::InvalidReference(name.to_string()));
        }
        Ok(self.root.join(REF_DIR).join(name))
    }

    /// Begin streaming a new blob into the store.
    pub fn blob_writer(&self) -> Result<BlobWriter> {
        BlobWriter::new(self.root.join(BLOB_DIR))
    }

    /// Store an entire stream as a blob, returning its digest and size.
    pub fn put_blob(&self, mut reader: impl Read) -> Result<(Digest, u64)> {
        let mut writer = self.blob_writer()?;
        std::io::copy(&mut reader, &mut writer)?;
        writer.complete()
    }

    /// Store a JSON document as a blob.
    ///
    /// Serialization goes through the typed `oci-spec`/serde structs, so the
    /// encoding is canonical: UTF-8, no insignificant whitespace, fields in
    /// data-model order.
    pub fn put_blob_json<T: serde::Serialize>(&self, value: &T) -> Result<(Digest, u64)> {
        let encoded = serde_json::to_vec(value)?;
        self.put_blob(encoded.as_slice())
    }

    /// Open a blob for reading, verifying its content against the digest.
    pub fn get_blob(&self, digest: &Digest) -> Result<File> {
        let path = self.blob_path(digest)?;
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("blob {digest}")),
            _ => Error::Io(e),
        })?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let found = hex::encode(hasher.finalize());
        if found != sha256_hex(digest)? {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                found: format!("sha256:{found}"),
            });
        }

        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Read and parse a blob according to its descriptor's media type.
    ///
    /// Image indexes (manifest lists) and any other media type outside
    /// manifest/config/layer are rejected with `UnsupportedMediaType`.
    pub fn read_blob(&self, descriptor: &Descriptor) -> Result<Blob> {
        let reader = self.get_blob(descriptor.digest())?;
        match descriptor.media_type() {
            MediaType::ImageManifest => Ok(Blob::Manifest(ImageManifest::from_reader(
                BufReader::new(reader),
            )?)),
            MediaType::ImageConfig => Ok(Blob::Config(ImageConfiguration::from_reader(
                BufReader::new(reader),
            )?)),
            MediaType::ImageLayerGzip => Ok(Blob::Layer(reader)),
            other => Err(Error::UnsupportedMediaType(other.clone())),
        }
    }

    /// Read a blob that must be an image manifest.
    pub fn read_manifest(&self, descriptor: &Descriptor) -> Result<ImageManifest> {
        match self.read_blob(descriptor)? {
            Blob::Manifest(manifest) => Ok(manifest),
            _ => Err(Error::UnsupportedMediaType(descriptor.media_type().clone())),
        }
    }

    /// Read a blob that must be an image configuration.
    pub fn read_config(&self, descriptor: &Descriptor) -> Result<ImageConfiguration> {
        match self.read_blob(descriptor)? {
            Blob::Config(config) => Ok(config),
            _ => Err(Error::UnsupportedMediaType(descriptor.media_type().clone())),
        }
    }

    /// Resolve a reference name to its descriptor.
    pub fn get_reference(&self, name: &str) -> Result<Descriptor> {
        let file = File::open(self.ref_path(name)?).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("reference {name:?}")),
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Bind a reference name to a descriptor, replacing any previous binding.
    pub fn put_reference(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let path = self.ref_path(name)?;
        fs::create_dir_all(self.root.join(REF_DIR))?;
        let mut tmp = NamedTempFile::new_in(self.root.join(REF_DIR))?;
        serde_json::to_writer(&mut tmp, descriptor)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!("bound reference {name:?} to {}", descriptor.digest());
        Ok(())
    }

    /// Drop a reference name.
    pub fn delete_reference(&self, name: &str) -> Result<()> {
        fs::remove_file(self.ref_path(name)?).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("reference {name:?}")),
            _ => Error::Io(e),
        })
    }

    /// All blob digests in the store, sorted.
    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in fs::read_dir(self.root.join(BLOB_DIR))? {
            let name = entry?.file_name();
            let hex = name.to_string_lossy();
            digests.push(sha256_digest(&hex)?);
        }
        digests.sort_by_key(|d| d.to_string());
        Ok(digests)
    }

    /// All reference names, sorted.
    pub fn list_references(&self) -> Result<Vec<String>> {
        let dir = match fs::read_dir(self.root.join(REF_DIR)) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = dir
            .map(|res| res.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        Ok(names)
    }
}

/// A streaming writer for one new blob.
///
/// Bytes are hashed as they are written to a temporary file inside the blobs
/// directory; [`BlobWriter::complete`] renames it to its digest name. If the
/// writer is dropped instead, or any step fails, the temporary file is
/// removed.
pub struct BlobWriter {
    blobs_dir: PathBuf,
    tmp: Option<NamedTempFile>,
    hasher: Sha256,
    size: u64,
    poisoned: bool,
}

impl BlobWriter {
    fn new(blobs_dir: PathBuf) -> Result<Self> {
        let tmp = NamedTempFile::new_in(&blobs_dir)?;
        Ok(Self {
            blobs_dir,
            tmp: Some(tmp),
            hasher: Sha256::new(),
            size: 0,
            poisoned: false,
        })
    }

    /// Finish the blob: flush, then move it to its digest name.
    ///
    /// Storing bytes that are already present leaves the existing blob
    /// untouched and discards the temporary file.
    pub fn complete(mut self) -> Result<(Digest, u64)> {
        if self.poisoned {
            return Err(Error::Cancelled);
        }
        let mut tmp = self.tmp.take().expect("writer already completed");
        tmp.flush()?;

        let hex = hex::encode(std::mem::take(&mut self.hasher).finalize());
        let target = self.blobs_dir.join(&hex);
        if !target.exists() {
            tmp.persist(&target).map_err(|e| Error::Io(e.error))?;
        }
        debug!("stored blob sha256:{hex} ({} bytes)", self.size);
        Ok((sha256_digest(&hex)?, self.size))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let tmp = self.tmp.as_mut().expect("writer already completed");
        match tmp.write(buf) {
            Ok(n) => {
                self.hasher.update(&buf[..n]);
                self.size += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.tmp.as_mut().expect("writer already completed").flush()
    }
}
