//! SHA-256 digest plumbing.
//!
//! Every blob in the store is addressed by `sha256:<hex>`. This module
//! provides construction and parsing helpers on top of the `oci-spec` digest
//! types, plus reader/writer adapters that hash a stream as it passes
//! through, so digests are always computed in the same pass as the I/O.

use std::io::{Read, Write};
use std::str::FromStr;

use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType, Sha256Digest};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Build a `sha256:<hex>` digest from a lowercase hex string.
pub fn sha256_digest(hex: &str) -> Result<Digest> {
    Sha256Digest::from_str(hex)
        .map(Digest::from)
        .map_err(|e| Error::MalformedDigest {
            digest: format!("sha256:{hex}"),
            reason: e.to_string(),
        })
}

/// Return the hex part of a digest, requiring the sha256 algorithm.
pub fn sha256_hex(digest: &Digest) -> Result<String> {
    let repr = digest.to_string();
    match repr.strip_prefix("sha256:") {
        Some(hex) => Ok(hex.to_string()),
        None => Err(Error::MalformedDigest {
            digest: repr,
            reason: "unsupported digest algorithm".into(),
        }),
    }
}

/// Build a descriptor for a blob already in the store.
pub fn new_descriptor(media_type: MediaType, digest: Digest, size: u64) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(media_type)
        .digest(digest)
        .size(size)
        .build()?)
}

/// A writer that hashes everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consume the writer, returning the inner writer and the hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that hashes everything read through it.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consume the reader, returning the hex digest of the bytes read so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    // sha256 of the empty string
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_digest_roundtrip() {
        let digest = sha256_digest(EMPTY).unwrap();
        assert_eq!(digest.to_string(), format!("sha256:{EMPTY}"));
        assert_eq!(sha256_hex(&digest).unwrap(), EMPTY);
    }

    #[test]
    fn test_sha256_digest_rejects_garbage() {
        assert!(sha256_digest("").is_err());
        assert!(sha256_digest("xyz").is_err());
        // truncated
        assert!(sha256_digest(&EMPTY[1..]).is_err());
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"").unwrap();
        let (_, hex) = HashingWriter::new(Vec::new()).finish();
        assert_eq!(hex, EMPTY);

        w.write_all(b"hello").unwrap();
        let (buf, hex) = w.finish();
        assert_eq!(buf, b"hello");
        assert_eq!(
            hex,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hashing_reader() {
        let mut r = HashingReader::new(b"hello" as &[u8]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(
            r.finish(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
