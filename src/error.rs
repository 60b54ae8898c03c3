//! Error types for the ocipack library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, Error>`. The CLI layers operation context on top with `anyhow`;
//! the variants here carry the path/digest/name the failure is about.

use std::path::PathBuf;

use oci_spec::image::MediaType;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for image store and bundle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The on-disk layout is not a readable OCI image layout v1.0.0.
    #[error("corrupt image layout at {}: {reason}", .path.display())]
    CorruptLayout { path: PathBuf, reason: String },

    /// A blob, reference, or file was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Content does not hash to its claimed digest.
    #[error("digest mismatch: expected {expected}, found {found}")]
    DigestMismatch { expected: String, found: String },

    /// A descriptor points at a media type this tool does not handle,
    /// notably image indexes (manifest lists).
    #[error("unsupported media type {0}")]
    UnsupportedMediaType(MediaType),

    /// A JSON document failed to parse.
    #[error("malformed JSON document: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// An OCI document failed to parse or build.
    #[error("malformed OCI document: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// A digest string is not `sha256:<hex>`.
    #[error("malformed digest {digest:?}: {reason}")]
    MalformedDigest { digest: String, reason: String },

    /// A UID/GID mapping string is not `container:host:length`.
    #[error("malformed ID mapping {0:?} (expected container:host:length)")]
    MalformedMapping(String),

    /// The persisted metadata manifest failed to parse.
    #[error("malformed metadata manifest at line {line}: {reason}")]
    MalformedManifestFile { line: usize, reason: String },

    /// The bundle has no metadata manifest for the source image.
    #[error("no metadata manifest for this image in bundle ({})", .0.display())]
    MissingBundleState(PathBuf),

    /// A reference name that cannot live under `refs/`.
    #[error("invalid reference name {0:?}")]
    InvalidReference(String),

    /// The image graph violates an invariant (e.g. layer/diff-ID count skew).
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// An underlying filesystem or stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A writer was completed after its sink chain had already failed.
    #[error("operation cancelled")]
    Cancelled,
}
