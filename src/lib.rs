//! ocipack manipulates OCI container images at rest.
//!
//! An image lives in an OCI image layout directory: a content-addressable
//! store of JSON documents (manifests, configurations) and `tar+gzip` layer
//! blobs, plus named references. This crate creates such images, unpacks a
//! named image into a runtime bundle (a rootfs plus a runtime
//! configuration), and repacks a modified bundle back into the image as a
//! new layer, keeping the manifest, configuration, and reference graph
//! consistent.
//!
//! The library emits `tracing` events but installs no subscriber; without
//! one the events are dropped. The `ocipack` binary wires up a formatter
//! driven by `RUST_LOG`.

pub mod cas;
pub mod digest;
pub mod error;
pub mod idmap;
pub mod image;
pub mod layer;
pub mod mtree;
pub mod repack;
pub mod runtime;
pub mod unpack;

pub use error::{Error, Result};

/// The rootfs directory inside a bundle.
pub const ROOTFS_NAME: &str = "rootfs";

/// Prefix marking a deleted path in a layer archive.
pub(crate) const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker clearing the contents of its directory in a layer archive.
pub(crate) const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
