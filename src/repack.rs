//! Repacking a modified bundle into its image as a new layer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use oci_spec::image::{Descriptor, MediaType};
use tar::Builder;
use tracing::{debug, info};

use crate::cas::Cas;
use crate::digest::new_descriptor;
use crate::error::{Error, Result};
use crate::idmap::MapOptions;
use crate::image::{append_layer, replace_reference};
use crate::layer::{append_deltas, GzipLayerWriter};
use crate::mtree::{self, hierarchy_file_name, DirectoryHierarchy};
use crate::ROOTFS_NAME;

/// Repack the bundle against the image `from` points at.
///
/// The delta between the bundle's recorded state and its current rootfs
/// becomes one new `tar+gzip` layer; the configuration gains its diff-ID,
/// the manifest gains its descriptor and points at the new configuration,
/// and `tag` (if given) is rebound to the new manifest. The blob writes are
/// strictly ordered: layer, then config, then manifest, then reference.
///
/// Returns the new manifest descriptor.
pub fn repack_bundle(
    cas: &Cas,
    from: &str,
    bundle: &Path,
    tag: Option<&str>,
    options: &MapOptions,
) -> Result<Descriptor> {
    let descriptor = cas.get_reference(from)?;
    if *descriptor.media_type() != MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(descriptor.media_type().clone()));
    }

    // the bundle state is keyed by the digest of the manifest it was
    // unpacked from
    let state_path = bundle.join(hierarchy_file_name(descriptor.digest()));
    let state_file = File::open(&state_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::MissingBundleState(state_path.clone()),
        _ => Error::Io(e),
    })?;
    let recorded = DirectoryHierarchy::from_reader(BufReader::new(state_file))?;
    let selection = recorded.used_keywords();

    let rootfs = bundle.join(ROOTFS_NAME);
    let current = mtree::walk(&rootfs, &selection, options.rootless)?;
    let deltas = mtree::compare(&recorded, &current, &selection);
    debug!(
        "bundle {} has {} changed inodes",
        bundle.display(),
        deltas.len()
    );

    let mut builder = Builder::new(GzipLayerWriter::new(cas)?);
    append_deltas(&mut builder, &rootfs, &deltas, options)?;
    let layer = builder.into_inner()?.complete()?;

    let mut manifest = cas.read_manifest(&descriptor)?;
    let mut config = cas.read_config(manifest.config())?;
    append_layer(&mut manifest, &mut config, &layer);

    let (config_digest, config_size) = cas.put_blob_json(&config)?;
    manifest.set_config(new_descriptor(
        MediaType::ImageConfig,
        config_digest,
        config_size,
    )?);
    let (manifest_digest, manifest_size) = cas.put_blob_json(&manifest)?;
    let repacked = new_descriptor(MediaType::ImageManifest, manifest_digest, manifest_size)?;

    info!(
        "repacked {from:?} as {} (layer {})",
        repacked.digest(),
        layer.descriptor.digest()
    );

    if let Some(tag) = tag {
        replace_reference(cas, tag, &repacked)?;
    }
    Ok(repacked)
}
