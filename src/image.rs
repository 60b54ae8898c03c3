//! Image creation and manifest/config graph mutation.

use std::path::Path;

use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, ImageConfiguration, ImageConfigurationBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, RootFsBuilder, SCHEMA_VERSION,
};
use tracing::debug;

use crate::cas::Cas;
use crate::digest::new_descriptor;
use crate::error::{Error, Result};
use crate::layer::Layer;

/// Initialize an image store, optionally seeding it with an empty image.
///
/// With a tag, the store receives an empty configuration (no layers, host
/// architecture/OS), an empty manifest pointing at it, and the named
/// reference, which is enough for `unpack` and `repack` to build on.
pub fn create_image(path: &Path, tag: Option<&str>) -> Result<Cas> {
    let cas = Cas::create(path)?;

    if let Some(tag) = tag {
        let config = ImageConfigurationBuilder::default()
            .architecture(Arch::default())
            .os(Os::default())
            .rootfs(
                RootFsBuilder::default()
                    .typ("layers")
                    .diff_ids(Vec::<String>::new())
                    .build()?,
            )
            .build()?;
        let (config_digest, config_size) = cas.put_blob_json(&config)?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(new_descriptor(
                MediaType::ImageConfig,
                config_digest,
                config_size,
            )?)
            .layers(Vec::new())
            .build()?;
        let (manifest_digest, manifest_size) = cas.put_blob_json(&manifest)?;

        cas.put_reference(
            tag,
            &new_descriptor(MediaType::ImageManifest, manifest_digest, manifest_size)?,
        )?;
        debug!("created empty image {tag:?} at {}", path.display());
    }

    Ok(cas)
}

/// Append a layer to the top of the image stack.
///
/// The manifest's layer list and the config's diff-ID list move in lockstep;
/// this is the only place either is extended.
pub fn append_layer(manifest: &mut ImageManifest, config: &mut ImageConfiguration, layer: &Layer) {
    let mut layers = manifest.layers().clone();
    layers.push(layer.descriptor.clone());
    manifest.set_layers(layers);

    let mut rootfs = config.rootfs().clone();
    let mut diff_ids = rootfs.diff_ids().clone();
    diff_ids.push(layer.diff_id.to_string());
    rootfs.set_diff_ids(diff_ids);
    config.set_rootfs(rootfs);
}

/// Point a reference at a new descriptor, clobbering any existing binding.
///
/// The old reference is deleted first; a missing old reference is fine.
pub fn replace_reference(cas: &Cas, name: &str, descriptor: &Descriptor) -> Result<()> {
    match cas.delete_reference(name) {
        Ok(()) | Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    cas.put_reference(name, descriptor)
}

/// Requested edits to an image configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigEdit {
    pub user: Option<String>,
    /// Appended to the existing environment.
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

impl ConfigEdit {
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.env.is_empty()
            && self.entrypoint.is_none()
            && self.cmd.is_none()
            && self.working_dir.is_none()
    }
}

/// Rewrite the configuration of the image `from` points at.
///
/// Writes the edited config and the manifest now pointing at it as new
/// blobs, then rebinds `tag` (defaulting to `from`) to the new manifest.
/// Layers are untouched. Returns the new manifest descriptor.
pub fn rewrite_config(
    cas: &Cas,
    from: &str,
    tag: Option<&str>,
    edit: &ConfigEdit,
) -> Result<Descriptor> {
    let descriptor = cas.get_reference(from)?;
    if *descriptor.media_type() != MediaType::ImageManifest {
        return Err(Error::UnsupportedMediaType(descriptor.media_type().clone()));
    }

    let mut manifest = cas.read_manifest(&descriptor)?;
    let mut config = cas.read_config(manifest.config())?;

    let mut inner = match config.config() {
        Some(existing) => existing.clone(),
        None => ConfigBuilder::default().build()?,
    };
    if let Some(user) = &edit.user {
        inner.set_user(Some(user.clone()));
    }
    if !edit.env.is_empty() {
        let mut env = inner.env().clone().unwrap_or_default();
        env.extend(edit.env.iter().cloned());
        inner.set_env(Some(env));
    }
    if let Some(entrypoint) = &edit.entrypoint {
        inner.set_entrypoint(Some(entrypoint.clone()));
    }
    if let Some(cmd) = &edit.cmd {
        inner.set_cmd(Some(cmd.clone()));
    }
    if let Some(working_dir) = &edit.working_dir {
        inner.set_working_dir(Some(working_dir.clone()));
    }
    config.set_config(Some(inner));

    let (config_digest, config_size) = cas.put_blob_json(&config)?;
    manifest.set_config(new_descriptor(
        MediaType::ImageConfig,
        config_digest,
        config_size,
    )?);
    let (manifest_digest, manifest_size) = cas.put_blob_json(&manifest)?;
    let rewritten = new_descriptor(MediaType::ImageManifest, manifest_digest, manifest_size)?;

    replace_reference(cas, tag.unwrap_or(from), &rewritten)?;
    Ok(rewritten)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::cas::Blob;

    #[test]
    fn test_create_image_bare() {
        let dir = tempfile::tempdir().unwrap();
        let cas = create_image(&dir.path().join("img"), None).unwrap();
        assert_eq!(cas.list_blobs().unwrap(), vec![]);
        assert_eq!(cas.list_references().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_create_image_with_tag() {
        let dir = tempfile::tempdir().unwrap();
        let cas = create_image(&dir.path().join("img"), Some("latest")).unwrap();

        let descriptor = cas.get_reference("latest").unwrap();
        assert_eq!(*descriptor.media_type(), MediaType::ImageManifest);

        let manifest = cas.read_manifest(&descriptor).unwrap();
        assert_eq!(manifest.layers().len(), 0);

        let config = cas.read_config(manifest.config()).unwrap();
        assert_eq!(config.rootfs().typ(), "layers");
        assert_eq!(config.rootfs().diff_ids().len(), 0);
    }

    #[test]
    fn test_rewrite_config() {
        let dir = tempfile::tempdir().unwrap();
        let cas = create_image(&dir.path().join("img"), Some("latest")).unwrap();
        let old = cas.get_reference("latest").unwrap();

        let edit = ConfigEdit {
            user: Some("1234:1332".into()),
            env: vec!["A=1".into()],
            ..Default::default()
        };
        let new = rewrite_config(&cas, "latest", Some("latest"), &edit).unwrap();
        assert_ne!(old.digest().to_string(), new.digest().to_string());

        let resolved = cas.get_reference("latest").unwrap();
        assert_eq!(resolved.digest().to_string(), new.digest().to_string());

        let manifest = cas.read_manifest(&resolved).unwrap();
        let config = cas.read_config(manifest.config()).unwrap();
        let inner = config.config().as_ref().unwrap();
        assert_eq!(inner.user().as_deref(), Some("1234:1332"));
        assert_eq!(inner.env().as_ref().unwrap(), &vec!["A=1".to_string()]);

        // editing again appends env rather than replacing
        let edit = ConfigEdit {
            env: vec!["B=2".into()],
            ..Default::default()
        };
        rewrite_config(&cas, "latest", None, &edit).unwrap();
        let manifest = cas
            .read_manifest(&cas.get_reference("latest").unwrap())
            .unwrap();
        let Blob::Config(config) = cas.read_blob(manifest.config()).unwrap() else {
            panic!("config descriptor must parse as a config");
        };
        assert_eq!(
            config.config().as_ref().unwrap().env().as_ref().unwrap(),
            &vec!["A=1".to_string(), "B=2".to_string()]
        );
    }
}
