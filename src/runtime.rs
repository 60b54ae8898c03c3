//! Minimal OCI runtime-spec configuration for unpacked bundles.
//!
//! Only the fields a runtime needs to start the container are emitted:
//! process (user, args, env, cwd) and root. The document is derived from the
//! image configuration at unpack time and written to `<bundle>/config.json`.

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const RUNTIME_SPEC_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub process: Process,
    pub root: Root,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    /// Always serialized; `null` means "no supplementary groups requested".
    pub additional_gids: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

impl RuntimeSpec {
    /// Derive a runtime configuration from an image configuration.
    pub fn from_image_config(config: &ImageConfiguration, rootfs: &str) -> Result<Self> {
        let inner = config.config().as_ref();

        let (uid, gid) = inner
            .and_then(|c| c.user().as_deref())
            .map(parse_user)
            .unwrap_or((0, 0));

        let mut args = Vec::new();
        if let Some(entrypoint) = inner.and_then(|c| c.entrypoint().as_ref()) {
            args.extend(entrypoint.iter().cloned());
        }
        if let Some(cmd) = inner.and_then(|c| c.cmd().as_ref()) {
            args.extend(cmd.iter().cloned());
        }
        if args.is_empty() {
            args.push("sh".to_string());
        }

        let env = inner
            .and_then(|c| c.env().as_ref())
            .cloned()
            .unwrap_or_default();

        let cwd = inner
            .and_then(|c| c.working_dir().as_deref())
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/")
            .to_string();

        Ok(Self {
            oci_version: RUNTIME_SPEC_VERSION.to_string(),
            process: Process {
                terminal: false,
                user: User {
                    uid,
                    gid,
                    additional_gids: None,
                },
                args,
                env,
                cwd,
            },
            root: Root {
                path: rootfs.to_string(),
                readonly: false,
            },
            hostname: None,
        })
    }
}

/// Parse an image-config `user` value of the form `uid[:gid]`.
///
/// Name-based users would need the bundle's `/etc/passwd`; they fall back to
/// root, as does an empty value.
fn parse_user(user: &str) -> (u32, u32) {
    let (uid_part, gid_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    let uid = uid_part.parse().unwrap_or_else(|_| {
        if !uid_part.is_empty() {
            debug!("cannot resolve user {user:?} numerically, defaulting to uid 0");
        }
        0
    });
    let gid = gid_part.and_then(|g| g.parse().ok()).unwrap_or(0);
    (uid, gid)
}
