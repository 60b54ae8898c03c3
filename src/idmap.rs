//! UID/GID mappings between the container and host namespaces.
//!
//! Mappings use the `container:host:length` form shared with the runtime's
//! `/proc/pid/uid_map`: the interval `[host, host+length)` on the host
//! corresponds to `[container, container+length)` in the container. IDs that
//! fall outside every mapping translate to themselves.

use rustix::process::{getegid, geteuid};
use tracing::info;

use crate::error::{Error, Result};

/// A single `container:host:length` interval mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container: u32,
    pub host: u32,
    pub length: u32,
}

impl IdMapping {
    /// Parse a `container:host:length` triple.
    ///
    /// All three fields are decimal integers with no surrounding whitespace
    /// and the length must be at least 1.
    pub fn parse(s: &str) -> Result<Self> {
        fn field(part: Option<&str>) -> Option<u32> {
            part.filter(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|f| f.parse().ok())
        }

        let mut fields = s.split(':');
        let container = field(fields.next());
        let host = field(fields.next());
        let length = field(fields.next());
        let trailing = fields.next();

        match (container, host, length, trailing) {
            (Some(container), Some(host), Some(length), None) if length > 0 => Ok(Self {
                container,
                host,
                length,
            }),
            _ => Err(Error::MalformedMapping(s.to_string())),
        }
    }
}

/// Translate a host ID into the container namespace.
///
/// The first mapping whose host interval contains `id` wins; an unmapped ID
/// is returned unchanged.
pub fn to_container(id: u32, mappings: &[IdMapping]) -> u32 {
    for m in mappings {
        if id >= m.host && id - m.host < m.length {
            return m.container + (id - m.host);
        }
    }
    id
}

/// Translate a container ID into the host namespace.
pub fn to_host(id: u32, mappings: &[IdMapping]) -> u32 {
    for m in mappings {
        if id >= m.container && id - m.container < m.length {
            return m.host + (id - m.container);
        }
    }
    id
}

/// ID translation options for unpack and repack.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    pub rootless: bool,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

impl MapOptions {
    /// Fill in the default rootless mappings for unprivileged use.
    ///
    /// When rootless and no explicit mappings were given, the only mappable
    /// user is the current one: `euid:0:1` and `egid:0:1` are synthesized.
    pub fn with_rootless_defaults(mut self) -> Self {
        if !self.rootless {
            return self;
        }
        if self.uid_mappings.is_empty() {
            let euid = geteuid().as_raw();
            info!("setting default rootless uid mapping {euid}:0:1");
            self.uid_mappings.push(IdMapping {
                container: euid,
                host: 0,
                length: 1,
            });
        }
        if self.gid_mappings.is_empty() {
            let egid = getegid().as_raw();
            info!("setting default rootless gid mapping {egid}:0:1");
            self.gid_mappings.push(IdMapping {
                container: egid,
                host: 0,
                length: 1,
            });
        }
        self
    }
}
