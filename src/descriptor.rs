//! Typed views over OCI descriptors.
//!
//! The cache persists only standard OCI descriptor fields plus three
//! annotations: the human-readable name of a root entry, and the buildkit
//! attestation linkage on index children. In memory those annotations are
//! surfaced as [`EntryKind`] so call sites match on a sum type instead of
//! poking at string maps.

use std::collections::HashMap;

use oci_spec::image::{Descriptor, Digest, MediaType, Platform};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Annotation carrying the human-readable name of a root index entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation on an attestation child naming the manifest it attests to.
pub const ANNOTATION_REFERENCE_DIGEST: &str = "vnd.docker.reference.digest";

/// Annotation marking a child as an attestation rather than a platform image.
pub const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";

/// The `vnd.docker.reference.type` value used for attestation manifests.
pub const ATTESTATION_MANIFEST: &str = "attestation-manifest";

/// OS/architecture value buildkit uses on attestation children.
pub const UNKNOWN: &str = "unknown";

const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// What a child descriptor of a multi-platform index represents.
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// A platform-specific image manifest.
    Platform(Platform),
    /// An attestation manifest; the digest is the manifest it attests to.
    Attestation(Digest),
    /// Anything else (no platform, or an unknown platform without an
    /// attestation annotation). Left untouched by merge and cleanup.
    Untyped,
}

/// Classify an index child.
///
/// Fails with `InvalidDigest` when the child looks like an attestation but
/// its `vnd.docker.reference.digest` value does not parse.
pub fn entry_kind(desc: &Descriptor) -> Result<EntryKind> {
    match desc.platform() {
        Some(platform) if !is_unknown_platform(platform) => {
            if platform.architecture().to_string().is_empty() {
                return Ok(EntryKind::Untyped);
            }
            Ok(EntryKind::Platform(platform.clone()))
        }
        Some(_) => match annotation(desc, ANNOTATION_REFERENCE_DIGEST) {
            Some(value) if !value.is_empty() => Ok(EntryKind::Attestation(parse_digest(value)?)),
            _ => Ok(EntryKind::Untyped),
        },
        None => Ok(EntryKind::Untyped),
    }
}

/// Look up a single annotation value on a descriptor.
pub fn annotation<'a>(desc: &'a Descriptor, key: &str) -> Option<&'a str> {
    desc.annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// The name a root descriptor answers to, if any.
pub fn ref_name(desc: &Descriptor) -> Option<&str> {
    annotation(desc, ANNOTATION_REF_NAME)
}

/// Return a copy of `desc` with the ref-name annotation set to `name`,
/// replacing any previous value.
pub fn with_ref_name(desc: &Descriptor, name: &str) -> Descriptor {
    let mut desc = desc.clone();
    let mut annotations = desc.annotations().clone().unwrap_or_default();
    annotations.insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
    desc.set_annotations(Some(annotations));
    desc
}

/// Annotation map for an attestation child pointing at `target`.
pub fn attestation_annotations(target: &Digest) -> HashMap<String, String> {
    HashMap::from([
        (
            ANNOTATION_REFERENCE_DIGEST.to_string(),
            target.to_string(),
        ),
        (
            ANNOTATION_REFERENCE_TYPE.to_string(),
            ATTESTATION_MANIFEST.to_string(),
        ),
    ])
}

/// Both OS and architecture are "unknown", the platform buildkit puts on
/// attestation manifests.
pub fn is_unknown_platform(platform: &Platform) -> bool {
    platform.os().to_string() == UNKNOWN && platform.architecture().to_string() == UNKNOWN
}

/// Platform equality for lookup purposes: OS and architecture only.
///
/// Variant is deliberately ignored so that e.g. an index entry for
/// `linux/arm64/v8` matches a request for plain `linux/arm64`.
pub fn matches_os_arch(platform: &Platform, wanted: &Platform) -> bool {
    platform.os() == wanted.os() && platform.architecture() == wanted.architecture()
}

/// Dedup key used when merging indexes: OS, architecture and variant.
pub fn platform_key(platform: &Platform) -> String {
    format!(
        "{}/{}/{}",
        platform.os(),
        platform.architecture(),
        platform.variant().as_deref().unwrap_or_default()
    )
}

/// True if the media type names a multi-platform index.
pub fn is_index_media_type(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

/// True if the media type names a single-image manifest.
pub fn is_manifest_media_type(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageManifest => true,
        MediaType::Other(other) => other == DOCKER_MANIFEST,
        _ => false,
    }
}

/// Parse a `sha256:...` string, mapping failure to `InvalidDigest`.
pub fn parse_digest(value: &str) -> Result<Digest> {
    value.parse().map_err(|_| Error::InvalidDigest {
        value: value.to_string(),
    })
}

/// Compute the canonical `sha256:<hex>` digest string of a blob.
pub fn sha256_string(data: &[u8]) -> String {
    let mut context = Sha256::new();
    context.update(data);
    format!("sha256:{}", hex::encode(context.finalize()))
}

/// Compute the sha256 digest of a blob as a typed [`Digest`].
pub fn sha256_digest(data: &[u8]) -> Digest {
    sha256_string(data)
        .parse()
        .expect("a formatted sha256 digest always parses")
}
