//! Push reconciliation against a remote registry.
//!
//! The registry transport is an external collaborator: callers hand in
//! anything implementing [`Registry`] (manifest get/put by reference plus
//! tag listing) and this module decides what to upload. Network errors pass
//! through unchanged; retry policy belongs to the caller.

use std::collections::HashSet;

use log::{debug, info, warn};
use oci_spec::image::{Digest, ImageIndex, MediaType};

use crate::cache::{Cache, Resolved};
use crate::descriptor::{entry_kind, is_index_media_type, EntryKind};
use crate::error::{Error, Result};
use crate::merge::{append_index, clean_dangling_references};

/// A manifest document as served by a registry.
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    pub media_type: MediaType,
    pub digest: Digest,
    pub bytes: Vec<u8>,
}

/// Minimal registry transport: manifests by reference, plus tag listing.
///
/// Implementations own authentication and the wire protocol; neither is
/// modeled here.
pub trait Registry {
    /// Fetch whatever the registry serves at `reference`, or `None` if the
    /// reference does not exist.
    fn get_manifest(&self, reference: &str) -> Result<Option<RemoteManifest>>;

    /// Store a manifest document at `reference`.
    fn put_manifest(
        &mut self,
        reference: &str,
        media_type: &MediaType,
        bytes: &[u8],
    ) -> Result<()>;

    /// List the tags of a repository.
    fn list_tags(&self, repository: &str) -> Result<Vec<String>>;
}

/// Push a cached name to a registry reference.
///
/// An image is uploaded only if the registry does not already serve the
/// identical digest. An index is first merged with whatever index the
/// registry already holds (local entries win, dangling attestations are
/// pruned), then uploaded, and each complete per-platform child is
/// additionally tagged `<reference>-<arch>` for direct pulls; children that
/// fail local validation are treated as never built for that platform and
/// skipped.
pub fn push(
    cache: &Cache,
    registry: &mut dyn Registry,
    name: &str,
    remote_name: Option<&str>,
) -> Result<()> {
    let remote_name = remote_name.unwrap_or(name);
    info!("pushing {name} to {remote_name}");

    match cache.resolve(name)? {
        Resolved::Image { descriptor, .. } => {
            if let Some(remote) = registry.get_manifest(remote_name)? {
                if remote.digest == *descriptor.digest() {
                    info!("{remote_name} already on registry with identical digest, skipping");
                    return Ok(());
                }
            }
            let bytes = cache.blobs().read(descriptor.digest())?;
            registry.put_manifest(remote_name, descriptor.media_type(), &bytes)?;
            info!("pushed image {remote_name}");
            Ok(())
        }
        Resolved::Index {
            descriptor,
            mut index,
        } => {
            let remote = registry.get_manifest(remote_name)?;
            if let Some(remote) = &remote {
                if remote.digest == *descriptor.digest() {
                    info!("{remote_name} already on registry with identical digest, skipping");
                    return Ok(());
                }
            }

            match remote {
                Some(remote) if is_index_media_type(&remote.media_type) => {
                    let remote_index = ImageIndex::from_reader(&remote.bytes[..])
                        .map_err(Error::registry)?;
                    append_index(&mut index, &remote_index)?;
                }
                Some(remote) => {
                    debug!(
                        "{remote_name} currently serves {} rather than an index, replacing",
                        remote.media_type
                    );
                }
                None => debug!("{remote_name} not yet on registry"),
            }
            clean_dangling_references(&mut index)?;

            let bytes = index.to_string()?.into_bytes();
            registry.put_manifest(remote_name, &MediaType::ImageIndex, &bytes)?;
            info!("pushed index {remote_name}");

            push_arch_tags(cache, registry, name, remote_name, &index)?;
            check_stale_arch_tags(registry, remote_name, &index);
            Ok(())
        }
    }
}

/// Tag each per-platform child of an index for direct pull access.
fn push_arch_tags(
    cache: &Cache,
    registry: &mut dyn Registry,
    name: &str,
    remote_name: &str,
    index: &ImageIndex,
) -> Result<()> {
    for child in index.manifests() {
        let EntryKind::Platform(platform) = entry_kind(child)? else {
            continue;
        };
        let arch = platform.architecture().to_string();
        let arch_tag = format!("{remote_name}-{arch}");
        if let Err(err) = cache.validate_manifest_blobs(name, child.digest()) {
            // never built for this platform locally
            debug!("skipping arch tag {arch_tag}: {err}");
            continue;
        }
        let bytes = cache.blobs().read(child.digest())?;
        registry.put_manifest(&arch_tag, child.media_type(), &bytes)?;
        debug!("tagged {arch_tag}");
    }
    Ok(())
}

/// Warn about arch tags on the registry that the pushed index does not
/// represent, e.g. leftovers from a push of a since-dropped platform.
fn check_stale_arch_tags(registry: &dyn Registry, remote_name: &str, index: &ImageIndex) {
    let (repository, tag) = split_reference(remote_name);
    let tags = match registry.list_tags(repository) {
        Ok(tags) => tags,
        Err(err) => {
            debug!("could not list tags of {repository}: {err}");
            return;
        }
    };
    let pushed: HashSet<String> = index
        .manifests()
        .iter()
        .map(|child| child.digest().to_string())
        .collect();
    let prefix = format!("{tag}-");
    for other in tags.iter().filter(|t| t.starts_with(&prefix)) {
        let reference = format!("{repository}:{other}");
        match registry.get_manifest(&reference) {
            Ok(Some(remote)) if !pushed.contains(&remote.digest.to_string()) => {
                warn!("registry tag {reference} is not represented in the pushed index");
            }
            Ok(_) => {}
            Err(err) => debug!("could not inspect {reference}: {err}"),
        }
    }
}

/// Split a reference into repository and tag, defaulting the tag to
/// "latest". The last colon counts only if it comes after the last slash
/// (registries may carry a port).
fn split_reference(reference: &str) -> (&str, &str) {
    let slash = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[slash..].rfind(':') {
        Some(colon) => (
            &reference[..slash + colon],
            &reference[slash + colon + 1..],
        ),
        None => (reference, "latest"),
    }
}
