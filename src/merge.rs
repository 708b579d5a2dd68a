//! Index reconciliation for pushes.
//!
//! When a locally-assembled multi-platform index is pushed to a registry
//! that already holds an index for the same name (built by a different run,
//! possibly for different platforms), the two are merged so that remote-only
//! platforms survive without duplicating anything. Attestation manifests are
//! only carried along when the manifest they point at is present in the
//! merged result; anything else would be a dangling reference.

use std::collections::HashSet;

use log::debug;
use oci_spec::image::ImageIndex;

use crate::descriptor::{entry_kind, platform_key, EntryKind};
use crate::error::Result;

/// Merge `secondary` into `primary`, with `primary` winning conflicts.
///
/// Platform-bearing children of `secondary` are appended unless their
/// platform (OS/architecture/variant) or digest is already covered.
/// Attestation children of `secondary` are appended only when their target
/// manifest survives in the merged result; dangling ones are dropped. When
/// `secondary` already contains every child of `primary` by digest, the
/// result is simply `secondary`.
pub fn append_index(primary: &mut ImageIndex, secondary: &ImageIndex) -> Result<()> {
    if index_superset(primary, secondary) {
        debug!("secondary index is a superset, taking it wholesale");
        *primary = secondary.clone();
        return Ok(());
    }

    let mut digest_seen: HashSet<String> = HashSet::new();
    let mut platform_seen: HashSet<String> = HashSet::new();
    for child in primary.manifests() {
        digest_seen.insert(child.digest().to_string());
        if let EntryKind::Platform(platform) = entry_kind(child)? {
            platform_seen.insert(platform_key(&platform));
        }
    }

    let mut merged = primary.manifests().clone();

    for child in secondary.manifests() {
        let EntryKind::Platform(platform) = entry_kind(child)? else {
            // attestations are handled in the second pass
            continue;
        };
        let key = platform_key(&platform);
        if platform_seen.contains(&key) {
            // primary wins
            continue;
        }
        if digest_seen.contains(&child.digest().to_string()) {
            continue;
        }
        debug!("merging remote-only platform {key}");
        platform_seen.insert(key);
        digest_seen.insert(child.digest().to_string());
        merged.push(child.clone());
    }

    // Attestations from secondary stay valid only if their target made it
    // into the merged set, either just now or because primary had it.
    for child in secondary.manifests() {
        let EntryKind::Attestation(target) = entry_kind(child)? else {
            continue;
        };
        if digest_seen.contains(&child.digest().to_string()) {
            continue;
        }
        if !digest_seen.contains(&target.to_string()) {
            debug!(
                "dropping attestation {} whose target {target} did not survive the merge",
                child.digest()
            );
            continue;
        }
        digest_seen.insert(child.digest().to_string());
        merged.push(child.clone());
    }

    primary.set_manifests(merged);
    Ok(())
}

/// Remove attestation children whose target manifest is no longer in the
/// index.
///
/// This happens when a platform image is replaced and its old attestation is
/// left behind. Only fully-unknown-platform children carrying a non-empty
/// `vnd.docker.reference.digest` annotation are judged; everything else is
/// left untouched.
pub fn clean_dangling_references(index: &mut ImageIndex) -> Result<()> {
    let mut valid: HashSet<String> = HashSet::new();
    for child in index.manifests() {
        if let EntryKind::Platform(_) = entry_kind(child)? {
            valid.insert(child.digest().to_string());
        }
    }

    let mut doomed: HashSet<String> = HashSet::new();
    for child in index.manifests() {
        if let EntryKind::Attestation(target) = entry_kind(child)? {
            if !valid.contains(&target.to_string()) {
                debug!(
                    "removing dangling attestation {} (target {target} is gone)",
                    child.digest()
                );
                doomed.insert(child.digest().to_string());
            }
        }
    }

    if doomed.is_empty() {
        return Ok(());
    }
    let manifests = index
        .manifests()
        .iter()
        .filter(|child| !doomed.contains(&child.digest().to_string()))
        .cloned()
        .collect();
    index.set_manifests(manifests);
    Ok(())
}

fn index_superset(inner: &ImageIndex, outer: &ImageIndex) -> bool {
    if inner.manifests().len() > outer.manifests().len() {
        return false;
    }
    let outer_digests: HashSet<String> = outer
        .manifests()
        .iter()
        .map(|child| child.digest().to_string())
        .collect();
    inner
        .manifests()
        .iter()
        .all(|child| outer_digests.contains(&child.digest().to_string()))
}
