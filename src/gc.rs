//! Garbage collection: removing names and pruning unreferenced blobs.
//!
//! There is no reference counting. `remove` computes the transitive blob set
//! of the entry being removed, then subtracts everything still reachable
//! from the remaining names, so blobs shared between entries (base-image
//! layers, mostly) survive. Deletion failures are warnings: the goal is
//! "ensure absent", and a blob that is already gone is not a problem.

use std::collections::HashSet;

use log::{debug, warn};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};

use crate::cache::Cache;
use crate::descriptor::parse_digest;
use crate::error::Result;
use crate::index::replace_entry;

/// Statistics from a prune operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Number of unreferenced blobs removed.
    pub blobs_removed: u64,
    /// Total bytes of blob data removed.
    pub blobs_bytes: u64,
}

impl Cache {
    /// Ensure that `name` is absent from the cache.
    ///
    /// A no-op (and a success) if the name does not exist. Otherwise the
    /// entry's blobs (layers, config, manifest, and for an index every
    /// child manifest's blobs plus the index blob itself) are deleted,
    /// except those still reachable from another name, and the descriptor
    /// is removed from the root index.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let mut index = self.read_index()?;

        let (doomed_entries, remaining): (Vec<Descriptor>, Vec<Descriptor>) = index
            .manifests()
            .iter()
            .cloned()
            .partition(|desc| crate::descriptor::ref_name(desc) == Some(name));
        if doomed_entries.is_empty() {
            debug!("remove {name}: not in cache, nothing to do");
            return Ok(());
        }

        let mut doomed = HashSet::new();
        for entry in &doomed_entries {
            doomed.extend(self.reachable_blobs(entry));
        }
        let mut retained = HashSet::new();
        for entry in &remaining {
            retained.extend(self.reachable_blobs(entry));
        }

        for digest in &doomed {
            if retained.contains(digest) {
                debug!("keeping blob {digest}: still referenced by another name");
                continue;
            }
            match parse_digest(digest).and_then(|d| self.blobs.delete(&d)) {
                Ok(()) => debug!("deleted blob {digest}"),
                Err(err) => warn!("could not delete blob {digest}: {err}"),
            }
        }

        replace_entry(&mut index, name, None);
        self.persist_index(&index)?;
        Ok(())
    }

    /// Delete every blob not reachable from any named entry.
    ///
    /// Picks up debris left by crashed imports or by older removals.
    pub fn prune(&self) -> Result<PruneResult> {
        let _lock = self.lock_exclusive()?;
        let index = self.read_index()?;

        let mut live = HashSet::new();
        for entry in index.manifests() {
            live.extend(self.reachable_blobs(entry));
        }

        let mut result = PruneResult::default();
        for digest in self.blobs.digests()? {
            if live.contains(&digest.to_string()) {
                continue;
            }
            let size = self.blobs.size(&digest).unwrap_or(0);
            match self.blobs.delete(&digest) {
                Ok(()) => {
                    debug!("pruned blob {digest}");
                    result.blobs_removed += 1;
                    result.blobs_bytes += size;
                }
                Err(err) => warn!("could not prune blob {digest}: {err}"),
            }
        }
        Ok(result)
    }

    /// The transitive blob set owned by a root descriptor, as digest
    /// strings.
    ///
    /// Blobs that are missing or unparsable are skipped with a warning; an
    /// entry may legitimately be partial (e.g. an index pulled for one
    /// architecture).
    fn reachable_blobs(&self, descriptor: &Descriptor) -> HashSet<String> {
        let mut blobs = HashSet::new();
        blobs.insert(descriptor.digest().to_string());

        let data = match self.blobs.read(descriptor.digest()) {
            Ok(data) => data,
            Err(err) => {
                warn!("blob {} unreadable: {err}", descriptor.digest());
                return blobs;
            }
        };

        if let Ok(index) = ImageIndex::from_reader(&data[..]) {
            for child in index.manifests() {
                blobs.insert(child.digest().to_string());
                match self.blobs.read(child.digest()) {
                    Ok(child_data) => match ImageManifest::from_reader(&child_data[..]) {
                        Ok(manifest) => collect_manifest_blobs(&manifest, &mut blobs),
                        Err(err) => {
                            warn!("child manifest {} does not parse: {err}", child.digest())
                        }
                    },
                    Err(err) => {
                        debug!("child manifest {} not cached: {err}", child.digest());
                    }
                }
            }
        } else if let Ok(manifest) = ImageManifest::from_reader(&data[..]) {
            collect_manifest_blobs(&manifest, &mut blobs);
        } else {
            warn!(
                "blob {} is neither an image manifest nor an index",
                descriptor.digest()
            );
        }
        blobs
    }
}

fn collect_manifest_blobs(manifest: &ImageManifest, blobs: &mut HashSet<String>) {
    blobs.insert(manifest.config().digest().to_string());
    for layer in manifest.layers() {
        blobs.insert(layer.digest().to_string());
    }
}
