//! Root index persistence and the descriptor write path.
//!
//! `index.json` is the single source of truth for which names exist and what
//! they point to. Two invariants hold at all times:
//!
//! - at most one descriptor per `ref.name` value: inserting a name is an
//!   atomic remove-all-then-append, never an additive union;
//! - every mutation happens under an exclusive `flock` on the cache
//!   directory for the full read-modify-write, so a concurrent reader never
//!   observes zero or two descriptors for a name.
//!
//! The file itself is replaced by writing a temp file and renaming over it.

use std::collections::HashMap;
use std::fs::{self, File};

use log::debug;
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType};
use rustix::fs::{flock, FlockOperation};

use crate::cache::Cache;
use crate::descriptor::{
    is_index_media_type, platform_key, ref_name, with_ref_name, ANNOTATION_REF_NAME,
};
use crate::error::{Error, Result};

/// Scoped exclusive lock on the cache directory.
///
/// Acquired for the duration of a root-index read-modify-write; dropping the
/// guard downgrades back to the shared lock held since [`Cache::open`].
pub struct IndexLock<'a> {
    dirfd: &'a File,
}

impl Drop for IndexLock<'_> {
    fn drop(&mut self) {
        flock(self.dirfd, FlockOperation::LockShared).expect("cache lock downgrade failed");
    }
}

pub(crate) fn empty_index() -> Result<ImageIndex> {
    Ok(ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![])
        .build()?)
}

impl Cache {
    /// Take the exclusive lock for a root-index mutation.
    pub(crate) fn lock_exclusive(&self) -> Result<IndexLock<'_>> {
        flock(&self.dirfd, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;
        Ok(IndexLock { dirfd: &self.dirfd })
    }

    /// Load the root index. A missing file reads as an empty index; an
    /// unparsable one is cache corruption.
    pub(crate) fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join("index.json");
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return empty_index(),
            Err(err) => return Err(err.into()),
        };
        ImageIndex::from_reader(file).map_err(|err| Error::InvalidCache {
            reason: format!("index.json does not parse: {err}"),
        })
    }

    /// Persist the root index. Caller must hold the exclusive lock.
    pub(crate) fn persist_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.root.join("index.json");
        let tmp = self.root.join("index.json.tmp");
        fs::write(&tmp, index.to_string_pretty()?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The root descriptor for a name, without resolving its referent.
    ///
    /// Finding more than one entry for the name means the replace invariant
    /// has been violated and the cache is corrupt.
    pub fn find_descriptor(&self, name: &str) -> Result<Option<Descriptor>> {
        let index = self.read_index()?;
        let mut matches = index
            .manifests()
            .iter()
            .filter(|desc| ref_name(desc) == Some(name));
        match (matches.next(), matches.next()) {
            (Some(desc), None) => Ok(Some(desc.clone())),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(Error::Ambiguous {
                name: name.to_string(),
            }),
        }
    }

    /// Insert or replace the descriptor for a name.
    ///
    /// Stamps the `ref.name` annotation, removes every existing entry for
    /// the name, appends the new one, and persists, all under the
    /// exclusive lock. Returns the stamped descriptor.
    pub fn write_descriptor(&self, name: &str, descriptor: &Descriptor) -> Result<Descriptor> {
        if name.is_empty() {
            return Err(Error::MissingName);
        }
        let stamped = with_ref_name(descriptor, name);
        debug!("writing descriptor for {name}");

        let _lock = self.lock_exclusive()?;
        let mut index = self.read_index()?;
        replace_entry(&mut index, name, Some(stamped.clone()));
        self.persist_index(&index)?;
        Ok(stamped)
    }

    /// Create or update the multi-platform index for a name from built
    /// per-platform descriptors.
    ///
    /// Does not pull anything; the descriptors' manifests are assumed to be
    /// present already. If the name already refers to an index, matching
    /// platform entries (by OS/architecture/variant) are replaced, the rest
    /// are kept, and the superseded index blob is deleted. The new index
    /// blob is written to the blob store and the root descriptor replaced
    /// atomically.
    pub fn write_index(&self, name: &str, descriptors: &[Descriptor]) -> Result<Descriptor> {
        if name.is_empty() {
            return Err(Error::MissingName);
        }
        if descriptors.is_empty() {
            return Err(Error::EmptyIndex);
        }
        debug!("writing an index for {name}");

        let _lock = self.lock_exclusive()?;
        let mut root = self.read_index()?;

        let existing = root
            .manifests()
            .iter()
            .find(|desc| ref_name(desc) == Some(name))
            .cloned();

        let children = match &existing {
            Some(previous) => {
                if !is_index_media_type(previous.media_type()) {
                    return Err(Error::NotAnIndex {
                        name: name.to_string(),
                    });
                }
                let data = self.blobs.read(previous.digest())?;
                let old =
                    ImageIndex::from_reader(&data[..]).map_err(|err| Error::InvalidCache {
                        reason: format!("index blob {} does not parse: {err}", previous.digest()),
                    })?;

                // replace per platform key, keep everything else
                let mut replacements: HashMap<String, &Descriptor> = descriptors
                    .iter()
                    .filter_map(|desc| desc.platform().as_ref().map(|p| (platform_key(p), desc)))
                    .collect();
                let mut children: Vec<Descriptor> = vec![];
                for child in old.manifests() {
                    let replaced = child
                        .platform()
                        .as_ref()
                        .and_then(|p| replacements.remove(&platform_key(p)));
                    children.push(replaced.unwrap_or(child).clone());
                }
                for desc in descriptors {
                    let pending = desc
                        .platform()
                        .as_ref()
                        .is_none_or(|p| replacements.remove(&platform_key(p)).is_some());
                    if pending {
                        children.push(desc.clone());
                    }
                }

                // the superseded index blob has no other owner
                self.blobs.delete(previous.digest())?;
                children
            }
            None => descriptors.to_vec(),
        };

        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(children)
            .build()?;
        let bytes = index.to_string()?.into_bytes();
        let digest = self.blobs.write(&bytes)?;

        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(digest)
            .size(bytes.len() as u64)
            .annotations(HashMap::from([(
                ANNOTATION_REF_NAME.to_string(),
                name.to_string(),
            )]))
            .build()?;

        replace_entry(&mut root, name, Some(descriptor.clone()));
        self.persist_index(&root)?;
        Ok(descriptor)
    }
}

/// Remove every entry named `name`, then append `replacement` if given.
pub(crate) fn replace_entry(index: &mut ImageIndex, name: &str, replacement: Option<Descriptor>) {
    let mut manifests: Vec<Descriptor> = index
        .manifests()
        .iter()
        .filter(|desc| ref_name(desc) != Some(name))
        .cloned()
        .collect();
    manifests.extend(replacement);
    index.set_manifests(manifests);
}

#[cfg(test)]
mod test {
    use oci_spec::image::{MediaType, PlatformBuilder};

    use crate::descriptor::sha256_digest;

    use super::*;

    fn cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn manifest_descriptor(payload: &[u8]) -> Descriptor {
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(sha256_digest(payload))
            .size(payload.len() as u64)
            .build()
            .unwrap()
    }

    fn platform_descriptor(payload: &[u8], arch: &str) -> Descriptor {
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(sha256_digest(payload))
            .size(payload.len() as u64)
            .platform(
                PlatformBuilder::default()
                    .os("linux")
                    .architecture(arch)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_write_descriptor_requires_name() {
        let (_dir, cache) = cache();
        let desc = manifest_descriptor(b"m1");
        assert!(matches!(
            cache.write_descriptor("", &desc),
            Err(Error::MissingName)
        ));
    }

    #[test]
    fn test_write_descriptor_stamps_name() {
        let (_dir, cache) = cache();
        let written = cache
            .write_descriptor("foo:1", &manifest_descriptor(b"m1"))
            .unwrap();
        assert_eq!(ref_name(&written), Some("foo:1"));
        let found = cache.find_descriptor("foo:1").unwrap().unwrap();
        assert_eq!(found.digest(), written.digest());
    }

    #[test]
    fn test_replace_invariant() {
        let (_dir, cache) = cache();
        let first = manifest_descriptor(b"first manifest");
        let second = manifest_descriptor(b"second manifest");
        cache.write_descriptor("foo:1", &first).unwrap();
        cache.write_descriptor("foo:1", &second).unwrap();

        // exactly the replacement, never both, never neither
        let entries = cache.list().unwrap();
        let matching: Vec<_> = entries.iter().filter(|(n, _)| n == "foo:1").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(*matching[0].1.digest(), sha256_digest(b"second manifest"));
    }

    #[test]
    fn test_replace_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(dir.path()).unwrap();
            cache
                .write_descriptor("bar:2", &manifest_descriptor(b"persisted"))
                .unwrap();
        }
        let cache = Cache::open(dir.path()).unwrap();
        let found = cache.find_descriptor("bar:2").unwrap().unwrap();
        assert_eq!(*found.digest(), sha256_digest(b"persisted"));
    }

    #[test]
    fn test_write_index_requires_manifests() {
        let (_dir, cache) = cache();
        assert!(matches!(
            cache.write_index("idx:1", &[]),
            Err(Error::EmptyIndex)
        ));
    }

    #[test]
    fn test_write_index_rejects_image_entry() {
        let (_dir, cache) = cache();
        let image = manifest_descriptor(b"an image manifest");
        cache.blobs().write(b"an image manifest").unwrap();
        cache.write_descriptor("foo:1", &image).unwrap();
        assert!(matches!(
            cache.write_index("foo:1", &[platform_descriptor(b"child", "amd64")]),
            Err(Error::NotAnIndex { .. })
        ));
    }

    #[test]
    fn test_write_index_replaces_platform_entries() {
        let (_dir, cache) = cache();
        let amd64_v1 = platform_descriptor(b"amd64 manifest v1", "amd64");
        let arm64 = platform_descriptor(b"arm64 manifest", "arm64");
        cache.write_index("idx:1", &[amd64_v1, arm64]).unwrap();

        let amd64_v2 = platform_descriptor(b"amd64 manifest v2", "amd64");
        cache.write_index("idx:1", &[amd64_v2]).unwrap();

        let resolved = cache.resolve("idx:1").unwrap();
        let crate::cache::Resolved::Index { index, .. } = resolved else {
            panic!("expected an index");
        };
        assert_eq!(index.manifests().len(), 2);
        let digests: Vec<String> = index
            .manifests()
            .iter()
            .map(|d| d.digest().to_string())
            .collect();
        assert!(digests.contains(&sha256_digest(b"amd64 manifest v2").to_string()));
        assert!(digests.contains(&sha256_digest(b"arm64 manifest").to_string()));
        assert!(!digests.contains(&sha256_digest(b"amd64 manifest v1").to_string()));
    }

    #[test]
    fn test_write_index_deletes_superseded_index_blob() {
        let (_dir, cache) = cache();
        let first = cache
            .write_index("idx:1", &[platform_descriptor(b"amd64 m", "amd64")])
            .unwrap();
        assert!(cache.blobs().contains(first.digest()));
        let second = cache
            .write_index("idx:1", &[platform_descriptor(b"arm64 m", "arm64")])
            .unwrap();
        assert!(!cache.blobs().contains(first.digest()));
        assert!(cache.blobs().contains(second.digest()));
    }
}
