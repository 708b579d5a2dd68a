//! The cache resource handle and name resolution.
//!
//! A [`Cache`] is an explicit handle on a cache directory; there is no
//! hidden singleton. Opening the cache takes a shared `flock` on the
//! directory which is held for the lifetime of the handle; mutations of the
//! root index upgrade to an exclusive lock for the duration of their
//! read-modify-write (see `index.rs`).
//!
//! # Cache layout
//!
//! ```text
//! cache-root/
//! ├── index.json            # root index: the only name → descriptor mapping
//! ├── oci-layout            # {"imageLayoutVersion":"1.0.0"}
//! ├── blobs/sha256/<hex>    # content-addressed blobs
//! └── cache/blobs/<key>     # derived artifacts, caller-keyed
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use oci_spec::image::{
    Descriptor, Digest, ImageConfiguration, ImageIndex, ImageManifest, OciLayoutBuilder, Platform,
};
use rustix::fs::{flock, FlockOperation};

use crate::blob::BlobStore;
use crate::derived::DerivedCache;
use crate::descriptor::{
    is_index_media_type, is_manifest_media_type, is_unknown_platform, matches_os_arch,
};
use crate::error::{Error, Result};

/// Handle on a cache directory.
///
/// Holds the directory open with a shared lock; dropping the handle releases
/// it. Cheap reads go straight to the blob store; every mutation of
/// `index.json` funnels through the write path in `index.rs` so locking
/// stays centralized.
#[derive(Debug)]
pub struct Cache {
    pub(crate) root: PathBuf,
    pub(crate) dirfd: File,
    pub(crate) blobs: BlobStore,
    pub(crate) derived: DerivedCache,
}

impl Drop for Cache {
    fn drop(&mut self) {
        flock(&self.dirfd, FlockOperation::Unlock).expect("cache unlock failed");
    }
}

/// What a cached name resolves to: a single-platform image or a
/// multi-platform index.
#[derive(Debug, Clone)]
pub enum Resolved {
    Image {
        descriptor: Descriptor,
        manifest: ImageManifest,
    },
    Index {
        descriptor: Descriptor,
        index: ImageIndex,
    },
}

impl Resolved {
    /// The root descriptor, whichever variant this is.
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Resolved::Image { descriptor, .. } => descriptor,
            Resolved::Index { descriptor, .. } => descriptor,
        }
    }
}

impl Cache {
    /// Open a cache directory, creating the on-disk structure if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let layout_path = root.join("oci-layout");
        if !layout_path.is_file() {
            let layout = OciLayoutBuilder::default()
                .image_layout_version("1.0.0".to_string())
                .build()?;
            fs::write(&layout_path, layout.to_string()?)?;
        }

        let blobs = BlobStore::open(&root)?;
        let derived = DerivedCache::open(&root)?;

        let dirfd = File::open(&root)?;
        flock(&dirfd, FlockOperation::LockShared).map_err(std::io::Error::from)?;

        let cache = Self {
            root,
            dirfd,
            blobs,
            derived,
        };
        if !cache.root.join("index.json").is_file() {
            let _lock = cache.lock_exclusive()?;
            cache.persist_index(&crate::index::empty_index()?)?;
        }
        Ok(cache)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The content-addressed blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// The auxiliary derived-artifact cache.
    pub fn derived(&self) -> &DerivedCache {
        &self.derived
    }

    /// Resolve a name to its image manifest or multi-platform index.
    pub fn resolve(&self, name: &str) -> Result<Resolved> {
        let descriptor = self
            .find_descriptor(name)?
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })?;
        let data = self.blobs.read(descriptor.digest())?;
        parse_root(descriptor, &data)
    }

    /// Every named entry in the root index.
    pub fn list(&self) -> Result<Vec<(String, Descriptor)>> {
        let index = self.read_index()?;
        Ok(index
            .manifests()
            .iter()
            .filter_map(|desc| {
                crate::descriptor::ref_name(desc).map(|name| (name.to_string(), desc.clone()))
            })
            .collect())
    }

    /// Read and parse the manifest blob behind an index child.
    pub fn child_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        let data = self.blobs.read(digest)?;
        ImageManifest::from_reader(&data[..]).map_err(|err| Error::InvalidCache {
            reason: format!("manifest blob {digest} does not parse: {err}"),
        })
    }

    /// The image configuration for a name, resolved to a platform when the
    /// name points at an index.
    pub fn config(&self, name: &str, platform: &Platform) -> Result<ImageConfiguration> {
        let manifest = match self.resolve(name)? {
            Resolved::Image { manifest, .. } => manifest,
            Resolved::Index { index, .. } => {
                let child = image_for_platform(&index, name, platform)?;
                self.child_manifest(child.digest())?
            }
        };
        let data = self.blobs.read(manifest.config().digest())?;
        ImageConfiguration::from_reader(&data[..]).map_err(|err| Error::InvalidCache {
            reason: format!(
                "config blob {} does not parse: {err}",
                manifest.config().digest()
            ),
        })
    }

    /// Network-free completeness check.
    ///
    /// For an image, every blob the manifest names must be present. For an
    /// index, a child must exist for each requested platform and be
    /// complete; children with a fully-unknown platform (attestations) are
    /// metadata and are checked as well.
    pub fn validate(&self, name: &str, platforms: &[Platform]) -> Result<()> {
        match self.resolve(name)? {
            Resolved::Image { descriptor, .. } => {
                if platforms.len() > 1 {
                    return Err(Error::IncompleteImage {
                        name: name.to_string(),
                        reason: format!(
                            "single-platform image cannot satisfy {} platforms",
                            platforms.len()
                        ),
                    });
                }
                self.validate_manifest_blobs(name, descriptor.digest())
            }
            Resolved::Index { index, .. } => {
                for child in index.manifests() {
                    let unknown = child
                        .platform()
                        .as_ref()
                        .is_none_or(is_unknown_platform);
                    if unknown {
                        self.validate_manifest_blobs(name, child.digest())?;
                    }
                }
                for platform in platforms {
                    let child = image_for_platform(&index, name, platform)?;
                    self.validate_manifest_blobs(name, child.digest())?;
                }
                Ok(())
            }
        }
    }

    /// Check that a manifest blob and everything it names are present.
    pub(crate) fn validate_manifest_blobs(&self, name: &str, digest: &Digest) -> Result<()> {
        let manifest = self.child_manifest(digest).map_err(|err| match err {
            Error::BlobMissing { digest } => Error::IncompleteImage {
                name: name.to_string(),
                reason: format!("manifest blob {digest} is missing"),
            },
            other => other,
        })?;
        let mut missing = vec![];
        if !self.blobs.contains(manifest.config().digest()) {
            missing.push(format!("config {}", manifest.config().digest()));
        }
        for layer in manifest.layers() {
            if !self.blobs.contains(layer.digest()) {
                missing.push(format!("layer {}", layer.digest()));
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompleteImage {
                name: name.to_string(),
                reason: format!("missing blobs: {}", missing.join(", ")),
            })
        }
    }
}

/// Find the index child matching a platform by OS and architecture.
///
/// Variant is ignored (an `arm64/v8` entry satisfies `arm64`). More than one
/// match means the index is corrupt, not that the caller should pick one.
pub fn image_for_platform<'a>(
    index: &'a ImageIndex,
    name: &str,
    platform: &Platform,
) -> Result<&'a Descriptor> {
    let mut matches = index.manifests().iter().filter(|child| {
        child
            .platform()
            .as_ref()
            .is_some_and(|p| matches_os_arch(p, platform))
    });
    let platform_label = || format!("{}/{}", platform.os(), platform.architecture());
    match (matches.next(), matches.next()) {
        (Some(child), None) => Ok(child),
        (None, _) => Err(Error::NoMatchingPlatform {
            name: name.to_string(),
            platform: platform_label(),
        }),
        (Some(_), Some(_)) => Err(Error::MultiplePlatformMatches {
            name: name.to_string(),
            platform: platform_label(),
        }),
    }
}

fn parse_root(descriptor: Descriptor, data: &[u8]) -> Result<Resolved> {
    let media_type = descriptor.media_type().clone();
    if is_index_media_type(&media_type) {
        let index = ImageIndex::from_reader(data).map_err(|err| Error::InvalidCache {
            reason: format!("index blob {} does not parse: {err}", descriptor.digest()),
        })?;
        return Ok(Resolved::Index { descriptor, index });
    }
    if is_manifest_media_type(&media_type) {
        let manifest = ImageManifest::from_reader(data).map_err(|err| Error::InvalidCache {
            reason: format!("manifest blob {} does not parse: {err}", descriptor.digest()),
        })?;
        return Ok(Resolved::Image {
            descriptor,
            manifest,
        });
    }
    // no recognizable media type on the descriptor: decide by shape
    debug!(
        "descriptor {} has media type {media_type}, probing blob shape",
        descriptor.digest()
    );
    if let Ok(index) = ImageIndex::from_reader(data) {
        return Ok(Resolved::Index { descriptor, index });
    }
    if let Ok(manifest) = ImageManifest::from_reader(data) {
        return Ok(Resolved::Image {
            descriptor,
            manifest,
        });
    }
    Err(Error::InvalidCache {
        reason: format!(
            "blob {} is neither an image manifest nor an index",
            descriptor.digest()
        ),
    })
}
