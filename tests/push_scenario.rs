//! End-to-end push reconciliation against a registry that already holds an
//! overlapping index: local platforms win, remote-only attestations survive
//! only when their target does.

use std::collections::BTreeMap;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, ImageManifestBuilder,
    MediaType, PlatformBuilder,
};

use bootcache::descriptor::{attestation_annotations, sha256_digest, UNKNOWN};
use bootcache::push::{Registry, RemoteManifest};
use bootcache::{Cache, Resolved, Result};

/// In-memory registry: reference → manifest document.
#[derive(Default)]
struct MemoryRegistry {
    manifests: BTreeMap<String, RemoteManifest>,
}

impl Registry for MemoryRegistry {
    fn get_manifest(&self, reference: &str) -> Result<Option<RemoteManifest>> {
        Ok(self.manifests.get(reference).cloned())
    }

    fn put_manifest(
        &mut self,
        reference: &str,
        media_type: &MediaType,
        bytes: &[u8],
    ) -> Result<()> {
        self.manifests.insert(
            reference.to_string(),
            RemoteManifest {
                media_type: media_type.clone(),
                digest: sha256_digest(bytes),
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let prefix = format!("{repository}:");
        Ok(self
            .manifests
            .keys()
            .filter_map(|r| r.strip_prefix(&prefix))
            .map(String::from)
            .collect())
    }
}

/// Store a complete image (config, one layer, manifest) under a name and
/// return its root descriptor.
fn store_image(cache: &Cache, name: &str, arch: &str, layer: &[u8]) -> Descriptor {
    let config_data = format!("{{\"architecture\":\"{arch}\",\"os\":\"linux\"}}").into_bytes();
    let config_digest = cache.blobs().write(&config_data).unwrap();
    let layer_digest = cache.blobs().write(layer).unwrap();

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageConfig)
                .digest(config_digest)
                .size(config_data.len() as u64)
                .build()
                .unwrap(),
        )
        .layers(vec![DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(layer_digest)
            .size(layer.len() as u64)
            .build()
            .unwrap()])
        .build()
        .unwrap();
    let bytes = manifest.to_string().unwrap().into_bytes();
    let digest = cache.blobs().write(&bytes).unwrap();

    let descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(digest)
        .size(bytes.len() as u64)
        .platform(
            PlatformBuilder::default()
                .os("linux")
                .architecture(arch)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    cache.write_descriptor(name, &descriptor).unwrap()
}

fn attestation_child(payload: &[u8], target: &Digest) -> Descriptor {
    DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(sha256_digest(payload))
        .size(payload.len() as u64)
        .platform(
            PlatformBuilder::default()
                .os(UNKNOWN)
                .architecture(UNKNOWN)
                .build()
                .unwrap(),
        )
        .annotations(attestation_annotations(target))
        .build()
        .unwrap()
}

#[test]
fn test_push_reconciliation_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();
    let mut registry = MemoryRegistry::default();

    // a single-platform image under its own name
    let foo = store_image(&cache, "foo:1", "amd64", b"foo rootfs layer");

    // a two-platform index, both children fully cached
    let amd64 = store_image(&cache, "bar:1-amd64-build", "amd64", b"bar amd64 layer");
    let arm64 = store_image(&cache, "bar:1-arm64-build", "arm64", b"bar arm64 layer");
    cache
        .write_index("bar:1", &[amd64.clone(), arm64.clone()])
        .unwrap();

    // the registry already holds bar:1 with only the arm64 child, a valid
    // attestation on it, and a dangling attestation on a digest that no
    // longer exists anywhere
    let surviving_attestation = attestation_child(b"arm64 sbom", arm64.digest());
    let dangling_attestation =
        attestation_child(b"orphaned sbom", &sha256_digest(b"a manifest long since replaced"));
    let remote_index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![
            arm64.clone(),
            surviving_attestation.clone(),
            dangling_attestation.clone(),
        ])
        .build()
        .unwrap();
    registry
        .put_manifest(
            "bar:1",
            &MediaType::ImageIndex,
            remote_index.to_string().unwrap().as_bytes(),
        )
        .unwrap();

    bootcache::push(&cache, &mut registry, "foo:1", None).unwrap();
    bootcache::push(&cache, &mut registry, "bar:1", None).unwrap();

    // the image went up as-is
    let remote_foo = registry.manifests.get("foo:1").unwrap();
    assert_eq!(remote_foo.digest, *foo.digest());

    // the pushed index has both platform children and exactly one
    // surviving attestation
    let remote_bar = registry.manifests.get("bar:1").unwrap();
    let pushed = ImageIndex::from_reader(&remote_bar.bytes[..]).unwrap();
    let digests: Vec<String> = pushed
        .manifests()
        .iter()
        .map(|child| child.digest().to_string())
        .collect();
    assert_eq!(pushed.manifests().len(), 3, "children: {digests:?}");
    assert!(digests.contains(&amd64.digest().to_string()));
    assert!(digests.contains(&arm64.digest().to_string()));
    assert!(digests.contains(&surviving_attestation.digest().to_string()));
    assert!(!digests.contains(&dangling_attestation.digest().to_string()));

    // both platforms were complete locally, so both got arch tags
    assert!(registry.manifests.contains_key("bar:1-amd64"));
    assert!(registry.manifests.contains_key("bar:1-arm64"));

    // pushing again converges: the merged result carries the same children
    bootcache::push(&cache, &mut registry, "bar:1", None).unwrap();
    let remote_bar = registry.manifests.get("bar:1").unwrap();
    let repushed = ImageIndex::from_reader(&remote_bar.bytes[..]).unwrap();
    let mut repushed_digests: Vec<String> = repushed
        .manifests()
        .iter()
        .map(|child| child.digest().to_string())
        .collect();
    let mut first_digests = digests.clone();
    repushed_digests.sort();
    first_digests.sort();
    assert_eq!(repushed_digests, first_digests);
}

#[test]
fn test_remove_then_resolve_round() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    store_image(&cache, "gone:1", "amd64", b"doomed layer");
    assert!(matches!(
        cache.resolve("gone:1").unwrap(),
        Resolved::Image { .. }
    ));

    cache.remove("gone:1").unwrap();
    assert!(cache.find_descriptor("gone:1").unwrap().is_none());
    cache.remove("gone:1").unwrap();
}
