//! Import and export of the portable OCI image-layout tar stream.
//!
//! The export stream is consumed by `docker load`-compatible tooling and has
//! a fixed entry order: the `oci-layout` marker, the `blobs/` and
//! `blobs/sha256/` directories, one entry per blob, and a trailing
//! `index.json` whose single descriptor carries the exported name. Import is
//! the inverse: blobs are written if absent (verified against their
//! filename digest), everything else except `index.json` is ignored, and the
//! final descriptor goes through the atomic-replace write path.

use std::collections::HashSet;
use std::io::{Read, Write};

use log::debug;
use oci_spec::image::{
    Descriptor, Digest, ImageIndex, ImageIndexBuilder, MediaType, OciLayoutBuilder,
};
use tar::{Archive, Builder, EntryType, Header};

use crate::cache::{Cache, Resolved};
use crate::descriptor::{entry_kind, parse_digest, ref_name, with_ref_name, EntryKind};
use crate::error::{Error, Result};

/// Export a named image or index as an OCI image-layout tar stream.
///
/// The exported descriptor is annotated with `override_name` when given,
/// otherwise with the cache name. For an index, platform children must be
/// complete locally; attestation children with missing blobs are skipped.
pub fn export_ref(
    cache: &Cache,
    name: &str,
    override_name: Option<&str>,
    writer: impl Write,
) -> Result<()> {
    let resolved = cache.resolve(name)?;
    let save_name = override_name.unwrap_or(name);
    debug!("exporting {name} as {save_name}");

    let mut builder = Builder::new(writer);

    let layout = OciLayoutBuilder::default()
        .image_layout_version("1.0.0".to_string())
        .build()?;
    append_file(&mut builder, "oci-layout", layout.to_string()?.as_bytes())?;
    append_dir(&mut builder, "blobs/")?;
    append_dir(&mut builder, "blobs/sha256/")?;

    let mut written: HashSet<String> = HashSet::new();
    match &resolved {
        Resolved::Image {
            descriptor,
            manifest,
        } => {
            append_blob(cache, &mut builder, manifest.config().digest(), &mut written)?;
            for layer in manifest.layers() {
                append_blob(cache, &mut builder, layer.digest(), &mut written)?;
            }
            append_blob(cache, &mut builder, descriptor.digest(), &mut written)?;
        }
        Resolved::Index { descriptor, index } => {
            for child in index.manifests() {
                let strict = matches!(entry_kind(child)?, EntryKind::Platform(_));
                match export_child(cache, &mut builder, child, &mut written) {
                    Ok(()) => {}
                    Err(err) if !strict => {
                        debug!("skipping index child {}: {err}", child.digest());
                    }
                    Err(err) => return Err(err),
                }
            }
            append_blob(cache, &mut builder, descriptor.digest(), &mut written)?;
        }
    }

    let exported = with_ref_name(resolved.descriptor(), save_name);
    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![exported])
        .build()?;
    append_file(&mut builder, "index.json", index.to_string_pretty()?.as_bytes())?;
    builder.finish()?;
    Ok(())
}

/// Import an OCI image-layout tar stream into the cache.
///
/// The stream's `index.json` must describe exactly one image. The imported
/// name is `override_name` when given, otherwise the descriptor's own
/// `ref.name` annotation; having neither is an error. Returns the inserted
/// root descriptor.
pub fn import_archive(
    cache: &Cache,
    reader: impl Read,
    override_name: Option<&str>,
) -> Result<Descriptor> {
    let mut archive = Archive::new(reader);
    let mut index_data: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == EntryType::Directory {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        match path.as_str() {
            "index.json" => {
                let mut data = vec![];
                entry.read_to_end(&mut data)?;
                index_data = Some(data);
            }
            "manifest.json" | "oci-layout" => {
                debug!("ignoring {path}");
            }
            _ if path.starts_with("blobs/sha256/") => {
                let parts: Vec<&str> = path.split('/').collect();
                if parts.len() != 3 {
                    debug!("ignoring {path}");
                    continue;
                }
                let digest = parse_digest(&format!("{}:{}", parts[1], parts[2]))?;
                debug!("writing {path} as blob {digest}");
                cache.blobs().write_verified(&digest, &mut entry)?;
            }
            _ => {
                debug!("ignoring {path}");
            }
        }
    }

    let Some(data) = index_data else {
        return Err(Error::InvalidArchive {
            reason: "no index.json in archive".to_string(),
        });
    };
    let index = ImageIndex::from_reader(&data[..]).map_err(|err| Error::InvalidArchive {
        reason: format!("index.json does not parse: {err}"),
    })?;
    // A multi-image archive gives us no way to know which entry the single
    // name we have should be attached to.
    if index.manifests().len() != 1 {
        return Err(Error::InvalidArchive {
            reason: format!(
                "expected exactly one image in archive, found {}",
                index.manifests().len()
            ),
        });
    }
    let descriptor = index.manifests()[0].clone();
    let name = match override_name {
        Some(name) => name.to_string(),
        None => ref_name(&descriptor)
            .ok_or(Error::MissingName)?
            .to_string(),
    };
    cache.write_descriptor(&name, &descriptor)
}

fn export_child(
    cache: &Cache,
    builder: &mut Builder<impl Write>,
    child: &Descriptor,
    written: &mut HashSet<String>,
) -> Result<()> {
    let manifest = cache.child_manifest(child.digest())?;
    append_blob(cache, builder, manifest.config().digest(), written)?;
    for layer in manifest.layers() {
        append_blob(cache, builder, layer.digest(), written)?;
    }
    append_blob(cache, builder, child.digest(), written)
}

fn append_blob(
    cache: &Cache,
    builder: &mut Builder<impl Write>,
    digest: &Digest,
    written: &mut HashSet<String>,
) -> Result<()> {
    if !written.insert(digest.to_string()) {
        return Ok(());
    }
    let size = cache.blobs().size(digest)?;
    let blob = cache.blobs().reader(digest)?;
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(size);
    builder.append_data(&mut header, format!("blobs/sha256/{}", digest.digest()), blob)?;
    Ok(())
}

fn append_file(builder: &mut Builder<impl Write>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn append_dir(builder: &mut Builder<impl Write>, path: &str) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    builder.append_data(&mut header, path, std::io::empty())?;
    Ok(())
}
