//! Content-addressed blob storage.
//!
//! Blobs live under `blobs/sha256/<hex>`, one file per blob, named by the
//! hex digest of their contents. Writes are if-absent: two processes racing
//! to store the same digest produce byte-identical files, so the store needs
//! no locking of its own. Deletion tolerates already-missing blobs.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};

use crate::descriptor::{parse_digest, sha256_digest};
use crate::error::{Error, Result};

/// Directory-backed content-addressed store keyed by sha256 digest.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub(crate) fn open(cache_root: &Path) -> Result<Self> {
        let dir = cache_root.join("blobs").join("sha256");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.digest())
    }

    /// True if a blob with this digest is present.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.path_for(digest).is_file()
    }

    /// Read a blob into memory.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.path_for(digest)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobMissing {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a blob for streaming reads.
    pub fn reader(&self, digest: &Digest) -> Result<File> {
        match File::open(self.path_for(digest)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobMissing {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Size in bytes of a stored blob.
    pub fn size(&self, digest: &Digest) -> Result<u64> {
        match fs::metadata(self.path_for(digest)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobMissing {
                digest: digest.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Store a blob, returning its digest. A no-op if already present.
    pub fn write(&self, data: &[u8]) -> Result<Digest> {
        let digest = sha256_digest(data);
        let path = self.path_for(&digest);
        if path.is_file() {
            debug!("blob {digest} already in cache");
            return Ok(digest);
        }
        self.commit(&path, |file| file.write_all(data))?;
        Ok(digest)
    }

    /// Store a blob from a reader under a caller-claimed digest.
    ///
    /// The content is hashed while it is copied; a mismatch against the
    /// claimed digest fails with `DigestMismatch` and stores nothing.
    pub fn write_verified(&self, digest: &Digest, reader: &mut impl Read) -> Result<()> {
        let path = self.path_for(digest);
        if path.is_file() {
            debug!("blob {digest} already in cache");
            return Ok(());
        }

        // per-process temp name: concurrent writers of the same digest must
        // not share a file, and whichever rename lands last wins with
        // identical bytes
        let tmp = self
            .dir
            .join(format!(".tmp-{}-{}", std::process::id(), digest.digest()));
        let result = (|| -> Result<()> {
            let mut file = File::create(&tmp)?;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n])?;
            }
            let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
            if computed != digest.to_string() {
                return Err(Error::DigestMismatch {
                    digest: digest.to_string(),
                    computed,
                });
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                fs::rename(&tmp, &path)?;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }

    /// Remove a blob. Succeeds if it was already gone.
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.path_for(digest)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Enumerate every stored digest.
    pub fn digests(&self) -> Result<Vec<Digest>> {
        let mut digests = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(hex) = name.to_str() else {
                continue;
            };
            if hex.starts_with('.') {
                // leftover temp file from an interrupted write
                continue;
            }
            digests.push(parse_digest(&format!("sha256:{hex}"))?);
        }
        Ok(digests)
    }

    fn commit(&self, path: &Path, write: impl FnOnce(&mut File) -> std::io::Result<()>) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        let tmp = self
            .dir
            .join(format!(".tmp-{}-{file_name}", std::process::id()));
        let mut file = File::create(&tmp)?;
        match write(&mut file) {
            Ok(()) => {
                drop(file);
                fs::rename(&tmp, path)?;
                Ok(())
            }
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, store) = store();
        let digest = store.write(b"some layer bytes").unwrap();
        assert!(store.contains(&digest));
        assert_eq!(store.read(&digest).unwrap(), b"some layer bytes");
        assert_eq!(store.size(&digest).unwrap(), 16);
    }

    #[test]
    fn test_write_is_idempotent() {
        let (_dir, store) = store();
        let first = store.write(b"dedup me").unwrap();
        let second = store.write(b"dedup me").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.digests().unwrap().len(), 1);
    }

    #[test]
    fn test_write_verified_rejects_mismatch() {
        let (_dir, store) = store();
        let claimed = sha256_digest(b"what the caller promised");
        let result = store.write_verified(&claimed, &mut &b"something else"[..]);
        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
        assert!(!store.contains(&claimed));
    }

    #[test]
    fn test_delete_tolerates_absence() {
        let (_dir, store) = store();
        let digest = store.write(b"doomed").unwrap();
        store.delete(&digest).unwrap();
        assert!(!store.contains(&digest));
        store.delete(&digest).unwrap();
    }

    #[test]
    fn test_missing_blob_error() {
        let (_dir, store) = store();
        let digest = sha256_digest(b"never stored");
        assert!(matches!(
            store.read(&digest),
            Err(Error::BlobMissing { .. })
        ));
    }
}
