//! Auxiliary cache for derived build artifacts.
//!
//! Unlike the blob store this is not content-addressed: entries live under
//! `cache/blobs/<key>` where the key is whatever string the caller chose
//! (typically describing the artifact and the inputs it was derived from).
//! Keys are percent-encoded so path separators and percent signs are safe.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;

/// Caller-keyed store for derived artifacts.
#[derive(Debug)]
pub struct DerivedCache {
    dir: PathBuf,
}

impl DerivedCache {
    pub(crate) fn open(cache_root: &Path) -> Result<Self> {
        let dir = cache_root.join("cache").join("blobs");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The on-disk path an entry would live at.
    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }

    /// Fetch an entry, or `None` if the key has never been stored.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Store an entry, replacing any previous value for the key.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        debug!("storing derived artifact {key}");
        let path = self.path(key);
        let tmp = self.dir.join(format!(".tmp-{}", encode_key(key)));
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Drop an entry. Succeeds if it was already gone.
    pub fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Percent-encode a key for filesystem storage. `%` first so encoded
/// sequences are never double-decoded.
fn encode_key(key: &str) -> String {
    key.replace('%', "%25").replace('/', "%2F")
}
