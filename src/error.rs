//! Error taxonomy for cache operations.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by cache operations.
///
/// `NotFound` is recoverable (the GC path treats it as "already absent");
/// `InvalidCache`, `Ambiguous` and `MultiplePlatformMatches` indicate a
/// corrupt cache and are fatal. Registry errors pass through unchanged so
/// the caller can decide on retry policy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no image named {name:?} in cache")]
    NotFound { name: String },

    #[error("invalid image cache: {reason}")]
    InvalidCache { reason: String },

    #[error("multiple cache entries named {name:?}")]
    Ambiguous { name: String },

    #[error("no manifest for platform {platform} in index for {name:?}")]
    NoMatchingPlatform { name: String, platform: String },

    #[error("multiple manifests for platform {platform} in index for {name:?}")]
    MultiplePlatformMatches { name: String, platform: String },

    #[error("invalid content digest {value:?}")]
    InvalidDigest { value: String },

    #[error("blob {digest} content does not match its digest (computed {computed})")]
    DigestMismatch { digest: String, computed: String },

    #[error("blob {digest} not present in cache")]
    BlobMissing { digest: String },

    #[error("cannot write descriptor without a name")]
    MissingName,

    #[error("cannot create an index without any manifests")]
    EmptyIndex,

    #[error("image named {name:?} already exists in cache and is not an index")]
    NotAnIndex { name: String },

    #[error("unsupported archive: {reason}")]
    InvalidArchive { reason: String },

    #[error("image {name:?} is incomplete: {reason}")]
    IncompleteImage { name: String, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Spec(#[from] oci_spec::OciSpecError),

    #[error("registry operation failed")]
    Registry(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a transport-level error for propagation to the caller.
    pub fn registry(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Registry(Box::new(err))
    }
}
