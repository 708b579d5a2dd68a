//! Local cache of OCI images and multi-platform indexes, used as the
//! staging store when building bootable OS images from containers.
//!
//! The cache sits between a remote registry and a build pipeline: images are
//! inserted (pulled, loaded from a tar stream, or built), the build reads
//! their config and filesystem, and a publish step pushes a consolidated
//! multi-platform index back out.
//!
//! # Cache layout
//!
//! ```text
//! cache-root/
//! ├── index.json            # root index: name → descriptor, sole source of truth
//! ├── oci-layout            # {"imageLayoutVersion":"1.0.0"}
//! ├── blobs/sha256/<hex>    # content-addressed blobs, one file per digest
//! └── cache/blobs/<key>     # derived artifacts, keyed by caller-chosen strings
//! ```
//!
//! # Names and garbage collection
//!
//! Every named entry is a descriptor in `index.json` carrying the
//! `org.opencontainers.image.ref.name` annotation; inserting a name
//! atomically replaces any previous entry. Removing a name deletes the
//! blobs it owns transitively, except those still reachable from another
//! name. There is no reference counting; reachability is recomputed at
//! deletion time. [`Cache::prune`] drops blobs no name reaches at all.
//!
//! # Concurrency
//!
//! The cache directory is shared between separate process invocations.
//! Opening a [`Cache`] takes a shared `flock` on the directory; every
//! root-index mutation upgrades to an exclusive lock for its
//! read-modify-write. Blob writes are content-addressed and if-absent, so
//! they need no locking.

pub mod blob;
pub mod cache;
pub mod derived;
pub mod descriptor;
pub mod error;
pub mod gc;
pub mod index;
pub mod layout;
pub mod merge;
pub mod push;

pub use cache::{image_for_platform, Cache, Resolved};
pub use error::{Error, Result};
pub use gc::PruneResult;
pub use layout::{export_ref, import_archive};
pub use merge::{append_index, clean_dangling_references};
pub use push::{push, Registry, RemoteManifest};
