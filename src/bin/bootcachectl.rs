//! Command-line control utility for bootcache image caches.
//!
//! `bootcachectl` lists and inspects cached images, removes them (with
//! garbage collection of their blobs), prunes unreferenced blobs, and
//! imports/exports OCI image-layout tar archives.

use std::fs::File;
use std::io::{stdin, stdout};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use oci_spec::image::PlatformBuilder;

use bootcache::descriptor::{entry_kind, EntryKind};
use bootcache::{export_ref, import_archive, Cache, Resolved};

/// bootcachectl
#[derive(Debug, Parser)]
#[clap(name = "bootcachectl", version)]
struct App {
    /// Operate on the cache at this directory
    #[clap(long, default_value = "~/.bootcache")]
    cache: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List all named entries in the cache
    Ls,
    /// Show what a name resolves to
    Inspect {
        /// Image or index name
        name: String,
    },
    /// Print the image configuration as JSON
    Config {
        /// Image or index name
        name: String,
        /// Platform OS to resolve an index with
        #[clap(long, default_value = "linux")]
        os: String,
        /// Platform architecture to resolve an index with
        #[clap(long, default_value = "amd64")]
        arch: String,
    },
    /// Remove a name and garbage-collect its blobs
    Rm {
        /// Image or index name
        name: String,
    },
    /// Delete every blob not reachable from a named entry
    Prune,
    /// Export a name as an OCI image-layout tar archive
    Export {
        /// Image or index name
        name: String,
        /// Name to record in the exported archive instead
        #[clap(long)]
        tag: Option<String>,
        /// Write to this file instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Import an OCI image-layout tar archive
    Import {
        /// Archive file, or "-" for stdin
        file: PathBuf,
        /// Name to store the image under, overriding the archive's
        #[clap(long)]
        name: Option<String>,
    },
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = App::parse();
    let cache = Cache::open(expand_home(&args.cache))?;

    match args.cmd {
        Command::Ls => {
            for (name, descriptor) in cache.list()? {
                println!("{name}\t{}\t{}", descriptor.media_type(), descriptor.digest());
            }
        }
        Command::Inspect { name } => match cache.resolve(&name)? {
            Resolved::Image {
                descriptor,
                manifest,
            } => {
                println!("image {}", descriptor.digest());
                println!("config {}", manifest.config().digest());
                for layer in manifest.layers() {
                    println!("layer {} ({} bytes)", layer.digest(), layer.size());
                }
            }
            Resolved::Index { descriptor, index } => {
                println!("index {}", descriptor.digest());
                for child in index.manifests() {
                    match entry_kind(child)? {
                        EntryKind::Platform(platform) => println!(
                            "platform {}/{} {}",
                            platform.os(),
                            platform.architecture(),
                            child.digest()
                        ),
                        EntryKind::Attestation(target) => {
                            println!("attestation {} -> {target}", child.digest())
                        }
                        EntryKind::Untyped => println!("other {}", child.digest()),
                    }
                }
            }
        },
        Command::Config { name, os, arch } => {
            let platform = PlatformBuilder::default()
                .os(os.as_str())
                .architecture(arch.as_str())
                .build()?;
            let config = cache.config(&name, &platform)?;
            println!("{}", config.to_string_pretty()?);
        }
        Command::Rm { name } => {
            cache.remove(&name)?;
        }
        Command::Prune => {
            let result = cache.prune()?;
            println!(
                "Blobs: {} removed ({} bytes)",
                result.blobs_removed, result.blobs_bytes
            );
        }
        Command::Export { name, tag, output } => match output {
            Some(path) => {
                export_ref(&cache, &name, tag.as_deref(), File::create(path)?)?;
            }
            None => {
                let out = stdout();
                export_ref(&cache, &name, tag.as_deref(), out.lock())?;
            }
        },
        Command::Import { file, name } => {
            let descriptor = if file.as_os_str() == "-" {
                import_archive(&cache, stdin().lock(), name.as_deref())?
            } else {
                import_archive(&cache, File::open(file)?, name.as_deref())?
            };
            println!("{}", descriptor.digest());
        }
    }
    Ok(())
}
