//! Core domain types and shared logic for Depot.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Blob content hashes and the manifest digest
//! - File entries, manifests, and manifest diffing
//! - Peer configuration and concurrency limits

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;

pub use config::{PeerConfig, ProjectBinding, SyncLimits};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use manifest::{validate_path, FileEntry, Manifest, ManifestDiff, ManifestDigest};

/// Default number of files hashed concurrently during a scan.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 10;

/// Default number of blobs transferred concurrently during push/pull.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 20;

/// Buffer size for streaming file I/O (64 KiB).
pub const IO_CHUNK_SIZE: usize = 64 * 1024;
