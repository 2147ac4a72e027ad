//! Content-addressed blob storage for Depot.
//!
//! This crate provides the object store that lives on the shared mount:
//! - Blobs keyed by content hash under `objects/<aa>/<hash>`
//! - Atomic puts via temp-file + fsync + rename, gzip-framed on disk
//! - Integrity-checked gets (a successful read always hashes back to its key)
//! - Pruning of unreferenced blobs for garbage collection

pub mod error;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use store::{BlobStore, ByteProgress, PruneStats, PutOutcome};
