//! Row types mapping to the catalog schema.
//!
//! Column types in the schema are advisory; the semantics carried by these
//! structs are binding. Timestamps persist as ISO-8601 UTC strings.

use depot_core::hash::ContentHash;
use depot_core::manifest::ManifestDigest;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Project record.
///
/// The local path a project maps to is per-peer configuration and is never
/// stored here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
}

/// Branch record. Created on demand when the first snapshot on the name is
/// written; the default branch is implicit and needs no row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchRow {
    pub project_id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Snapshot record. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Creator peer hostname. An untrusted display label.
    pub created_by: String,
    pub manifest_hash: ManifestDigest,
    pub file_count: u64,
    pub total_size: u64,
    pub branch: String,
}

/// One manifest row: (snapshot, path) → content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntryRow {
    pub snapshot_id: Uuid,
    pub path: String,
    pub hash: ContentHash,
    /// Logical (uncompressed) size.
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

/// Advisory file lock. Informational only; the engine never refuses a
/// transfer because of one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileLockRow {
    pub project_id: Uuid,
    pub path: String,
    pub machine_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_at: OffsetDateTime,
}
