//! The engine facade: `push`, `pull`, `restore`, `status`, `gc`.
//!
//! The engine owns its resources (peer config, blob store, catalog image)
//! and is explicitly opened. The four mutating operations hold the
//! exclusion lock for their whole duration and reload the catalog under it,
//! so each sees the latest peer-visible state; `status` is a lockless read
//! that tolerates a torn catalog.

use crate::error::{EngineError, EngineResult};
use crate::ignore::{IgnoreMatcher, IncludeMatcher};
use crate::lock::{ExclusionLock, Operation};
use crate::progress::ProgressFn;
use crate::scanner::Scanner;
use crate::transfer::{self, TransferFailure};
use depot_catalog::{Catalog, FileEntryRow, FileLockRow, ProjectRow, SnapshotRow, DEFAULT_BRANCH};
use depot_core::manifest::{FileEntry, Manifest};
use depot_core::PeerConfig;
use depot_storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Catalog file name at the mount root.
pub const CATALOG_FILE: &str = "sync.db";

/// Per-project selective-sync patterns file, relative to the working copy.
const SELECTIVE_FILE: &str = ".sync/selective.json";

/// A path modified on both sides, awaiting a resolution.
#[derive(Clone, Debug, Serialize)]
pub struct Conflict {
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub local_modified_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub remote_modified_at: OffsetDateTime,
}

/// Caller-supplied answer for one conflicting path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    KeepBoth,
}

/// Result of a push.
#[derive(Debug)]
pub struct PushOutcome {
    pub files_added: u64,
    pub files_modified: u64,
    pub files_deleted: u64,
    pub bytes_transferred: u64,
    /// `None` when the tree was already identical to the latest snapshot.
    pub snapshot_id: Option<Uuid>,
}

/// Result of a pull.
#[derive(Debug)]
pub struct PullOutcome {
    /// `false` means conflicts were found and no resolutions were given;
    /// nothing was transferred or deleted.
    pub success: bool,
    pub files_downloaded: u64,
    pub files_deleted: u64,
    pub conflicts: Vec<Conflict>,
    pub failures: Vec<TransferFailure>,
}

/// Result of a restore.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub files_downloaded: u64,
    pub files_deleted: u64,
    pub failures: Vec<TransferFailure>,
}

/// Result of a status query. Pure read; nothing was transferred.
#[derive(Debug)]
pub struct StatusOutcome {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: u64,
}

/// Result of a gc run.
#[derive(Debug)]
pub struct GcOutcome {
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub temp_files_removed: u64,
}

/// The synchronization engine bound to one shared mount.
pub struct Engine {
    config: PeerConfig,
    store: Arc<BlobStore>,
    catalog: Catalog,
    scanner: Scanner,
}

impl Engine {
    /// Open the engine against the configured mount.
    pub async fn open(config: PeerConfig) -> EngineResult<Self> {
        config.validate()?;
        if !config.nas_path.is_dir() {
            return Err(EngineError::NotConfigured(format!(
                "shared mount {} is not reachable",
                config.nas_path.display()
            )));
        }
        let store = Arc::new(BlobStore::open(&config.nas_path).await?);
        let catalog = Catalog::load(config.nas_path.join(CATALOG_FILE))?;
        let scanner = Scanner::new(config.limits.scan_concurrency);
        Ok(Self {
            config,
            store,
            catalog,
            scanner,
        })
    }

    /// The peer configuration this engine was opened with.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Read access to the catalog image (projects, snapshots, locks).
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ===== Project management =====
    //
    // Catalog-only writes. The concurrency contract requires the exclusion
    // lock for push/pull/restore/gc; these small writes rely on the
    // rename-atomic save alone, as the catalog does.

    /// Register a new project.
    pub fn create_project(&mut self, name: &str) -> EngineResult<ProjectRow> {
        self.catalog.reload()?;
        Ok(self.catalog.create_project(name)?)
    }

    /// Delete a project and all of its history. Blobs stay until gc.
    pub fn delete_project(&mut self, project_id: Uuid) -> EngineResult<()> {
        self.catalog.reload()?;
        Ok(self.catalog.delete_project(project_id)?)
    }

    /// Delete a snapshot from history.
    pub fn delete_snapshot(&mut self, snapshot_id: Uuid) -> EngineResult<()> {
        self.catalog.reload()?;
        Ok(self.catalog.delete_snapshot(snapshot_id)?)
    }

    /// Take an advisory file lock. `false` when someone already holds it.
    pub fn acquire_file_lock(&mut self, project_id: Uuid, path: &str) -> EngineResult<bool> {
        self.catalog.reload()?;
        let machine = self.config.machine_name.clone();
        Ok(self.catalog.acquire_file_lock(project_id, path, &machine)?)
    }

    /// Release an advisory file lock. `false` when another machine holds it.
    pub fn release_file_lock(&mut self, project_id: Uuid, path: &str) -> EngineResult<bool> {
        self.catalog.reload()?;
        let machine = self.config.machine_name.clone();
        Ok(self.catalog.release_file_lock(project_id, path, &machine)?)
    }

    /// Advisory file locks for a project, refreshed from the mount.
    pub fn file_locks(&mut self, project_id: Uuid) -> EngineResult<Vec<FileLockRow>> {
        self.catalog.reload()?;
        Ok(self
            .catalog
            .file_locks(project_id)
            .into_iter()
            .cloned()
            .collect())
    }

    // ===== Sync operations =====

    /// Scan, diff against the branch head, upload changed blobs, and write
    /// a new snapshot. Deletions are represented by absence, not tombstones.
    #[instrument(skip_all, fields(project = %project_id, branch = branch.unwrap_or(DEFAULT_BRANCH)), err)]
    pub async fn push(
        &mut self,
        project_id: Uuid,
        local_path: &Path,
        message: &str,
        branch: Option<&str>,
        progress: Option<ProgressFn>,
    ) -> EngineResult<PushOutcome> {
        let branch = branch.unwrap_or(DEFAULT_BRANCH);
        let lock = ExclusionLock::acquire(
            &self.config.nas_path,
            &self.config.machine_name,
            Operation::Push,
        )
        .await?;

        self.catalog.reload()?;
        self.catalog
            .get_project(project_id)
            .ok_or_else(|| EngineError::NotFound(format!("project {project_id}")))?;

        let matcher = IgnoreMatcher::for_root(local_path)?;
        let scan = self
            .scanner
            .scan(local_path, &matcher, progress.clone())
            .await?;

        let remote = match self.catalog.latest_snapshot(project_id, branch) {
            Some(snapshot) => self.catalog.manifest(snapshot.id),
            None => Manifest::new(),
        };
        let diff = Manifest::diff(&scan.manifest, &remote);

        if diff.is_clean() {
            info!("push found no changes");
            lock.release();
            return Ok(PushOutcome {
                files_added: 0,
                files_modified: 0,
                files_deleted: 0,
                bytes_transferred: 0,
                snapshot_id: None,
            });
        }

        let outgoing: Vec<FileEntry> = diff.outgoing().cloned().collect();
        let transfer = transfer::upload(
            self.store.clone(),
            local_path,
            &outgoing,
            self.config.limits.transfer_concurrency,
            progress,
        )
        .await?;
        if !transfer.failures.is_empty() {
            // A snapshot must never reference a blob that is not durable.
            return Err(EngineError::TransferFailed(transfer.failures));
        }

        let now = OffsetDateTime::now_utc();
        let snapshot_id = Uuid::new_v4();
        let snapshot = SnapshotRow {
            id: snapshot_id,
            project_id,
            message: message.to_string(),
            created_at: now,
            created_by: self.config.machine_name.clone(),
            manifest_hash: scan.manifest.digest(),
            file_count: scan.file_count,
            total_size: scan.total_size,
            branch: branch.to_string(),
        };
        let entries: Vec<FileEntryRow> = scan
            .manifest
            .iter()
            .map(|e| FileEntryRow {
                snapshot_id,
                path: e.path.clone(),
                hash: e.hash,
                size: e.size,
                modified_at: e.modified_at,
            })
            .collect();
        self.catalog.create_snapshot(snapshot, entries)?;
        self.catalog.update_last_sync(project_id, now)?;

        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            bytes = transfer.bytes,
            "push complete"
        );
        lock.release();
        Ok(PushOutcome {
            files_added: diff.added.len() as u64,
            files_modified: diff.modified.len() as u64,
            files_deleted: diff.deleted.len() as u64,
            bytes_transferred: transfer.bytes,
            snapshot_id: Some(snapshot_id),
        })
    }

    /// Bring the working copy up to the branch head.
    ///
    /// Conflicting paths (local hash differs and local mtime is strictly
    /// newer) are returned without any write I/O unless `resolutions`
    /// covers them all.
    #[instrument(skip_all, fields(project = %project_id, branch = branch.unwrap_or(DEFAULT_BRANCH)), err)]
    pub async fn pull(
        &mut self,
        project_id: Uuid,
        local_path: &Path,
        branch: Option<&str>,
        resolutions: &HashMap<String, Resolution>,
        progress: Option<ProgressFn>,
        include_patterns: Option<&[String]>,
    ) -> EngineResult<PullOutcome> {
        let branch = branch.unwrap_or(DEFAULT_BRANCH);
        let lock = ExclusionLock::acquire(
            &self.config.nas_path,
            &self.config.machine_name,
            Operation::Pull,
        )
        .await?;

        self.catalog.reload()?;
        self.catalog
            .get_project(project_id)
            .ok_or_else(|| EngineError::NotFound(format!("project {project_id}")))?;
        let remote = match self.catalog.latest_snapshot(project_id, branch) {
            Some(snapshot) => self.catalog.manifest(snapshot.id),
            None => Manifest::new(),
        };

        let apply = self
            .apply_remote(
                local_path,
                &remote,
                Some(resolutions),
                progress,
                include_patterns,
            )
            .await?;

        lock.release();
        match apply {
            ApplyOutcome::ConflictsPending(conflicts) => Ok(PullOutcome {
                success: false,
                files_downloaded: 0,
                files_deleted: 0,
                conflicts,
                failures: Vec::new(),
            }),
            ApplyOutcome::Applied {
                downloaded,
                deleted,
                conflicts,
                failures,
            } => Ok(PullOutcome {
                success: true,
                files_downloaded: downloaded,
                files_deleted: deleted,
                conflicts,
                failures,
            }),
        }
    }

    /// Reset the working copy to a named snapshot. No conflict check; the
    /// caller has opted into overwriting local changes.
    #[instrument(skip_all, fields(project = %project_id, snapshot = %snapshot_id), err)]
    pub async fn restore(
        &mut self,
        project_id: Uuid,
        local_path: &Path,
        snapshot_id: Uuid,
        progress: Option<ProgressFn>,
        include_patterns: Option<&[String]>,
    ) -> EngineResult<RestoreOutcome> {
        let lock = ExclusionLock::acquire(
            &self.config.nas_path,
            &self.config.machine_name,
            Operation::Restore,
        )
        .await?;

        self.catalog.reload()?;
        let snapshot = self
            .catalog
            .get_snapshot(snapshot_id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {snapshot_id}")))?;
        if snapshot.project_id != project_id {
            return Err(EngineError::NotFound(format!(
                "snapshot {snapshot_id} does not belong to project {project_id}"
            )));
        }
        let remote = self.catalog.manifest(snapshot_id);

        let apply = self
            .apply_remote(local_path, &remote, None, progress, include_patterns)
            .await?;

        lock.release();
        match apply {
            ApplyOutcome::ConflictsPending(_) => unreachable!("restore skips conflict detection"),
            ApplyOutcome::Applied {
                downloaded,
                deleted,
                failures,
                ..
            } => Ok(RestoreOutcome {
                files_downloaded: downloaded,
                files_deleted: deleted,
                failures,
            }),
        }
    }

    /// Compare the working copy against the branch head. Takes no lock.
    #[instrument(skip_all, fields(project = %project_id), err)]
    pub async fn status(
        &mut self,
        project_id: Uuid,
        local_path: &Path,
        branch: Option<&str>,
    ) -> EngineResult<StatusOutcome> {
        let branch = branch.unwrap_or(DEFAULT_BRANCH);
        self.catalog.reload()?;
        self.catalog
            .get_project(project_id)
            .ok_or_else(|| EngineError::NotFound(format!("project {project_id}")))?;

        let matcher = IgnoreMatcher::for_root(local_path)?;
        let scan = self.scanner.scan(local_path, &matcher, None).await?;
        let remote = match self.catalog.latest_snapshot(project_id, branch) {
            Some(snapshot) => self.catalog.manifest(snapshot.id),
            None => Manifest::new(),
        };
        let diff = Manifest::diff(&scan.manifest, &remote);

        Ok(StatusOutcome {
            added: diff.added.iter().map(|e| e.path.clone()).collect(),
            modified: diff.modified.iter().map(|e| e.path.clone()).collect(),
            deleted: diff.deleted.iter().map(|e| e.path.clone()).collect(),
            unchanged: diff.unchanged.len() as u64,
        })
    }

    /// Remove unreferenced blobs and clear the staging area.
    #[instrument(skip_all, err)]
    pub async fn gc(&mut self) -> EngineResult<GcOutcome> {
        let lock = ExclusionLock::acquire(
            &self.config.nas_path,
            &self.config.machine_name,
            Operation::Gc,
        )
        .await?;

        self.catalog.reload()?;
        let live = self.catalog.referenced_hashes();
        let stats = self.store.prune(&live).await?;
        let temp_files_removed = self.store.clear_temp().await?;

        info!(
            blobs_removed = stats.blobs_removed,
            bytes_freed = stats.bytes_freed,
            "gc complete"
        );
        lock.release();
        Ok(GcOutcome {
            blobs_removed: stats.blobs_removed,
            bytes_freed: stats.bytes_freed,
            temp_files_removed,
        })
    }

    /// Materialize a remote manifest into the working copy: scan, detect
    /// conflicts (when `resolutions` is `Some`), download, delete.
    async fn apply_remote(
        &mut self,
        local_path: &Path,
        remote: &Manifest,
        resolutions: Option<&HashMap<String, Resolution>>,
        progress: Option<ProgressFn>,
        include_patterns: Option<&[String]>,
    ) -> EngineResult<ApplyOutcome> {
        let include = effective_includes(local_path, include_patterns)?;
        let included = |path: &str| include.as_ref().is_none_or(|m| m.includes(path));

        let matcher = IgnoreMatcher::for_root(local_path)?;
        let scan = self
            .scanner
            .scan(local_path, &matcher, progress.clone())
            .await?;
        let local = &scan.manifest;

        let mut to_download: Vec<FileEntry> = Vec::new();
        let mut conflicts: Vec<Conflict> = Vec::new();

        for remote_entry in remote.iter() {
            if !included(&remote_entry.path) {
                continue;
            }
            match local.get(&remote_entry.path) {
                None => to_download.push(remote_entry.clone()),
                Some(ours) if ours.hash != remote_entry.hash => {
                    // Strictly-newer local mtime marks a conflict; a tie
                    // means remote wins.
                    let is_conflict = resolutions.is_some()
                        && ours.modified_at > remote_entry.modified_at;
                    if is_conflict {
                        conflicts.push(Conflict {
                            path: remote_entry.path.clone(),
                            local_modified_at: ours.modified_at,
                            remote_modified_at: remote_entry.modified_at,
                        });
                    } else {
                        to_download.push(remote_entry.clone());
                    }
                }
                Some(_) => {}
            }
        }

        if let Some(resolutions) = resolutions {
            let unresolved = conflicts
                .iter()
                .any(|c| !resolutions.contains_key(&c.path));
            if unresolved {
                return Ok(ApplyOutcome::ConflictsPending(conflicts));
            }
            for conflict in &conflicts {
                match resolutions[&conflict.path] {
                    Resolution::KeepLocal => {}
                    Resolution::KeepRemote => {
                        let entry = remote.get(&conflict.path).expect("conflict path in remote");
                        to_download.push(entry.clone());
                    }
                    Resolution::KeepBoth => {
                        rename_local_variant(local_path, &conflict.path)?;
                        let entry = remote.get(&conflict.path).expect("conflict path in remote");
                        to_download.push(entry.clone());
                    }
                }
            }
        }

        let transfer = transfer::download(
            self.store.clone(),
            local_path,
            &to_download,
            self.config.limits.transfer_concurrency,
            progress,
        )
        .await?;

        let mut deleted = 0u64;
        for entry in local.iter() {
            if !included(&entry.path) || remote.get(&entry.path).is_some() {
                continue;
            }
            let victim = transfer::local_path(local_path, &entry.path);
            match std::fs::remove_file(&victim) {
                Ok(()) => {
                    deleted += 1;
                    remove_empty_parents(local_path, &victim);
                }
                Err(e) => warn!(path = %victim.display(), error = %e, "failed to delete local file"),
            }
        }

        Ok(ApplyOutcome::Applied {
            downloaded: transfer.completed,
            deleted,
            conflicts,
            failures: transfer.failures,
        })
    }
}

enum ApplyOutcome {
    ConflictsPending(Vec<Conflict>),
    Applied {
        downloaded: u64,
        deleted: u64,
        conflicts: Vec<Conflict>,
        failures: Vec<TransferFailure>,
    },
}

/// Resolve the selective-sync include set: explicit patterns win, then the
/// per-project `.sync/selective.json`, then no filtering.
fn effective_includes(
    local_path: &Path,
    include_patterns: Option<&[String]>,
) -> EngineResult<Option<IncludeMatcher>> {
    let patterns: Option<Vec<String>> = match include_patterns {
        Some(patterns) => Some(patterns.to_vec()),
        None => {
            let path = local_path.join(SELECTIVE_FILE);
            match std::fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                    Ok(patterns) => Some(patterns),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable selective-sync file, ignoring");
                        None
                    }
                },
                Err(_) => None,
            }
        }
    };
    match patterns {
        Some(patterns) if !patterns.is_empty() => {
            Ok(Some(IncludeMatcher::from_patterns(&patterns)?))
        }
        _ => Ok(None),
    }
}

/// Rename `rel` inside the working copy to its `<stem>.local<ext>` variant.
fn rename_local_variant(root: &Path, rel: &str) -> std::io::Result<()> {
    let source = transfer::local_path(root, rel);
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let variant = match (Path::new(&name).file_stem(), Path::new(&name).extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}.local.{}",
            stem.to_string_lossy(),
            ext.to_string_lossy()
        ),
        _ => format!("{name}.local"),
    };
    let target: PathBuf = source.with_file_name(variant);
    std::fs::rename(&source, &target)
}

/// Remove directories left empty by a deletion, up to (but excluding) the
/// working copy root.
fn remove_empty_parents(root: &Path, deleted: &Path) {
    let mut dir = deleted.parent();
    while let Some(current) = dir {
        if current == root {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_local_variant_with_extension() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"local").unwrap();
        rename_local_variant(temp.path(), "a.txt").unwrap();
        assert!(!temp.path().join("a.txt").exists());
        assert_eq!(
            std::fs::read(temp.path().join("a.local.txt")).unwrap(),
            b"local"
        );
    }

    #[test]
    fn test_rename_local_variant_without_extension() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("README"), b"doc").unwrap();
        rename_local_variant(temp.path(), "README").unwrap();
        assert!(temp.path().join("README.local").exists());
    }

    #[test]
    fn test_remove_empty_parents_stops_at_root() {
        let temp = tempfile::tempdir().unwrap();
        let deep = temp.path().join("a/b/c");
        std::fs::create_dir_all(&deep).unwrap();
        let file = deep.join("f.txt");
        std::fs::write(&file, b"x").unwrap();
        std::fs::remove_file(&file).unwrap();

        remove_empty_parents(temp.path(), &file);
        assert!(!temp.path().join("a").exists());
        assert!(temp.path().exists());
    }

    #[test]
    fn test_remove_empty_parents_keeps_occupied_dirs() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/keep.txt"), b"x").unwrap();
        let file = temp.path().join("a/b/f.txt");
        std::fs::write(&file, b"x").unwrap();
        std::fs::remove_file(&file).unwrap();

        remove_empty_parents(temp.path(), &file);
        assert!(!temp.path().join("a/b").exists());
        assert!(temp.path().join("a/keep.txt").exists());
    }

    #[test]
    fn test_resolution_deserializes_snake_case() {
        let r: Resolution = serde_json::from_str("\"keep_both\"").unwrap();
        assert_eq!(r, Resolution::KeepBoth);
    }

    #[test]
    fn test_effective_includes_prefers_explicit_patterns() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join(".sync")).unwrap();
        std::fs::write(
            temp.path().join(SELECTIVE_FILE),
            br#"["Source/**"]"#,
        )
        .unwrap();

        let explicit = vec!["Content/**".to_string()];
        let include = effective_includes(temp.path(), Some(&explicit))
            .unwrap()
            .unwrap();
        assert!(include.includes("Content/x.uasset"));
        assert!(!include.includes("Source/y.cpp"));

        let from_file = effective_includes(temp.path(), None).unwrap().unwrap();
        assert!(from_file.includes("Source/y.cpp"));
        assert!(!from_file.includes("Content/x.uasset"));
    }

    #[test]
    fn test_effective_includes_absent() {
        let temp = tempfile::tempdir().unwrap();
        assert!(effective_includes(temp.path(), None).unwrap().is_none());
    }
}
