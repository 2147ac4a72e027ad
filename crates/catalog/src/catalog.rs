//! The catalog image and its persistence.

use crate::error::{CatalogError, CatalogResult};
use crate::models::{BranchRow, FileEntryRow, FileLockRow, ProjectRow, SnapshotRow};
use depot_core::manifest::{validate_path, FileEntry, Manifest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

/// The implicit default branch. A branch reference with no row behaves as
/// if one existed under this name.
pub const DEFAULT_BRANCH: &str = "main";

const CATALOG_FORMAT_VERSION: u32 = 1;

/// Serialized catalog image.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogData {
    version: u32,
    projects: Vec<ProjectRow>,
    branches: Vec<BranchRow>,
    snapshots: Vec<SnapshotRow>,
    file_entries: Vec<FileEntryRow>,
    file_locks: Vec<FileLockRow>,
}

impl Default for CatalogData {
    fn default() -> Self {
        Self {
            version: CATALOG_FORMAT_VERSION,
            projects: Vec::new(),
            branches: Vec::new(),
            snapshots: Vec::new(),
            file_entries: Vec::new(),
            file_locks: Vec::new(),
        }
    }
}

/// In-memory catalog bound to its file on the shared mount.
///
/// Every logical write operation ends by persisting the whole image. Callers
/// mutate only while holding the repository exclusion lock; lockless readers
/// (`status`) must tolerate one torn read, which `load` does by retrying a
/// failed parse once.
pub struct Catalog {
    path: PathBuf,
    data: CatalogData,
}

impl Catalog {
    /// Load the catalog, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> CatalogResult<Self> {
        let path = path.into();
        let data = Self::read_image(&path)?;
        Ok(Self { path, data })
    }

    /// Re-read the image from disk, discarding in-memory state.
    pub fn reload(&mut self) -> CatalogResult<()> {
        self.data = Self::read_image(&self.path)?;
        Ok(())
    }

    fn read_image(path: &Path) -> CatalogResult<CatalogData> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CatalogData::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(data) => Ok(data),
            Err(first) => {
                // A concurrent writer may have replaced the file mid-read.
                // One retry against the (renamed-into-place) successor.
                warn!(path = %path.display(), error = %first, "catalog parse failed, retrying once");
                std::thread::sleep(std::time::Duration::from_millis(50));
                let bytes = std::fs::read(path)?;
                serde_json::from_slice(&bytes).map_err(|source| CatalogError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }

    /// Persist the whole image: serialize → sibling temp file → fsync →
    /// rename into place.
    fn save(&self) -> CatalogResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.data)?;

        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = bytes.len(), "catalog saved");
        Ok(())
    }

    // ===== Projects =====

    /// Create a project. Name collisions are allowed; identity is the id.
    pub fn create_project(&mut self, name: &str) -> CatalogResult<ProjectRow> {
        let row = ProjectRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
            last_sync_at: None,
        };
        self.data.projects.push(row.clone());
        self.save()?;
        Ok(row)
    }

    /// Look up a project.
    pub fn get_project(&self, id: Uuid) -> Option<&ProjectRow> {
        self.data.projects.iter().find(|p| p.id == id)
    }

    /// All projects, in creation order.
    pub fn list_projects(&self) -> &[ProjectRow] {
        &self.data.projects
    }

    /// Stamp a project's last successful sync.
    pub fn update_last_sync(&mut self, id: Uuid, at: OffsetDateTime) -> CatalogResult<()> {
        let project = self
            .data
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CatalogError::NotFound(format!("project {id}")))?;
        project.last_sync_at = Some(at);
        self.save()
    }

    /// Delete a project and cascade to its snapshots, file entries,
    /// branches, and file locks. Blobs are untouched (gc's job).
    pub fn delete_project(&mut self, id: Uuid) -> CatalogResult<()> {
        if self.get_project(id).is_none() {
            return Err(CatalogError::NotFound(format!("project {id}")));
        }
        let doomed: HashSet<Uuid> = self
            .data
            .snapshots
            .iter()
            .filter(|s| s.project_id == id)
            .map(|s| s.id)
            .collect();

        self.data.projects.retain(|p| p.id != id);
        self.data.snapshots.retain(|s| s.project_id != id);
        self.data
            .file_entries
            .retain(|e| !doomed.contains(&e.snapshot_id));
        self.data.branches.retain(|b| b.project_id != id);
        self.data.file_locks.retain(|l| l.project_id != id);
        self.save()
    }

    // ===== Snapshots =====

    /// Append a snapshot and its manifest rows as one durable unit.
    ///
    /// Upserts the branch row, validates that the snapshot's digest, file
    /// count, and total size agree with the entries, and persists everything
    /// in a single save.
    pub fn create_snapshot(
        &mut self,
        snapshot: SnapshotRow,
        entries: Vec<FileEntryRow>,
    ) -> CatalogResult<()> {
        if self.get_project(snapshot.project_id).is_none() {
            return Err(CatalogError::NotFound(format!(
                "project {}",
                snapshot.project_id
            )));
        }
        if self.get_snapshot(snapshot.id).is_some() {
            return Err(CatalogError::AlreadyExists(format!(
                "snapshot {}",
                snapshot.id
            )));
        }
        if entries.iter().any(|e| e.snapshot_id != snapshot.id) {
            return Err(CatalogError::Constraint(
                "file entry bound to a different snapshot".to_string(),
            ));
        }
        for entry in &entries {
            validate_path(&entry.path).map_err(|e| CatalogError::Constraint(e.to_string()))?;
        }

        let manifest = Manifest::from_entries(entries.iter().map(row_to_entry));
        if manifest.len() != entries.len() {
            return Err(CatalogError::Constraint(
                "duplicate path within snapshot".to_string(),
            ));
        }
        if snapshot.file_count != entries.len() as u64 {
            return Err(CatalogError::Constraint(format!(
                "file_count {} does not match {} entries",
                snapshot.file_count,
                entries.len()
            )));
        }
        if snapshot.total_size != manifest.total_size() {
            return Err(CatalogError::Constraint(format!(
                "total_size {} does not match entries ({})",
                snapshot.total_size,
                manifest.total_size()
            )));
        }
        manifest
            .verify_digest(&snapshot.manifest_hash)
            .map_err(|e| CatalogError::Constraint(e.to_string()))?;

        self.upsert_branch(snapshot.project_id, &snapshot.branch, snapshot.created_at);
        self.data.snapshots.push(snapshot);
        self.data.file_entries.extend(entries);
        self.save()
    }

    fn upsert_branch(&mut self, project_id: Uuid, name: &str, created_at: OffsetDateTime) {
        let exists = self
            .data
            .branches
            .iter()
            .any(|b| b.project_id == project_id && b.name == name);
        if !exists {
            self.data.branches.push(BranchRow {
                project_id,
                name: name.to_string(),
                created_at,
            });
        }
    }

    /// Look up a snapshot.
    pub fn get_snapshot(&self, id: Uuid) -> Option<&SnapshotRow> {
        self.data.snapshots.iter().find(|s| s.id == id)
    }

    /// Latest snapshot on a branch, or `None` if the branch has no history.
    pub fn latest_snapshot(&self, project_id: Uuid, branch: &str) -> Option<&SnapshotRow> {
        self.data
            .snapshots
            .iter()
            .filter(|s| s.project_id == project_id && s.branch == branch)
            .max_by_key(|s| s.created_at)
    }

    /// Snapshots for a project, newest first, optionally filtered by branch
    /// and truncated to `limit`.
    pub fn snapshots(
        &self,
        project_id: Uuid,
        branch: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<&SnapshotRow> {
        let mut rows: Vec<&SnapshotRow> = self
            .data
            .snapshots
            .iter()
            .filter(|s| s.project_id == project_id)
            .filter(|s| branch.is_none_or(|b| s.branch == b))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Delete one snapshot and its file entries.
    pub fn delete_snapshot(&mut self, id: Uuid) -> CatalogResult<()> {
        if self.get_snapshot(id).is_none() {
            return Err(CatalogError::NotFound(format!("snapshot {id}")));
        }
        self.data.snapshots.retain(|s| s.id != id);
        self.data.file_entries.retain(|e| e.snapshot_id != id);
        self.save()
    }

    /// File entries of a snapshot.
    pub fn entries(&self, snapshot_id: Uuid) -> Vec<&FileEntryRow> {
        self.data
            .file_entries
            .iter()
            .filter(|e| e.snapshot_id == snapshot_id)
            .collect()
    }

    /// A snapshot's manifest, rebuilt from its rows.
    pub fn manifest(&self, snapshot_id: Uuid) -> Manifest {
        Manifest::from_entries(
            self.data
                .file_entries
                .iter()
                .filter(|e| e.snapshot_id == snapshot_id)
                .map(row_to_entry),
        )
    }

    /// Branch rows for a project (the implicit default branch may be absent).
    pub fn branches(&self, project_id: Uuid) -> Vec<&BranchRow> {
        self.data
            .branches
            .iter()
            .filter(|b| b.project_id == project_id)
            .collect()
    }

    /// Every content hash referenced by any file entry, as hex keys.
    /// This is the gc live set.
    pub fn referenced_hashes(&self) -> HashSet<String> {
        self.data
            .file_entries
            .iter()
            .map(|e| e.hash.to_hex())
            .collect()
    }

    // ===== Advisory file locks =====

    /// Take an advisory lock on (project, path). Returns `false` without
    /// error if any holder already exists.
    pub fn acquire_file_lock(
        &mut self,
        project_id: Uuid,
        path: &str,
        machine_name: &str,
    ) -> CatalogResult<bool> {
        let held = self
            .data
            .file_locks
            .iter()
            .any(|l| l.project_id == project_id && l.path == path);
        if held {
            return Ok(false);
        }
        self.data.file_locks.push(FileLockRow {
            project_id,
            path: path.to_string(),
            machine_name: machine_name.to_string(),
            locked_at: OffsetDateTime::now_utc(),
        });
        self.save()?;
        Ok(true)
    }

    /// Release an advisory lock. Succeeds when no row exists or the row
    /// belongs to the caller; another machine's lock is left alone and the
    /// call returns `false`.
    pub fn release_file_lock(
        &mut self,
        project_id: Uuid,
        path: &str,
        machine_name: &str,
    ) -> CatalogResult<bool> {
        match self
            .data
            .file_locks
            .iter()
            .position(|l| l.project_id == project_id && l.path == path)
        {
            None => Ok(true),
            Some(idx) if self.data.file_locks[idx].machine_name == machine_name => {
                self.data.file_locks.remove(idx);
                self.save()?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// All advisory locks for a project.
    pub fn file_locks(&self, project_id: Uuid) -> Vec<&FileLockRow> {
        self.data
            .file_locks
            .iter()
            .filter(|l| l.project_id == project_id)
            .collect()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn row_to_entry(row: &FileEntryRow) -> FileEntry {
    FileEntry {
        path: row.path.clone(),
        hash: row.hash,
        size: row.size,
        modified_at: row.modified_at,
    }
}
