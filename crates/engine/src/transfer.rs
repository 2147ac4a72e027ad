//! Bounded parallel blob transfer.
//!
//! Uploads and downloads fan out over a `JoinSet` gated by a semaphore.
//! Per-file I/O and integrity failures are collected into the aggregate
//! outcome so one bad file cannot sink a whole operation; an infrastructure
//! failure (a panicked worker) stops further spawning and surfaces while
//! in-flight tasks finish. Inside workers only completion updates the
//! shared byte count; per-chunk progress is suppressed.

use crate::error::{EngineError, EngineResult};
use crate::progress::{ProgressEvent, ProgressFn};
use depot_core::manifest::{validate_path, FileEntry};
use depot_storage::BlobStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

/// One file that could not be transferred.
#[derive(Clone, Debug)]
pub struct TransferFailure {
    pub path: String,
    pub error: String,
}

/// Aggregate result of a transfer batch.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    /// Files fully transferred.
    pub completed: u64,
    /// Logical bytes actually moved (deduplicated blobs excluded).
    pub bytes: u64,
    /// Per-file failures, in completion order.
    pub failures: Vec<TransferFailure>,
}

/// Upload the blobs behind `entries` into the store, deduplicating against
/// blobs that already exist.
#[instrument(skip_all, fields(files = entries.len()), err)]
pub async fn upload(
    store: Arc<BlobStore>,
    root: &Path,
    entries: &[FileEntry],
    concurrency: usize,
    progress: Option<ProgressFn>,
) -> EngineResult<TransferOutcome> {
    let total_bytes = Arc::new(AtomicU64::new(0));
    run_pool(entries, concurrency, |entry| {
        let store = store.clone();
        let source = root.join(&entry.path);
        let path = entry.path.clone();
        let progress = progress.clone();
        let total_bytes = total_bytes.clone();
        async move {
            match store.put(&source, None).await {
                Ok(outcome) => {
                    let moved = if outcome.written { outcome.size } else { 0 };
                    Ok(report_bytes(&progress, &total_bytes, moved))
                }
                Err(e) => Err(TransferFailure {
                    path,
                    error: e.to_string(),
                }),
            }
        }
    })
    .await
}

/// Download the blobs behind `entries` into files under `root`.
///
/// Manifest paths come off the shared mount and are not trusted: each one
/// is validated before it touches the filesystem, so a catalog row like
/// `../x` becomes a per-file failure instead of a write outside the
/// working copy.
///
/// Each downloaded file gets the manifest's recorded mtime, so a later
/// scan compares against snapshot time rather than download time. Without
/// this, every fetched file would look locally-newer than any snapshot.
#[instrument(skip_all, fields(files = entries.len()), err)]
pub async fn download(
    store: Arc<BlobStore>,
    root: &Path,
    entries: &[FileEntry],
    concurrency: usize,
    progress: Option<ProgressFn>,
) -> EngineResult<TransferOutcome> {
    let total_bytes = Arc::new(AtomicU64::new(0));
    run_pool(entries, concurrency, |entry| {
        let store = store.clone();
        let dest = local_path(root, &entry.path);
        let path = entry.path.clone();
        let hash = entry.hash;
        let modified_at = entry.modified_at;
        let progress = progress.clone();
        let total_bytes = total_bytes.clone();
        async move {
            if let Err(e) = validate_path(&path) {
                return Err(TransferFailure {
                    path,
                    error: e.to_string(),
                });
            }
            match store.get(hash, &dest).await {
                Ok(written) => {
                    restore_mtime(&dest, modified_at);
                    Ok(report_bytes(&progress, &total_bytes, written))
                }
                Err(e) => Err(TransferFailure {
                    path,
                    error: e.to_string(),
                }),
            }
        }
    })
    .await
}

/// Stamp the manifest mtime onto a downloaded file. Best effort.
fn restore_mtime(dest: &Path, modified_at: OffsetDateTime) {
    let stamp = || -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(dest)?;
        file.set_modified(modified_at.into())
    };
    if let Err(e) = stamp() {
        warn!(path = %dest.display(), error = %e, "failed to restore mtime");
    }
}

/// Convert a slash-separated catalog path to a platform path under `root`.
pub fn local_path(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in rel.split('/') {
        path.push(segment);
    }
    path
}

fn report_bytes(progress: &Option<ProgressFn>, total: &AtomicU64, moved: u64) -> u64 {
    let cumulative = total.fetch_add(moved, Ordering::Relaxed) + moved;
    if let Some(progress) = progress {
        progress(ProgressEvent::Transfer { bytes: cumulative });
    }
    moved
}

async fn run_pool<F, Fut>(
    entries: &[FileEntry],
    concurrency: usize,
    make_task: F,
) -> EngineResult<TransferOutcome>
where
    F: Fn(&FileEntry) -> Fut,
    Fut: std::future::Future<Output = Result<u64, TransferFailure>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks: JoinSet<Result<u64, TransferFailure>> = JoinSet::new();
    let mut outcome = TransferOutcome::default();
    let mut spawn_error: Option<EngineError> = None;

    for entry in entries {
        // Harvest finished workers before each spawn so an infrastructure
        // failure stops the fan-out early.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = collect(joined, &mut outcome) {
                spawn_error = Some(e);
            }
        }
        if spawn_error.is_some() {
            break;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("transfer semaphore closed");
        let task = make_task(entry);
        tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    // In-flight tasks run to completion either way.
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = collect(joined, &mut outcome) {
            spawn_error.get_or_insert(e);
        }
    }

    match spawn_error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

fn collect(
    joined: Result<Result<u64, TransferFailure>, tokio::task::JoinError>,
    outcome: &mut TransferOutcome,
) -> EngineResult<()> {
    match joined {
        Ok(Ok(bytes)) => {
            outcome.completed += 1;
            outcome.bytes += bytes;
            Ok(())
        }
        Ok(Err(failure)) => {
            outcome.failures.push(failure);
            Ok(())
        }
        Err(join_err) => Err(EngineError::Io(std::io::Error::other(format!(
            "transfer worker failed: {join_err}"
        )))),
    }
}
