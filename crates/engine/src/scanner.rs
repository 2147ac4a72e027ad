//! Tree scanning with a persistent hash cache.
//!
//! The scanner walks a working copy, applies the ignore rules (pruning
//! ignored directories rather than recursing into them), and hashes every
//! regular file under a bounded concurrency limit. A per-project cache at
//! `.sync/cache.json` skips re-hashing files whose mtime and size are
//! unchanged. Cache I/O never fails a scan.

use crate::error::{EngineError, EngineResult};
use crate::ignore::IgnoreMatcher;
use crate::progress::{ProgressEvent, ProgressFn};
use depot_core::hash::ContentHash;
use depot_core::manifest::{FileEntry, Manifest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Relative path of the cache file inside a working copy.
const CACHE_FILE: &str = ".sync/cache.json";

/// One cached hash observation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// Modification time in Unix milliseconds.
    mtime: i64,
    size: u64,
    hash: ContentHash,
}

/// Persistent path → `{mtime, size, hash}` cache.
#[derive(Default)]
struct HashCache {
    entries: HashMap<String, CacheEntry>,
}

impl HashCache {
    /// Load the cache; any failure yields an empty cache.
    fn load(root: &Path) -> Self {
        let path = root.join(CACHE_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => Self { entries },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "hash cache unreadable, rescanning");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn lookup(&self, path: &str, mtime: i64, size: u64) -> Option<ContentHash> {
        self.entries
            .get(path)
            .filter(|e| e.mtime == mtime && e.size == size)
            .map(|e| e.hash)
    }

    /// Replace the cache with exactly the observed entries. Stale paths are
    /// pruned implicitly. Failures are non-fatal.
    fn store(root: &Path, observed: &HashMap<String, CacheEntry>) {
        let path = root.join(CACHE_FILE);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec(observed)?;
            std::fs::write(&path, bytes)
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), error = %e, "failed to write hash cache");
        }
    }
}

/// Result of scanning a working copy.
#[derive(Debug)]
pub struct ScanResult {
    pub manifest: Manifest,
    pub total_size: u64,
    pub file_count: u64,
    pub dir_count: u64,
    pub scanned_at: OffsetDateTime,
}

/// Directory tree scanner.
pub struct Scanner {
    concurrency: usize,
}

impl Scanner {
    /// Create a scanner with the given hashing concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Scan `root`, producing a manifest of every non-ignored regular file.
    ///
    /// Writes nothing except the hash cache.
    #[instrument(skip_all, fields(root = %root.display()), err)]
    pub async fn scan(
        &self,
        root: &Path,
        matcher: &IgnoreMatcher,
        progress: Option<ProgressFn>,
    ) -> EngineResult<ScanResult> {
        if !root.is_dir() {
            return Err(EngineError::NotFound(format!(
                "scan root {} is not a directory",
                root.display()
            )));
        }

        let walk = walk_tree(root, matcher)?;
        let cache = HashCache::load(root);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let counter = Arc::new(AtomicU64::new(0));
        let mut tasks: JoinSet<EngineResult<(String, CacheEntry)>> = JoinSet::new();

        let mut manifest = Manifest::new();
        let mut observed: HashMap<String, CacheEntry> = HashMap::new();
        let mut cached_hits = 0u64;

        for file in walk.files {
            if let Some(hash) = cache.lookup(&file.rel_path, file.mtime_ms, file.size) {
                cached_hits += 1;
                let entry = CacheEntry {
                    mtime: file.mtime_ms,
                    size: file.size,
                    hash,
                };
                observed.insert(file.rel_path.clone(), entry);
                report(&progress, &counter, &file.rel_path);
                manifest.insert(file.into_entry(hash));
                continue;
            }

            // Semaphore-bounded spawning: one slow file never stalls a
            // whole wave of others.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("scan semaphore closed");
            let abs_path = file.abs_path.clone();
            let progress = progress.clone();
            let counter = counter.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let hash = tokio::task::spawn_blocking(move || ContentHash::hash_file(&abs_path))
                    .await
                    .map_err(|e| EngineError::Io(std::io::Error::other(format!("hash task failed: {e}"))))??;
                report(&progress, &counter, &file.rel_path);
                let entry = CacheEntry {
                    mtime: file.mtime_ms,
                    size: file.size,
                    hash,
                };
                Ok((file.rel_path.clone(), entry))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (rel_path, entry) = joined
                .map_err(|e| EngineError::Io(std::io::Error::other(format!("hash task panicked: {e}"))))??;
            observed.insert(rel_path.clone(), entry);
            manifest.insert(FileEntry {
                path: rel_path,
                hash: entry.hash,
                size: entry.size,
                modified_at: millis_to_datetime(entry.mtime),
            });
        }

        HashCache::store(root, &observed);
        debug!(
            files = manifest.len(),
            cached = cached_hits,
            dirs = walk.dir_count,
            "scan complete"
        );

        Ok(ScanResult {
            total_size: manifest.total_size(),
            file_count: manifest.len() as u64,
            dir_count: walk.dir_count,
            scanned_at: OffsetDateTime::now_utc(),
            manifest,
        })
    }
}

fn report(progress: &Option<ProgressFn>, counter: &AtomicU64, path: &str) {
    let files = counter.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(progress) = progress {
        progress(ProgressEvent::Scan {
            files,
            path: path.to_string(),
        });
    }
}

struct WalkedFile {
    rel_path: String,
    abs_path: PathBuf,
    size: u64,
    mtime_ms: i64,
}

impl WalkedFile {
    fn into_entry(self, hash: ContentHash) -> FileEntry {
        FileEntry {
            path: self.rel_path,
            hash,
            size: self.size,
            modified_at: millis_to_datetime(self.mtime_ms),
        }
    }
}

struct WalkOutput {
    files: Vec<WalkedFile>,
    dir_count: u64,
}

/// Walk the tree, pruning ignored directories. Order is arbitrary.
fn walk_tree(root: &Path, matcher: &IgnoreMatcher) -> EngineResult<WalkOutput> {
    let mut files = Vec::new();
    let mut dir_count = 0u64;

    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => return false,
            };
            !matcher.ignores(&slash_path(rel), entry.file_type().is_dir())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            EngineError::Io(std::io::Error::other(format!("walk failed: {e}")))
        })?;
        if entry.depth() == 0 {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            dir_count += 1;
            continue;
        }
        if !file_type.is_file() {
            // Symlinks and specials are not synchronized.
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked path outside root");
        let meta = entry.metadata().map_err(|e| {
            EngineError::Io(std::io::Error::other(format!("stat failed: {e}")))
        })?;
        files.push(WalkedFile {
            rel_path: slash_path(rel),
            abs_path: entry.path().to_path_buf(),
            size: meta.len(),
            mtime_ms: system_time_millis(meta.modified()?),
        });
    }

    Ok(WalkOutput { files, dir_count })
}

/// Convert a relative path to `/`-separated form.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn system_time_millis(t: std::time::SystemTime) -> i64 {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn millis_to_datetime(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
