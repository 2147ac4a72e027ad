//! The on-mount blob store.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<aa>/<hash>    one blob, gzip-framed or raw (sniffed on read)
//! temp/                  staging area for in-flight puts
//! ```
//!
//! The shared mount offers `rename` as its only atomicity primitive, so
//! every durable write goes through a uniquely-named temp file, an fsync,
//! and a rename into place. Rename atomicity must hold on the underlying
//! filesystem; SMB/CIFS and NFS provide it for same-directory renames.

use crate::error::{StorageError, StorageResult};
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use depot_core::hash::ContentHash;
use depot_core::IO_CHUNK_SIZE;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Gzip stream magic bytes, used to sniff the blob framing on read.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Per-chunk progress callback, called with cumulative logical bytes.
pub type ByteProgress = dyn Fn(u64) + Send + Sync;

/// Result of a `put`.
#[derive(Clone, Copy, Debug)]
pub struct PutOutcome {
    /// Content hash of the source file (the blob key).
    pub hash: ContentHash,
    /// Logical (uncompressed) size of the source.
    pub size: u64,
    /// Whether a new blob was written. `false` means it was deduplicated.
    pub written: bool,
}

/// Result of a `prune`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PruneStats {
    /// Number of blobs unlinked.
    pub blobs_removed: u64,
    /// On-disk bytes reclaimed.
    pub bytes_freed: u64,
}

/// Content-addressed blob store rooted at the shared mount.
pub struct BlobStore {
    objects_dir: PathBuf,
    temp_dir: PathBuf,
}

impl BlobStore {
    /// Open (and if needed create) a store under the given root.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let objects_dir = root.join("objects");
        let temp_dir = root.join("temp");
        fs::create_dir_all(&objects_dir).await?;
        fs::create_dir_all(&temp_dir).await?;
        Ok(Self {
            objects_dir,
            temp_dir,
        })
    }

    /// Filesystem path of a blob.
    fn object_path(&self, hash: ContentHash) -> PathBuf {
        self.objects_dir.join(hash.prefix()).join(hash.to_hex())
    }

    /// Store a file's contents, deduplicating against existing blobs.
    ///
    /// The source is hashed first; if the blob already exists the put is a
    /// no-op beyond that single read. Otherwise the source streams through a
    /// gzip encoder into a temp file which is renamed into place.
    #[instrument(skip_all, err)]
    pub async fn put(
        &self,
        source: &Path,
        progress: Option<&ByteProgress>,
    ) -> StorageResult<PutOutcome> {
        let (hash, size) = hash_file(source).await?;

        let target = self.object_path(hash);
        if fs::try_exists(&target).await? {
            debug!(hash = %hash, "blob already stored, skipping write");
            return Ok(PutOutcome {
                hash,
                size,
                written: false,
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name so concurrent puts of the same content never
        // collide mid-write; content-addressing makes the race benign.
        let temp_path = self
            .temp_dir
            .join(format!("{}.{}.tmp", hash.to_hex(), Uuid::new_v4()));

        let write_result = write_gzip_temp(source, &temp_path, progress).await;
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(PutOutcome {
            hash,
            size,
            written: true,
        })
    }

    /// Materialize a blob at `dest`, verifying integrity.
    ///
    /// The first two bytes select the framing: gzip streams are inflated,
    /// anything else is copied verbatim. The written bytes are hashed on the
    /// way out; a mismatch against the requested key deletes `dest` and
    /// reports corruption.
    #[instrument(skip_all, fields(hash = %hash), err)]
    pub async fn get(&self, hash: ContentHash, dest: &Path) -> StorageResult<u64> {
        let path = self.object_path(hash);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(hash.to_hex())
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut reader = BufReader::with_capacity(IO_CHUNK_SIZE, file);
        let head = reader.fill_buf().await?;
        let is_gzip = head.len() >= 2 && head[..2] == GZIP_MAGIC;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut out = fs::File::create(dest).await?;

        let copy_result = if is_gzip {
            copy_and_hash(&mut GzipDecoder::new(reader), &mut out).await
        } else {
            copy_and_hash(&mut reader, &mut out).await
        };

        let (actual, written) = match copy_result {
            Ok(pair) => pair,
            Err(e) => {
                drop(out);
                let _ = fs::remove_file(dest).await;
                return Err(e.into());
            }
        };
        out.flush().await?;
        drop(out);

        if actual != hash {
            let _ = fs::remove_file(dest).await;
            return Err(StorageError::Integrity {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        Ok(written)
    }

    /// Whether a blob exists. Single stat.
    pub async fn exists(&self, hash: ContentHash) -> StorageResult<bool> {
        Ok(fs::try_exists(self.object_path(hash)).await?)
    }

    /// On-disk (compressed) size of a blob. Single stat.
    ///
    /// Deliberately distinct from the logical size recorded in manifests.
    pub async fn size(&self, hash: ContentHash) -> StorageResult<u64> {
        let meta = fs::metadata(self.object_path(hash)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(hash.to_hex())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(meta.len())
    }

    /// Unlink one blob. Errors are reported as `false`.
    pub async fn delete(&self, hash: ContentHash) -> bool {
        fs::remove_file(self.object_path(hash)).await.is_ok()
    }

    /// Remove every blob whose key is not in `live`.
    ///
    /// Empty prefix directories are cleaned up afterwards.
    #[instrument(skip_all, err)]
    pub async fn prune(&self, live: &HashSet<String>) -> StorageResult<PruneStats> {
        let mut stats = PruneStats::default();
        let mut prefixes = Vec::new();

        let mut top = fs::read_dir(&self.objects_dir).await?;
        while let Some(prefix_entry) = top.next_entry().await? {
            if !prefix_entry.file_type().await?.is_dir() {
                continue;
            }
            prefixes.push(prefix_entry.path());
        }

        for prefix in &prefixes {
            let mut entries = fs::read_dir(prefix).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if live.contains(&name) {
                    continue;
                }
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                match fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        stats.blobs_removed += 1;
                        stats.bytes_freed += size;
                    }
                    Err(e) => warn!(blob = %name, error = %e, "failed to prune blob"),
                }
            }
            // Fails while non-empty, which is fine.
            let _ = fs::remove_dir(prefix).await;
        }

        Ok(stats)
    }

    /// Empty the staging directory of abandoned in-flight puts.
    pub async fn clear_temp(&self) -> StorageResult<u64> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.temp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Hash a file by streaming, returning the key and the logical size.
async fn hash_file(path: &Path) -> StorageResult<(ContentHash, u64)> {
    let file = fs::File::open(path).await?;
    let mut reader = BufReader::with_capacity(IO_CHUNK_SIZE, file);
    let mut hasher = ContentHash::hasher();
    let mut size = 0u64;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

/// Stream `source` through a gzip encoder into `temp_path`, fsyncing before
/// return. Progress is reported per chunk with cumulative logical bytes.
async fn write_gzip_temp(
    source: &Path,
    temp_path: &Path,
    progress: Option<&ByteProgress>,
) -> StorageResult<()> {
    let input = fs::File::open(source).await?;
    let mut reader = BufReader::with_capacity(IO_CHUNK_SIZE, input);
    let output = fs::File::create(temp_path).await?;
    let mut encoder = GzipEncoder::new(output);

    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n]).await?;
        total += n as u64;
        if let Some(progress) = progress {
            progress(total);
        }
    }

    encoder.shutdown().await?;
    let file = encoder.into_inner();
    file.sync_all().await?;
    Ok(())
}

/// Copy `reader` into `writer`, hashing the bytes on the way through.
async fn copy_and_hash<R>(
    reader: &mut R,
    writer: &mut fs::File,
) -> std::io::Result<(ContentHash, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = ContentHash::hasher();
    let mut written = 0u64;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    Ok((hasher.finalize(), written))
}
