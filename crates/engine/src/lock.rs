//! The whole-repository exclusion lock.
//!
//! Peers coordinate through two files at the mount root: `sync.lock`, a
//! sentinel carrying an OS advisory lock, and `sync.lock.info`, a JSON
//! sidecar naming the holder and its operation. A crashed peer releases the
//! advisory lock automatically but leaves the files behind; the sidecar's
//! timestamp bounds how long a wedged-but-alive holder can block others.

use crate::error::{EngineError, EngineResult};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Sentinel file name at the mount root. May be zero-length.
pub const LOCK_FILE: &str = "sync.lock";

/// Holder info sidecar.
pub const LOCK_INFO_FILE: &str = "sync.lock.info";

/// A lock older than this is treated as abandoned and may be seized.
pub const STALE_AFTER: Duration = Duration::minutes(5);

const ACQUIRE_ATTEMPTS: u32 = 3;

/// The operation a lock holder is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Push,
    Pull,
    Restore,
    Gc,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Restore => "restore",
            Self::Gc => "gc",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `sync.lock.info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub machine_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_at: OffsetDateTime,
    pub operation: Operation,
}

impl LockInfo {
    fn is_stale(&self, now: OffsetDateTime) -> bool {
        now - self.locked_at > STALE_AFTER
    }
}

/// Held exclusion lock. Released explicitly or on drop.
pub struct ExclusionLock {
    // Keeps the advisory lock alive for the guard's lifetime.
    file: Option<File>,
    lock_path: PathBuf,
    info_path: PathBuf,
}

impl ExclusionLock {
    /// Acquire the lock for `machine` running `operation`.
    ///
    /// Bounded retry with jitter; persistent contention fails with
    /// `LockBusy` naming the holder from the info file. A holder whose info
    /// timestamp has aged past [`STALE_AFTER`] is seized.
    pub async fn acquire(
        mount: &Path,
        machine: &str,
        operation: Operation,
    ) -> EngineResult<Self> {
        let lock_path = mount.join(LOCK_FILE);
        let info_path = mount.join(LOCK_INFO_FILE);

        for attempt in 0..ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    if let Some(info) = read_info(&info_path) {
                        // The advisory subsystem reports unlocked but a
                        // sidecar remains: the holder crashed. Recovery is
                        // automatic.
                        warn!(
                            machine = %info.machine_name,
                            operation = %info.operation,
                            "recovering stale exclusion lock"
                        );
                    }
                    let info = LockInfo {
                        machine_name: machine.to_string(),
                        locked_at: OffsetDateTime::now_utc(),
                        operation,
                    };
                    let json = serde_json::to_vec_pretty(&info)
                        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
                    std::fs::write(&info_path, json)?;
                    debug!(machine, operation = %operation, "exclusion lock acquired");
                    return Ok(Self {
                        file: Some(file),
                        lock_path,
                        info_path,
                    });
                }
                Err(_) => {
                    let info = read_info(&info_path);
                    if let Some(ref info) = info {
                        if info.is_stale(OffsetDateTime::now_utc()) {
                            // Holder exceeded the recovery bound. Removing
                            // the sentinel invalidates its inode; the next
                            // attempt locks a fresh one.
                            warn!(
                                machine = %info.machine_name,
                                operation = %info.operation,
                                locked_at = %info.locked_at,
                                "seizing abandoned exclusion lock"
                            );
                            let _ = std::fs::remove_file(&info_path);
                            let _ = std::fs::remove_file(&lock_path);
                            continue;
                        }
                    }

                    if attempt + 1 == ACQUIRE_ATTEMPTS {
                        return Err(match info {
                            Some(info) => EngineError::LockBusy {
                                machine: info.machine_name,
                                operation: info.operation.to_string(),
                            },
                            None => EngineError::LockBusy {
                                machine: "unknown peer".to_string(),
                                operation: "unknown".to_string(),
                            },
                        });
                    }

                    let jitter_ms = rand::thread_rng().gen_range(1000..=3000);
                    tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                }
            }
        }

        // Seizure attempts exhausted the loop without a successful lock.
        Err(EngineError::LockStale {
            machine: read_info(&mount.join(LOCK_INFO_FILE))
                .map(|i| i.machine_name)
                .unwrap_or_else(|| "unknown peer".to_string()),
        })
    }

    /// Release: delete the info file, then drop the advisory lock. Info
    /// deletion failures are swallowed.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = std::fs::remove_file(&self.info_path);
            let _ = FileExt::unlock(&file);
            debug!(path = %self.lock_path.display(), "exclusion lock released");
        }
    }

    /// Read the current holder info, if any.
    pub fn holder(mount: &Path) -> Option<LockInfo> {
        read_info(&mount.join(LOCK_INFO_FILE))
    }

    /// Administrative recovery: remove info and sentinel unconditionally.
    pub fn force_release(mount: &Path) -> EngineResult<()> {
        let info_path = mount.join(LOCK_INFO_FILE);
        let lock_path = mount.join(LOCK_FILE);
        remove_if_present(&info_path)?;
        remove_if_present(&lock_path)?;
        Ok(())
    }
}

impl Drop for ExclusionLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable lock info file");
            None
        }
    }
}
