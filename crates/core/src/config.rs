//! Peer configuration.
//!
//! The peer config lives outside the shared mount (one file per
//! workstation). It binds the mount path, names the machine, and maps
//! project ids to this peer's local working copies. Local paths are
//! per-peer and never written to the shared catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-peer binding of a project to a local working copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectBinding {
    /// Local path of the working copy on this machine.
    pub local_path: PathBuf,
}

/// Per-peer configuration, stored as JSON outside the shared mount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Root of the shared network mount.
    pub nas_path: PathBuf,
    /// This peer's identity label (untrusted, for display and lock info).
    #[serde(default = "default_machine_name")]
    pub machine_name: String,
    /// Project id → local working copy.
    #[serde(default)]
    pub projects: HashMap<Uuid, ProjectBinding>,
    /// Concurrency limits.
    #[serde(default)]
    pub limits: SyncLimits,
}

fn default_machine_name() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
}

impl PeerConfig {
    /// Create a config bound to a mount, with the hostname as machine name.
    pub fn new(nas_path: impl Into<PathBuf>) -> Self {
        Self {
            nas_path: nas_path.into(),
            machine_name: default_machine_name(),
            projects: HashMap::new(),
            limits: SyncLimits::default(),
        }
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&data).map_err(|e| crate::Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.nas_path.as_os_str().is_empty() {
            return Err(crate::Error::Config("nas_path must not be empty".to_string()));
        }
        if self.machine_name.is_empty() {
            return Err(crate::Error::Config(
                "machine_name must not be empty".to_string(),
            ));
        }
        self.limits.validate()?;
        Ok(())
    }

    /// Local working copy for a project, if bound on this peer.
    pub fn local_path(&self, project_id: Uuid) -> Option<&Path> {
        self.projects.get(&project_id).map(|b| b.local_path.as_path())
    }

    /// Create a test configuration rooted at a temp mount.
    ///
    /// **For testing only.**
    pub fn for_testing(nas_path: impl Into<PathBuf>) -> Self {
        Self {
            nas_path: nas_path.into(),
            machine_name: "test-peer".to_string(),
            projects: HashMap::new(),
            limits: SyncLimits::default(),
        }
    }
}

/// Concurrency limits for scanning and transfer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SyncLimits {
    /// Files hashed concurrently during a scan.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Blobs transferred concurrently during push/pull/restore.
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
}

fn default_scan_concurrency() -> usize {
    crate::DEFAULT_SCAN_CONCURRENCY
}

fn default_transfer_concurrency() -> usize {
    crate::DEFAULT_TRANSFER_CONCURRENCY
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            scan_concurrency: default_scan_concurrency(),
            transfer_concurrency: default_transfer_concurrency(),
        }
    }
}

impl SyncLimits {
    /// Validate that limits are usable.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scan_concurrency == 0 {
            return Err(crate::Error::Config(
                "limits.scan_concurrency must be at least 1".to_string(),
            ));
        }
        if self.transfer_concurrency == 0 {
            return Err(crate::Error::Config(
                "limits.transfer_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
