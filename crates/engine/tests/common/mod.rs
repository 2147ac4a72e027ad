//! Common test utilities and fixtures.

use depot_core::PeerConfig;
use depot_engine::Engine;
use std::path::{Path, PathBuf};

/// A shared mount plus working-copy directories for two peers.
pub struct TestRig {
    root: tempfile::TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join("mount")).unwrap();
        std::fs::create_dir_all(root.path().join("peer-a")).unwrap();
        std::fs::create_dir_all(root.path().join("peer-b")).unwrap();
        Self { root }
    }

    pub fn mount(&self) -> PathBuf {
        self.root.path().join("mount")
    }

    /// Working copy for a named peer.
    pub fn workdir(&self, peer: &str) -> PathBuf {
        self.root.path().join(peer)
    }

    /// Open an engine for a named peer against the shared mount.
    pub async fn engine(&self, peer: &str) -> Engine {
        let mut config = PeerConfig::for_testing(self.mount());
        config.machine_name = peer.to_string();
        Engine::open(config).await.expect("engine open")
    }
}

/// Write a file under a working copy, creating parent directories.
pub fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

/// Read a file under a working copy.
pub fn read_file(root: &Path, rel: &str) -> Vec<u8> {
    std::fs::read(root.join(rel)).unwrap()
}

/// Deterministic pseudo-random payload for binary-asset fixtures.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Count blobs currently present in the mount's object store.
pub fn blob_count(mount: &Path) -> usize {
    let objects = mount.join("objects");
    let mut count = 0;
    if let Ok(prefixes) = std::fs::read_dir(&objects) {
        for prefix in prefixes.flatten() {
            if let Ok(blobs) = std::fs::read_dir(prefix.path()) {
                count += blobs.flatten().count();
            }
        }
    }
    count
}
