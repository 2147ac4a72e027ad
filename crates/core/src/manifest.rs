//! Manifests, the manifest digest, and manifest diffing.
//!
//! A manifest is the set of file entries belonging to one snapshot. Its
//! digest is SHA-256 over the UTF-8 records `path\tcontent-hash\n`, entries
//! ordered by bytewise path comparison, and is the canonical identity of
//! tree content.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Check that a string is a well-formed manifest path: project-relative,
/// `/`-separated, with no empty, `.`, or `..` segments.
///
/// Manifest rows read back from the shared mount are not trusted; a path
/// like `../x` must never reach the filesystem.
pub fn validate_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(crate::Error::InvalidPath("empty path".to_string()));
    }
    if path.contains('\\') {
        return Err(crate::Error::InvalidPath(format!(
            "backslash in path: {path}"
        )));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(crate::Error::InvalidPath(format!(
            "path must be relative with no trailing slash: {path}"
        )));
    }
    for segment in path.split('/') {
        match segment {
            "" => {
                return Err(crate::Error::InvalidPath(format!(
                    "empty segment in path: {path}"
                )));
            }
            "." | ".." => {
                return Err(crate::Error::InvalidPath(format!(
                    "path escapes its root: {path}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// One file in a manifest.
///
/// Paths are project-relative, `/`-separated, and case-sensitive. `size` is
/// the logical (uncompressed) byte count; the on-disk size of the backing
/// blob is a storage concern and never appears here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

/// A SHA-256 manifest digest (64 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ManifestDigest([u8; 32]);

impl ManifestDigest {
    /// Compute the digest over a set of entries, in canonical order.
    ///
    /// The result is invariant under permutation of the input.
    pub fn compute<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a FileEntry>,
    {
        let mut records: Vec<(&str, ContentHash)> = entries
            .into_iter()
            .map(|e| (e.path.as_str(), e.hash))
            .collect();
        records.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut hasher = Sha256::new();
        for (path, hash) in records {
            hasher.update(path.as_bytes());
            hasher.update(b"\t");
            hasher.update(hash.to_hex().as_bytes());
            hasher.update(b"\n");
        }
        Self(hasher.finalize().into())
    }

    /// Parse from a 64-char hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<ManifestDigest> for String {
    fn from(digest: ManifestDigest) -> String {
        digest.to_hex()
    }
}

impl TryFrom<String> for ManifestDigest {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::from_hex(&s)
    }
}

impl fmt::Debug for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The set of file entries belonging to one snapshot, keyed by path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, FileEntry>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from entries. Later duplicates of a path win.
    pub fn from_entries(entries: impl IntoIterator<Item = FileEntry>) -> Self {
        let mut manifest = Self::new();
        for entry in entries {
            manifest.insert(entry);
        }
        manifest
    }

    /// Insert an entry, replacing any previous entry at the same path.
    pub fn insert(&mut self, entry: FileEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Look up an entry by path.
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    /// Iterate entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of logical sizes over all entries.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Compute the canonical manifest digest.
    pub fn digest(&self) -> ManifestDigest {
        ManifestDigest::compute(self.entries.values())
    }

    /// Verify the digest matches an expected value.
    pub fn verify_digest(&self, expected: &ManifestDigest) -> crate::Result<()> {
        let computed = self.digest();
        if &computed != expected {
            return Err(crate::Error::HashMismatch {
                expected: expected.to_hex(),
                actual: computed.to_hex(),
            });
        }
        Ok(())
    }

    /// Compare a local manifest against a remote one.
    pub fn diff(local: &Manifest, remote: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, entry) in &local.entries {
            match remote.entries.get(path) {
                None => diff.added.push(entry.clone()),
                Some(theirs) if theirs.hash != entry.hash => diff.modified.push(entry.clone()),
                Some(_) => diff.unchanged.push(path.clone()),
            }
        }
        for (path, entry) in &remote.entries {
            if !local.entries.contains_key(path) {
                diff.deleted.push(entry.clone());
            }
        }
        diff
    }
}

/// Result of comparing a local manifest `L` against a remote manifest `R`.
///
/// `added` and `modified` carry local entries; `deleted` carries the remote
/// entries with no local counterpart.
#[derive(Clone, Debug, Default)]
pub struct ManifestDiff {
    pub added: Vec<FileEntry>,
    pub modified: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
    pub unchanged: Vec<String>,
}

impl ManifestDiff {
    /// Whether local and remote describe identical content.
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Entries whose blobs a push must make durable: added ∪ modified.
    pub fn outgoing(&self) -> impl Iterator<Item = &FileEntry> {
        self.added.iter().chain(self.modified.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, data: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: ContentHash::compute(data),
            size: data.len() as u64,
            modified_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_digest_invariant_under_permutation() {
        let a = entry("a.txt", b"one");
        let b = entry("dir/b.bin", b"two");
        let c = entry("z.txt", b"three");

        let forward = ManifestDigest::compute([&a, &b, &c]);
        let backward = ManifestDigest::compute([&c, &a, &b]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_digest_depends_on_content() {
        let base = ManifestDigest::compute([&entry("a.txt", b"one")]);
        let other_hash = ManifestDigest::compute([&entry("a.txt", b"two")]);
        let other_path = ManifestDigest::compute([&entry("b.txt", b"one")]);
        assert_ne!(base, other_hash);
        assert_ne!(base, other_path);
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = ManifestDigest::compute([&entry("a", b"x")]);
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ManifestDigest::from_hex(&hex).unwrap(), digest);
    }

    #[test]
    fn test_diff_partitions_paths() {
        let local = Manifest::from_entries([
            entry("same.txt", b"same"),
            entry("changed.txt", b"new"),
            entry("added.txt", b"fresh"),
        ]);
        let remote = Manifest::from_entries([
            entry("same.txt", b"same"),
            entry("changed.txt", b"old"),
            entry("removed.txt", b"gone"),
        ]);

        let diff = Manifest::diff(&local, &remote);
        assert_eq!(
            diff.added.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            ["added.txt"]
        );
        assert_eq!(
            diff.modified.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            ["changed.txt"]
        );
        assert_eq!(
            diff.deleted.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            ["removed.txt"]
        );
        assert_eq!(diff.unchanged, ["same.txt"]);
        assert!(!diff.is_clean());
    }

    #[test]
    fn test_diff_against_empty_remote() {
        let local = Manifest::from_entries([entry("a", b"1"), entry("b", b"2")]);
        let diff = Manifest::diff(&local, &Manifest::new());
        assert_eq!(diff.added.len(), 2);
        assert!(diff.modified.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_identical_manifests_are_clean() {
        let manifest = Manifest::from_entries([entry("a", b"1")]);
        let diff = Manifest::diff(&manifest, &manifest.clone());
        assert!(diff.is_clean());
        assert_eq!(diff.unchanged, ["a"]);
    }

    #[test]
    fn test_paths_preserved_exactly() {
        let spaced = entry("dir with space/ünïcode ファイル.Bin", b"data");
        let manifest = Manifest::from_entries([spaced.clone()]);
        assert_eq!(
            manifest.get("dir with space/ünïcode ファイル.Bin"),
            Some(&spaced)
        );
        // Case matters.
        assert!(manifest.get("dir with space/ünïcode ファイル.bin").is_none());
    }

    #[test]
    fn test_validate_path_accepts_ordinary_trees() {
        assert!(validate_path("a.txt").is_ok());
        assert!(validate_path("dir/sub/b.bin").is_ok());
        assert!(validate_path("dir with space/ünïcode ファイル.Bin").is_ok());
        // A segment merely containing dots is fine.
        assert!(validate_path("archive.tar.gz").is_ok());
        assert!(validate_path("dir/..hidden").is_ok());
    }

    #[test]
    fn test_validate_path_rejects_malformed_paths() {
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("dir/").is_err());
        assert!(validate_path("dir//file").is_err());
        assert!(validate_path("dir\\file").is_err());
        assert!(validate_path("./file").is_err());
        assert!(validate_path("../escape").is_err());
        assert!(validate_path("dir/../escape").is_err());
    }

    #[test]
    fn test_total_size_and_len() {
        let manifest = Manifest::from_entries([entry("a", b"12345"), entry("b", b"123")]);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.total_size(), 8);
    }
}
