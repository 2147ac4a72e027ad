//! Ignore pattern matching.
//!
//! Pattern sources, in order:
//! 1. Built-in defaults (always active)
//! 2. The Unreal Engine overlay, when the project root contains a
//!    `.uproject` file
//! 3. `.syncignore` at the project root
//!
//! All sources use gitignore syntax: `#` comments, `!` negation, trailing
//! `/` for directories, leading `/` for anchoring, `**` for any segments.
//! Paths are normalized to forward slashes before matching.

use crate::error::EngineResult;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use tracing::warn;

/// Always-ignored patterns for any project.
const DEFAULT_PATTERNS: &[&str] = &[
    ".sync/",
    ".git/",
    "node_modules/",
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    "*.log",
    "*.tmp",
    "*.temp",
    "*~",
];

/// Extra patterns for Unreal Engine projects: generated trees and IDE
/// droppings that must never travel between peers.
const UNREAL_PATTERNS: &[&str] = &[
    "Binaries/",
    "Intermediate/",
    "DerivedDataCache/",
    "Saved/",
    ".vs/",
    ".idea/",
    ".vscode/",
    "*.sln",
    "*.suo",
    "*.VC.db",
    "*.opendb",
];

/// Name of the per-project extra-patterns file.
const SYNCIGNORE_FILE: &str = ".syncignore";

/// Gitignore-style matcher over an ordered pattern list.
pub struct IgnoreMatcher {
    patterns: Vec<String>,
    matcher: Gitignore,
}

impl IgnoreMatcher {
    /// Build a matcher from explicit patterns only.
    pub fn from_patterns<I, S>(patterns: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let matcher = build(&patterns)?;
        Ok(Self { patterns, matcher })
    }

    /// Build the matcher for a project root: defaults, the Unreal overlay
    /// when applicable, then `.syncignore` contributions.
    pub fn for_root(root: &Path) -> EngineResult<Self> {
        let mut patterns: Vec<String> = DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect();

        if is_unreal_project(root) {
            patterns.extend(UNREAL_PATTERNS.iter().map(|s| s.to_string()));
        }

        let syncignore = root.join(SYNCIGNORE_FILE);
        if syncignore.exists() {
            match std::fs::read_to_string(&syncignore) {
                Ok(contents) => {
                    patterns.extend(contents.lines().map(|l| l.to_string()));
                }
                Err(e) => {
                    warn!(path = %syncignore.display(), error = %e, "failed to read .syncignore");
                }
            }
        }

        Self::from_patterns(patterns)
    }

    /// Append patterns, rebuilding the matcher.
    pub fn add<I, S>(&mut self, patterns: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self.matcher = build(&self.patterns)?;
        Ok(())
    }

    /// Whether a slash-separated relative path is ignored.
    ///
    /// A path inside an ignored directory is ignored too.
    pub fn ignores(&self, path: &str, is_dir: bool) -> bool {
        let path = path.replace('\\', "/");
        self.matcher
            .matched_path_or_any_parents(Path::new(&path), is_dir)
            .is_ignore()
    }

    /// Keep only the non-ignored paths (treating each as a file).
    pub fn filter<'a, I>(&self, paths: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter(|p| !self.ignores(p, false))
            .collect()
    }
}

/// Selective-sync include filter.
///
/// A path participates in pull/restore iff it matches at least one include
/// pattern; everything else is skipped entirely, downloads and deletions
/// alike.
pub struct IncludeMatcher {
    matcher: Gitignore,
}

impl IncludeMatcher {
    /// Build from gitignore-syntax include patterns.
    pub fn from_patterns<I, S>(patterns: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        Ok(Self {
            matcher: build(&patterns)?,
        })
    }

    /// Whether a path matches at least one include pattern.
    pub fn includes(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        self.matcher
            .matched_path_or_any_parents(Path::new(&path), false)
            .is_ignore()
    }
}

fn build(patterns: &[String]) -> EngineResult<Gitignore> {
    let mut builder = GitignoreBuilder::new("");
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| depot_core::Error::Config(format!("bad ignore pattern: {e}")))?;
    }
    Ok(builder
        .build()
        .map_err(|e| depot_core::Error::Config(format!("ignore matcher: {e}")))?)
}

fn is_unreal_project(root: &Path) -> bool {
    std::fs::read_dir(root)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(".uproject")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_sync_and_vcs_dirs() {
        let matcher = IgnoreMatcher::from_patterns(DEFAULT_PATTERNS.iter().copied()).unwrap();
        assert!(matcher.ignores(".sync/cache.json", false));
        assert!(matcher.ignores(".git/objects/ab/cd", false));
        assert!(matcher.ignores("web/node_modules/left-pad/index.js", false));
        assert!(matcher.ignores("logs/build.log", false));
        assert!(matcher.ignores(".DS_Store", false));
        assert!(!matcher.ignores("src/main.rs", false));
        assert!(!matcher.ignores("Content/map.umap", false));
    }

    #[test]
    fn test_negation_and_anchor_patterns() {
        let matcher =
            IgnoreMatcher::from_patterns(["*.log", "!keep.log", "/top.txt", "build/"]).unwrap();
        assert!(matcher.ignores("debug.log", false));
        assert!(!matcher.ignores("keep.log", false));
        assert!(matcher.ignores("top.txt", false));
        assert!(!matcher.ignores("nested/top.txt", false));
        assert!(matcher.ignores("build", true));
        assert!(matcher.ignores("build/output.bin", false));
    }

    #[test]
    fn test_double_star_spans_segments() {
        let matcher = IgnoreMatcher::from_patterns(["docs/**/draft.md"]).unwrap();
        assert!(matcher.ignores("docs/draft.md", false));
        assert!(matcher.ignores("docs/a/b/draft.md", false));
        assert!(!matcher.ignores("src/draft.md", false));
    }

    #[test]
    fn test_backslashes_normalized() {
        let matcher = IgnoreMatcher::from_patterns(["build/"]).unwrap();
        assert!(matcher.ignores("build\\output.bin", false));
    }

    #[test]
    fn test_unreal_overlay_applies_with_uproject() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("Shooter.uproject"), b"{}").unwrap();

        let matcher = IgnoreMatcher::for_root(temp.path()).unwrap();
        assert!(matcher.ignores("Binaries/Win64/Shooter.exe", false));
        assert!(matcher.ignores("Intermediate/Build/x.obj", false));
        assert!(matcher.ignores("DerivedDataCache/DDC.ddp", false));
        assert!(matcher.ignores("Saved/Logs/Shooter.log", false));
        assert!(matcher.ignores("Shooter.sln", false));
        assert!(!matcher.ignores("Content/Maps/Arena.umap", false));
        assert!(!matcher.ignores("Source/Shooter/Shooter.cpp", false));
    }

    #[test]
    fn test_unreal_overlay_absent_without_uproject() {
        let temp = tempfile::tempdir().unwrap();
        let matcher = IgnoreMatcher::for_root(temp.path()).unwrap();
        assert!(!matcher.ignores("Binaries/tool", false));
        assert!(!matcher.ignores("Saved/data.bin", false));
    }

    #[test]
    fn test_syncignore_contributes_after_defaults() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join(".syncignore"),
            "# local-only stuff\n*.psd\nRecordings/\n",
        )
        .unwrap();

        let matcher = IgnoreMatcher::for_root(temp.path()).unwrap();
        assert!(matcher.ignores("art/source.psd", false));
        assert!(matcher.ignores("Recordings/take1.mp4", false));
        // Defaults still hold.
        assert!(matcher.ignores(".sync/cache.json", false));
        assert!(!matcher.ignores("art/source.png", false));
    }

    #[test]
    fn test_filter_and_add() {
        let mut matcher = IgnoreMatcher::from_patterns(["*.tmp"]).unwrap();
        let kept = matcher.filter(["a.txt", "b.tmp", "c.bin"]);
        assert_eq!(kept, ["a.txt", "c.bin"]);

        matcher.add(["*.bin"]).unwrap();
        let kept = matcher.filter(["a.txt", "b.tmp", "c.bin"]);
        assert_eq!(kept, ["a.txt"]);
    }

    #[test]
    fn test_include_matcher_selects_subtrees() {
        let include = IncludeMatcher::from_patterns(["Content/**"]).unwrap();
        assert!(include.includes("Content/x.uasset"));
        assert!(include.includes("Content/Maps/Arena.umap"));
        assert!(!include.includes("Source/y.cpp"));
        assert!(!include.includes("Saved/z.log"));
    }
}
