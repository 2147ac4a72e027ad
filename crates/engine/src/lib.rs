//! Synchronization engine for Depot.
//!
//! This crate drives version-controlled synchronization of project trees
//! over a passive shared mount:
//! - gitignore-style filtering with built-in and per-project patterns
//! - Tree scanning with a persistent mtime/size hash cache
//! - The whole-repository exclusion lock peers coordinate through
//! - Manifest diffing, conflict detection, and bounded parallel transfer
//! - The top-level `push`, `pull`, `restore`, `status`, and `gc` operations
//!
//! The engine is headless; shells (desktop or CLI) are thin callers.

pub mod engine;
pub mod error;
pub mod ignore;
pub mod lock;
pub mod progress;
pub mod scanner;
pub mod transfer;

pub use engine::{
    Conflict, Engine, GcOutcome, PullOutcome, PushOutcome, Resolution, RestoreOutcome,
    StatusOutcome,
};
pub use error::{EngineError, EngineResult};
pub use ignore::{IgnoreMatcher, IncludeMatcher};
pub use lock::{ExclusionLock, LockInfo, Operation};
pub use progress::{ProgressEvent, ProgressFn};
pub use scanner::{ScanResult, Scanner};
pub use transfer::TransferFailure;
