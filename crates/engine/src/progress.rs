//! Progress reporting.
//!
//! Callbacks are advisory. Operations never depend on them for
//! correctness, and inside parallel transfer workers only completion
//! updates the aggregate byte count.

use std::sync::Arc;

/// A progress event emitted during an engine operation.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Scan advanced: cumulative file count and the path just processed.
    Scan { files: u64, path: String },
    /// Transfer advanced: cumulative logical bytes moved this operation.
    Transfer { bytes: u64 },
}

/// Shared progress callback.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
