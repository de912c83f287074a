/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export allocator errors from the memory module
pub use crate::memory::{AuditViolation, MemoryError, MemoryResult};

/// Mutex and wait errors with serialization support
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SyncError {
    #[error("Owner {owner} already holds this non-recursive mutex")]
    #[diagnostic(
        code(sync::deadlock),
        help("Relocking a non-recursive mutex from its holder can never succeed. Use a recursive mutex or release first.")
    )]
    Deadlock { owner: u64 },

    #[error("Owner {caller} cannot unlock a mutex held by {owner:?}")]
    #[diagnostic(
        code(sync::not_owner),
        help("Only the recorded owner may unlock. The mutex state was left unchanged.")
    )]
    NotOwner { caller: u64, owner: Option<u64> },

    #[error("Wait interrupted by attention signal {level}")]
    #[diagnostic(
        code(sync::interrupted),
        help("A cancellation token was raised while blocked. Abort the operation cooperatively.")
    )]
    Interrupted { level: u8 },

    #[error("Timed out waiting for mutex")]
    #[diagnostic(code(sync::timed_out))]
    TimedOut,

    #[error("Wait primitive failed with errno {errno}")]
    #[diagnostic(
        code(sync::wait_failed),
        help("The platform wait call reported an unexpected error.")
    )]
    WaitFailed { errno: i32 },
}

/// Result type for mutex operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Unified error type with miette diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum HeapcoreError {
    #[error("Memory error: {0}")]
    #[diagnostic(transparent)]
    Memory(#[from] MemoryError),

    #[error("Sync error: {0}")]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),
}
