/*!
 * Heap Audit
 *
 * Consistency checks over headers and free lists. A failed check means the
 * heap is corrupt, so live paths treat it as fatal; `Heap::check_free_pool`
 * returns the first violation as a value instead.
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// How much checking the heap does on its hot paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditMode {
    /// No checks beyond header decoding
    Off,
    /// Double-free, poisoned usecount and tag checks on every free/lower
    Checked,
    /// `Checked`, plus a full free-pool walk after every collection
    Paranoid,
}

impl AuditMode {
    #[inline]
    pub fn enabled(self) -> bool {
        !matches!(self, AuditMode::Off)
    }
}

impl Default for AuditMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            AuditMode::Checked
        } else {
            AuditMode::Off
        }
    }
}

/// What a live audit failure does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViolationAction {
    /// Log and abort the process
    #[default]
    Abort,
    /// Log and panic (for tests)
    Panic,
}

/// A detected inconsistency
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Diagnostic)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum AuditViolation {
    #[error("block {addr:#x} on the class {list} free list is tagged class {tag}")]
    #[diagnostic(code(audit::wrong_class))]
    WrongClass { addr: usize, list: u8, tag: u8 },

    #[error("block {addr:#x} is on a free list but not tagged free")]
    #[diagnostic(code(audit::not_free))]
    NotFree { addr: usize },

    #[error("block {addr:#x} was lowered with a poisoned usecount")]
    #[diagnostic(
        code(audit::poisoned_usecount),
        help("The block was already released; some caller kept a stale handle.")
    )]
    PoisonedUsecount { addr: usize },

    #[error("free list of class {class} loops")]
    #[diagnostic(code(audit::list_loop))]
    ListLoop { class: u8 },

    #[error("block {addr:#x} has an unreadable header tag {raw:#x}")]
    #[diagnostic(code(audit::bad_tag))]
    BadTag { addr: usize, raw: u32 },

    #[error("block {addr:#x} freed twice")]
    #[diagnostic(code(audit::double_free))]
    DoubleFree { addr: usize },

    #[error("block {addr:#x} lowered below zero")]
    #[diagnostic(code(audit::underflow))]
    Underflow { addr: usize },

    #[error("block {addr:#x} arrived from another heap's mailbox")]
    #[diagnostic(code(audit::misdelivered))]
    Misdelivered { addr: usize },
}

impl AuditViolation {
    /// Stable numeric code for introspection
    pub fn code(&self) -> u8 {
        match self {
            AuditViolation::WrongClass { .. } => 1,
            AuditViolation::NotFree { .. } => 2,
            AuditViolation::PoisonedUsecount { .. } => 3,
            AuditViolation::ListLoop { .. } => 4,
            AuditViolation::BadTag { .. } => 5,
            AuditViolation::DoubleFree { .. } => 6,
            AuditViolation::Underflow { .. } => 7,
            AuditViolation::Misdelivered { .. } => 8,
        }
    }
}

/// Report a violation found on a live path; never returns
#[cold]
#[inline(never)]
pub(crate) fn fatal(action: ViolationAction, violation: AuditViolation) -> ! {
    error!(code = violation.code(), %violation, "heap audit failed");
    match action {
        ViolationAction::Panic => panic!("heap audit failed: {violation}"),
        ViolationAction::Abort => std::process::abort(),
    }
}
