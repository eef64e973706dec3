//! Status codes and the per-context error channel.
//!
//! # Invariants
//! - Every non-`Ok` outcome carries a retrievable message, and an errno when
//!   the failure originated at the I/O boundary.
//! - `Fatal` is sticky at the context level: once recorded, only `close` is a
//!   legal next operation.
//!
//! # Design Notes
//! - Operations return `Result<_, ArchiveError>`; contexts mirror the outcome
//!   into `status()`/`last_error()` so callers can also poll after the fact.
//! - The numeric values match the classic archive status contract so they can
//!   be surfaced over FFI-ish boundaries unchanged.

use std::fmt;
use std::io;

/// Outcome class for a single context operation.
///
/// `Retry` means the same operation may be retried. `Warn` is partial
/// success: the operation completed but something was degraded. `Failed`
/// aborts the current entry/operation while the context stays usable.
/// `Fatal` poisons the context.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    Eof = 1,
    Retry = -10,
    Warn = -20,
    Failed = -25,
    Fatal = -30,
}

impl Status {
    #[inline(always)]
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::Eof)
    }
}

/// Which layer produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Stream,
    Filter,
    Format,
    State,
    Extract,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Stream => "stream",
            Stage::Filter => "filter",
            Stage::Format => "format",
            Stage::State => "state",
            Stage::Extract => "extract",
        }
    }
}

/// Error value carried by every failing operation.
///
/// # Guarantees
/// - `status()` is never `Ok`/`Eof`.
/// - `errno()` is 0 unless the error wraps a platform error.
/// - The message names the failing stage and, where known, the entry path.
#[derive(Clone, Debug)]
pub struct ArchiveError {
    status: Status,
    stage: Stage,
    errno: i32,
    msg: String,
    path: Option<String>,
}

impl ArchiveError {
    pub fn new(status: Status, stage: Stage, msg: impl Into<String>) -> Self {
        debug_assert!(!status.is_ok());
        Self {
            status,
            stage,
            errno: 0,
            msg: msg.into(),
            path: None,
        }
    }

    pub fn warn(stage: Stage, msg: impl Into<String>) -> Self {
        Self::new(Status::Warn, stage, msg)
    }

    pub fn failed(stage: Stage, msg: impl Into<String>) -> Self {
        Self::new(Status::Failed, stage, msg)
    }

    pub fn fatal(stage: Stage, msg: impl Into<String>) -> Self {
        Self::new(Status::Fatal, stage, msg)
    }

    /// Wrap an I/O error, keeping its platform errno when present.
    pub fn io(status: Status, stage: Stage, ctx: &str, err: &io::Error) -> Self {
        let mut e = Self::new(status, stage, format!("{ctx}: {err}"));
        e.errno = err.raw_os_error().unwrap_or(0);
        e
    }

    /// Attach the offending entry path (kept on the first caller to set it).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Platform error number, 0 when not applicable.
    #[inline]
    pub fn errno(&self) -> i32 {
        self.errno
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.msg
    }

    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.status == Status::Fatal
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.as_str(), self.msg)?;
        if let Some(p) = &self.path {
            write!(f, " (entry {p:?})")?;
        }
        if self.errno != 0 {
            write!(f, " [errno {}]", self.errno)?;
        }
        Ok(())
    }
}

impl std::error::Error for ArchiveError {}
