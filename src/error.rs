//! Classified ingest errors.
//!
//! Library call sites return [`IngestError`], a `thiserror` enum carrying one
//! of the error kinds from the design: each variant says whether it is
//! retried, skipped, or fatal to the run. The CLI binary collapses these into
//! `anyhow::Error` at the top level the same way `main.rs` does for the rest
//! of the ambient stack.

use std::fmt;
use std::path::PathBuf;

/// One of the seven classified error kinds a run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/unreadable root, non-positive chunk size, bad configuration. Never retried.
    InvalidInput,
    /// Read error, queue-full, allocation failure, catalog connection blip. Retried per policy.
    TransientIO,
    /// Snapshot or chunk row not visible yet to the committing transaction.
    ReferentialIntegrity,
    /// NoSuchFile / AccessDenied observed during scan or chunking. Counted as skipped, not errored.
    FileVanishedOrDenied,
    /// File size differed between the whole-file hash pass and the per-chunk read pass.
    FileChangedDuringScan,
    /// Cooperative cancellation observed before completion.
    Cancelled,
    /// Snapshot creation/verification failed, catalog unavailable, pool closed. Aborts the run.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::TransientIO => "transient I/O",
            ErrorKind::ReferentialIntegrity => "referential integrity",
            ErrorKind::FileVanishedOrDenied => "file vanished or denied",
            ErrorKind::FileChangedDuringScan => "file changed during scan",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Per-file errors of this kind are counted as *skipped*, not *errored*.
    pub fn is_skip(&self) -> bool {
        matches!(self, ErrorKind::FileVanishedOrDenied)
    }

    /// Whether the caller may retry an operation that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIO | ErrorKind::ReferentialIntegrity)
    }
}

/// A classified ingest error: kind, optional path, message, and cause chain.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}: {message}", .path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
pub struct IngestError {
    pub kind: ErrorKind,
    pub path: Option<PathBuf>,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIO, message)
    }

    pub fn referential_integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReferentialIntegrity, message)
    }

    pub fn vanished_or_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileVanishedOrDenied, message)
    }

    pub fn changed_during_scan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileChangedDuringScan, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by caller")
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        match e.kind() {
            IoKind::NotFound | IoKind::PermissionDenied => {
                IngestError::vanished_or_denied(e.to_string()).with_cause(e)
            }
            _ => IngestError::transient_io(e.to_string()).with_cause(e),
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        IngestError::transient_io(e.to_string()).with_cause(e)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_classification_matches_spec() {
        assert!(ErrorKind::FileVanishedOrDenied.is_skip());
        assert!(!ErrorKind::FileChangedDuringScan.is_skip());
        assert!(!ErrorKind::Fatal.is_skip());
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TransientIO.is_retryable());
        assert!(ErrorKind::ReferentialIntegrity.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn display_includes_path_when_set() {
        let e = IngestError::invalid_input("bad chunk size").with_path("/tmp/x");
        let s = e.to_string();
        assert!(s.contains("invalid input"));
        assert!(s.contains("/tmp/x"));
    }

    #[test]
    fn io_not_found_maps_to_vanished_or_denied() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let e: IngestError = io.into();
        assert_eq!(e.kind, ErrorKind::FileVanishedOrDenied);
    }
}
