//! Error types for pario.

use thiserror::Error;

/// Result type alias using pario's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pario operations.
///
/// Errors are never swallowed: every call site reports the error through
/// the diagnostic channel (see [`report`]) and returns the code to its
/// caller. A failed write leaves still-queued multi-buffer contents in
/// place so a retry with corrected arguments is possible, but releases
/// every scratch buffer the call itself acquired.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown file, variable, or decomposition id.
    #[error("unknown {kind} id: {id}")]
    BadId {
        /// What kind of object the id was supposed to name.
        kind: &'static str,
        /// The offending id.
        id: i32,
    },

    /// Argument out of range or structurally inconsistent.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Write attempted on a file not opened for write.
    #[error("file not open for writing")]
    Permission,

    /// Buffer pool or system allocator failed.
    #[error("buffer pool exhausted: requested {requested} bytes, largest free block {maxfree}")]
    OutOfMemory {
        /// Bytes the caller asked for.
        requested: usize,
        /// Largest contiguous free block at the time of the request.
        maxfree: usize,
    },

    /// Unknown backend tag.
    #[error("unknown backend tag: {0}")]
    BadIoType(i32),

    /// Fill defaulting attempted for an element type without a default.
    #[error("no default fill value for element type: {0}")]
    BadElementType(String),

    /// Underlying communication failure. Carries the decoded reason.
    #[error("communication failure with rank {peer} (tag {tag}): {reason}")]
    Comm {
        /// Peer rank the operation involved.
        peer: usize,
        /// Message tag in flight.
        tag: u64,
        /// Decoded failure description.
        reason: String,
    },

    /// Pass-through from the file-format backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Report an error into the diagnostic sink and hand it back.
///
/// The moral equivalent of the classic `(kind, file, line)` error funnel:
/// call sites write `Err(report(Error::Permission))` and the failure is
/// traced with its source location before propagating.
#[track_caller]
pub(crate) fn report(err: Error) -> Error {
    let loc = std::panic::Location::caller();
    tracing::error!("{err} ({}:{})", loc.file(), loc.line());
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BadId {
            kind: "decomposition",
            id: 42,
        };
        assert_eq!(err.to_string(), "unknown decomposition id: 42");

        let err = Error::OutOfMemory {
            requested: 4096,
            maxfree: 128,
        };
        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("128"));
    }

    #[test]
    fn test_report_passthrough() {
        let err = report(Error::Permission);
        assert!(matches!(err, Error::Permission));
    }
}
