//! Error taxonomy for the FVD core.
//!
//! A small set of error *kinds*, not one error type per call site.
//! Each component that needs its own detail (header validation, journal recovery, ...)
//! defines a focused `Snafu` enum and composes it into [`FvdError`] via `context(...)`,
//! the same pattern `vector-buffers` uses for `BufferError<T>`.

use std::io;

use snafu::Snafu;

use crate::header::HeaderError;
use crate::journal::JournalError;
use crate::table::TableError;

/// Top-level error returned by the public FVD surface.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FvdError {
    /// The host block layer failed a child read, write, or flush; propagated straight to
    /// the caller. The prefetcher disables itself permanently on the first `Io` error it
    /// sees.
    #[snafu(display("block backend I/O error during {op}: {source}"))]
    Io { op: &'static str, source: io::Error },

    /// Header magic/version mismatch, misaligned virtual size, or an inconsistent table
    /// on open. Fatal for `open()`; never raised afterwards.
    #[snafu(display("image format error: {source}"))]
    Format { source: HeaderError },

    /// Unclean shutdown with no journal to recover from.
    ///
    /// Fatal when opening in [`crate::state::OpenMode::Boot`]; permitted in
    /// [`crate::state::OpenMode::Maintenance`].
    #[snafu(display("journal is dirty and cannot be recovered (open in maintenance mode to bypass)"))]
    JournalDirty,

    /// A compact image could not grow to satisfy a chunk allocation.
    #[snafu(display("storage exhausted: need {needed} bytes, have {available} bytes"))]
    StorageExhausted { needed: u64, available: u64 },

    /// Caller-supplied range outside the device, a malformed iov, or a request larger
    /// than the configured maximum.
    #[snafu(display("invalid request: {reason}"))]
    Invalid { reason: String },

    /// A journal-specific failure (allocation, recycle, recovery).
    #[snafu(display("journal error: {source}"))]
    Journal { source: JournalError },

    /// A compact-table-specific failure.
    #[snafu(display("table error: {source}"))]
    Table { source: TableError },

    /// The request was cancelled by the caller before it completed.
    #[snafu(display("request was cancelled"))]
    Cancelled,
}

pub type Result<T, E = FvdError> = std::result::Result<T, E>;
