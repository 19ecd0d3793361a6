//! # Typed Store Errors
//!
//! Most functions in this crate return `eyre::Result` with context attached
//! at each layer (file name, operation, offsets). The error kinds below are
//! the cases callers need to tell apart programmatically: a corrupted file is
//! fatal and should be surfaced, a version mismatch means the file was
//! written by a newer release, a read-only store rejects mutation, and an
//! internal error is a bug in the caller or in this crate, never a user
//! error.
//!
//! Kinds convert into `eyre::Report` at the raise site, so a caller can
//! recover them with `report.downcast_ref::<StoreError>()`. Plain I/O
//! failures stay as wrapped `std::io::Error` values with the file name and
//! operation in the context chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Header mismatch, illegal page size, or a page id past the end of the
    /// file. Fatal: close the store and surface to the caller.
    #[error("file '{0}' is corrupted: {1}")]
    FileCorrupted(String, String),

    /// The file's read version is newer than this implementation understands.
    #[error("file '{0}' was written by a newer version and cannot be read")]
    FileVersion(String),

    /// Mutation attempted on a store opened (or downgraded) read-only.
    #[error("store '{0}' is open read-only")]
    ReadOnly(String),

    /// Invariant violation: duplicate delete, broken allocation state,
    /// missing reader. Indicates a bug, not a user error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A caller-supplied value is out of range, e.g. a record payload too
    /// large for a single page.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
