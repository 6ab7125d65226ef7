//! # Error Taxonomy
//!
//! Every fallible operation in jotbase returns [`StorageError`], a closed
//! taxonomy callers can pattern-match. The variants separate the distinct
//! failure classes of the storage core:
//!
//! - Path resolution and file opening (`InvalidPath`, `CannotOpen`)
//! - Interprocess ownership (`AlreadyInUse`)
//! - OS-level I/O (`Io`)
//! - Programmer errors on page offsets (`MisalignedOffset`,
//!   `OffsetOutOfBounds`); callers should treat these as unrecoverable
//! - Resource exhaustion (`CacheExhausted`, `OutOfMemory`), recoverable by
//!   dropping page handles
//!
//! [`RetCode`] is the flat status-code view of the taxonomy kept for
//! compatibility with the storage wire/FFI surface; [`StorageError::ret_code`]
//! maps every variant onto it.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat status codes surfaced at the storage boundary.
///
/// The spelling is load-bearing: embedders that speak the storage status
/// protocol match on these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    Ok,
    UnknownError,
    InsufficientMemory,
    InvalidHandle,
    InvalidFilePath,
    CannotOpenFile,
    AlreadyInUse,
    IoError,
    Overloaded,
}

/// Errors produced by the storage core.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The input path could not be resolved to an absolute path.
    #[error("invalid storage path '{path}': {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The OS refused to open or create the storage file.
    #[error("cannot open storage file '{path}': {source}")]
    CannotOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another instance (in this or another process) owns the file.
    #[error("storage file '{path}' is already in use")]
    AlreadyInUse { path: PathBuf },

    /// A size query, resize, map, or flush failed at the OS level.
    #[error("storage I/O failed: {detail}")]
    Io {
        detail: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A page offset that is not a multiple of the page size.
    #[error("offset {offset} is not aligned to the page size {page_size}")]
    MisalignedOffset { offset: u64, page_size: u64 },

    /// A page offset whose page does not lie inside the file.
    #[error("offset {offset} is out of bounds for a file of {size} bytes")]
    OffsetOutOfBounds { offset: u64, size: u64 },

    /// Every descriptor in the fixed page pool is referenced.
    #[error("page cache exhausted: all {capacity} descriptors are in use")]
    CacheExhausted { capacity: usize },

    /// Heap allocation for an internal structure failed.
    #[error("out of memory: {detail}")]
    OutOfMemory { detail: String },

    /// A tunable was set to a value the core cannot operate with.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// A handle that does not refer to an open volume.
    ///
    /// Not produced by the core itself; reserved for the registry layer that
    /// sits on top of it, so the whole taxonomy lives in one place.
    #[error("handle does not refer to an open volume")]
    InvalidHandle,

    /// Anything the OS reported that fits no other class.
    #[error("{detail}")]
    Unknown { detail: String },
}

impl StorageError {
    /// Maps the error onto the flat status-code surface.
    pub fn ret_code(&self) -> RetCode {
        match self {
            StorageError::InvalidPath { .. } => RetCode::InvalidFilePath,
            StorageError::CannotOpen { .. } => RetCode::CannotOpenFile,
            StorageError::AlreadyInUse { .. } => RetCode::AlreadyInUse,
            StorageError::Io { .. } => RetCode::IoError,
            // Logic errors surface misuse, not state; they have no
            // dedicated status code.
            StorageError::MisalignedOffset { .. }
            | StorageError::OffsetOutOfBounds { .. }
            | StorageError::InvalidConfig { .. } => RetCode::UnknownError,
            StorageError::CacheExhausted { .. } => RetCode::Overloaded,
            StorageError::OutOfMemory { .. } => RetCode::InsufficientMemory,
            StorageError::InvalidHandle => RetCode::InvalidHandle,
            StorageError::Unknown { .. } => RetCode::UnknownError,
        }
    }

    /// True for programmer errors (misuse of the offset contract) that no
    /// retry or resource release can fix.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            StorageError::MisalignedOffset { .. }
                | StorageError::OffsetOutOfBounds { .. }
                | StorageError::InvalidConfig { .. }
        )
    }

    pub(crate) fn io(detail: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            detail: detail.into(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_code_mapping() {
        let err = StorageError::InvalidPath {
            path: PathBuf::from("/nope"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(err.ret_code(), RetCode::InvalidFilePath);

        let err = StorageError::AlreadyInUse {
            path: PathBuf::from("./foo.jb"),
        };
        assert_eq!(err.ret_code(), RetCode::AlreadyInUse);

        let err = StorageError::CacheExhausted { capacity: 8 };
        assert_eq!(err.ret_code(), RetCode::Overloaded);

        let err = StorageError::OutOfMemory {
            detail: "pool".into(),
        };
        assert_eq!(err.ret_code(), RetCode::InsufficientMemory);

        assert_eq!(StorageError::InvalidHandle.ret_code(), RetCode::InvalidHandle);
    }

    #[test]
    fn logic_errors_are_flagged() {
        let err = StorageError::MisalignedOffset {
            offset: 1,
            page_size: 4096,
        };
        assert!(err.is_logic_error());
        assert_eq!(err.ret_code(), RetCode::UnknownError);

        let err = StorageError::OffsetOutOfBounds {
            offset: 4096,
            size: 4096,
        };
        assert!(err.is_logic_error());

        let err = StorageError::Io {
            detail: "truncate failed".into(),
            source: None,
        };
        assert!(!err.is_logic_error());
    }

    #[test]
    fn messages_carry_context() {
        let err = StorageError::MisalignedOffset {
            offset: 17,
            page_size: 4096,
        };
        let text = err.to_string();
        assert!(text.contains("17"));
        assert!(text.contains("4096"));
    }
}
