//! Error types for the storage layer.

use std::path::PathBuf;

use thiserror::Error;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup of a sequence number the log does not contain.
    #[error("no record with sequence {0}")]
    NoSuchSeq(i64),

    /// An explicit append sequence that does not continue the log.
    #[error("sequence {given} does not continue log end {end}")]
    NonMonotonicSeq { given: i64, end: i64 },

    /// A key unusable as a file name (traversal, separator, reserved).
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Lookup of an absent key where presence is required.
    #[error("no value for key {0:?}")]
    NoSuchKey(String),

    /// A persisted record names a factory tag nobody registered.
    #[error("unknown factory tag {0:?}")]
    UnknownTag(String),

    /// A persisted record that does not decode.
    #[error("malformed persisted record: {0}")]
    Decode(#[from] serde_json::Error),

    /// A segment file in a state the scanner cannot work with. Fatal to
    /// that shard's startup.
    #[error("corrupt segment {}: {reason}", path.display())]
    CorruptSegment { path: PathBuf, reason: String },
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
