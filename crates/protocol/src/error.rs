//! Error types for the protocol crate.

use thiserror::Error;

/// Error decoding a directory announcement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The URI does not use the `file://` scheme.
    #[error("not a file:// uri: {0}")]
    NotFileUri(String),

    /// The announced path is empty or does not start with `/`.
    #[error("path is not absolute: {0:?}")]
    RelativePath(String),

    /// The decoded path exceeds the accepted length.
    #[error("path too long: {len} bytes exceeds maximum of {max} bytes")]
    PathTooLong {
        /// Decoded path length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
