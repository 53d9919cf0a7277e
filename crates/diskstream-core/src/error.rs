//! Error types for the diskstream core library.

use std::path::PathBuf;

/// The main error type for conversion operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Malformed or unsupported stream-optimized VMDK data.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },

    /// Malformed or unsupported QCOW2 data.
    #[error("QCOW2 error: {message}")]
    Qcow2 { message: String },

    /// zlib or raw-deflate payload could not be decoded.
    #[error("decompression error: {message}")]
    Decompress { message: String },

    /// The reader violated the block stream contract.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The conversion was cancelled by the caller.
    #[error("conversion cancelled")]
    Cancelled,
}

/// A specialized Result type for conversion operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a VMDK format error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }

    /// Create a QCOW2 format error.
    pub fn qcow2(message: impl Into<String>) -> Self {
        Self::Qcow2 {
            message: message.into(),
        }
    }

    /// Create a decompression error.
    pub fn decompress(message: impl Into<String>) -> Self {
        Self::Decompress {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// True if this error reports caller-initiated cancellation rather
    /// than an I/O or format failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
