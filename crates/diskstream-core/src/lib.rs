//! Diskstream Core Library
//!
//! Streaming conversion between three virtual disk image formats: flat
//! RAW, stream-optimized VMDK and QCOW2 v3 (read only). Conversions
//! make one sequential pass over the source and one sequential write
//! pass over the destination, preserving capacity, sparseness and byte
//! identity.
//!
//! # Modules
//!
//! - `error` - Error types and Result alias
//! - `cancel` - Cooperative cancellation token
//! - `transport` - Byte source/sink capability traits and backends
//! - `convert` - Reader/writer traits and the conversion pipeline
//! - `raw` - RAW stream reader and writer
//! - `vmdk` - Stream-optimized VMDK reader and writer
//! - `qcow2` - QCOW2 v3 random reader

pub mod cancel;
pub mod convert;
pub mod error;
pub mod qcow2;
pub mod raw;
pub mod transport;
pub mod vmdk;

pub use cancel::CancelToken;
pub use convert::{
    Block, CompressionLevel, ConvertProgress, ConvertSummary, Converter, ImageReader, ImageWriter,
    ProgressCallback,
};
pub use error::{Error, Result};
pub use qcow2::Qcow2Reader;
pub use raw::{RawReader, RawWriter};
pub use vmdk::{VmdkStreamReader, VmdkStreamWriter};
