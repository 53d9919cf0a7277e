//! Stream-optimized VMDK codec.
//!
//! - `stream` - on-disk structures, markers and the zlib grain codec
//! - `descriptor` - embedded text descriptor generation
//! - `reader` - single-pass stream reader
//! - `writer` - single-pass stream writer

pub mod descriptor;
pub mod reader;
pub mod stream;
pub mod writer;

pub use reader::VmdkStreamReader;
pub use writer::VmdkStreamWriter;
