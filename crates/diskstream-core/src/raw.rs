//! RAW stream reader and writer.
//!
//! A RAW image is an opaque byte sequence; the reader yields dense
//! blocks at advancing offsets and the writer appends bytes at a
//! monotonically increasing offset without any framing.

use tracing::debug;

use crate::convert::{Block, ImageReader, ImageWriter};
use crate::error::{Error, Result};
use crate::transport::{ByteSink, ByteSource};

/// Default block size for RAW iteration (1 MiB).
const RAW_BLOCK_BYTES: usize = 1 << 20;

/// Reader over a RAW byte stream.
///
/// Capacity comes from the source's declared size when known; when it
/// is not, the pipeline infers capacity from the bytes delivered. The
/// source is dropped at `close`.
pub struct RawReader<S> {
    source: Option<S>,
    offset: u64,
    capacity_bytes: u64,
    finished: bool,
}

impl<S: ByteSource> RawReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            offset: 0,
            capacity_bytes: 0,
            finished: false,
        }
    }
}

impl<S: ByteSource> ImageReader for RawReader<S> {
    fn open(&mut self) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::protocol("RAW reader is closed"))?;
        self.capacity_bytes = source.size().unwrap_or(0);
        self.offset = 0;
        debug!(capacity = self.capacity_bytes, "opened RAW source");
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn block_bytes(&self) -> usize {
        RAW_BLOCK_BYTES
    }

    fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<Block>> {
        if self.finished {
            return Ok(None);
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::protocol("RAW reader is closed"))?;

        // Fill the buffer; a short final read is still a valid block
        // and the following call reports end-of-stream.
        let mut n = 0;
        while n < buf.len() {
            match source.read(&mut buf[n..])? {
                0 => {
                    self.finished = true;
                    break;
                }
                k => n += k,
            }
        }

        if n == 0 {
            return Ok(None);
        }
        let offset = self.offset;
        self.offset += n as u64;
        Ok(Some(Block { offset, len: n }))
    }

    fn close(&mut self) -> Result<()> {
        self.finished = true;
        self.source = None;
        Ok(())
    }
}

/// Writer appending a RAW byte stream to a sink.
pub struct RawWriter<S> {
    sink: S,
    prealloc: bool,
    offset: u64,
    closed: bool,
}

impl<S: ByteSink> RawWriter<S> {
    /// When `prealloc` is set and capacity is known at open, the sink
    /// is asked to reserve the full image up front.
    pub fn new(sink: S, prealloc: bool) -> Self {
        Self {
            sink,
            prealloc,
            offset: 0,
            closed: false,
        }
    }
}

impl<S: ByteSink> ImageWriter for RawWriter<S> {
    fn open(&mut self, capacity_bytes: u64) -> Result<()> {
        self.offset = 0;
        if self.prealloc && capacity_bytes > 0 {
            self.sink
                .preallocate(capacity_bytes)
                .map_err(Error::io_simple)?;
        }
        Ok(())
    }

    fn write_granularity(&self) -> Option<usize> {
        None
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .write_all_at(self.offset, data)
            .map_err(Error::io_simple)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close().map_err(Error::io_simple)
    }
}
