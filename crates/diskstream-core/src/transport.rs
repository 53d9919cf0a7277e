//! Byte transports consumed by the format codecs.
//!
//! Transports are polymorphic over two capability sets: sources offer
//! sequential read plus an optional known size and optional random
//! read; sinks offer random write at an offset plus optional
//! preallocation. Codecs probe for the optional capabilities at open
//! time instead of assuming a concrete type (the QCOW2 reader requires
//! random read and spools to a scratch file when it is absent).
//!
//! The HTTP source and response-body sink live outside this crate;
//! [`MemSource`], [`MemSink`] and [`SequentialSink`] satisfy the same
//! contracts for embedding and tests.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Random read at an absolute offset.
///
/// Mirrors `positioned_io::ReadAt`; a separate trait keeps the
/// transport contract object safe and lets in-memory backends
/// participate without an intermediate file.
pub trait RandomRead {
    /// Read up to `buf.len()` bytes at `pos`, returning the count read.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Fill `buf` completely from `pos` or fail.
    fn read_exact_at(&self, mut pos: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(pos, buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read at offset",
                    ))
                }
                n => {
                    pos += n as u64;
                    let rest = buf;
                    buf = &mut rest[n..];
                }
            }
        }
        Ok(())
    }
}

impl RandomRead for File {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        positioned_io::ReadAt::read_at(self, pos, buf)
    }
}

/// A sequential byte source with optional extra capabilities.
pub trait ByteSource: Read {
    /// Total size in bytes, if known up front.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Random-read capability, if the backing store supports it.
    fn random_access(&self) -> Option<&dyn RandomRead> {
        None
    }
}

/// A random-write byte sink.
///
/// All writers in this crate drive sinks at strictly non-decreasing,
/// contiguous offsets, so an append-only adapter is a valid sink.
pub trait ByteSink {
    /// Write `buf` at absolute offset `pos`, returning the count written.
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize>;

    /// Write all of `buf` at `pos` or fail.
    fn write_all_at(&mut self, mut pos: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(pos, buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sink accepted zero bytes",
                    ))
                }
                n => {
                    pos += n as u64;
                    buf = &buf[n..];
                }
            }
        }
        Ok(())
    }

    /// Reserve `size` bytes if the backing store supports it; no-op otherwise.
    fn preallocate(&mut self, _size: u64) -> io::Result<()> {
        Ok(())
    }

    /// Release the sink. Called once by the owning writer.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Local file source with a known size and random read.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Open `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(e, path))?
            .len();
        Ok(Self { file, size })
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl RandomRead for FileSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        positioned_io::ReadAt::read_at(&self.file, pos, buf)
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn random_access(&self) -> Option<&dyn RandomRead> {
        Some(self)
    }
}

/// Local file sink with random write and truncate-based preallocation.
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Create (or truncate) `path` for writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::io(e, path))?;
        Ok(Self { file })
    }
}

impl ByteSink for FileSink {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        positioned_io::WriteAt::write_at(&mut self.file, pos, buf)
    }

    fn preallocate(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// In-memory source over an owned byte buffer.
///
/// Stands in for an upload body with a known length; supports random
/// read, so the QCOW2 reader uses it without spooling.
pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Read for MemSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl RandomRead for MemSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = pos as usize;
        let n = (self.data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

impl ByteSource for MemSource {
    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn random_access(&self) -> Option<&dyn RandomRead> {
        Some(self)
    }
}

/// In-memory sink backed by a shared buffer.
///
/// The buffer handle survives the sink being consumed by a writer, so
/// callers can inspect the produced image after the conversion closes
/// everything down.
pub struct MemSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemSink {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle onto the bytes written so far.
    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buf)
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSink for MemSink {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.buf.lock().unwrap();
        let end = pos as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// Append-only sink over any `io::Write`.
///
/// Accepts `write_at` only at the current cursor, modelling a
/// destination such as an HTTP response body that cannot seek. Every
/// writer in this crate emits monotonically, so this adapter composes
/// with all of them.
pub struct SequentialSink<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> SequentialSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    /// Bytes accepted so far.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Recover the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ByteSink for SequentialSink<W> {
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        if pos != self.offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sequential sink does not support random write",
            ));
        }
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
