//! QCOW2 v3 random reader.
//!
//! Decodes guest reads through the two-level L1/L2 translation tables,
//! zero-filling unallocated clusters and inflating compressed ones.
//! QCOW2 clusters are raw deflate streams (RFC 1951), unlike VMDK
//! grains which carry a zlib envelope; the two framings must never be
//! conflated.
//!
//! The decoder needs random read. When the source cannot provide it
//! (an upload body, a pipe), the whole stream is first spooled to an
//! anonymous scratch file, which the OS reclaims on close no matter
//! how the conversion ends.

pub mod cache;
pub mod header;

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};
use flate2::read::DeflateDecoder;
use tracing::{debug, warn};

use crate::convert::{Block, ImageReader};
use crate::error::{Error, Result};
use crate::transport::{ByteSource, RandomRead};

use self::cache::{TableCache, TableKey, MAX_CACHED_TABLES};
use self::header::{ClusterDescriptor, Header, L1Entry, L2Entry};

/// Preferred buffer size for block iteration (1 MiB).
const QCOW2_BLOCK_BYTES: usize = 1 << 20;

/// Where decoded reads are served from after open.
enum Backing {
    Unopened,
    /// The source itself supports random read.
    Direct,
    /// Scratch copy of a source that could only stream.
    Spooled(File),
}

/// Pool of full-cluster scratch buffers for compressed reads.
struct ClusterPool {
    bufs: RefCell<Vec<Vec<u8>>>,
    cluster_bytes: usize,
}

impl ClusterPool {
    fn new(cluster_bytes: usize) -> Self {
        Self {
            bufs: RefCell::new(Vec::new()),
            cluster_bytes,
        }
    }

    fn take(&self) -> Vec<u8> {
        self.bufs
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.cluster_bytes])
    }

    fn put(&self, buf: Vec<u8>) {
        self.bufs.borrow_mut().push(buf);
    }

    fn clear(&self) {
        self.bufs.borrow_mut().clear();
    }
}

/// Random reader over a QCOW2 v3 image.
///
/// The source is dropped as soon as it is no longer needed: at `close`,
/// or right after spooling when it could only stream.
pub struct Qcow2Reader<S> {
    source: Option<S>,
    backing: Backing,
    header: Option<Header>,
    cluster_size: u64,
    tables: TableCache,
    scratch: ClusterPool,
    offset: u64,
}

impl<S: ByteSource> Qcow2Reader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            backing: Backing::Unopened,
            header: None,
            cluster_size: 0,
            tables: TableCache::new(MAX_CACHED_TABLES),
            scratch: ClusterPool::new(0),
            offset: 0,
        }
    }

    fn header(&self) -> Result<&Header> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::qcow2("reader is not open"))
    }

    /// Exact random read from whichever backing serves this image.
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        match &self.backing {
            Backing::Direct => {
                let access = self
                    .source
                    .as_ref()
                    .and_then(|source| source.random_access())
                    .ok_or_else(|| Error::qcow2("source withdrew random read"))?;
                access.read_exact_at(pos, buf).map_err(Error::io_simple)
            }
            Backing::Spooled(file) => {
                RandomRead::read_exact_at(file, pos, buf).map_err(Error::io_simple)
            }
            Backing::Unopened => Err(Error::qcow2("reader is not open")),
        }
    }

    fn load_table(&self, offset: u64, entries: usize) -> Result<std::rc::Rc<Vec<u64>>> {
        let key = TableKey { offset, entries };
        self.tables.get_or_load(key, || {
            let mut raw = vec![0u8; entries * 8];
            self.read_exact_at(offset, &mut raw)
                .map_err(|e| Error::qcow2(format!("failed to read table: {}", e)))?;
            let mut table = Vec::with_capacity(entries);
            for chunk in raw.chunks_exact(8) {
                table.push(BigEndian::read_u64(chunk));
            }
            Ok(table)
        })
    }

    /// Resolve the L2 entry covering `guest_offset`.
    fn l2_entry(&self, guest_offset: u64) -> Result<L2Entry> {
        let header = self.header()?;
        let l2_entries = header.l2_entries();
        let cluster_index = guest_offset / self.cluster_size;
        let l2_index = cluster_index % l2_entries;
        let l1_index = cluster_index / l2_entries;

        if l1_index >= header.l1_size as u64 {
            return Ok(L2Entry(0));
        }

        let l1_table = self.load_table(header.l1_table_offset, header.l1_size as usize)?;
        let l1_entry = L1Entry(l1_table[l1_index as usize]);
        if !l1_entry.used() || l1_entry.l2_offset() == 0 {
            return Ok(L2Entry(0));
        }

        let l2_table = self.load_table(l1_entry.l2_offset(), l2_entries as usize)?;
        Ok(L2Entry(l2_table[l2_index as usize]))
    }

    /// Read guest bytes at `off`, clamped to the declared image size.
    /// Returns 0 at or past the end.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let header = self.header()?;
        let image_size = header.size;
        let cluster_bits = header.cluster_bits;
        if off >= image_size {
            return Ok(0);
        }

        let len = buf.len().min((image_size - off) as usize);
        let mut n = 0;
        while n < len {
            let pos = off + n as u64;
            let cluster_offset = pos % self.cluster_size;
            let to_read = ((self.cluster_size - cluster_offset) as usize).min(len - n);

            let entry = self.l2_entry(pos)?;
            let slice = &mut buf[n..n + to_read];
            match entry.describe(cluster_bits) {
                ClusterDescriptor::Unallocated => slice.fill(0),
                ClusterDescriptor::Standard { offset } => {
                    self.read_exact_at(offset + cluster_offset, slice)?;
                }
                ClusterDescriptor::Compressed { offset, length } => {
                    self.read_compressed_cluster(slice, offset, length, cluster_offset)?;
                }
            }
            n += to_read;
        }
        Ok(n)
    }

    fn read_compressed_cluster(
        &self,
        out: &mut [u8],
        offset: u64,
        length: usize,
        cluster_offset: u64,
    ) -> Result<()> {
        let mut compressed = vec![0u8; length];
        self.read_exact_at(offset, &mut compressed)
            .map_err(|e| Error::qcow2(format!("failed to read compressed cluster: {}", e)))?;

        let mut cluster = self.scratch.take();
        let mut decoder = DeflateDecoder::new(compressed.as_slice());
        let inflate = decoder.read_exact(&mut cluster);
        let result = match inflate {
            Ok(()) => {
                let start = cluster_offset as usize;
                out.copy_from_slice(&cluster[start..start + out.len()]);
                Ok(())
            }
            Err(e) => Err(Error::decompress(format!(
                "failed to decompress cluster: {}",
                e
            ))),
        };
        self.scratch.put(cluster);
        result
    }
}

impl<S: ByteSource> ImageReader for Qcow2Reader<S> {
    fn open(&mut self) -> Result<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::qcow2("reader is closed"))?;
        let header = if source.random_access().is_some() {
            let header = Header::read(source)?;
            self.backing = Backing::Direct;
            header
        } else {
            warn!("QCOW2 source lacks random read, spooling to a scratch file");
            let mut spool = tempfile::tempfile().map_err(Error::io_simple)?;
            std::io::copy(source, &mut spool)?;
            spool.seek(SeekFrom::Start(0))?;
            let header = Header::read(&mut &spool)?;
            self.backing = Backing::Spooled(spool);
            header
        };

        if matches!(self.backing, Backing::Spooled(_)) {
            // The stream is fully drained; all reads come from the spool.
            self.source = None;
        }

        self.cluster_size = header.cluster_size();
        self.scratch = ClusterPool::new(self.cluster_size as usize);
        self.offset = 0;
        debug!(
            size = header.size,
            cluster_bits = header.cluster_bits,
            l1_size = header.l1_size,
            "opened QCOW2 image"
        );
        self.header = Some(header);
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.header.as_ref().map(|h| h.size).unwrap_or(0)
    }

    fn block_bytes(&self) -> usize {
        QCOW2_BLOCK_BYTES
    }

    fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<Block>> {
        let offset = self.offset;
        let n = self.read_at(buf, offset)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        Ok(Some(Block { offset, len: n }))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping a spooled backing releases the unlinked scratch
        // file; the source has no close operation of its own, so it is
        // released by dropping it here rather than at destruction.
        self.backing = Backing::Unopened;
        self.source = None;
        self.header = None;
        self.tables.clear();
        self.scratch.clear();
        Ok(())
    }
}
