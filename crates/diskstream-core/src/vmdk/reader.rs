//! Stream-optimized VMDK reader.
//!
//! Consumes the extent strictly forward: one 512-byte record at a
//! time, classified as header copy, special marker or grain marker.
//! Grains are yielded in file order; producers written by this crate
//! emit them in ascending guest order, but the reader does not assume
//! that.

use std::io::Read;

use tracing::debug;

use crate::convert::{Block, ImageReader};
use crate::error::{Error, Result};
use crate::transport::ByteSource;

use super::stream::{
    decompress_grain_into, record_is_header, GrainMarker, MarkerType, SparseExtentHeader,
    align_to_sector, COMPRESSION_DEFLATE, GRAIN_MARKER_BYTES, MAX_COMPRESSED_GRAIN, SECTOR_SHIFT,
    SECTOR_SIZE,
};

/// Compressed payload bytes that fit in the grain marker's own sector.
const INLINE_PAYLOAD_BYTES: usize = SECTOR_SIZE as usize - GRAIN_MARKER_BYTES;

/// Reader for a stream-optimized VMDK carried by a sequential source.
/// The source is dropped at `close`.
pub struct VmdkStreamReader<S> {
    source: Option<S>,
    header: Option<SparseExtentHeader>,
    capacity_bytes: u64,
    grain_bytes: usize,
    record: Vec<u8>,
    finished: bool,
}

impl<S: ByteSource> VmdkStreamReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            header: None,
            capacity_bytes: 0,
            grain_bytes: 0,
            record: vec![0u8; SECTOR_SIZE as usize],
            finished: false,
        }
    }

    fn source_mut(&mut self) -> Result<&mut S> {
        self.source
            .as_mut()
            .ok_or_else(|| Error::vmdk("reader is closed"))
    }

    /// Skip `count` bytes of the stream.
    fn skip(&mut self, mut count: u64) -> Result<()> {
        let source = self.source_mut()?;
        let mut scratch = [0u8; SECTOR_SIZE as usize];
        while count > 0 {
            let n = count.min(scratch.len() as u64) as usize;
            source.read_exact(&mut scratch[..n])?;
            count -= n as u64;
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<()> {
        self.record.truncate(SECTOR_SIZE as usize);
        let record = &mut self.record;
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::vmdk("reader is closed"))?;
        source.read_exact(record)?;
        Ok(())
    }
}

impl<S: ByteSource> ImageReader for VmdkStreamReader<S> {
    fn open(&mut self) -> Result<()> {
        self.read_record()?;
        let header = SparseExtentHeader::from_bytes(&self.record)?;

        if header.compress_algorithm != COMPRESSION_DEFLATE {
            return Err(Error::vmdk(format!(
                "unsupported compression algorithm {}",
                header.compress_algorithm
            )));
        }
        if header.grain_size == 0 {
            return Err(Error::vmdk("grain size is zero"));
        }
        if header.overhead == 0 {
            return Err(Error::vmdk("header overhead is zero"));
        }

        // Advance past the embedded descriptor and any reserved area.
        self.skip((header.overhead << SECTOR_SHIFT) - SECTOR_SIZE)?;

        self.capacity_bytes = header.capacity << SECTOR_SHIFT;
        self.grain_bytes = (header.grain_size << SECTOR_SHIFT) as usize;
        debug!(
            capacity = self.capacity_bytes,
            grain = self.grain_bytes,
            "opened stream-optimized VMDK"
        );
        self.header = Some(header);
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn block_bytes(&self) -> usize {
        self.grain_bytes
    }

    fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<Block>> {
        if self.header.is_none() {
            return Err(Error::vmdk("reader is not open"));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            self.read_record()?;

            // A header copy may reappear mid-stream; skip it.
            if record_is_header(&self.record) {
                continue;
            }

            let size = u32::from_le_bytes(self.record[8..12].try_into().unwrap());
            if size == 0 {
                let raw_type = u32::from_le_bytes(self.record[12..16].try_into().unwrap());
                let val = u64::from_le_bytes(self.record[0..8].try_into().unwrap());
                match MarkerType::from_raw(raw_type)? {
                    MarkerType::EndOfStream => {
                        self.finished = true;
                        return Ok(None);
                    }
                    MarkerType::GrainTable
                    | MarkerType::GrainDirectory
                    | MarkerType::Footer => {
                        self.skip(val << SECTOR_SHIFT)?;
                        continue;
                    }
                }
            }

            if size > MAX_COMPRESSED_GRAIN {
                return Err(Error::vmdk(format!(
                    "compressed grain of {} bytes exceeds the {} byte limit",
                    size, MAX_COMPRESSED_GRAIN
                )));
            }

            let marker = GrainMarker::from_bytes(&self.record);
            if size as usize > INLINE_PAYLOAD_BYTES {
                // Payload continues past the marker's sector.
                let extra = align_to_sector((size as usize - INLINE_PAYLOAD_BYTES) as u64) as usize;
                let base = self.record.len();
                self.record.resize(base + extra, 0);
                let tail = &mut self.record[base..];
                let source = self
                    .source
                    .as_mut()
                    .ok_or_else(|| Error::vmdk("reader is closed"))?;
                source.read_exact(tail)?;
            }

            let payload = &self.record[GRAIN_MARKER_BYTES..GRAIN_MARKER_BYTES + size as usize];
            let n = decompress_grain_into(payload, buf)?;
            return Ok(Some(Block {
                offset: marker.lba << SECTOR_SHIFT,
                len: n,
            }));
        }
    }

    fn close(&mut self) -> Result<()> {
        self.finished = true;
        self.source = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemSource;
    use crate::vmdk::stream::{compress_grain, SpecialMarker};

    /// Assemble a minimal stream: header, one descriptor sector, the
    /// given records, an EOS marker.
    fn build_stream(records: &[Vec<u8>]) -> Vec<u8> {
        let header = SparseExtentHeader::new(256, 1);
        let mut image = Vec::new();
        image.extend_from_slice(&header.to_bytes());
        image.extend_from_slice(&[0u8; SECTOR_SIZE as usize]);
        for record in records {
            image.extend_from_slice(record);
        }
        image.extend_from_slice(&SpecialMarker::new(MarkerType::EndOfStream, 0).to_bytes());
        image
    }

    fn grain_record(lba: u64, payload: &[u8]) -> Vec<u8> {
        let compressed = compress_grain(payload, 6).unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&GrainMarker::new(lba, compressed.len() as u32).to_bytes());
        record.extend_from_slice(&compressed);
        record.resize(align_to_sector(record.len() as u64) as usize, 0);
        record
    }

    #[test]
    fn test_open_reports_capacity_and_grain() {
        let image = build_stream(&[]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();
        assert_eq!(reader.capacity_bytes(), 256 * 512);
        assert_eq!(reader.block_bytes(), 64 * 1024);
    }

    #[test]
    fn test_yields_grain_then_eof() {
        let payload = vec![0x42u8; 64 * 1024];
        let image = build_stream(&[grain_record(128, &payload)]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let block = reader.next_block(&mut buf).unwrap().unwrap();
        assert_eq!(block.offset, 128 * 512);
        assert_eq!(block.len, payload.len());
        assert_eq!(buf, payload);

        assert!(reader.next_block(&mut buf).unwrap().is_none());
        // EOF is sticky.
        assert!(reader.next_block(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_skips_midstream_header_copy() {
        let header_copy = SparseExtentHeader::new(256, 1).to_bytes().to_vec();
        let payload = vec![0x17u8; 64 * 1024];
        let image = build_stream(&[header_copy, grain_record(0, &payload)]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let block = reader.next_block(&mut buf).unwrap().unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_skips_special_marker_payload() {
        let mut gt = SpecialMarker::new(MarkerType::GrainTable, 4).to_bytes().to_vec();
        gt.extend_from_slice(&[0xEE; 4 * 512]);
        let payload = vec![0x33u8; 64 * 1024];
        let image = build_stream(&[gt, grain_record(128, &payload)]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let block = reader.next_block(&mut buf).unwrap().unwrap();
        assert_eq!(block.offset, 128 * 512);
    }

    #[test]
    fn test_close_drops_source_and_ends_stream() {
        let image = build_stream(&[]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();
        reader.close().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        assert!(reader.next_block(&mut buf).unwrap().is_none());
        reader.close().unwrap();
    }

    #[test]
    fn test_rejects_oversized_grain() {
        let mut record = vec![0u8; SECTOR_SIZE as usize];
        record[0..8].copy_from_slice(&0u64.to_le_bytes());
        record[8..12].copy_from_slice(&(MAX_COMPRESSED_GRAIN + 1).to_le_bytes());
        let image = build_stream(&[record]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        assert!(matches!(
            reader.next_block(&mut buf),
            Err(Error::Vmdk { .. })
        ));
    }

    #[test]
    fn test_rejects_corrupt_marker_type() {
        let mut record = vec![0u8; SECTOR_SIZE as usize];
        record[12..16].copy_from_slice(&9u32.to_le_bytes());
        let image = build_stream(&[record]);
        let mut reader = VmdkStreamReader::new(MemSource::new(image));
        reader.open().unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        assert!(reader.next_block(&mut buf).is_err());
    }

    #[test]
    fn test_rejects_truncated_stream() {
        let image = build_stream(&[]);
        // Drop the EOS marker and half the descriptor.
        let truncated = image[..image.len() - 700].to_vec();
        let mut reader = VmdkStreamReader::new(MemSource::new(truncated));
        assert!(reader.open().is_err());
    }
}
