//! Stream-optimized VMDK writer.
//!
//! Emits a complete extent in one forward pass: header, embedded
//! descriptor, compressed grains with inline markers, grain tables as
//! they fill, and finally the grain directory, footer header copy and
//! end-of-stream marker. The sink is driven at strictly increasing
//! offsets, so an append-only sink works.

use tracing::debug;

use crate::convert::{CompressionLevel, ImageWriter};
use crate::error::{Error, Result};
use crate::transport::ByteSink;

use super::descriptor::{generate_cid, make_descriptor};
use super::stream::{
    align_to_sector, compress_grain, GrainMarker, MarkerType, SparseExtentHeader, SpecialMarker,
    GRAIN_SECTORS, GT_ENTRIES_PER_GT, SECTOR_SHIFT, SECTOR_SIZE,
};

/// Writer producing a stream-optimized VMDK on a byte sink.
pub struct VmdkStreamWriter<S> {
    sink: S,
    file_name: String,
    level: CompressionLevel,
    header: Option<SparseExtentHeader>,
    grain_bytes: usize,
    /// Grains consumed so far, sparse ones included.
    grain_index: u64,
    /// Sectors emitted to the sink; doubles as the write position.
    write_sectors: u64,
    grain_table: Vec<u32>,
    grain_directory: Vec<u32>,
    closed: bool,
}

impl<S: ByteSink> VmdkStreamWriter<S> {
    /// Create a writer; `file_name` is embedded in the descriptor.
    pub fn new(sink: S, file_name: impl Into<String>, level: CompressionLevel) -> Self {
        Self {
            sink,
            file_name: file_name.into(),
            level,
            header: None,
            grain_bytes: (GRAIN_SECTORS << SECTOR_SHIFT) as usize,
            grain_index: 0,
            write_sectors: 0,
            grain_table: Vec::with_capacity(GT_ENTRIES_PER_GT as usize),
            grain_directory: Vec::new(),
            closed: false,
        }
    }

    /// Sectors written to the sink so far.
    pub fn sectors_emitted(&self) -> u64 {
        self.write_sectors
    }

    /// Write a sector-aligned chunk at the current position.
    fn emit(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % SECTOR_SIZE as usize, 0);
        let pos = self.write_sectors << SECTOR_SHIFT;
        self.sink.write_all_at(pos, data).map_err(Error::io_simple)?;
        self.write_sectors += (data.len() as u64) >> SECTOR_SHIFT;
        Ok(())
    }

    /// Flush the pending grain table. Returns the sector its entries
    /// landed at, or 0 when the whole table was sparse and elided.
    fn flush_grain_table(&mut self) -> Result<u32> {
        if self.grain_table.iter().all(|&entry| entry == 0) {
            self.grain_table.clear();
            return Ok(0);
        }

        self.grain_table.resize(GT_ENTRIES_PER_GT as usize, 0);
        let table_bytes = align_to_sector((GT_ENTRIES_PER_GT as u64) * 4);

        let marker = SpecialMarker::new(MarkerType::GrainTable, table_bytes >> SECTOR_SHIFT);
        self.emit(&marker.to_bytes())?;

        let table_sector = self.write_sectors as u32;
        let mut buf = Vec::with_capacity(table_bytes as usize);
        for entry in &self.grain_table {
            buf.extend_from_slice(&entry.to_le_bytes());
        }
        buf.resize(table_bytes as usize, 0);
        self.emit(&buf)?;

        self.grain_table.clear();
        Ok(table_sector)
    }

    fn finish_grain(&mut self) -> Result<()> {
        self.grain_index += 1;
        if self.grain_table.len() == GT_ENTRIES_PER_GT as usize {
            let table_sector = self.flush_grain_table()?;
            self.grain_directory.push(table_sector);
        }
        Ok(())
    }
}

impl<S: ByteSink> ImageWriter for VmdkStreamWriter<S> {
    fn open(&mut self, capacity_bytes: u64) -> Result<()> {
        let capacity_sectors = align_to_sector(capacity_bytes) >> SECTOR_SHIFT;

        let cid = generate_cid();
        let descriptor = make_descriptor(&self.file_name, capacity_sectors, cid);
        let descriptor_bytes = align_to_sector(descriptor.len() as u64);

        let header = SparseExtentHeader::new(capacity_sectors, descriptor_bytes >> SECTOR_SHIFT);
        self.emit(&header.to_bytes())?;

        let mut padded = descriptor.into_bytes();
        padded.resize(descriptor_bytes as usize, 0);
        self.emit(&padded)?;

        debug!(
            capacity_sectors,
            overhead = header.overhead,
            "opened stream-optimized VMDK writer"
        );
        self.header = Some(header);
        Ok(())
    }

    fn write_granularity(&self) -> Option<usize> {
        Some(self.grain_bytes)
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::vmdk("writer is not open"))?;
        if data.len() > self.grain_bytes {
            return Err(Error::vmdk(format!(
                "block of {} bytes exceeds the {} byte grain",
                data.len(),
                self.grain_bytes
            )));
        }
        let grain_sectors = header.grain_size;

        if data.iter().all(|&b| b == 0) {
            self.grain_table.push(0);
            return self.finish_grain();
        }

        let compressed = compress_grain(data, self.level.to_zlib_level())?;
        let marker = GrainMarker::new(self.grain_index * grain_sectors, compressed.len() as u32);

        let mut record = Vec::with_capacity(compressed.len() + SECTOR_SIZE as usize);
        record.extend_from_slice(&marker.to_bytes());
        record.extend_from_slice(&compressed);
        record.resize(align_to_sector(record.len() as u64) as usize, 0);

        let grain_sector = self.write_sectors as u32;
        self.emit(&record)?;
        self.grain_table.push(grain_sector);
        self.finish_grain()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(header) = self.header.take() {
            if !self.grain_table.is_empty() {
                let table_sector = self.flush_grain_table()?;
                self.grain_directory.push(table_sector);
            }

            let directory_bytes = align_to_sector(self.grain_directory.len() as u64 * 4);
            let marker =
                SpecialMarker::new(MarkerType::GrainDirectory, directory_bytes >> SECTOR_SHIFT);
            self.emit(&marker.to_bytes())?;

            let directory_sector = self.write_sectors;
            if directory_bytes > 0 {
                let mut buf = Vec::with_capacity(directory_bytes as usize);
                for entry in &self.grain_directory {
                    buf.extend_from_slice(&entry.to_le_bytes());
                }
                buf.resize(directory_bytes as usize, 0);
                self.emit(&buf)?;
            }

            self.emit(&SpecialMarker::new(MarkerType::Footer, 1).to_bytes())?;
            self.emit(&header.as_footer(directory_sector).to_bytes())?;
            self.emit(&SpecialMarker::new(MarkerType::EndOfStream, 0).to_bytes())?;

            debug!(
                sectors = self.write_sectors,
                gd_sector = directory_sector,
                "finished stream-optimized VMDK"
            );
        }

        self.sink.close().map_err(Error::io_simple)
    }
}
