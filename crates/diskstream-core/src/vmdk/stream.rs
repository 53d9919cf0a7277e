//! Stream-optimized VMDK on-disk structures.
//!
//! A stream-optimized VMDK is a single sparse extent written in one
//! forward pass:
//! - Version 3 header with the grain directory offset deferred
//! - Embedded text descriptor at sector 1
//! - DEFLATE-compressed grains framed as zlib (RFC 1950)
//! - 512-byte markers announcing grain tables, the grain directory,
//!   the footer header copy and end-of-stream
//!
//! All multi-byte fields are little-endian; all offsets and sizes are
//! expressed in 512-byte sectors.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// VMDK magic number ("KDMV" on disk).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// log2 of the sector size; sector/byte conversions shift by this.
pub const SECTOR_SHIFT: u32 = 9;

/// Grain size in sectors (128 sectors = 64 KiB).
pub const GRAIN_SECTORS: u64 = 128;

/// Number of grain table entries per grain table.
pub const GT_ENTRIES_PER_GT: u32 = 512;

/// Largest compressed grain payload the reader will accept.
pub const MAX_COMPRESSED_GRAIN: u32 = 128 * 1024;

/// Header flags for a stream-optimized extent.
/// - Bit 0: valid newline detector
/// - Bit 16: compressed grains
/// - Bit 17: grain markers with embedded LBAs
pub const FLAG_VALID_NEWLINE_DETECTOR: u32 = 1 << 0;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_EMBEDDED_LBA: u32 = 1 << 17;

/// Grain directory offset sentinel meaning "patched in the footer".
pub const GD_AT_END: u64 = u64::MAX;

/// Compression algorithm identifiers.
pub const COMPRESSION_NONE: u16 = 0;
pub const COMPRESSION_DEFLATE: u16 = 1;

/// Grain marker header length; the rest of its sector is payload.
pub const GRAIN_MARKER_BYTES: usize = 12;

/// Round `size` up to a whole number of sectors.
pub fn align_to_sector(size: u64) -> u64 {
    (size + SECTOR_SIZE - 1) & !(SECTOR_SIZE - 1)
}

/// Marker types used by the special 512-byte markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MarkerType {
    /// End of stream.
    EndOfStream = 0,
    /// Grain table follows.
    GrainTable = 1,
    /// Grain directory follows.
    GrainDirectory = 2,
    /// Footer header copy follows.
    Footer = 3,
}

impl MarkerType {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::EndOfStream),
            1 => Ok(Self::GrainTable),
            2 => Ok(Self::GrainDirectory),
            3 => Ok(Self::Footer),
            other => Err(Error::vmdk(format!("corrupt marker type {}", other))),
        }
    }
}

/// A special marker: one full sector with `size == 0`.
///
/// `val` is the sector count of the structure that follows, or 1 for
/// the footer header copy, or 0 for end-of-stream.
#[derive(Debug, Clone, Copy)]
pub struct SpecialMarker {
    pub val: u64,
    pub marker_type: MarkerType,
}

impl SpecialMarker {
    pub fn new(marker_type: MarkerType, val: u64) -> Self {
        Self { val, marker_type }
    }

    /// Serialize to one 512-byte sector.
    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(&self.val.to_le_bytes());
        // size at 8..12 stays zero: that is what marks this special
        buf[12..16].copy_from_slice(&(self.marker_type as u32).to_le_bytes());
        buf
    }
}

/// Grain marker: 12-byte header preceding a compressed grain payload.
#[derive(Debug, Clone, Copy)]
pub struct GrainMarker {
    /// Guest LBA of the grain, in sectors.
    pub lba: u64,
    /// Compressed payload length in bytes.
    pub size: u32,
}

impl GrainMarker {
    pub fn new(lba: u64, size: u32) -> Self {
        Self { lba, size }
    }

    pub fn to_bytes(&self) -> [u8; GRAIN_MARKER_BYTES] {
        let mut buf = [0u8; GRAIN_MARKER_BYTES];
        buf[0..8].copy_from_slice(&self.lba.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Parse from the start of a marker record.
    pub fn from_bytes(data: &[u8]) -> Self {
        let lba = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let size = u32::from_le_bytes(data[8..12].try_into().unwrap());
        Self { lba, size }
    }
}

/// Sparse extent header: the 512-byte structure at sector 0, repeated
/// verbatim in the footer with `gd_offset` patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Embedded descriptor offset in sectors.
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory offset; unused for stream-optimized.
    pub rgd_offset: u64,
    /// Grain directory offset in sectors; [`GD_AT_END`] until the footer.
    pub gd_offset: u64,
    /// Sectors consumed by header plus descriptor.
    pub overhead: u64,
    pub unclean_shutdown: bool,
    pub single_end_line_char: u8,
    pub non_end_line_char: u8,
    pub double_end_line_char1: u8,
    pub double_end_line_char2: u8,
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Build the create-time header for a disk of `capacity_sectors`
    /// with a descriptor occupying `descriptor_sectors`.
    pub fn new(capacity_sectors: u64, descriptor_sectors: u64) -> Self {
        Self {
            magic: VMDK_MAGIC,
            version: 3,
            flags: FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA,
            capacity: capacity_sectors,
            grain_size: GRAIN_SECTORS,
            descriptor_offset: 1,
            descriptor_size: descriptor_sectors,
            num_gtes_per_gt: GT_ENTRIES_PER_GT,
            rgd_offset: 0,
            gd_offset: GD_AT_END,
            overhead: 1 + descriptor_sectors,
            unclean_shutdown: false,
            single_end_line_char: b'\n',
            non_end_line_char: b' ',
            double_end_line_char1: b'\r',
            double_end_line_char2: b'\n',
            compress_algorithm: COMPRESSION_DEFLATE,
        }
    }

    /// Serialize to exactly one sector.
    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        buf[72] = self.unclean_shutdown as u8;
        buf[73] = self.single_end_line_char;
        buf[74] = self.non_end_line_char;
        buf[75] = self.double_end_line_char1;
        buf[76] = self.double_end_line_char2;
        buf[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        // 79..512 is padding, already zero
        buf
    }

    /// Parse from one sector. Fails only on short input or bad magic;
    /// field validation is the caller's concern.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::vmdk("sparse extent header shorter than one sector"));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != VMDK_MAGIC {
            return Err(Error::vmdk(format!(
                "invalid VMDK magic: expected 0x{:08X}, got 0x{:08X}",
                VMDK_MAGIC, magic
            )));
        }
        Ok(Self {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            flags: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            capacity: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            grain_size: u64::from_le_bytes(data[20..28].try_into().unwrap()),
            descriptor_offset: u64::from_le_bytes(data[28..36].try_into().unwrap()),
            descriptor_size: u64::from_le_bytes(data[36..44].try_into().unwrap()),
            num_gtes_per_gt: u32::from_le_bytes(data[44..48].try_into().unwrap()),
            rgd_offset: u64::from_le_bytes(data[48..56].try_into().unwrap()),
            gd_offset: u64::from_le_bytes(data[56..64].try_into().unwrap()),
            overhead: u64::from_le_bytes(data[64..72].try_into().unwrap()),
            unclean_shutdown: data[72] != 0,
            single_end_line_char: data[73],
            non_end_line_char: data[74],
            double_end_line_char1: data[75],
            double_end_line_char2: data[76],
            compress_algorithm: u16::from_le_bytes(data[77..79].try_into().unwrap()),
        })
    }

    /// The footer header copy: identical except for the patched GD offset.
    pub fn as_footer(&self, gd_offset_sectors: u64) -> Self {
        let mut footer = self.clone();
        footer.gd_offset = gd_offset_sectors;
        footer
    }
}

/// True if a 512-byte record starts with the VMDK magic.
pub fn record_is_header(record: &[u8]) -> bool {
    record.len() >= 4 && u32::from_le_bytes(record[0..4].try_into().unwrap()) == VMDK_MAGIC
}

/// Compress one grain into a zlib stream (RFC 1950).
pub fn compress_grain(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::decompress(format!("failed to compress grain: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::decompress(format!("failed to finish grain compression: {}", e)))
}

/// Inflate a zlib-framed grain payload into `out`, returning the byte
/// count produced. A full grain decompresses to exactly `out.len()`;
/// the final grain of an unaligned disk may come up short.
pub fn decompress_grain_into(compressed: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut n = 0;
    while n < out.len() {
        match decoder
            .read(&mut out[n..])
            .map_err(|e| Error::decompress(format!("failed to decompress grain: {}", e)))?
        {
            0 => break,
            k => n += k,
        }
    }
    Ok(n)
}
