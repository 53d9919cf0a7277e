//! QCOW2 version 3 header, header extensions and table entries.
//!
//! Everything on disk is big-endian. Only the read-only subset is
//! modelled: no backing files, no encryption, no external data files,
//! deflate as the sole compression type.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// QCOW2 magic ("QFI\xfb").
pub const QCOW2_MAGIC: u32 = 0x514649FB;

/// The only supported version.
pub const VERSION_3: u32 = 3;

/// `crypt_method` value meaning no encryption.
const CRYPT_NONE: u32 = 0;

/// `compression_type` value for deflate.
pub const COMPRESSION_TYPE_DEFLATE: u8 = 0;

/// Byte length of the fixed version 3 header prefix.
const HEADER_V3_BYTES: u32 = 104;

/// Header extension identifiers.
const EXT_END: u32 = 0x0000_0000;
const EXT_BACKING_FILE_FORMAT: u32 = 0xE279_2ACA;
const EXT_EXTERNAL_DATA_FILE: u32 = 0x4441_5441;
const EXT_FULL_DISK_ENCRYPTION: u32 = 0x0537_BE77;

/// Offset bits of an L1 or uncompressed L2 entry.
const TABLE_OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FE00;

/// Entry flag bits.
const ENTRY_USED: u64 = 1 << 63;
const ENTRY_COMPRESSED: u64 = 1 << 62;

/// A retained, non-rejected header extension.
#[derive(Debug, Clone)]
pub struct HeaderExtension {
    pub ext_type: u32,
    pub data: Vec<u8>,
}

/// Parsed QCOW2 v3 header with its extensions.
#[derive(Debug, Clone)]
pub struct Header {
    pub cluster_bits: u32,
    /// Guest-visible size in bytes.
    pub size: u64,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
    /// From the additional fields, when `header_length` carries them.
    pub compression_type: Option<u8>,
    pub extensions: Vec<HeaderExtension>,
}

impl Header {
    /// Parse and validate a header from a sequential reader positioned
    /// at byte 0 of the image.
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let magic = r.read_u32::<BigEndian>()?;
        if magic != QCOW2_MAGIC {
            return Err(Error::qcow2("invalid magic bytes"));
        }
        let version = r.read_u32::<BigEndian>()?;
        if version != VERSION_3 {
            return Err(Error::qcow2(format!(
                "only version 3 is supported, got {}",
                version
            )));
        }

        let backing_file_offset = r.read_u64::<BigEndian>()?;
        let _backing_file_size = r.read_u32::<BigEndian>()?;
        if backing_file_offset != 0 {
            return Err(Error::qcow2("backing files are not supported"));
        }

        let cluster_bits = r.read_u32::<BigEndian>()?;
        if !(9..=21).contains(&cluster_bits) {
            return Err(Error::qcow2(format!("bad cluster_bits {}", cluster_bits)));
        }

        let size = r.read_u64::<BigEndian>()?;
        let crypt_method = r.read_u32::<BigEndian>()?;
        if crypt_method != CRYPT_NONE {
            return Err(Error::qcow2("encryption is not supported"));
        }

        let l1_size = r.read_u32::<BigEndian>()?;
        let l1_table_offset = r.read_u64::<BigEndian>()?;
        let refcount_table_offset = r.read_u64::<BigEndian>()?;
        let refcount_table_clusters = r.read_u32::<BigEndian>()?;
        let nb_snapshots = r.read_u32::<BigEndian>()?;
        let snapshots_offset = r.read_u64::<BigEndian>()?;

        let incompatible_features = r.read_u64::<BigEndian>()?;
        if incompatible_features != 0 {
            return Err(Error::qcow2("incompatible features are not supported"));
        }
        let compatible_features = r.read_u64::<BigEndian>()?;
        let autoclear_features = r.read_u64::<BigEndian>()?;
        let refcount_order = r.read_u32::<BigEndian>()?;
        let header_length = r.read_u32::<BigEndian>()?;
        if header_length < HEADER_V3_BYTES {
            return Err(Error::qcow2(format!(
                "header length {} shorter than the version 3 minimum",
                header_length
            )));
        }

        // Additional fields, when the header extends past the fixed
        // prefix; the first byte is the compression type.
        let mut compression_type = None;
        if header_length > HEADER_V3_BYTES {
            let mut additional = vec![0u8; (header_length - HEADER_V3_BYTES) as usize];
            r.read_exact(&mut additional)?;
            if let Some(&ct) = additional.first() {
                if ct != COMPRESSION_TYPE_DEFLATE {
                    return Err(Error::qcow2(format!(
                        "unsupported compression type {}",
                        ct
                    )));
                }
                compression_type = Some(ct);
            }
        }

        let extensions = read_extensions(r)?;

        Ok(Self {
            cluster_bits,
            size,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_length,
            compression_type,
            extensions,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    /// Entries per L2 table: one u64 per cluster-sized slot.
    pub fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }
}

fn read_extensions(r: &mut impl Read) -> Result<Vec<HeaderExtension>> {
    let mut extensions = Vec::new();
    loop {
        let ext_type = r.read_u32::<BigEndian>()?;
        if ext_type == EXT_END {
            return Ok(extensions);
        }
        if ext_type == EXT_BACKING_FILE_FORMAT
            || ext_type == EXT_EXTERNAL_DATA_FILE
            || ext_type == EXT_FULL_DISK_ENCRYPTION
        {
            return Err(Error::qcow2(format!(
                "unsupported header extension 0x{:08X}",
                ext_type
            )));
        }

        let length = r.read_u32::<BigEndian>()?;
        let mut data = vec![0u8; length as usize];
        r.read_exact(&mut data)?;

        // Entries are padded to 8-byte multiples.
        let padding = (8 - (length % 8) as usize) % 8;
        if padding > 0 {
            let mut pad = [0u8; 8];
            r.read_exact(&mut pad[..padding])?;
        }

        extensions.push(HeaderExtension { ext_type, data });
    }
}

/// One L1 table entry.
#[derive(Debug, Clone, Copy)]
pub struct L1Entry(pub u64);

impl L1Entry {
    pub fn used(self) -> bool {
        self.0 & ENTRY_USED != 0
    }

    /// Cluster-aligned file offset of the L2 table.
    pub fn l2_offset(self) -> u64 {
        self.0 & TABLE_OFFSET_MASK
    }
}

/// One L2 table entry describing a guest cluster.
#[derive(Debug, Clone, Copy)]
pub struct L2Entry(pub u64);

/// The three mutually exclusive dispositions of a guest cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterDescriptor {
    /// Reads as zeros.
    Unallocated,
    /// Stored verbatim at a cluster-aligned offset.
    Standard { offset: u64 },
    /// Raw-deflate stream of `length` stored bytes at an unaligned offset.
    Compressed { offset: u64, length: usize },
}

impl L2Entry {
    pub fn describe(self, cluster_bits: u32) -> ClusterDescriptor {
        if self.0 & ENTRY_USED == 0 {
            return ClusterDescriptor::Unallocated;
        }
        if self.0 & ENTRY_COMPRESSED != 0 {
            // The split between offset and size bits depends on the
            // cluster size; the size field counts 512-byte units, less
            // one.
            let csize_shift = 62 - (cluster_bits - 8);
            let offset = self.0 & ((1u64 << csize_shift) - 1);
            let units = (self.0 >> csize_shift) & ((1u64 << (62 - csize_shift)) - 1);
            return ClusterDescriptor::Compressed {
                offset,
                length: ((units + 1) * 512) as usize,
            };
        }
        ClusterDescriptor::Standard {
            offset: self.0 & TABLE_OFFSET_MASK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize a minimal v3 header followed by an end-of-extensions word.
    fn header_bytes(mutate: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&QCOW2_MAGIC.to_be_bytes());
        buf.extend_from_slice(&VERSION_3.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes()); // backing_file_offset
        buf.extend_from_slice(&0u32.to_be_bytes()); // backing_file_size
        buf.extend_from_slice(&16u32.to_be_bytes()); // cluster_bits
        buf.extend_from_slice(&(1u64 << 30).to_be_bytes()); // size
        buf.extend_from_slice(&0u32.to_be_bytes()); // crypt_method
        buf.extend_from_slice(&2u32.to_be_bytes()); // l1_size
        buf.extend_from_slice(&(3u64 << 16).to_be_bytes()); // l1_table_offset
        buf.extend_from_slice(&0u64.to_be_bytes()); // refcount_table_offset
        buf.extend_from_slice(&0u32.to_be_bytes()); // refcount_table_clusters
        buf.extend_from_slice(&0u32.to_be_bytes()); // nb_snapshots
        buf.extend_from_slice(&0u64.to_be_bytes()); // snapshots_offset
        buf.extend_from_slice(&0u64.to_be_bytes()); // incompatible
        buf.extend_from_slice(&0u64.to_be_bytes()); // compatible
        buf.extend_from_slice(&0u64.to_be_bytes()); // autoclear
        buf.extend_from_slice(&4u32.to_be_bytes()); // refcount_order
        buf.extend_from_slice(&104u32.to_be_bytes()); // header_length
        mutate(&mut buf);
        buf.extend_from_slice(&0u32.to_be_bytes()); // end of extensions
        buf
    }

    #[test]
    fn test_parse_minimal_header() {
        let bytes = header_bytes(|_| {});
        let header = Header::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.cluster_bits, 16);
        assert_eq!(header.cluster_size(), 65536);
        assert_eq!(header.l2_entries(), 8192);
        assert_eq!(header.size, 1 << 30);
        assert_eq!(header.l1_size, 2);
        assert_eq!(header.l1_table_offset, 3 << 16);
        assert!(header.compression_type.is_none());
        assert!(header.extensions.is_empty());
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut bytes = header_bytes(|_| {});
        bytes[0] = 0;
        assert!(matches!(
            Header::read(&mut bytes.as_slice()),
            Err(Error::Qcow2 { .. })
        ));
    }

    #[test]
    fn test_reject_version_2() {
        let mut bytes = header_bytes(|_| {});
        bytes[4..8].copy_from_slice(&2u32.to_be_bytes());
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_reject_backing_file() {
        let mut bytes = header_bytes(|_| {});
        bytes[8..16].copy_from_slice(&512u64.to_be_bytes());
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_reject_encryption() {
        let mut bytes = header_bytes(|_| {});
        bytes[32..36].copy_from_slice(&1u32.to_be_bytes());
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_reject_incompatible_features() {
        let mut bytes = header_bytes(|_| {});
        bytes[72..80].copy_from_slice(&1u64.to_be_bytes());
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_reject_backing_format_extension() {
        let bytes = header_bytes(|buf| {
            buf.extend_from_slice(&EXT_BACKING_FILE_FORMAT.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
        });
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_retains_unknown_extension_with_padding() {
        let bytes = header_bytes(|buf| {
            buf.extend_from_slice(&0x12345678u32.to_be_bytes());
            buf.extend_from_slice(&3u32.to_be_bytes());
            buf.extend_from_slice(b"abc");
            buf.extend_from_slice(&[0u8; 5]); // pad to 8
        });
        let header = Header::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.extensions.len(), 1);
        assert_eq!(header.extensions[0].ext_type, 0x12345678);
        assert_eq!(header.extensions[0].data, b"abc");
    }

    #[test]
    fn test_additional_fields_compression_type() {
        let mut bytes = header_bytes(|buf| {
            buf.extend_from_slice(&[COMPRESSION_TYPE_DEFLATE, 0, 0, 0, 0, 0, 0, 0]);
        });
        bytes[100..104].copy_from_slice(&112u32.to_be_bytes());
        let header = Header::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.compression_type, Some(COMPRESSION_TYPE_DEFLATE));
    }

    #[test]
    fn test_reject_unknown_compression_type() {
        let mut bytes = header_bytes(|buf| {
            buf.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]); // zstd
        });
        bytes[100..104].copy_from_slice(&112u32.to_be_bytes());
        assert!(Header::read(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_l1_entry_fields() {
        let entry = L1Entry(ENTRY_USED | (3 << 16));
        assert!(entry.used());
        assert_eq!(entry.l2_offset(), 3 << 16);
        assert!(!L1Entry(0).used());
    }

    #[test]
    fn test_l2_dispositions() {
        assert_eq!(L2Entry(0).describe(16), ClusterDescriptor::Unallocated);

        let standard = L2Entry(ENTRY_USED | (5 << 16));
        assert_eq!(
            standard.describe(16),
            ClusterDescriptor::Standard { offset: 5 << 16 }
        );

        // cluster_bits 9: the size field occupies bit 61 only, so a
        // sub-sector stream reads as one 512-byte unit.
        let compressed = L2Entry(ENTRY_USED | ENTRY_COMPRESSED | 2048);
        assert_eq!(
            compressed.describe(9),
            ClusterDescriptor::Compressed {
                offset: 2048,
                length: 512
            }
        );

        // cluster_bits 16: size field spans bits 54..61.
        let shift = 62 - (16 - 8);
        let two_units = L2Entry(ENTRY_USED | ENTRY_COMPRESSED | (1u64 << shift) | 4096);
        assert_eq!(
            two_units.describe(16),
            ClusterDescriptor::Compressed {
                offset: 4096,
                length: 1024
            }
        );
    }
}
