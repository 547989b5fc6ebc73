//! On-disk sparse extent header, grain record and marker layouts.
//!
//! The header is a single 512-byte little-endian block at the start of the
//! extent file. Several multi-byte fields sit at unaligned offsets, so the
//! codec goes through the byte-slice helpers in [`crate::sector`] rather
//! than any struct transmutation.

use crate::error::{DiskError, Result};
use crate::sector::{get_le16, get_le32, get_le64, put_le16, put_le32, put_le64, SECTOR_SIZE};

/// `'V','M','D','K'` packed as a host u32; appears on disk as the bytes
/// `KDMV` because all fields are little-endian.
pub const SPARSE_MAGIC: u32 = 0x564D_444B;

/// Magic with every letter lowercased (`vmdk`). Written first during
/// finalization so that a crash between the two header writes leaves a
/// file no reader will accept.
pub const SPARSE_MAGIC_SCRAMBLED: u32 = SPARSE_MAGIC ^ 0x2020_2020;

/// Highest compatibility version this codec understands.
pub const SPARSE_VERSION_MAX: u32 = 3;

pub const FLAG_VALID_NEWLINE_DETECTOR: u32 = 0x0000_0001;
pub const FLAG_USE_REDUNDANT: u32 = 0x0000_0002;
pub const FLAG_COMPRESSED: u32 = 0x0001_0000;
pub const FLAG_EMBEDDED_LBA: u32 = 0x0002_0000;

/// Bits the reader must understand to interpret the file at all.
pub const FLAGS_INCOMPAT: u32 = 0xFFFF_0000;

/// Newline detector sentinels, in on-disk order.
const SINGLE_END_LINE_CHAR: u8 = b'\n';
const NON_END_LINE_CHAR: u8 = b' ';
const DOUBLE_END_LINE_CHAR1: u8 = b'\r';
const DOUBLE_END_LINE_CHAR2: u8 = b'\n';

pub const COMPRESS_ALGORITHM_NONE: u16 = 0;
pub const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

/// The header occupies exactly one sector on disk.
pub const HEADER_SIZE: usize = SECTOR_SIZE as usize;

/// Per-grain record header when `FLAG_EMBEDDED_LBA` is set:
/// `{ lba: LE64, cmpSize: LE32 }`.
pub const GRAIN_HEADER_SIZE: usize = 12;

/// Record header without an embedded LBA: just `cmpSize: LE32`.
pub const GRAIN_HEADER_SIZE_NO_LBA: usize = 4;

/// Marker type terminating the payload stream.
pub const MARKER_EOS: u32 = 0;

/// Decoded sparse extent header. Sizes and offsets are in sectors unless
/// a field name says otherwise.
#[derive(Debug, Clone)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    /// Disk capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    /// First sector available for payload.
    pub over_head: u64,
    pub unclean_shutdown: u8,
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_embedded_lba(&self) -> bool {
        self.flags & FLAG_EMBEDDED_LBA != 0
    }

    /// Grain size in bytes.
    pub fn grain_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Quick magic probe, used to decide whether a file is a sparse
    /// extent at all before attempting a full decode.
    pub fn check_magic(buf: &[u8]) -> bool {
        buf.len() >= 4 && get_le32(buf, 0) == SPARSE_MAGIC
    }

    /// Decodes and validates a header block.
    ///
    /// # Errors
    ///
    /// Returns a format error on a bad magic, an unsupported version,
    /// unknown incompatible flags, an embedded-LBA flag without the
    /// compressed flag, or corrupted newline sentinels.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(DiskError::Format("extent header too short".into()));
        }
        if get_le32(buf, 0) != SPARSE_MAGIC {
            return Err(DiskError::Format("bad sparse extent magic".into()));
        }
        let version = get_le32(buf, 4);
        if version > SPARSE_VERSION_MAX {
            return Err(DiskError::Format(format!(
                "unsupported sparse extent version {version}"
            )));
        }
        let flags = get_le32(buf, 8);
        if flags & (FLAGS_INCOMPAT & !FLAG_COMPRESSED & !FLAG_EMBEDDED_LBA) != 0 {
            return Err(DiskError::Format(format!(
                "unknown incompatible flags {flags:#010x}"
            )));
        }
        if flags & FLAG_VALID_NEWLINE_DETECTOR != 0
            && (buf[73] != SINGLE_END_LINE_CHAR
                || buf[74] != NON_END_LINE_CHAR
                || buf[75] != DOUBLE_END_LINE_CHAR1
                || buf[76] != DOUBLE_END_LINE_CHAR2)
        {
            return Err(DiskError::Format(
                "newline detector mismatch, file was corrupted in transfer".into(),
            ));
        }
        // Embedded LBA is only meaningful for compressed grains.
        if flags & FLAG_EMBEDDED_LBA != 0 && flags & FLAG_COMPRESSED == 0 {
            return Err(DiskError::Format(
                "embedded LBA flag requires compressed grains".into(),
            ));
        }
        Ok(SparseExtentHeader {
            version,
            flags,
            capacity: get_le64(buf, 12),
            grain_size: get_le64(buf, 20),
            descriptor_offset: get_le64(buf, 28),
            descriptor_size: get_le64(buf, 36),
            num_gtes_per_gt: get_le32(buf, 44),
            rgd_offset: get_le64(buf, 48),
            gd_offset: get_le64(buf, 56),
            over_head: get_le64(buf, 64),
            unclean_shutdown: buf[72],
            compress_algorithm: get_le16(buf, 77),
        })
    }

    /// Encodes the header into its 512-byte on-disk form.
    ///
    /// With `scrambled` set, the magic is written lowercased. Finalization
    /// writes the scrambled form first, syncs, then rewrites with the
    /// canonical magic and syncs again.
    pub fn encode(&self, scrambled: bool) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let magic = if scrambled {
            SPARSE_MAGIC_SCRAMBLED
        } else {
            SPARSE_MAGIC
        };
        put_le32(&mut buf, 0, magic);
        put_le32(&mut buf, 4, self.version);
        put_le32(&mut buf, 8, self.flags);
        put_le64(&mut buf, 12, self.capacity);
        put_le64(&mut buf, 20, self.grain_size);
        put_le64(&mut buf, 28, self.descriptor_offset);
        put_le64(&mut buf, 36, self.descriptor_size);
        put_le32(&mut buf, 44, self.num_gtes_per_gt);
        put_le64(&mut buf, 48, self.rgd_offset);
        put_le64(&mut buf, 56, self.gd_offset);
        put_le64(&mut buf, 64, self.over_head);
        buf[72] = self.unclean_shutdown;
        buf[73] = SINGLE_END_LINE_CHAR;
        buf[74] = NON_END_LINE_CHAR;
        buf[75] = DOUBLE_END_LINE_CHAR1;
        buf[76] = DOUBLE_END_LINE_CHAR2;
        put_le16(&mut buf, 77, self.compress_algorithm);
        buf
    }
}

/// Builds the one-sector special marker record
/// `{ val: LE64, size: LE32, type: LE32, pad... }`.
pub fn encode_marker(marker_type: u32, val: u64) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    put_le64(&mut buf, 0, val);
    put_le32(&mut buf, 12, marker_type);
    buf
}
