//! Grain directory and grain table model.
//!
//! A sparse extent locates grains through a two-level index: the grain
//! directory (GD) maps grain-table numbers to the file sector holding that
//! grain table, and each grain table (GT) maps grain numbers to the file
//! sector of the grain's record. Entry 0 marks a hole, entry 1 an explicit
//! zero grain.
//!
//! GD and GTs live in a single contiguous allocation, GTs immediately
//! after the GD, so the writer can finalize the whole index with one
//! positional write and the reader can pull adjacent tables in one request.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DiskError, Result};
use crate::header::SparseExtentHeader;
use crate::sector::{ceiling, get_le32, put_le32, SECTOR_SIZE};

const GTE_SIZE: u64 = 4;
const GTES_PER_SECTOR: usize = (SECTOR_SIZE / GTE_SIZE) as usize;

fn is_pow2(val: u64) -> bool {
    val != 0 && val & (val - 1) == 0
}

/// Grain index geometry plus the backing GD+GT slab.
///
/// The slab entries are atomics so that copy-engine workers can publish
/// their own grain's table entry without a lock; every grain number is
/// claimed by exactly one worker, and joining the workers publishes the
/// final values to the thread that serializes the slab.
pub struct GrainTables {
    /// Total number of live grain table entries (grains covering the disk).
    pub gtes: u64,
    /// Number of grain tables.
    pub gts: u32,
    /// Sectors occupied by the grain directory.
    pub gd_sectors: u32,
    /// Sectors occupied by one grain table.
    pub gt_sectors: u32,
    /// Grain number of the partial grain at the end of the disk.
    pub last_grain_nr: u64,
    /// Size in bytes of the partial tail grain; 0 when the capacity is
    /// grain-aligned (the disk then ends with grain `last_grain_nr - 1`).
    pub last_grain_size: u32,
    slab: Vec<AtomicU32>,
    gd_entries: usize,
}

impl GrainTables {
    /// Derives the index geometry from a decoded header and allocates the
    /// zeroed GD+GT slab.
    ///
    /// # Errors
    ///
    /// Returns a geometry error when the grain size is not a power of two
    /// in [1, 128] sectors, or the grain table length is not a power of
    /// two of at least one sector's worth of entries.
    pub fn from_header(hdr: &SparseExtentHeader) -> Result<Self> {
        if hdr.grain_size < 1 || hdr.grain_size > 128 || !is_pow2(hdr.grain_size) {
            return Err(DiskError::Geometry(format!(
                "grain size {} is not a power of two in [1, 128]",
                hdr.grain_size
            )));
        }
        if (hdr.num_gtes_per_gt as usize) < GTES_PER_SECTOR || !is_pow2(hdr.num_gtes_per_gt as u64)
        {
            return Err(DiskError::Geometry(format!(
                "grain table length {} is not a power of two of at least {}",
                hdr.num_gtes_per_gt, GTES_PER_SECTOR
            )));
        }
        let last_grain_nr = hdr.capacity / hdr.grain_size;
        let last_grain_size = ((hdr.capacity & (hdr.grain_size - 1)) * SECTOR_SIZE) as u32;
        let gtes = last_grain_nr + u64::from(last_grain_size != 0);
        // The sector pointers in a GT are 32 bits; so is the entry count.
        if gtes > u64::from(u32::MAX) {
            return Err(DiskError::Geometry(format!(
                "capacity of {} sectors needs more than 2^32 grains",
                hdr.capacity
            )));
        }
        let gts = ceiling(gtes, u64::from(hdr.num_gtes_per_gt)) as u32;
        let gd_sectors = ceiling(u64::from(gts) * GTE_SIZE, SECTOR_SIZE) as u32;
        let gt_sectors = ceiling(u64::from(hdr.num_gtes_per_gt) * GTE_SIZE, SECTOR_SIZE) as u32;
        let gd_entries = gd_sectors as usize * GTES_PER_SECTOR;
        let total = gd_entries + gt_sectors as usize * gts as usize * GTES_PER_SECTOR;
        let mut slab = Vec::with_capacity(total);
        slab.resize_with(total, || AtomicU32::new(0));
        Ok(GrainTables {
            gtes,
            gts,
            gd_sectors,
            gt_sectors,
            last_grain_nr,
            last_grain_size,
            slab,
            gd_entries,
        })
    }

    /// Assigns each GD entry its reserved grain table location, starting
    /// at `gt_base`, and returns the first sector past the reserved range,
    /// which becomes the first sector available for payload.
    pub fn prefill_gd(&self, mut gt_base: u64) -> u64 {
        for i in 0..self.gts as usize {
            self.slab[i].store(gt_base as u32, Ordering::Relaxed);
            gt_base += u64::from(self.gt_sectors);
        }
        gt_base
    }

    /// Sector location of grain table `i`, 0 when unallocated.
    pub fn gd(&self, i: u32) -> u32 {
        self.slab[i as usize].load(Ordering::Relaxed)
    }

    /// Sector location of the record for grain `grain_nr`. GTs are
    /// contiguous, so the grain number indexes the GT region directly.
    pub fn gt(&self, grain_nr: u64) -> u32 {
        self.slab[self.gd_entries + grain_nr as usize].load(Ordering::Relaxed)
    }

    /// Records the sector location for grain `grain_nr`.
    pub fn set_gt(&self, grain_nr: u64, sector: u32) {
        self.slab[self.gd_entries + grain_nr as usize].store(sector, Ordering::Relaxed);
    }

    /// Effective size in bytes of grain `grain_nr`: a full grain below the
    /// tail, the partial tail size at it, and 0 past the end of the disk.
    pub fn grain_len_bytes(&self, grain_bytes: u64, grain_nr: u64) -> u64 {
        if grain_nr < self.last_grain_nr {
            grain_bytes
        } else if grain_nr == self.last_grain_nr {
            u64::from(self.last_grain_size)
        } else {
            0
        }
    }

    /// Total size of the GD+GT region in sectors.
    pub fn region_sectors(&self) -> u64 {
        u64::from(self.gd_sectors) + u64::from(self.gt_sectors) * u64::from(self.gts)
    }

    /// Serializes the whole GD+GT slab to its little-endian on-disk image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.slab.len() * GTE_SIZE as usize];
        for (i, entry) in self.slab.iter().enumerate() {
            put_le32(&mut bytes, i * GTE_SIZE as usize, entry.load(Ordering::Relaxed));
        }
        bytes
    }

    /// Decodes the grain directory region read from disk.
    pub fn load_gd(&self, bytes: &[u8]) {
        for i in 0..self.gd_entries {
            self.slab[i].store(get_le32(bytes, i * GTE_SIZE as usize), Ordering::Relaxed);
        }
    }

    /// Decodes the full grain table region read from disk. Tables whose GD
    /// entry is unallocated were never read and decode as zeros.
    pub fn load_gts(&self, bytes: &[u8]) {
        for i in 0..self.slab.len() - self.gd_entries {
            self.slab[self.gd_entries + i]
                .store(get_le32(bytes, i * GTE_SIZE as usize), Ordering::Relaxed);
        }
    }
}
