//! Stream-optimized sparse VMDK writer.
//!
//! The writer produces a monolithic stream-optimized extent: an append-only
//! file in which every grain is deflate-compressed and located through the
//! GD/GT index. Sectors for the header, the embedded descriptor and the
//! whole GD+GT region are reserved up front; payload records are appended
//! at a monotonically increasing sector cursor. Finalization writes the
//! end-of-stream marker, the index, the descriptor, and then the header
//! twice (scrambled magic, sync, canonical magic, sync) so that a torn
//! close leaves a file no reader accepts.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::debug;

use crate::compress::{GrainDeflator, NO_GRAIN};
use crate::descriptor;
use crate::error::{DiskError, Result};
use crate::grains::GrainTables;
use crate::header::{
    encode_marker, SparseExtentHeader, COMPRESS_ALGORITHM_DEFLATE, FLAG_COMPRESSED,
    FLAG_EMBEDDED_LBA, FLAG_VALID_NEWLINE_DETECTOR, MARKER_EOS,
};
use crate::sector::{ceiling, pwrite_all, SECTOR_SIZE};

/// Grain size of created extents, in sectors (64 KiB grains).
const DEFAULT_GRAIN_SIZE: u64 = 128;

/// Grain table length of created extents.
const DEFAULT_GTES_PER_GT: u32 = 512;

/// Sectors reserved for the embedded text descriptor.
const DESCRIPTOR_SECTORS: u64 = 20;

/// A stream-optimized extent open for writing.
///
/// The format is append-only: once a grain has been flushed to disk its
/// table entry is set and any later write into it fails with
/// [`DiskError::AlreadyWritten`]. Only one grain is buffered at a time, so
/// moving to another grain flushes the current one.
pub struct StreamOptimizedDisk {
    pub(crate) file: File,
    pub(crate) hdr: SparseExtentHeader,
    pub(crate) tables: GrainTables,
    /// Next payload sector to be allocated.
    pub(crate) cur_sp: u64,
    pub(crate) compression_level: u32,
    grain: GrainDeflator,
    file_name: String,
    tools_version: String,
}

impl StreamOptimizedDisk {
    /// Creates `path` as an empty stream-optimized extent able to hold
    /// `capacity` bytes, compressing grains at `compression_level`
    /// (1 fastest, 9 best). `tools_version` is recorded in the embedded
    /// descriptor's `ddb.toolsVersion` entry.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or the derived geometry is
    /// invalid.
    pub fn create(
        path: &Path,
        capacity: u64,
        compression_level: u32,
        tools_version: &str,
    ) -> Result<Self> {
        let mut hdr = SparseExtentHeader {
            version: 3,
            flags: FLAG_VALID_NEWLINE_DETECTOR | FLAG_COMPRESSED | FLAG_EMBEDDED_LBA,
            capacity: ceiling(capacity, SECTOR_SIZE),
            grain_size: DEFAULT_GRAIN_SIZE,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: DEFAULT_GTES_PER_GT,
            rgd_offset: 0,
            gd_offset: 0,
            over_head: 1,
            unclean_shutdown: 0,
            compress_algorithm: COMPRESS_ALGORITHM_DEFLATE,
        };
        let tables = GrainTables::from_header(&hdr)?;

        // Reserve the descriptor, the GD, and the GT region; payload
        // starts right after.
        hdr.descriptor_offset = hdr.over_head;
        hdr.descriptor_size = DESCRIPTOR_SECTORS;
        hdr.over_head += hdr.descriptor_size;
        hdr.gd_offset = hdr.over_head;
        hdr.over_head += u64::from(tables.gd_sectors);
        hdr.over_head = tables.prefill_gd(hdr.over_head);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!(
            "Created stream-optimized extent '{}': {} sectors, {} grain tables, payload from sector {}",
            file_name, hdr.capacity, tables.gts, hdr.over_head
        );

        let grain = GrainDeflator::new(hdr.grain_bytes() as usize, compression_level);
        let cur_sp = hdr.over_head;
        Ok(StreamOptimizedDisk {
            file,
            hdr,
            tables,
            cur_sp,
            compression_level,
            grain,
            file_name,
            tools_version: tools_version.to_string(),
        })
    }

    /// Disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.hdr.capacity * SECTOR_SIZE
    }

    /// Writes `buf` into the logical disk at byte offset `pos`.
    ///
    /// Walks every grain the range touches. Entering a new grain flushes
    /// the previous one; a write disjoint from the data already staged in
    /// the current grain zero-fills the gap first, because the grain will
    /// become a single deflate stream and cannot have holes.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and when the write lands in a grain that was
    /// already flushed (the append-only contract: "write A, write B, write
    /// A again" is an error even though A only reached the disk because
    /// moving to B forced a flush).
    pub fn pwrite(&mut self, buf: &[u8], pos: u64) -> Result<usize> {
        let grain_bytes = self.hdr.grain_bytes() as usize;
        let mut grain_nr = pos / grain_bytes as u64;
        let mut update_start = (pos % grain_bytes as u64) as usize;
        let mut done = 0usize;
        while done < buf.len() {
            self.prepare_grain(grain_nr)?;
            let update_len = (grain_bytes - update_start).min(buf.len() - done);
            let update_end = update_start + update_len;
            let disjoint = self.grain.valid_end != 0
                && (update_end < self.grain.valid_start || update_start > self.grain.valid_end);
            if disjoint {
                self.fill_grain()?;
            }
            self.grain.buf_mut()[update_start..update_end]
                .copy_from_slice(&buf[done..done + update_len]);
            if update_start < self.grain.valid_start || self.grain.valid_end == 0 {
                self.grain.valid_start = update_start;
            }
            if update_end > self.grain.valid_end {
                self.grain.valid_end = update_end;
            }
            done += update_len;
            grain_nr += 1;
            update_start = 0;
        }
        Ok(done)
    }

    /// Switches the staged grain, flushing the previous one. Returning to
    /// a grain that was already flushed violates the append-only contract
    /// and is rejected up front.
    fn prepare_grain(&mut self, grain_nr: u64) -> Result<()> {
        if grain_nr != self.grain.nr {
            self.flush_grain()?;
            if grain_nr < self.tables.gtes && self.tables.gt(grain_nr) != 0 {
                return Err(DiskError::AlreadyWritten(grain_nr));
            }
            self.grain.reset(grain_nr);
        }
        Ok(())
    }

    /// Zero-pads the staged grain to its effective length (full grain, or
    /// the partial tail length for the last grain).
    fn fill_grain(&mut self) -> Result<()> {
        let nr = self.grain.nr;
        if nr >= self.tables.gtes {
            return Err(DiskError::Geometry(format!(
                "grain {nr} is past the end of the disk"
            )));
        }
        let expected = self.tables.grain_len_bytes(self.hdr.grain_bytes(), nr) as usize;
        if self.grain.valid_start == 0 && self.grain.valid_end >= expected {
            return Ok(());
        }
        if self.tables.gt(nr) != 0 {
            return Err(DiskError::AlreadyWritten(nr));
        }
        self.grain.fill(expected);
        Ok(())
    }

    /// Compresses and appends the staged grain. An all-zero grain is
    /// elided: its table entry stays 0 and no sectors are consumed.
    fn flush_grain(&mut self) -> Result<()> {
        if self.grain.nr == NO_GRAIN || self.grain.valid_end == 0 {
            return Ok(());
        }
        let nr = self.grain.nr;
        if nr >= self.tables.gtes {
            return Err(DiskError::Geometry(format!(
                "grain {nr} is past the end of the disk"
            )));
        }
        self.fill_grain()?;
        if self.tables.gt(nr) != 0 {
            return Err(DiskError::AlreadyWritten(nr));
        }
        if !self.grain.is_zero() {
            let lba = nr * self.hdr.grain_size;
            let record = self.grain.deflate_record(lba)?;
            pwrite_all(&self.file, record, self.cur_sp * SECTOR_SIZE)?;
            self.tables.set_gt(nr, self.cur_sp as u32);
            self.cur_sp += record.len() as u64 / SECTOR_SIZE;
        }
        Ok(())
    }

    /// Writes a one-sector special marker record at the current cursor.
    fn write_special(&mut self, marker_type: u32, val: u64) -> Result<()> {
        let marker = encode_marker(marker_type, val);
        pwrite_all(&self.file, &marker, self.cur_sp * SECTOR_SIZE)
    }

    /// Finalizes the extent: flushes the pending grain, writes the EOS
    /// marker, the GD+GT region, the embedded descriptor, and the header
    /// twice around syncs. On any failure the file is abandoned as-is; the
    /// canonical magic never hits the disk, so readers will reject it.
    pub fn close(mut self) -> Result<()> {
        self.finish()
        // Dropping self releases the buffers and the file handle either way.
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_grain()?;
        self.write_special(MARKER_EOS, 0)?;
        pwrite_all(
            &self.file,
            &self.tables.to_bytes(),
            self.hdr.gd_offset * SECTOR_SIZE,
        )?;

        let cid = descriptor::generate_cid();
        let desc = descriptor::emit(
            &self.file_name,
            self.hdr.capacity,
            cid,
            &self.tools_version,
        );
        pwrite_all(
            &self.file,
            desc.as_bytes(),
            self.hdr.descriptor_offset * SECTOR_SIZE,
        )?;

        let scrambled = self.hdr.encode(true);
        pwrite_all(&self.file, &scrambled, 0)?;
        self.file.sync_all()?;
        let canonical = self.hdr.encode(false);
        pwrite_all(&self.file, &canonical, 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Discards the writer without finalizing. The partial file is left on
    /// disk; since the canonical magic was never written, consumers will
    /// reject it, and unlinking is the caller's business.
    pub fn abort(self) {
        debug!("Aborting stream-optimized extent '{}'", self.file_name);
    }
}
