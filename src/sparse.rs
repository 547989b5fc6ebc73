//! Sparse extent reader.
//!
//! Opens a monolithic sparse VMDK extent (stream-optimized or hosted),
//! loads the grain index, and serves random reads by decompressing grains
//! on demand. Holes and explicit-zero grains read back as zeros without
//! touching the file.

use std::fs::File;
use std::path::Path;

use log::debug;

use crate::compress::GrainInflator;
use crate::error::{DiskError, Result};
use crate::grains::GrainTables;
use crate::header::{
    SparseExtentHeader, COMPRESS_ALGORITHM_DEFLATE, GRAIN_HEADER_SIZE, GRAIN_HEADER_SIZE_NO_LBA,
    HEADER_SIZE,
};
use crate::sector::{get_le32, get_le64, pread_exact, round_to_sector, SECTOR_SIZE};

/// Accumulates adjacent positional reads into single requests.
///
/// Loading the grain tables issues one read per allocated table; tables
/// that are contiguous both on disk and in the destination buffer collapse
/// into one request, so a fully populated index loads in a single read.
struct CoalescedReader<'a> {
    file: &'a File,
    pending: Option<Pending>,
}

struct Pending {
    dest: usize,
    len: usize,
    pos: u64,
}

impl<'a> CoalescedReader<'a> {
    fn new(file: &'a File) -> Self {
        CoalescedReader {
            file,
            pending: None,
        }
    }

    /// Queues a read of `len` bytes at file offset `pos` into
    /// `buf[dest..]`, merging it with the pending request when both the
    /// file range and the destination range are contiguous.
    fn request(&mut self, buf: &mut [u8], dest: usize, len: usize, pos: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if let Some(pending) = &mut self.pending {
            if pending.pos + pending.len as u64 == pos && pending.dest + pending.len == dest {
                pending.len += len;
                return Ok(());
            }
            let pending = self.pending.take().unwrap();
            pread_exact(
                self.file,
                &mut buf[pending.dest..pending.dest + pending.len],
                pending.pos,
            )?;
        }
        self.pending = Some(Pending { dest, len, pos });
        Ok(())
    }

    /// Executes the last pending request.
    fn finish(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            pread_exact(
                self.file,
                &mut buf[pending.dest..pending.dest + pending.len],
                pending.pos,
            )?;
        }
        Ok(())
    }
}

/// A sparse extent open for reading.
pub struct SparseDisk {
    file: File,
    hdr: SparseExtentHeader,
    tables: GrainTables,
}

impl SparseDisk {
    /// Opens and validates a sparse extent, loading the grain directory
    /// and every allocated grain table.
    ///
    /// # Errors
    ///
    /// Fails when the header does not validate (see
    /// [`SparseExtentHeader::decode`]), the geometry is out of range, the
    /// compression algorithm is not deflate, or the index cannot be read.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut hdr_buf = [0u8; HEADER_SIZE];
        pread_exact(&file, &mut hdr_buf, 0)?;
        let hdr = SparseExtentHeader::decode(&hdr_buf)?;
        if hdr.is_compressed() && hdr.compress_algorithm != COMPRESS_ALGORITHM_DEFLATE {
            return Err(DiskError::Format(format!(
                "unsupported compression algorithm {}",
                hdr.compress_algorithm
            )));
        }
        let tables = GrainTables::from_header(&hdr)?;
        debug!(
            "Opened sparse extent '{}': {} sectors, {} grain tables",
            path.display(),
            hdr.capacity,
            tables.gts
        );

        let mut gd_bytes = vec![0u8; tables.gd_sectors as usize * SECTOR_SIZE as usize];
        pread_exact(&file, &mut gd_bytes, hdr.gd_offset * SECTOR_SIZE)?;
        tables.load_gd(&gd_bytes);

        // Tables whose directory entry is 0 cover only holes and are left
        // zeroed in the slab.
        let gt_len = tables.gt_sectors as usize * SECTOR_SIZE as usize;
        let mut gt_bytes = vec![0u8; gt_len * tables.gts as usize];
        let mut reader = CoalescedReader::new(&file);
        for i in 0..tables.gts {
            let loc = tables.gd(i);
            if loc != 0 {
                reader.request(
                    &mut gt_bytes,
                    i as usize * gt_len,
                    gt_len,
                    u64::from(loc) * SECTOR_SIZE,
                )?;
            }
        }
        reader.finish(&mut gt_bytes)?;
        tables.load_gts(&gt_bytes);

        Ok(SparseDisk { file, hdr, tables })
    }

    /// Disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.hdr.capacity * SECTOR_SIZE
    }

    /// Decoded extent header, for inspection tools.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.hdr
    }

    /// The embedded text descriptor, when the extent carries one.
    pub fn embedded_descriptor(&self) -> Result<Option<String>> {
        if self.hdr.descriptor_offset == 0 || self.hdr.descriptor_size == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; (self.hdr.descriptor_size * SECTOR_SIZE) as usize];
        pread_exact(&self.file, &mut buf, self.hdr.descriptor_offset * SECTOR_SIZE)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(Some(String::from_utf8_lossy(&buf[..end]).into_owned()))
    }

    /// Reads up to `buf.len()` bytes of decompressed disk content starting
    /// at byte offset `pos`. Returns the number of bytes read, which is
    /// smaller than requested only when the request reaches past the end
    /// of the disk.
    ///
    /// The inflate context is created once per call and reset between
    /// grains, so a single source can serve many readers concurrently.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let grain_bytes = self.hdr.grain_bytes();
        let mut grain_nr = pos / grain_bytes;
        let mut read_skip = (pos % grain_bytes) as usize;
        let mut inflator = GrainInflator::new();
        let mut grain_buf = vec![0u8; grain_bytes as usize];
        let mut record_buf = vec![0u8; (grain_bytes + SECTOR_SIZE) as usize];
        let mut done = 0usize;
        while done < buf.len() {
            let grain_len = self.tables.grain_len_bytes(grain_bytes, grain_nr) as usize;
            if read_skip >= grain_len {
                // Past the tail of the disk; the request is clipped.
                break;
            }
            let read_len = (grain_len - read_skip).min(buf.len() - done);
            let sect = self.tables.gt(grain_nr);
            if sect <= 1 {
                // Hole or explicit zero grain.
                buf[done..done + read_len].fill(0);
            } else if self.hdr.is_compressed() {
                self.read_compressed_grain(
                    sect,
                    grain_nr,
                    grain_len,
                    &mut record_buf,
                    &mut grain_buf,
                    &mut inflator,
                )?;
                buf[done..done + read_len]
                    .copy_from_slice(&grain_buf[read_skip..read_skip + read_len]);
            } else {
                // Uncompressed hosted sparse extent: the grain lives
                // uncompressed at its sector, read the slice directly.
                pread_exact(
                    &self.file,
                    &mut buf[done..done + read_len],
                    u64::from(sect) * SECTOR_SIZE + read_skip as u64,
                )?;
            }
            done += read_len;
            grain_nr += 1;
            read_skip = 0;
        }
        Ok(done)
    }

    /// Reads and inflates the record of one grain into `grain_buf`.
    fn read_compressed_grain(
        &self,
        sect: u32,
        grain_nr: u64,
        grain_len: usize,
        record_buf: &mut [u8],
        grain_buf: &mut [u8],
        inflator: &mut GrainInflator,
    ) -> Result<()> {
        let sector = SECTOR_SIZE as usize;
        pread_exact(&self.file, &mut record_buf[..sector], u64::from(sect) * SECTOR_SIZE)?;
        let (hdr_len, cmp_size) = if self.hdr.has_embedded_lba() {
            let lba = get_le64(record_buf, 0);
            if lba != grain_nr * self.hdr.grain_size {
                return Err(DiskError::Integrity(format!(
                    "grain {grain_nr} record carries LBA {lba}, expected {}",
                    grain_nr * self.hdr.grain_size
                )));
            }
            (GRAIN_HEADER_SIZE, get_le32(record_buf, 8) as usize)
        } else {
            (GRAIN_HEADER_SIZE_NO_LBA, get_le32(record_buf, 0) as usize)
        };
        if cmp_size > record_buf.len() - hdr_len {
            return Err(DiskError::Integrity(format!(
                "grain {grain_nr} compressed size {cmp_size} exceeds the grain bound"
            )));
        }
        if cmp_size + hdr_len > sector {
            let remaining = round_to_sector((cmp_size + hdr_len - sector) as u64) as usize;
            let (_, rest) = record_buf.split_at_mut(sector);
            pread_exact(&self.file, &mut rest[..remaining], (u64::from(sect) + 1) * SECTOR_SIZE)?;
        }
        let produced = inflator.inflate(&record_buf[hdr_len..hdr_len + cmp_size], grain_buf)?;
        if produced < grain_len {
            return Err(DiskError::Integrity(format!(
                "grain {grain_nr} inflated to {produced} bytes, expected at least {grain_len}"
            )));
        }
        Ok(())
    }

    /// Finds the next data range at or after `pos`: the first allocated
    /// grain opens the range (keeping the in-grain offset when `pos` falls
    /// inside it), the next hole grain closes it, and a range still open
    /// at the end of the disk closes at the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DiskError::NoData`] when no allocated grain exists at or
    /// after `pos`.
    pub fn next_data(&self, pos: u64) -> Result<(u64, u64)> {
        let grain_bytes = self.hdr.grain_bytes();
        let mut grain_nr = pos / grain_bytes;
        let mut skip = pos % grain_bytes;
        let mut start = None;
        while grain_nr < self.tables.gtes {
            let empty = self.tables.gt(grain_nr) == 0;
            match start {
                None if !empty => start = Some(grain_nr * grain_bytes + skip),
                Some(s) if empty => return Ok((s, grain_nr * grain_bytes)),
                _ => {}
            }
            skip = 0;
            grain_nr += 1;
        }
        match start {
            Some(s) => Ok((
                s,
                self.tables.last_grain_nr * grain_bytes + u64::from(self.tables.last_grain_size),
            )),
            None => Err(DiskError::NoData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_coalesced_reader_merges_adjacent() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        tmp.write_all(&data).unwrap();
        let file = tmp.reopen().unwrap();

        let mut buf = vec![0u8; 3072];
        let mut reader = CoalescedReader::new(&file);
        // Three adjacent requests collapse into one pending read.
        reader.request(&mut buf, 0, 1024, 0).unwrap();
        reader.request(&mut buf, 1024, 1024, 1024).unwrap();
        reader.request(&mut buf, 2048, 1024, 2048).unwrap();
        assert!(reader.pending.as_ref().is_some_and(|p| p.len == 3072));
        reader.finish(&mut buf).unwrap();
        assert_eq!(buf, data[..3072]);
    }

    #[test]
    fn test_coalesced_reader_splits_discontiguous() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..8192u32).map(|i| (i / 32) as u8).collect();
        tmp.write_all(&data).unwrap();
        let file = tmp.reopen().unwrap();

        let mut buf = vec![0u8; 2048];
        let mut reader = CoalescedReader::new(&file);
        reader.request(&mut buf, 0, 1024, 0).unwrap();
        // Contiguous destination but a gap in the file: must not merge.
        reader.request(&mut buf, 1024, 1024, 4096).unwrap();
        assert!(reader.pending.as_ref().is_some_and(|p| p.len == 1024));
        reader.finish(&mut buf).unwrap();
        assert_eq!(buf[..1024], data[..1024]);
        assert_eq!(buf[1024..], data[4096..5120]);
    }
}
