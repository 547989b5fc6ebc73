//! Flat (raw) disk abstraction.
//!
//! A thin wrapper around [`std::fs::File`] treating the whole file as the
//! disk content. This is the usual source when converting a raw image into
//! a stream-optimized extent, and the usual sink when extracting one.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{DiskError, Result};
use crate::sector::pread_exact;

/// A raw file-backed disk. The capacity is simply the file length.
pub struct FlatDisk {
    file: File,
    capacity: u64,
}

impl FlatDisk {
    /// Opens an existing raw image read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let capacity = file.metadata()?.len();
        Ok(FlatDisk { file, capacity })
    }

    /// Creates (or truncates) a raw image pre-sized to `capacity` bytes.
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(FlatDisk { file, capacity })
    }

    /// Disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reads up to `buf.len()` bytes at `pos`, clipped to the capacity.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        if pos >= self.capacity {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.capacity - pos) as usize;
        pread_exact(&self.file, &mut buf[..len], pos)?;
        Ok(len)
    }

    /// Writes `buf` at `pos`.
    pub fn pwrite(&mut self, buf: &[u8], pos: u64) -> Result<usize> {
        crate::sector::pwrite_all(&self.file, buf, pos)?;
        Ok(buf.len())
    }

    /// A flat disk is one contiguous data range; there are no holes to
    /// skip.
    pub fn next_data(&self, pos: u64) -> Result<(u64, u64)> {
        if pos >= self.capacity {
            return Err(DiskError::NoData);
        }
        Ok((pos, self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.img");
        let mut disk = FlatDisk::create(&path, 4096).unwrap();
        assert_eq!(disk.capacity(), 4096);
        disk.pwrite(&[0xAB; 100], 1000).unwrap();

        let disk = FlatDisk::open(&path).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(disk.pread(&mut buf, 1000).unwrap(), 100);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_pread_clips_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.img");
        let disk = FlatDisk::create(&path, 100).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(disk.pread(&mut buf, 90).unwrap(), 10);
        assert_eq!(disk.pread(&mut buf, 100).unwrap(), 0);
        assert_eq!(disk.pread(&mut buf, 200).unwrap(), 0);
    }

    #[test]
    fn test_next_data_single_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("span.img");
        let disk = FlatDisk::create(&path, 100).unwrap();
        assert_eq!(disk.next_data(0).unwrap(), (0, 100));
        assert_eq!(disk.next_data(40).unwrap(), (40, 100));
        assert!(matches!(disk.next_data(100), Err(DiskError::NoData)));
    }
}
