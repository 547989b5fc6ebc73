//! Codec for VMware stream-optimized sparse VMDK disk images.
//!
//! The crate creates stream-optimized extents from arbitrary source disks,
//! compressing grains through a pool of workers, and opens existing sparse
//! extents for random-access reads with on-demand decompression. Raw flat
//! images are supported as sources and sinks so a disk can be converted in
//! either direction.
//!
//! Disks are reached through the [`Disk`] enum, which dispatches the
//! common capability set over the concrete kinds. Not every kind supports
//! every operation: the sparse reader cannot be written, the
//! stream-optimized writer cannot be read back before it is finalized.

pub mod compress;
pub mod copy;
pub mod descriptor;
pub mod error;
pub mod flat;
pub mod grains;
pub mod header;
pub mod sector;
pub mod sparse;
pub mod stream;

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

pub use copy::copy_disk;
pub use error::{DiskError, Result};
pub use flat::FlatDisk;
pub use sparse::SparseDisk;
pub use stream::StreamOptimizedDisk;

use header::{SparseExtentHeader, SPARSE_MAGIC_SCRAMBLED};
use sector::get_le32;

/// A disk reachable through the common capability set.
pub enum Disk {
    /// A sparse extent open for reading.
    Sparse(SparseDisk),
    /// A stream-optimized extent open for writing.
    Stream(StreamOptimizedDisk),
    /// A raw file-backed disk.
    Flat(FlatDisk),
}

impl Disk {
    /// Opens an existing disk for reading, probing the sparse extent magic
    /// and falling back to a raw flat image.
    ///
    /// A file carrying the scrambled (lowercased) magic is the leftover of
    /// an interrupted finalization and is rejected outright rather than
    /// being misread as a raw image.
    pub fn open(path: &Path) -> Result<Disk> {
        let file = File::open(path)?;
        let mut probe = [0u8; 4];
        let is_sparse = match file.read_exact_at(&mut probe, 0) {
            Ok(()) => {
                if get_le32(&probe, 0) == SPARSE_MAGIC_SCRAMBLED {
                    return Err(DiskError::Format(
                        "extent was never finalized (scrambled magic)".into(),
                    ));
                }
                SparseExtentHeader::check_magic(&probe)
            }
            // Too short for a header; a raw image may still be this small.
            Err(_) => false,
        };
        drop(file);
        if is_sparse {
            debug!("Opening '{}' as a sparse extent", path.display());
            Ok(Disk::Sparse(SparseDisk::open(path)?))
        } else {
            debug!("Opening '{}' as a flat image", path.display());
            Ok(Disk::Flat(FlatDisk::open(path)?))
        }
    }

    /// Creates a stream-optimized extent able to hold `capacity` bytes.
    pub fn create_stream_optimized(
        path: &Path,
        capacity: u64,
        compression_level: u32,
        tools_version: &str,
    ) -> Result<Disk> {
        Ok(Disk::Stream(StreamOptimizedDisk::create(
            path,
            capacity,
            compression_level,
            tools_version,
        )?))
    }

    /// Creates a raw flat image pre-sized to `capacity` bytes.
    pub fn create_flat(path: &Path, capacity: u64) -> Result<Disk> {
        Ok(Disk::Flat(FlatDisk::create(path, capacity)?))
    }

    /// Short name of the disk kind, for reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Disk::Sparse(_) => "sparse",
            Disk::Stream(_) => "streamOptimized",
            Disk::Flat(_) => "flat",
        }
    }

    /// Disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        match self {
            Disk::Sparse(disk) => disk.capacity(),
            Disk::Stream(disk) => disk.capacity(),
            Disk::Flat(disk) => disk.capacity(),
        }
    }

    /// Positional read of decompressed disk content.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        match self {
            Disk::Sparse(disk) => disk.pread(buf, pos),
            Disk::Stream(_) => Err(DiskError::Unsupported(
                "a stream-optimized extent under construction cannot be read",
            )),
            Disk::Flat(disk) => disk.pread(buf, pos),
        }
    }

    /// Positional write into the logical disk.
    pub fn pwrite(&mut self, buf: &[u8], pos: u64) -> Result<usize> {
        match self {
            Disk::Sparse(_) => Err(DiskError::Unsupported(
                "sparse extents are opened read-only",
            )),
            Disk::Stream(disk) => disk.pwrite(buf, pos),
            Disk::Flat(disk) => disk.pwrite(buf, pos),
        }
    }

    /// Finds the next data range at or after `pos`.
    pub fn next_data(&self, pos: u64) -> Result<(u64, u64)> {
        match self {
            Disk::Sparse(disk) => disk.next_data(pos),
            Disk::Stream(_) => Err(DiskError::Unsupported(
                "a stream-optimized extent under construction cannot be scanned",
            )),
            Disk::Flat(disk) => disk.next_data(pos),
        }
    }

    /// Closes the disk, finalizing a stream-optimized extent.
    pub fn close(self) -> Result<()> {
        match self {
            Disk::Sparse(_) | Disk::Flat(_) => Ok(()),
            Disk::Stream(disk) => disk.close(),
        }
    }

    /// Releases the disk without finalizing anything.
    pub fn abort(self) {
        if let Disk::Stream(disk) = self {
            disk.abort();
        }
    }
}
