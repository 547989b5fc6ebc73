//! Whole-file tests: write stream-optimized extents, read them back, and
//! poke at the on-disk bytes.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vmdk_stream::sector::{get_le32, round_to_sector, SECTOR_SIZE};
use vmdk_stream::{copy_disk, Disk, DiskError, FlatDisk, SparseDisk, StreamOptimizedDisk};

const GRAIN_BYTES: usize = 64 * 1024;

fn workdir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// A source image mixing incompressible noise, zero runs and repetitive
/// text, grain-aligned so hole elision kicks in.
fn mixed_pattern(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut x = 0xDEADBEEFu32;
    for (i, chunk) in data.chunks_mut(GRAIN_BYTES).enumerate() {
        match i % 3 {
            0 => {} // hole grain
            1 => {
                for b in chunk.iter_mut() {
                    x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                    *b = (x >> 24) as u8;
                }
            }
            _ => {
                for (j, b) in chunk.iter_mut().enumerate() {
                    *b = b"all work and no play "[j % 21];
                }
            }
        }
    }
    data
}

fn write_stream(path: &Path, data: &[u8], chunk: usize) {
    let mut disk = StreamOptimizedDisk::create(path, data.len() as u64, 6, "0").unwrap();
    for (i, part) in data.chunks(chunk).enumerate() {
        assert_eq!(disk.pwrite(part, (i * chunk) as u64).unwrap(), part.len());
    }
    disk.close().unwrap();
}

fn read_back(path: &Path, len: usize) -> Vec<u8> {
    let disk = SparseDisk::open(path).unwrap();
    let mut data = vec![0u8; len];
    let mut pos = 0usize;
    while pos < len {
        let n = disk
            .pread(&mut data[pos..(pos + 123_456).min(len)], pos as u64)
            .unwrap();
        assert!(n > 0, "pread made no progress at {pos}");
        pos += n;
    }
    data
}

/// Reads the grain table entries straight from the file bytes.
fn raw_gt_entries(path: &Path) -> (vmdk_stream::header::SparseExtentHeader, Vec<u32>) {
    let data = std::fs::read(path).unwrap();
    let hdr = vmdk_stream::header::SparseExtentHeader::decode(&data).unwrap();
    let grains = (hdr.capacity + hdr.grain_size - 1) / hdr.grain_size;
    let gd_sectors = (4 * ((grains + u64::from(hdr.num_gtes_per_gt) - 1)
        / u64::from(hdr.num_gtes_per_gt))
        + SECTOR_SIZE
        - 1)
        / SECTOR_SIZE;
    let gt_base = ((hdr.gd_offset + gd_sectors) * SECTOR_SIZE) as usize;
    let entries = (0..grains)
        .map(|i| get_le32(&data, gt_base + i as usize * 4))
        .collect();
    (hdr, entries)
}

#[test]
fn round_trip_mixed_image() {
    let dir = workdir();
    let path = dir.path().join("mixed.vmdk");
    let data = mixed_pattern(48 * GRAIN_BYTES);
    write_stream(&path, &data, 1 << 20);
    assert_eq!(read_back(&path, data.len()), data);
}

#[test]
fn round_trip_unaligned_writes() {
    let dir = workdir();
    let path = dir.path().join("unaligned.vmdk");
    let data = mixed_pattern(7 * GRAIN_BYTES + 12345);
    // Odd chunk size exercises grain-crossing writes.
    write_stream(&path, &data, 33_333);
    assert_eq!(read_back(&path, data.len()), data);
}

#[test]
fn all_zero_disk_has_no_data() {
    let dir = workdir();
    let path = dir.path().join("zero.vmdk");
    write_stream(&path, &vec![0u8; 128 * 512], 128 * 512);

    let disk = SparseDisk::open(&path).unwrap();
    assert!(matches!(disk.next_data(0), Err(DiskError::NoData)));
    let mut buf = vec![0xFFu8; 4096];
    assert_eq!(disk.pread(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn single_grain_disk() {
    let dir = workdir();
    let path = dir.path().join("single.vmdk");
    let mut data = vec![0u8; 256 * 512];
    data[..GRAIN_BYTES].fill(0xA5);
    write_stream(&path, &data, data.len());

    let (_, entries) = raw_gt_entries(&path);
    assert_ne!(entries[0], 0);
    assert_eq!(entries[1], 0);

    let disk = SparseDisk::open(&path).unwrap();
    let mut buf = vec![0u8; GRAIN_BYTES];
    assert_eq!(disk.pread(&mut buf, 0).unwrap(), GRAIN_BYTES);
    assert!(buf.iter().all(|&b| b == 0xA5));
}

#[test]
fn tail_grain_clipping() {
    let dir = workdir();
    let path = dir.path().join("tail.vmdk");
    let data: Vec<u8> = (0..100u8).collect();
    write_stream(&path, &data, 100);

    let disk = SparseDisk::open(&path).unwrap();
    // The 100-byte capacity rounds up to one 512-byte sector.
    assert_eq!(disk.capacity(), 512);
    let mut buf = vec![0u8; 100];
    assert_eq!(disk.pread(&mut buf, 0).unwrap(), 100);
    assert_eq!(buf, data);
    // A read straddling the end of the disk is clipped.
    let mut buf = [0u8; 2];
    assert_eq!(disk.pread(&mut buf, 511).unwrap(), 1);
    assert_eq!(disk.pread(&mut buf, 512).unwrap(), 0);
    assert_eq!(disk.pread(&mut buf, 100_000).unwrap(), 0);
}

#[test]
fn hole_and_explicit_zero_read_alike() {
    let dir = workdir();
    let path = dir.path().join("holes.vmdk");
    let mut data = vec![0u8; 4 * GRAIN_BYTES];
    data[GRAIN_BYTES..2 * GRAIN_BYTES].fill(0x5A);
    write_stream(&path, &data, data.len());

    // Grain 2 is a hole; patch its table entry to the explicit-zero
    // sentinel and confirm the read does not change.
    let (hdr, _) = raw_gt_entries(&path);
    let gt_base = (hdr.gd_offset + 1) * SECTOR_SIZE;
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&1u32.to_le_bytes(), gt_base + 2 * 4).unwrap();
    drop(file);

    assert_eq!(read_back(&path, data.len()), data);
}

#[test]
fn next_data_walks_holes() {
    let dir = workdir();
    let path = dir.path().join("spans.vmdk");
    let mut data = vec![0u8; 8 * GRAIN_BYTES];
    data[2 * GRAIN_BYTES..4 * GRAIN_BYTES].fill(1);
    data[6 * GRAIN_BYTES..6 * GRAIN_BYTES + 100].fill(2);
    write_stream(&path, &data, data.len());

    let disk = SparseDisk::open(&path).unwrap();
    let g = GRAIN_BYTES as u64;
    assert_eq!(disk.next_data(0).unwrap(), (2 * g, 4 * g));
    // A hint inside a data range keeps its in-grain offset.
    assert_eq!(disk.next_data(2 * g + 777).unwrap(), (2 * g + 777, 4 * g));
    assert_eq!(disk.next_data(4 * g).unwrap(), (6 * g, 7 * g));
    assert!(matches!(disk.next_data(7 * g), Err(DiskError::NoData)));
}

#[test]
fn scrambled_magic_is_rejected() {
    let dir = workdir();
    let path = dir.path().join("torn.vmdk");
    write_stream(&path, &mixed_pattern(2 * GRAIN_BYTES), GRAIN_BYTES);

    // Simulate a crash between the two header writes.
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(b"kdmv", 0).unwrap();
    drop(file);

    assert!(matches!(
        SparseDisk::open(&path),
        Err(DiskError::Format(_))
    ));
    assert!(matches!(Disk::open(&path), Err(DiskError::Format(_))));
}

#[test]
fn embedded_lba_mismatch_is_rejected() {
    let dir = workdir();
    let path = dir.path().join("badlba.vmdk");
    let mut data = vec![0u8; 2 * GRAIN_BYTES];
    data.fill(0x42);
    write_stream(&path, &data, data.len());

    let (_, entries) = raw_gt_entries(&path);
    let record_pos = u64::from(entries[1]) * SECTOR_SIZE;
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&999u64.to_le_bytes(), record_pos).unwrap();
    drop(file);

    let disk = SparseDisk::open(&path).unwrap();
    let mut buf = vec![0u8; GRAIN_BYTES];
    // Grain 0 is untouched.
    disk.pread(&mut buf, 0).unwrap();
    // Grain 1 carries a wrong embedded LBA.
    assert!(matches!(
        disk.pread(&mut buf, GRAIN_BYTES as u64),
        Err(DiskError::Integrity(_))
    ));
}

fn convert(dir: &Path, data: &[u8], threads: usize, name: &str) -> PathBuf {
    let src_path = dir.join(format!("{name}.img"));
    let mut src = FlatDisk::create(&src_path, data.len() as u64).unwrap();
    src.pwrite(data, 0).unwrap();
    drop(src);

    let dst_path = dir.join(format!("{name}.vmdk"));
    let src = Disk::open(&src_path).unwrap();
    let dst = Disk::create_stream_optimized(&dst_path, data.len() as u64, 6, "0").unwrap();
    let copied = copy_disk(&src, dst, threads).unwrap();
    assert_eq!(copied, data.len() as u64);
    dst_path
}

#[test]
fn parallel_copy_matches_single_threaded() {
    let dir = workdir();
    let data = mixed_pattern(4 << 20);

    let serial = convert(dir.path(), &data, 1, "serial");
    let parallel = convert(dir.path(), &data, 8, "parallel");

    // Reader output is byte-identical even though the on-disk sector
    // assignment depends on worker scheduling.
    assert_eq!(read_back(&serial, data.len()), data);
    assert_eq!(read_back(&parallel, data.len()), data);
}

#[test]
fn parallel_copy_sector_accounting() {
    let dir = workdir();
    let data = mixed_pattern(4 << 20);
    let path = convert(dir.path(), &data, 8, "accounting");

    let (hdr, entries) = raw_gt_entries(&path);
    let populated: Vec<u32> = entries.iter().copied().filter(|&s| s != 0).collect();
    assert!(!populated.is_empty());

    // Every allocated grain lives in the payload area, at a distinct
    // sector.
    let mut sorted = populated.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), populated.len());
    assert!(sorted.iter().all(|&s| u64::from(s) >= hdr.over_head));

    // The payload area is exactly the sum of the rounded-up record sizes:
    // the end-of-stream marker sits right after the last record.
    let file_bytes = std::fs::read(&path).unwrap();
    let mut payload_sectors = 0u64;
    for &sect in &populated {
        let cmp_size = get_le32(&file_bytes, (u64::from(sect) * SECTOR_SIZE + 8) as usize);
        payload_sectors += round_to_sector(12 + u64::from(cmp_size)) / SECTOR_SIZE;
    }
    let eos_sector = hdr.over_head + payload_sectors;
    assert_eq!(file_bytes.len() as u64, (eos_sector + 1) * SECTOR_SIZE);
}

#[test]
fn convert_back_to_raw_image() {
    let dir = workdir();
    let data = mixed_pattern(2 << 20);
    let vmdk = convert(dir.path(), &data, 4, "back");

    let raw_path = dir.path().join("back-restored.img");
    let src = Disk::open(&vmdk).unwrap();
    let dst = Disk::create_flat(&raw_path, src.capacity()).unwrap();
    copy_disk(&src, dst, 1).unwrap();

    let restored = Disk::open(&raw_path).unwrap();
    let mut buf = vec![0u8; data.len()];
    assert_eq!(restored.pread(&mut buf, 0).unwrap(), data.len());
    assert_eq!(buf, data);
}

#[test]
fn writer_reports_descriptor_metadata() {
    let dir = workdir();
    let path = dir.path().join("meta.vmdk");
    write_stream(&path, &mixed_pattern(2 * GRAIN_BYTES), GRAIN_BYTES);

    let disk = SparseDisk::open(&path).unwrap();
    let text = disk.embedded_descriptor().unwrap().unwrap();
    let info: vmdk_stream::descriptor::DescriptorInfo = text.parse().unwrap();
    assert_eq!(
        info.create_type,
        vmdk_stream::descriptor::DiskType::StreamOptimized
    );
    assert_eq!(info.capacity_sectors() * SECTOR_SIZE, disk.capacity());
    assert_eq!(info.extents[0].file_name.as_deref(), Some("meta.vmdk"));
    assert_ne!(info.cid, 0xFFFF_FFFF);
    assert_ne!(info.cid, 0xFFFF_FFFE);
}
