//! Disk-to-disk copy: the parallel grain compression engine used when the
//! destination is a stream-optimized extent, and a single-threaded span
//! copy for everything else.
//!
//! The engine runs N workers over a shared read cursor. Each worker claims
//! one grain-sized slice of the source, reads and compresses it in its own
//! buffers, reserves output sectors under the write cursor's lock, writes
//! the record, and publishes its grain table entry. Output sector order
//! therefore follows reservation order, not grain order; the grain table
//! records the true location of every grain. No I/O happens under any
//! lock, and no worker ever holds two locks at once.

use std::fs::File;
use std::sync::Mutex;
use std::thread;

use log::error;

use crate::compress::GrainDeflator;
use crate::error::{DiskError, Result};
use crate::flat::FlatDisk;
use crate::grains::GrainTables;
use crate::sector::{pwrite_all, SECTOR_SIZE};
use crate::sparse::SparseDisk;
use crate::stream::StreamOptimizedDisk;
use crate::Disk;

/// Chunk size of the single-threaded span copy.
const COPY_CHUNK: usize = 64 * 1024;

/// The narrow source capability the engine needs: capacity plus a
/// positional read that any number of workers may call at once.
enum CopySource<'a> {
    Sparse(&'a SparseDisk),
    Flat(&'a FlatDisk),
}

impl CopySource<'_> {
    fn of(disk: &Disk) -> Result<CopySource<'_>> {
        match disk {
            Disk::Sparse(sparse) => Ok(CopySource::Sparse(sparse)),
            Disk::Flat(flat) => Ok(CopySource::Flat(flat)),
            Disk::Stream(_) => Err(DiskError::Unsupported(
                "an extent under construction cannot be a copy source",
            )),
        }
    }

    fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        match self {
            CopySource::Sparse(sparse) => sparse.pread(buf, pos),
            CopySource::Flat(flat) => flat.pread(buf, pos),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CopyState {
    Running,
    Done,
    Failed,
}

struct CopyContext<'a> {
    src: CopySource<'a>,
    file: &'a File,
    tables: &'a GrainTables,
    grain_bytes: u64,
    grain_size: u64,
    capacity: u64,
    read_pos: Mutex<u64>,
    cur_sp: Mutex<u64>,
    state: Mutex<CopyState>,
}

impl CopyContext<'_> {
    fn fail(&self) {
        *self.state.lock().unwrap() = CopyState::Failed;
    }
}

/// One worker: claim, read, compress, reserve, write, publish, repeat.
fn grain_worker(ctx: &CopyContext<'_>, compression_level: u32) {
    let mut grain = GrainDeflator::new(ctx.grain_bytes as usize, compression_level);
    loop {
        // Another worker may have failed since the last iteration; stop
        // early instead of doing wasted work.
        if *ctx.state.lock().unwrap() == CopyState::Failed {
            return;
        }
        let claim = {
            let mut read_pos = ctx.read_pos.lock().unwrap();
            if *read_pos >= ctx.capacity {
                None
            } else {
                let pos = *read_pos;
                let len = (ctx.capacity - pos).min(ctx.grain_bytes);
                *read_pos += len;
                Some((pos, len as usize))
            }
        };
        let (pos, len) = match claim {
            Some(claim) => claim,
            None => {
                // The source is exhausted. The read cursor only grows, so
                // announcing completion after dropping its lock is sound.
                let mut state = ctx.state.lock().unwrap();
                if *state == CopyState::Running {
                    *state = CopyState::Done;
                }
                return;
            }
        };
        let grain_nr = pos / ctx.grain_bytes;
        grain.reset(grain_nr);
        match ctx.src.pread(&mut grain.buf_mut()[..len], pos) {
            Ok(n) if n == len => {}
            Ok(n) => {
                error!("short read from source at {pos}: {n} of {len} bytes");
                ctx.fail();
                return;
            }
            Err(e) => {
                error!("reading source at {pos}: {e}");
                ctx.fail();
                return;
            }
        }
        grain.valid_end = len;
        if grain.is_zero() {
            // Hole: no record, no sectors, table entry stays 0.
            continue;
        }
        let record = match grain.deflate_record(grain_nr * ctx.grain_size) {
            Ok(record) => record,
            Err(e) => {
                error!("compressing grain {grain_nr}: {e}");
                ctx.fail();
                return;
            }
        };
        let sectors = record.len() as u64 / SECTOR_SIZE;
        let sp = {
            let mut cur_sp = ctx.cur_sp.lock().unwrap();
            let sp = *cur_sp;
            *cur_sp += sectors;
            sp
        };
        if let Err(e) = pwrite_all(ctx.file, record, sp * SECTOR_SIZE) {
            error!("writing grain {grain_nr} at sector {sp}: {e}");
            ctx.fail();
            return;
        }
        // This worker owns grain_nr through its read-cursor claim, so no
        // lock is needed to publish the entry.
        ctx.tables.set_gt(grain_nr, sp as u32);
    }
}

/// Drains `src` into the stream-optimized writer with `num_threads`
/// workers. Returns the number of bytes read from the source.
///
/// The driver joins every worker it managed to spawn, whatever the
/// outcome; the copy succeeds only if all workers were created and the
/// shared state ended as done.
pub(crate) fn parallel_copy(
    src: &Disk,
    dst: &mut StreamOptimizedDisk,
    num_threads: usize,
) -> Result<u64> {
    let ctx = CopyContext {
        src: CopySource::of(src)?,
        file: &dst.file,
        tables: &dst.tables,
        grain_bytes: dst.hdr.grain_bytes(),
        grain_size: dst.hdr.grain_size,
        capacity: src.capacity(),
        read_pos: Mutex::new(0),
        cur_sp: Mutex::new(dst.cur_sp),
        state: Mutex::new(CopyState::Running),
    };
    let compression_level = dst.compression_level;

    let mut spawned = 0usize;
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let builder = thread::Builder::new().name(format!("grain-worker-{i}"));
            match builder.spawn_scoped(scope, || grain_worker(&ctx, compression_level)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("failed to spawn compression worker {i}: {e}");
                    ctx.fail();
                    break;
                }
            }
        }
        spawned = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                ctx.fail();
            }
        }
    });

    dst.cur_sp = *ctx.cur_sp.lock().unwrap();
    let read_pos = *ctx.read_pos.lock().unwrap();
    if spawned == num_threads && *ctx.state.lock().unwrap() == CopyState::Done {
        Ok(read_pos)
    } else {
        Err(DiskError::Copy(
            "parallel grain compression failed".into(),
        ))
    }
}

/// Copies the byte range `[pos, end)` from `src` to `dst` in fixed-size
/// chunks.
fn copy_data(dst: &mut Disk, src: &Disk, mut pos: u64, end: u64) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK];
    while pos < end {
        let len = ((end - pos) as usize).min(COPY_CHUNK);
        let read = src.pread(&mut buf[..len], pos)?;
        if read != len {
            return Err(DiskError::Format(format!(
                "short read from source at offset {pos}: {read} of {len} bytes"
            )));
        }
        let written = dst.pwrite(&buf[..len], pos)?;
        if written != len {
            return Err(DiskError::ShortWrite {
                offset: pos,
                written,
                expected: len,
            });
        }
        pos += len as u64;
    }
    Ok(())
}

/// Copies `src` into `dst` and finalizes the destination.
///
/// A stream-optimized destination is filled by the parallel engine; any
/// other destination gets the source's data spans copied one chunk at a
/// time, skipping holes. On success the destination is closed and the
/// number of bytes copied is returned; on failure it is aborted and the
/// partial file is left behind for the caller to unlink.
pub fn copy_disk(src: &Disk, dst: Disk, num_threads: usize) -> Result<u64> {
    match dst {
        Disk::Stream(mut writer) => match parallel_copy(src, &mut writer, num_threads.max(1)) {
            Ok(copied) => {
                writer.close()?;
                Ok(copied)
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        },
        mut other => {
            let mut copied = 0u64;
            let mut end = 0u64;
            loop {
                match src.next_data(end) {
                    Ok((pos, span_end)) => {
                        if let Err(e) = copy_data(&mut other, src, pos, span_end) {
                            other.abort();
                            return Err(e);
                        }
                        copied += span_end - pos;
                        end = span_end;
                    }
                    Err(DiskError::NoData) => break,
                    Err(e) => {
                        other.abort();
                        return Err(e);
                    }
                }
            }
            other.close()?;
            Ok(copied)
        }
    }
}
