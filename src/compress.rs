//! Per-grain compression contexts.
//!
//! Each grain is compressed as an independent zlib-framed deflate stream,
//! produced and consumed in a single call. The contexts are allocated once
//! and reset between grains; the record buffer is sized once from the
//! worst-case deflate bound and never grows.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{DiskError, Result};
use crate::header::GRAIN_HEADER_SIZE;
use crate::sector::{is_zeroed, put_le32, put_le64, round_to_sector};

/// Grain number marking an empty grain buffer.
pub const NO_GRAIN: u64 = u64::MAX;

/// Worst-case zlib output size for `len` input bytes: incompressible data
/// expands by the stored-block framing plus the zlib envelope.
fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 18
}

/// One grain's worth of staged data plus the deflate context that turns it
/// into an on-disk compressed grain record.
pub struct GrainDeflator {
    ctx: Compress,
    /// Grain number the buffer belongs to, [`NO_GRAIN`] when empty.
    pub nr: u64,
    /// Byte range of the buffer holding caller data. The range is kept
    /// contiguous; disjoint updates force a zero fill of the gap first.
    pub valid_start: usize,
    pub valid_end: usize,
    buf: Vec<u8>,
    record: Vec<u8>,
}

impl GrainDeflator {
    /// Allocates buffers for `grain_bytes`-sized grains at the given
    /// deflate `level` (1 fastest, 9 best).
    pub fn new(grain_bytes: usize, level: u32) -> Self {
        let record_len = round_to_sector((deflate_bound(grain_bytes) + GRAIN_HEADER_SIZE) as u64);
        GrainDeflator {
            ctx: Compress::new(Compression::new(level), true),
            nr: NO_GRAIN,
            valid_start: 0,
            valid_end: 0,
            buf: vec![0u8; grain_bytes],
            record: vec![0u8; record_len as usize],
        }
    }

    /// Marks the buffer as belonging to `grain_nr` with no valid data yet.
    pub fn reset(&mut self, grain_nr: u64) {
        self.nr = grain_nr;
        self.valid_start = 0;
        self.valid_end = 0;
    }

    /// Grain staging buffer.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Zero-pads the valid range out to `[0, expected)`. No-op when the
    /// range already covers it.
    pub fn fill(&mut self, expected: usize) {
        if self.valid_start == 0 && self.valid_end >= expected {
            return;
        }
        if self.valid_start != 0 {
            self.buf[..self.valid_start].fill(0);
            self.valid_start = 0;
        }
        if self.valid_end < expected {
            self.buf[self.valid_end..expected].fill(0);
            self.valid_end = expected;
        }
    }

    /// True when every valid byte is zero, in which case the grain becomes
    /// a hole instead of a record.
    pub fn is_zero(&self) -> bool {
        is_zeroed(&self.buf[..self.valid_end])
    }

    /// Compresses the valid range into a complete grain record: the
    /// `{lba, cmpSize}` header, the deflate stream, and zero padding up to
    /// the next sector boundary.
    ///
    /// # Errors
    ///
    /// Fails when the deflate stream cannot be finished in one pass, which
    /// with a bound-sized output buffer indicates a broken context.
    pub fn deflate_record(&mut self, lba: u64) -> Result<&[u8]> {
        self.ctx.reset();
        let cap = self.record.len();
        let status = self
            .ctx
            .compress(
                &self.buf[..self.valid_end],
                &mut self.record[GRAIN_HEADER_SIZE..cap],
                FlushCompress::Finish,
            )
            .map_err(|e| DiskError::Integrity(format!("grain deflate failed: {e}")))?;
        if status != Status::StreamEnd {
            return Err(DiskError::Integrity(
                "grain deflate did not reach end of stream".into(),
            ));
        }
        let cmp_size = self.ctx.total_out() as usize;
        put_le64(&mut self.record, 0, lba);
        put_le32(&mut self.record, 8, cmp_size as u32);
        let len = GRAIN_HEADER_SIZE + cmp_size;
        let padded = round_to_sector(len as u64) as usize;
        self.record[len..padded].fill(0);
        Ok(&self.record[..padded])
    }
}

/// Reusable inflate context for reading compressed grains.
pub struct GrainInflator {
    ctx: Decompress,
}

impl GrainInflator {
    pub fn new() -> Self {
        GrainInflator {
            ctx: Decompress::new(true),
        }
    }

    /// Inflates one complete grain stream into `out`, returning the number
    /// of bytes produced.
    ///
    /// # Errors
    ///
    /// Fails when the stream does not end cleanly within `out`.
    pub fn inflate(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.ctx.reset(true);
        let status = self
            .ctx
            .decompress(input, out, FlushDecompress::Finish)
            .map_err(|e| DiskError::Integrity(format!("grain inflate failed: {e}")))?;
        if status != Status::StreamEnd {
            return Err(DiskError::Integrity(
                "grain inflate did not reach end of stream".into(),
            ));
        }
        Ok(self.ctx.total_out() as usize)
    }
}

impl Default for GrainInflator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::{get_le32, get_le64, SECTOR_SIZE};

    const GRAIN_BYTES: usize = 128 * 512;

    #[test]
    fn test_record_round_trip() {
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 6);
        deflator.reset(3);
        deflator.buf_mut()[..GRAIN_BYTES]
            .iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b = (i % 251) as u8);
        deflator.valid_end = GRAIN_BYTES;

        let record = deflator.deflate_record(3 * 128).unwrap().to_vec();
        assert_eq!(record.len() % SECTOR_SIZE as usize, 0);
        assert_eq!(get_le64(&record, 0), 3 * 128);
        let cmp_size = get_le32(&record, 8) as usize;
        assert!(cmp_size <= record.len() - GRAIN_HEADER_SIZE);

        let mut out = vec![0u8; GRAIN_BYTES];
        let mut inflator = GrainInflator::new();
        let produced = inflator
            .inflate(&record[GRAIN_HEADER_SIZE..GRAIN_HEADER_SIZE + cmp_size], &mut out)
            .unwrap();
        assert_eq!(produced, GRAIN_BYTES);
        assert!(out.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn test_tail_grain_partial_length() {
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 9);
        deflator.reset(0);
        deflator.buf_mut()[..100].fill(0xA5);
        deflator.valid_end = 100;

        let record = deflator.deflate_record(0).unwrap().to_vec();
        let cmp_size = get_le32(&record, 8) as usize;
        let mut out = vec![0u8; GRAIN_BYTES];
        let produced = GrainInflator::new()
            .inflate(&record[GRAIN_HEADER_SIZE..GRAIN_HEADER_SIZE + cmp_size], &mut out)
            .unwrap();
        assert_eq!(produced, 100);
        assert!(out[..100].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_context_reuse_across_grains() {
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 1);
        let mut inflator = GrainInflator::new();
        for nr in 0..4u64 {
            deflator.reset(nr);
            deflator.buf_mut().fill(nr as u8 + 1);
            deflator.valid_end = GRAIN_BYTES;
            let record = deflator.deflate_record(nr * 128).unwrap().to_vec();
            let cmp_size = get_le32(&record, 8) as usize;
            let mut out = vec![0u8; GRAIN_BYTES];
            let produced = inflator
                .inflate(&record[GRAIN_HEADER_SIZE..GRAIN_HEADER_SIZE + cmp_size], &mut out)
                .unwrap();
            assert_eq!(produced, GRAIN_BYTES);
            assert!(out.iter().all(|&b| b == nr as u8 + 1));
        }
    }

    #[test]
    fn test_fill_pads_disjoint_range() {
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 6);
        deflator.reset(0);
        deflator.buf_mut()[1024..2048].fill(0xFF);
        deflator.valid_start = 1024;
        deflator.valid_end = 2048;
        deflator.fill(GRAIN_BYTES);
        assert_eq!(deflator.valid_start, 0);
        assert_eq!(deflator.valid_end, GRAIN_BYTES);
        assert!(!deflator.is_zero());
        let buf = deflator.buf_mut();
        assert!(buf[..1024].iter().all(|&b| b == 0));
        assert!(buf[2048..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_grain_detected() {
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 6);
        deflator.reset(0);
        deflator.fill(GRAIN_BYTES);
        assert!(deflator.is_zero());
    }

    #[test]
    fn test_incompressible_grain_fits_bound() {
        // A pseudo-random grain must still fit the sized-once record buffer.
        let mut deflator = GrainDeflator::new(GRAIN_BYTES, 9);
        deflator.reset(0);
        let mut x = 0x12345678u32;
        for b in deflator.buf_mut().iter_mut() {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (x >> 24) as u8;
        }
        deflator.valid_end = GRAIN_BYTES;
        assert!(deflator.deflate_record(0).is_ok());
    }
}
