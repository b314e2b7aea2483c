//! Typed free-space bitmap.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`; a set bit means the
//! resource is in use. The type owns its bytes and is independent of the
//! block buffer it was loaded from.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    #[error("bit range {start}+{count} exceeds bitmap length {len}")]
    OutOfRange { start: u32, count: u32, len: u32 },
    #[error("bit {bit} already set")]
    AlreadySet { bit: u32 },
    #[error("bit {bit} already clear")]
    AlreadyClear { bit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    len: u32,
}

impl Bitmap {
    /// An all-free bitmap of `len` bits.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0_u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Wrap raw bytes, tracking only the first `len` bits. Short input is
    /// zero-extended.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], len: u32) -> Self {
        let mut owned = vec![0_u8; len.div_ceil(8) as usize];
        let n = owned.len().min(bytes.len());
        owned[..n].copy_from_slice(&bytes[..n]);
        Self { bytes: owned, len }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy the tracked bytes over the front of `block`.
    pub fn write_into(&self, block: &mut [u8]) {
        let n = self.bytes.len().min(block.len());
        block[..n].copy_from_slice(&self.bytes[..n]);
    }

    #[must_use]
    pub fn is_set(&self, bit: u32) -> bool {
        if bit >= self.len {
            return false;
        }
        (self.bytes[(bit / 8) as usize] >> (bit % 8)) & 1 == 1
    }

    fn put(&mut self, bit: u32, value: bool) {
        let byte = &mut self.bytes[(bit / 8) as usize];
        if value {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }

    #[must_use]
    pub fn count_free(&self) -> u32 {
        let full = (self.len / 8) as usize;
        let mut free: u32 = self.bytes[..full].iter().map(|b| b.count_zeros()).sum();
        for bit in (self.len / 8) * 8..self.len {
            if !self.is_set(bit) {
                free += 1;
            }
        }
        free
    }

    /// First run of `count` free bits.
    #[must_use]
    pub fn find_free_run(&self, count: u32) -> Option<u32> {
        self.find_run_in(0, self.len, count)
    }

    /// First run of `count` free bits at or after `goal`, wrapping to the
    /// start of the bitmap if none is found past it.
    #[must_use]
    pub fn find_free_run_from(&self, goal: u32, count: u32) -> Option<u32> {
        let goal = goal.min(self.len);
        self.find_run_in(goal, self.len, count)
            .or_else(|| self.find_run_in(0, self.len, count))
    }

    fn find_run_in(&self, from: u32, to: u32, count: u32) -> Option<u32> {
        if count == 0 || count > to.saturating_sub(from) {
            return None;
        }
        let mut run_start = from;
        let mut run_len = 0_u32;
        let mut bit = from;
        while bit < to {
            // Skip fully used bytes while not inside a run.
            if run_len == 0 && bit % 8 == 0 && self.bytes[(bit / 8) as usize] == 0xFF {
                bit += 8;
                run_start = bit;
                continue;
            }
            if self.is_set(bit) {
                run_start = bit + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }

    fn check_range(&self, start: u32, count: u32) -> Result<(), BitmapError> {
        match start.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BitmapError::OutOfRange {
                start,
                count,
                len: self.len,
            }),
        }
    }

    /// Mark `[start, start + count)` used. Fails without modifying anything
    /// if any bit in the range is already set.
    pub fn set_range(&mut self, start: u32, count: u32) -> Result<(), BitmapError> {
        self.check_range(start, count)?;
        if let Some(bit) = (start..start + count).find(|&b| self.is_set(b)) {
            return Err(BitmapError::AlreadySet { bit });
        }
        for bit in start..start + count {
            self.put(bit, true);
        }
        Ok(())
    }

    /// Mark `[start, start + count)` free. Fails without modifying anything
    /// if any bit in the range is already clear.
    pub fn clear_range(&mut self, start: u32, count: u32) -> Result<(), BitmapError> {
        self.check_range(start, count)?;
        if let Some(bit) = (start..start + count).find(|&b| !self.is_set(b)) {
            return Err(BitmapError::AlreadyClear { bit });
        }
        for bit in start..start + count {
            self.put(bit, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_and_clear_single_bits() {
        let mut bm = Bitmap::new(16);
        bm.set_range(0, 1).unwrap();
        bm.set_range(7, 2).unwrap();
        assert_eq!(bm.as_bytes(), &[0x81, 0x01]);
        assert!(bm.is_set(8));
        bm.clear_range(7, 1).unwrap();
        assert!(!bm.is_set(7));
        assert_eq!(bm.count_free(), 14);
    }

    #[test]
    fn double_set_and_double_clear_are_rejected() {
        let mut bm = Bitmap::new(32);
        bm.set_range(4, 4).unwrap();
        assert_eq!(bm.set_range(6, 4), Err(BitmapError::AlreadySet { bit: 6 }));
        // Nothing past the conflict was touched.
        assert!(!bm.is_set(8));
        assert_eq!(
            bm.clear_range(2, 4),
            Err(BitmapError::AlreadyClear { bit: 2 })
        );
        assert!(bm.is_set(4));
    }

    #[test]
    fn range_past_end_is_rejected() {
        let mut bm = Bitmap::new(10);
        assert!(matches!(
            bm.set_range(8, 3),
            Err(BitmapError::OutOfRange { .. })
        ));
        assert!(matches!(
            bm.set_range(u32::MAX, 2),
            Err(BitmapError::OutOfRange { .. })
        ));
    }

    #[test]
    fn find_free_run_skips_fragments() {
        let mut bm = Bitmap::new(64);
        for i in (0..16).step_by(2) {
            bm.set_range(i, 1).unwrap();
        }
        assert_eq!(bm.find_free_run(1), Some(1));
        assert_eq!(bm.find_free_run(2), Some(15));
        bm.set_range(16, 8).unwrap();
        assert_eq!(bm.find_free_run(2), Some(24));
        assert_eq!(bm.find_free_run(41), None);
        assert_eq!(bm.find_free_run(40), Some(24));
    }

    #[test]
    fn find_free_run_from_wraps() {
        let mut bm = Bitmap::new(16);
        bm.set_range(8, 8).unwrap();
        assert_eq!(bm.find_free_run_from(3, 2), Some(3));
        assert_eq!(bm.find_free_run_from(10, 2), Some(0));
    }

    #[test]
    fn partial_last_byte_is_respected() {
        let bm = Bitmap::from_bytes(&[0x00, 0xFF], 12);
        assert_eq!(bm.count_free(), 8);
        assert_eq!(bm.find_free_run(9), None);
        assert_eq!(bm.len(), 12);
    }

    proptest! {
        #[test]
        fn free_count_tracks_set_and_clear(ops in proptest::collection::vec((0_u32..200, 1_u32..8), 0..40)) {
            let mut bm = Bitmap::new(256);
            let mut used = 0_u32;
            for (start, count) in ops {
                if bm.set_range(start, count).is_ok() {
                    used += count;
                }
            }
            prop_assert_eq!(bm.count_free(), 256 - used);
        }

        #[test]
        fn found_runs_are_free(fill in proptest::collection::vec(proptest::num::u8::ANY, 8), count in 1_u32..10) {
            let bm = Bitmap::from_bytes(&fill, 64);
            if let Some(start) = bm.find_free_run(count) {
                for bit in start..start + count {
                    prop_assert!(!bm.is_set(bit));
                }
            }
        }
    }
}
