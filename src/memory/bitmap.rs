//! Dense bit-indexed page availability tracking.
//!
//! One bit per page/frame, packed into machine words. Both the virtual and
//! the physical availability trackers are instances of [`PageBitmap`]; run
//! searches over it bound what `mmap` can hand out, so the word-boundary
//! behavior here is load-bearing.

use alloc::boxed::Box;
use alloc::vec;

use crate::constants::memory::WORD_BITS;
use crate::memory::MemoryError;

/// Search-miss sentinel returned by the `next_*` family.
pub const NO_INDEX: usize = usize::MAX;

pub struct PageBitmap {
    words: Box<[usize]>,
    capacity: usize,
}

impl PageBitmap {
    /// Allocates backing words for `capacity` bits, all set to `default_value`.
    pub fn new(capacity: usize, default_value: bool) -> Self {
        let word_count = capacity.div_ceil(WORD_BITS);
        let fill = if default_value { usize::MAX } else { 0 };
        Self {
            words: vec![fill; word_count].into_boxed_slice(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reads one bit. Out-of-range indices read as `false`.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        (self.words[index / WORD_BITS] >> (index % WORD_BITS)) & 1 != 0
    }

    /// Writes one bit. Out-of-range indices are a no-op.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.capacity {
            return;
        }
        let mask = 1usize << (index % WORD_BITS);
        if value {
            self.words[index / WORD_BITS] |= mask;
        } else {
            self.words[index / WORD_BITS] &= !mask;
        }
    }

    pub fn set_all(&mut self, value: bool) {
        let fill = if value { usize::MAX } else { 0 };
        self.words.fill(fill);
    }

    /// Sets every bit in `[start, end)` to `value`. Interior whole words are
    /// filled in single stores. Rejects reversed or out-of-capacity ranges
    /// without mutating anything.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) -> Result<(), MemoryError> {
        if start > end || end > self.capacity {
            return Err(MemoryError::InvalidRange);
        }
        let fill = if value { usize::MAX } else { 0 };
        let mut idx = start;
        while idx < end && idx % WORD_BITS != 0 {
            self.set(idx, value);
            idx += 1;
        }
        while idx + WORD_BITS <= end {
            self.words[idx / WORD_BITS] = fill;
            idx += WORD_BITS;
        }
        while idx < end {
            self.set(idx, value);
            idx += 1;
        }
        Ok(())
    }

    /// First index `>= offset` whose bit is set, or [`NO_INDEX`].
    pub fn next_true(&self, offset: usize) -> usize {
        self.scan(offset, true)
    }

    /// First index `>= offset` whose bit is clear, or [`NO_INDEX`].
    pub fn next_false(&self, offset: usize) -> usize {
        self.scan(offset, false)
    }

    /// Start of the first run of at least `n` set bits at or after `offset`.
    pub fn next_true_run(&self, offset: usize, n: usize) -> usize {
        self.scan_run(offset, n, true)
    }

    /// Start of the first run of at least `n` clear bits at or after `offset`.
    pub fn next_false_run(&self, offset: usize, n: usize) -> usize {
        self.scan_run(offset, n, false)
    }

    /// Normalizes a word so that bits matching `target` read as ones.
    fn word_matching(&self, word_idx: usize, target: bool) -> usize {
        let word = self.words[word_idx];
        if target {
            word
        } else {
            !word
        }
    }

    fn scan(&self, offset: usize, target: bool) -> usize {
        if offset >= self.capacity {
            return NO_INDEX;
        }
        let mut word_idx = offset / WORD_BITS;
        // Mask off the bits below `offset` within the first word.
        let mut word = self.word_matching(word_idx, target) & (usize::MAX << (offset % WORD_BITS));
        while word == 0 {
            word_idx += 1;
            if word_idx >= self.words.len() {
                return NO_INDEX;
            }
            word = self.word_matching(word_idx, target);
        }
        let index = word_idx * WORD_BITS + word.trailing_zeros() as usize;
        // The last word can carry bits past capacity; those never count.
        if index >= self.capacity {
            NO_INDEX
        } else {
            index
        }
    }

    /// Locates a run start, measures the run with the complementary search,
    /// and retries from the run's end until one of length `>= n` is found.
    fn scan_run(&self, offset: usize, n: usize, target: bool) -> usize {
        if n == 0 || n > self.capacity {
            return NO_INDEX;
        }
        let mut start = self.scan(offset, target);
        while start != NO_INDEX {
            let boundary = self.scan(start, !target);
            let run_end = if boundary == NO_INDEX {
                self.capacity
            } else {
                boundary
            };
            if run_end - start >= n {
                return start;
            }
            if boundary == NO_INDEX {
                // Run reached capacity without room for `n` bits.
                return NO_INDEX;
            }
            start = self.scan(boundary, target);
        }
        NO_INDEX
    }
}
