//! Chunk-descriptor kernel heap.
//!
//! Allocations are tracked by a table of [`HeapChunk`] descriptors linked
//! into a circular, address-ordered list through slot 0 (the anchor, which
//! never describes memory). Backing pages come from the kernel address space
//! via `mmap`; freeing a chunk returns any whole pages it covers with
//! `munmap`, so heap and page bitmaps stay consistent.

use alloc::vec::Vec;

use crate::constants::memory::{MIN_CHUNK_SIZE, PAGE_SIZE};
use crate::memory::paging::{EntryFlags, MemoryManager};
use crate::memory::MemoryError;

/// One region of heap address space, allocated or free.
#[derive(Debug, Clone, Copy)]
struct HeapChunk {
    start: u32,
    size: usize,
    prev: usize,
    next: usize,
    /// The described memory is available for allocation.
    memory_free: bool,
    /// This descriptor slot itself is unused.
    slot_free: bool,
}

impl HeapChunk {
    const fn anchor() -> Self {
        HeapChunk {
            start: 0,
            size: 0,
            prev: 0,
            next: 0,
            memory_free: false,
            slot_free: false,
        }
    }

    fn end(&self) -> u32 {
        self.start + self.size as u32
    }
}

const ANCHOR: usize = 0;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

pub struct HeapAllocator {
    chunks: Vec<HeapChunk>,
    /// Pages accounted to the descriptor table itself.
    table_addr: u32,
    table_pages: usize,
}

impl HeapAllocator {
    /// Sets up an empty heap. One page is mapped for the descriptor table;
    /// the first allocation maps the first data pages.
    pub fn init(mem: &mut MemoryManager) -> Result<Self, MemoryError> {
        let table_addr = mem.mmap(0, PAGE_SIZE, EntryFlags::WRITABLE)?;
        let mut chunks = Vec::new();
        chunks.reserve_exact(Self::slots_per_pages(1));
        chunks.push(HeapChunk::anchor());
        log::debug!("heap: descriptor table at {table_addr:#x}");
        Ok(Self {
            chunks,
            table_addr,
            table_pages: 1,
        })
    }

    fn slots_per_pages(pages: usize) -> usize {
        pages * PAGE_SIZE / core::mem::size_of::<HeapChunk>()
    }

    pub fn allocate(&mut self, mem: &mut MemoryManager, size: usize) -> Result<u32, MemoryError> {
        self.allocate_aligned(mem, size, 1)
    }

    /// First-fit allocation of `size` bytes whose start is a multiple of
    /// `align` (a power of two).
    pub fn allocate_aligned(
        &mut self,
        mem: &mut MemoryManager,
        size: usize,
        align: u32,
    ) -> Result<u32, MemoryError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(MemoryError::InvalidRange);
        }
        self.grow_table_if_needed(mem)?;
        let mut grown = false;
        loop {
            if let Some((idx, aligned)) = self.find_fit(size, align) {
                return Ok(self.place(idx, aligned, size));
            }
            if grown {
                return Err(MemoryError::OutOfMemory);
            }
            self.grow_heap(mem, size + align as usize - 1)?;
            grown = true;
        }
    }

    /// Returns the memory at `address` to the heap. `address` must be the
    /// exact start of a live allocation.
    pub fn free(&mut self, mem: &mut MemoryManager, address: u32) -> Result<(), MemoryError> {
        self.grow_table_if_needed(mem)?;
        let idx = self
            .walk()
            .find(|&i| self.chunks[i].start == address && !self.chunks[i].memory_free)
            .ok_or(MemoryError::BadPointer)?;
        self.chunks[idx].memory_free = true;
        let idx = self.merge_neighbors(idx);
        self.release_whole_pages(mem, idx)
    }

    /// Sum of the sizes of all free chunks.
    pub fn total_free_bytes(&self) -> usize {
        self.walk()
            .filter(|&i| self.chunks[i].memory_free)
            .map(|i| self.chunks[i].size)
            .sum()
    }

    /// Chunk indices in address order, anchor excluded.
    fn walk(&self) -> ChunkWalk<'_> {
        ChunkWalk {
            chunks: &self.chunks,
            at: self.chunks[ANCHOR].next,
        }
    }

    fn find_fit(&self, size: usize, align: u32) -> Option<(usize, u32)> {
        self.walk().find_map(|i| {
            let chunk = &self.chunks[i];
            if !chunk.memory_free {
                return None;
            }
            let aligned = align_up(chunk.start, align);
            let gap = (aligned - chunk.start) as usize;
            if gap + size <= chunk.size {
                Some((i, aligned))
            } else {
                None
            }
        })
    }

    /// Carves `size` bytes at `aligned` out of free chunk `idx`: splits off
    /// an alignment gap in front and a remainder behind when the remainder is
    /// worth a descriptor.
    fn place(&mut self, mut idx: usize, aligned: u32, size: usize) -> u32 {
        let gap = (aligned - self.chunks[idx].start) as usize;
        if gap > 0 {
            idx = self.split(idx, gap);
        }
        let leftover = self.chunks[idx].size - size;
        if leftover > MIN_CHUNK_SIZE {
            self.split(idx, size);
        }
        self.chunks[idx].memory_free = false;
        self.chunks[idx].start
    }

    /// Splits chunk `idx` at `offset` bytes, returning the index of the new
    /// upper chunk. Both halves inherit the free flag.
    fn split(&mut self, idx: usize, offset: usize) -> usize {
        let upper_slot = self.slot();
        let chunk = self.chunks[idx];
        self.chunks[upper_slot] = HeapChunk {
            start: chunk.start + offset as u32,
            size: chunk.size - offset,
            prev: idx,
            next: chunk.next,
            memory_free: chunk.memory_free,
            slot_free: false,
        };
        self.chunks[chunk.next].prev = upper_slot;
        self.chunks[idx].next = upper_slot;
        self.chunks[idx].size = offset;
        upper_slot
    }

    /// Absorbs address-contiguous free neighbors into `idx`; returns the
    /// index of the surviving chunk.
    fn merge_neighbors(&mut self, mut idx: usize) -> usize {
        let prev = self.chunks[idx].prev;
        if prev != ANCHOR
            && self.chunks[prev].memory_free
            && self.chunks[prev].end() == self.chunks[idx].start
        {
            self.chunks[prev].size += self.chunks[idx].size;
            self.unlink(idx);
            idx = prev;
        }
        let next = self.chunks[idx].next;
        if next != ANCHOR
            && self.chunks[next].memory_free
            && self.chunks[idx].end() == self.chunks[next].start
        {
            self.chunks[idx].size += self.chunks[next].size;
            self.unlink(next);
        }
        idx
    }

    /// Unmaps every whole page inside free chunk `idx` and trims or removes
    /// the descriptor so it only covers still-mapped bytes.
    fn release_whole_pages(&mut self, mem: &mut MemoryManager, idx: usize) -> Result<(), MemoryError> {
        let chunk = self.chunks[idx];
        let first = align_up(chunk.start, PAGE_SIZE as u32);
        let last = align_down(chunk.end(), PAGE_SIZE as u32);
        if first >= last {
            return Ok(());
        }
        mem.munmap(first, (last - first) as usize)?;

        let head = (first - chunk.start) as usize;
        let tail = (chunk.end() - last) as usize;
        match (head > 0, tail > 0) {
            (false, false) => self.unlink(idx),
            (true, false) => self.chunks[idx].size = head,
            (false, true) => {
                self.chunks[idx].start = last;
                self.chunks[idx].size = tail;
            }
            (true, true) => {
                self.chunks[idx].size = head;
                let upper = self.slot();
                let next = self.chunks[idx].next;
                self.chunks[upper] = HeapChunk {
                    start: last,
                    size: tail,
                    prev: idx,
                    next,
                    memory_free: true,
                    slot_free: false,
                };
                self.chunks[next].prev = upper;
                self.chunks[idx].next = upper;
            }
        }
        Ok(())
    }

    fn unlink(&mut self, idx: usize) {
        let HeapChunk { prev, next, .. } = self.chunks[idx];
        self.chunks[prev].next = next;
        self.chunks[next].prev = prev;
        self.chunks[idx].slot_free = true;
    }

    /// Finds a free descriptor slot, pushing a new one when the table has
    /// room. `allocate_aligned` and `free` grow the table before touching the
    /// list, so the push never outruns the accounted pages.
    fn slot(&mut self) -> usize {
        if let Some(i) = (1..self.chunks.len()).find(|&i| self.chunks[i].slot_free) {
            return i;
        }
        self.chunks.push(HeapChunk::anchor());
        self.chunks.len() - 1
    }

    /// Maps fresh pages big enough for `min_bytes` at the top of the heap.
    /// Contiguous with a free tail chunk, the tail is extended; otherwise a
    /// new free chunk is appended.
    fn grow_heap(&mut self, mem: &mut MemoryManager, min_bytes: usize) -> Result<(), MemoryError> {
        let tail = self.chunks[ANCHOR].prev;
        let hint = if tail == ANCHOR {
            0
        } else {
            self.chunks[tail].end()
        };
        let bytes = min_bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let addr = mem.mmap(hint, bytes, EntryFlags::WRITABLE)?;
        log::debug!("heap: grew by {bytes} bytes at {addr:#x}");

        if tail != ANCHOR && self.chunks[tail].memory_free && self.chunks[tail].end() == addr {
            self.chunks[tail].size += bytes;
            return Ok(());
        }
        let slot = self.slot();
        self.chunks[slot] = HeapChunk {
            start: addr,
            size: bytes,
            prev: tail,
            next: ANCHOR,
            memory_free: true,
            slot_free: false,
        };
        self.chunks[tail].next = slot;
        self.chunks[ANCHOR].prev = slot;
        Ok(())
    }

    /// Doubles the descriptor table's page accounting when the current pages
    /// are nearly exhausted. The old pages are unmapped after the new ones
    /// are in place.
    fn grow_table_if_needed(&mut self, mem: &mut MemoryManager) -> Result<(), MemoryError> {
        // Growth and release can each add a descriptor; keep two spare.
        if self.chunks.len() + 2 <= Self::slots_per_pages(self.table_pages) {
            return Ok(());
        }
        let new_pages = self.table_pages * 2;
        let new_addr = mem.mmap(0, new_pages * PAGE_SIZE, EntryFlags::WRITABLE)?;
        mem.munmap(self.table_addr, self.table_pages * PAGE_SIZE)?;
        self.chunks.reserve_exact(Self::slots_per_pages(new_pages) - self.chunks.len());
        self.table_addr = new_addr;
        self.table_pages = new_pages;
        log::debug!("heap: descriptor table now {new_pages} pages at {new_addr:#x}");
        Ok(())
    }
}

struct ChunkWalk<'a> {
    chunks: &'a [HeapChunk],
    at: usize,
}

impl Iterator for ChunkWalk<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.at == ANCHOR {
            return None;
        }
        let idx = self.at;
        self.at = self.chunks[idx].next;
        Some(idx)
    }
}
