pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SHIFT: usize = 12;

/// 4 GiB of address space in 4 KiB pages.
pub const MAX_PAGES: usize = 1 << 20;

/// Entries per page directory / page table (i386 two-level layout).
pub const TABLE_ENTRIES: usize = 1024;

pub const WORD_BITS: usize = usize::BITS as usize;

/// Leftovers smaller than this are handed out whole instead of split off
/// into their own chunk.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Identity-mapped MMIO window at the top of the address space
/// (framebuffer, LAPIC and friends live up here).
pub const MMIO_WINDOW_START: u32 = 0xf000_0000;
