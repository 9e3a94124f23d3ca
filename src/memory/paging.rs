//! Two-level i386 paging.
//!
//! One [`AddressSpace`] exists for the kernel (built once at boot from the
//! boot loader's memory map, never torn down) and one per user process. An
//! address space owns its directory, its lazily created tables and the
//! virtual-availability bitmap; physical frames always come from the shared
//! [`FrameAllocator`] borrowed per call.
//!
//! All bookkeeping here is plain memory the address space owns. Nothing
//! dereferences a mapped virtual address until paging has been made live on
//! real hardware, so the whole module is exercisable off-target.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::constants::memory::{FRAME_SHIFT, MAX_PAGES, PAGE_SIZE, TABLE_ENTRIES};
use crate::memory::bitmap::{PageBitmap, NO_INDEX};
use crate::memory::frames::FrameAllocator;
use crate::memory::{MemoryError, MemoryRegion};

/// A 32-bit virtual address, decomposed 10/10/12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub fn from_page(page: usize) -> Self {
        VirtAddr((page as u32) << FRAME_SHIFT)
    }

    pub fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    pub fn table_index(self) -> usize {
        ((self.0 >> FRAME_SHIFT) & 0x3ff) as usize
    }

    pub fn page_offset(self) -> usize {
        (self.0 & 0xfff) as usize
    }

    pub fn page_index(self) -> usize {
        (self.0 >> FRAME_SHIFT) as usize
    }
}

bitflags! {
    /// Flag bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
    }
}

/// Table entry: flags in the low 12 bits, frame index in the top 20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: usize, flags: EntryFlags) -> Self {
        PageTableEntry(((frame as u32) << FRAME_SHIFT) | (flags | EntryFlags::PRESENT).bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn frame_index(self) -> usize {
        (self.0 >> FRAME_SHIFT) as usize
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Directory entry: flags plus the covering table's page-aligned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageDirectoryEntry(u32);

impl PageDirectoryEntry {
    pub const fn empty() -> Self {
        PageDirectoryEntry(0)
    }

    fn new(table_frame: u32, flags: EntryFlags) -> Self {
        PageDirectoryEntry((table_frame << FRAME_SHIFT) | (flags | EntryFlags::PRESENT).bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    fn zeroed() -> Box<Self> {
        Box::new(PageTable {
            entries: [PageTableEntry::empty(); TABLE_ENTRIES],
        })
    }
}

#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageDirectoryEntry; TABLE_ENTRIES],
}

impl PageDirectory {
    fn zeroed() -> Box<Self> {
        Box::new(PageDirectory {
            entries: [PageDirectoryEntry::empty(); TABLE_ENTRIES],
        })
    }
}

pub struct AddressSpace {
    directory: Box<PageDirectory>,
    tables: Vec<Option<Box<PageTable>>>,
    /// true = virtual page free.
    virt_avail: PageBitmap,
    /// Set once paging runs on real hardware; gates raw-memory side effects
    /// (zero-fill of fresh mappings, TLB invalidation).
    live: bool,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(TABLE_ENTRIES);
        tables.resize_with(TABLE_ENTRIES, || None);
        Self {
            directory: PageDirectory::zeroed(),
            tables,
            virt_avail: PageBitmap::new(MAX_PAGES, true),
            live: false,
        }
    }

    /// A fresh space for a user process. Kernel directory entries are shared
    /// so ring-0 code and MMIO stay reachable after a CR3 switch; the 4 MiB
    /// span under each shared entry is withheld from this space's virtual
    /// pool so user mappings never disturb a shared table.
    pub fn new_user(kernel: &AddressSpace) -> Self {
        let mut space = AddressSpace::new();
        for (i, entry) in kernel.directory.entries.iter().enumerate() {
            if entry.is_present() {
                space.directory.entries[i] = *entry;
                let _ = space
                    .virt_avail
                    .set_range(i * TABLE_ENTRIES, (i + 1) * TABLE_ENTRIES, false);
            }
        }
        space
    }

    pub fn directory_address(&self) -> u32 {
        self.directory.as_ref() as *const PageDirectory as usize as u32
    }

    /// Loads this space's directory into CR3.
    #[cfg(target_arch = "x86")]
    pub unsafe fn activate(&self) {
        core::arch::asm!("mov cr3, {0}", in(reg) self.directory_address(), options(nostack));
    }

    fn entry(&self, addr: VirtAddr) -> Option<PageTableEntry> {
        if !self.directory.entries[addr.directory_index()].is_present() {
            return None;
        }
        self.tables[addr.directory_index()]
            .as_ref()
            .map(|table| table.entries[addr.table_index()])
    }

    /// Creates the table covering `dir_idx` if missing, stamping the
    /// directory entry with `flags`.
    fn ensure_table(&mut self, dir_idx: usize, flags: EntryFlags) -> &mut PageTable {
        let slot = &mut self.tables[dir_idx];
        let created = slot.is_none();
        let table = slot.get_or_insert_with(PageTable::zeroed);
        if created {
            // The kernel image is identity mapped, so the table's address is
            // also its physical location.
            let table_frame = (&**table as *const PageTable as usize >> FRAME_SHIFT) as u32;
            self.directory.entries[dir_idx] = PageDirectoryEntry::new(table_frame, flags);
        }
        table
    }

    fn map_page(&mut self, frames: &mut FrameAllocator, page: usize, frame: usize, flags: EntryFlags) {
        let addr = VirtAddr::from_page(page);
        let table = self.ensure_table(addr.directory_index(), flags);
        table.entries[addr.table_index()] = PageTableEntry::new(frame, flags);
        frames.mark_used(frame);
        self.virt_avail.set(page, false);
    }

    fn unmap_page(&mut self, frames: &mut FrameAllocator, page: usize) {
        let addr = VirtAddr::from_page(page);
        if let Some(table) = self.tables[addr.directory_index()].as_mut() {
            let entry = table.entries[addr.table_index()];
            if entry.is_present() {
                frames.free(entry.frame_index());
                table.entries[addr.table_index()] = PageTableEntry::empty();
            }
        }
        self.virt_avail.set(page, true);
        self.flush_tlb(VirtAddr::from_page(page));
    }

    /// Maps `[phys_addr, phys_addr + size)` at the numerically identical
    /// virtual addresses, creating directory entries and tables on demand.
    /// Pages already mapped are left alone. Boot-time only.
    pub fn identity_map(
        &mut self,
        frames: &mut FrameAllocator,
        phys_addr: u32,
        size: usize,
        flags: EntryFlags,
    ) {
        let num_pages = size.div_ceil(PAGE_SIZE);
        let mut page = VirtAddr(phys_addr).page_index();
        for _ in 0..num_pages {
            if page >= MAX_PAGES {
                return;
            }
            let mapped = self
                .entry(VirtAddr::from_page(page))
                .is_some_and(PageTableEntry::is_present);
            if !mapped {
                self.map_page(frames, page, page, flags);
            }
            page += 1;
        }
    }

    /// Maps `length` bytes (rounded up to whole pages) of fresh memory at the
    /// first free virtual run at or after `addr_hint`, taking one free frame
    /// per page. Nothing is left mapped on failure.
    pub fn mmap(
        &mut self,
        frames: &mut FrameAllocator,
        addr_hint: u32,
        length: usize,
        flags: EntryFlags,
    ) -> Result<u32, MemoryError> {
        if length == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let num_pages = length.div_ceil(PAGE_SIZE);
        let first = self
            .virt_avail
            .next_true_run(VirtAddr(addr_hint).page_index(), num_pages);
        if first == NO_INDEX {
            return Err(MemoryError::OutOfVirtualPages);
        }

        for i in 0..num_pages {
            let frame = match frames.alloc() {
                Ok(frame) => frame,
                Err(err) => {
                    // Roll the partial mapping back before reporting.
                    for page in first..first + i {
                        self.unmap_page(frames, page);
                    }
                    return Err(err);
                }
            };
            self.map_page(frames, first + i, frame, flags);
        }

        let addr = VirtAddr::from_page(first).0;
        self.zero_fill(addr, length);
        Ok(addr)
    }

    /// Unmaps every page in `[address, address + length)`, returning frames
    /// and virtual pages to their bitmaps. The whole range is validated
    /// before anything is mutated.
    pub fn munmap(
        &mut self,
        frames: &mut FrameAllocator,
        address: u32,
        length: usize,
    ) -> Result<(), MemoryError> {
        if length == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let first = VirtAddr(address).page_index();
        let num_pages = length.div_ceil(PAGE_SIZE);
        if first + num_pages > MAX_PAGES {
            return Err(MemoryError::InvalidRange);
        }
        for page in first..first + num_pages {
            match self.entry(VirtAddr::from_page(page)) {
                Some(entry) if entry.is_present() => {}
                _ => return Err(MemoryError::NotMapped),
            }
        }
        for page in first..first + num_pages {
            self.unmap_page(frames, page);
        }
        Ok(())
    }

    /// Walks directory and table for `virtual_address`.
    pub fn translate(&self, virtual_address: u32) -> Result<u32, MemoryError> {
        let addr = VirtAddr(virtual_address);
        match self.entry(addr) {
            Some(entry) if entry.is_present() => {
                Ok(((entry.frame_index() as u32) << FRAME_SHIFT) | addr.page_offset() as u32)
            }
            _ => Err(MemoryError::NotMapped),
        }
    }

    /// Read-only copy of the covering table entry; empty if unmapped.
    pub fn inspect(&self, virtual_address: u32) -> PageTableEntry {
        self.entry(VirtAddr(virtual_address))
            .filter(|e| e.is_present())
            .unwrap_or(PageTableEntry::empty())
    }

    pub fn free_virtual_pages_from(&self, offset: usize) -> usize {
        let mut count = 0;
        let mut idx = self.virt_avail.next_true(offset);
        while idx != NO_INDEX {
            let boundary = self.virt_avail.next_false(idx);
            let end = if boundary == NO_INDEX {
                self.virt_avail.capacity()
            } else {
                boundary
            };
            count += end - idx;
            if boundary == NO_INDEX {
                break;
            }
            idx = self.virt_avail.next_true(boundary);
        }
        count
    }

    /// Returns every mapped frame to the pool. Process teardown.
    pub fn release_all(&mut self, frames: &mut FrameAllocator) {
        for table in self.tables.iter_mut().flatten() {
            for entry in table.entries.iter_mut() {
                if entry.is_present() {
                    frames.free(entry.frame_index());
                    *entry = PageTableEntry::empty();
                }
            }
        }
        self.virt_avail.set_all(true);
    }

    fn zero_fill(&self, addr: u32, length: usize) {
        if !self.live {
            return;
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            core::ptr::write_bytes(addr as usize as *mut u8, 0, length);
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = (addr, length);
    }

    fn flush_tlb(&self, addr: VirtAddr) {
        if !self.live {
            return;
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("invlpg [{0}]", in(reg) addr.0, options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = addr;
    }
}

/// The kernel's address space plus the machine-wide frame pool, built once
/// at boot and never torn down.
pub struct MemoryManager {
    pub frames: FrameAllocator,
    pub kernel: AddressSpace,
    main_region_end: u32,
    paging_enabled: bool,
}

impl MemoryManager {
    /// Processes the boot loader's memory map: identity-maps every region
    /// (and the holes between them), clamps the region holding the kernel
    /// image to the current kernel break, opens the post-kernel span of that
    /// region for frame allocation and identity-maps the high MMIO window.
    pub fn init(regions: &[MemoryRegion], kernel_break: u32) -> Result<Self, MemoryError> {
        let mut frames = FrameAllocator::new(MAX_PAGES);
        let mut kernel = AddressSpace::new();
        let mut main_region_end: u32 = 0;
        let mut last_end: u64 = 0;

        for region in regions {
            if region.address >= u32::MAX as u64 {
                continue;
            }
            let address = region.address as u32;
            let length = region.length.min(u32::MAX as u64 - region.address) as usize;

            if region.address > last_end {
                // Fill the hole between the previous region and this one.
                kernel.identity_map(
                    &mut frames,
                    last_end as u32,
                    (region.address - last_end) as usize,
                    EntryFlags::WRITABLE,
                );
            }

            let writable = region.kind.is_usable() && address > 0;
            let flags = if writable {
                EntryFlags::WRITABLE
            } else {
                EntryFlags::empty()
            };
            let contains_kernel =
                address < kernel_break && region.address + region.length > u64::from(kernel_break);
            if contains_kernel {
                // Only the used part of the kernel's region is mapped now;
                // the rest becomes the main allocation pool.
                kernel.identity_map(&mut frames, address, (kernel_break - address) as usize, flags);
                main_region_end = (region.address + region.length).min(u32::MAX as u64) as u32;
            } else {
                kernel.identity_map(&mut frames, address, length, flags);
            }

            last_end = region.address + region.length;
        }

        kernel.identity_map(
            &mut frames,
            crate::constants::memory::MMIO_WINDOW_START,
            (u32::MAX - crate::constants::memory::MMIO_WINDOW_START) as usize,
            EntryFlags::WRITABLE,
        );

        // First whole page past the kernel image.
        let post_kernel_page = (kernel_break as usize >> FRAME_SHIFT) + 1;
        if main_region_end as usize >> FRAME_SHIFT > post_kernel_page {
            frames.mark_free_range(post_kernel_page, main_region_end as usize >> FRAME_SHIFT)?;
        }

        log::info!(
            "paging: memory map processed, {} frames free",
            frames.free_frames()
        );

        Ok(Self {
            frames,
            kernel,
            main_region_end,
            paging_enabled: false,
        })
    }

    pub fn main_region_end(&self) -> u32 {
        self.main_region_end
    }

    pub fn mmap(&mut self, addr_hint: u32, length: usize, flags: EntryFlags) -> Result<u32, MemoryError> {
        self.kernel.mmap(&mut self.frames, addr_hint, length, flags)
    }

    pub fn munmap(&mut self, address: u32, length: usize) -> Result<(), MemoryError> {
        self.kernel.munmap(&mut self.frames, address, length)
    }

    /// Loads the directory into CR3 and sets CR0.PG. Called exactly once,
    /// after all boot-time mappings are in place.
    #[cfg(target_arch = "x86")]
    pub unsafe fn enable(&mut self) {
        if self.paging_enabled {
            return;
        }
        let directory = self.kernel.directory_address();
        core::arch::asm!("mov cr3, {0}", in(reg) directory, options(nostack));
        let mut cr0: u32;
        core::arch::asm!("mov {0}, cr0", out(reg) cr0, options(nomem, nostack));
        cr0 |= 0x8000_0001;
        core::arch::asm!("mov cr0, {0}", in(reg) cr0, options(nostack));
        self.paging_enabled = true;
        self.kernel.live = true;
        log::info!("paging: enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(free: core::ops::Range<usize>) -> FrameAllocator {
        let mut frames = FrameAllocator::new(MAX_PAGES);
        frames.mark_free_range(free.start, free.end).unwrap();
        frames
    }

    #[test]
    fn virt_addr_decomposition() {
        let addr = VirtAddr(0xdead_beef);
        assert_eq!(addr.directory_index(), 0xdead_beef >> 22);
        assert_eq!(addr.table_index(), (0xdead_beef >> 12) & 0x3ff);
        assert_eq!(addr.page_offset(), 0xeef);
    }

    #[test]
    fn identity_map_claims_both_bitmaps() {
        let mut frames = pool(0..64);
        let mut space = AddressSpace::new();
        space.identity_map(&mut frames, 0x2000, 2 * PAGE_SIZE, EntryFlags::WRITABLE);
        assert_eq!(space.translate(0x2000), Ok(0x2000));
        assert_eq!(space.translate(0x3abc), Ok(0x3abc));
        assert!(!frames.is_free(2));
        assert!(!frames.is_free(3));
        assert_eq!(space.translate(0x4000), Err(MemoryError::NotMapped));
    }

    #[test]
    fn mmap_munmap_restores_bitmap_state() {
        let mut frames = pool(0..32);
        let mut space = AddressSpace::new();
        let free_before = frames.free_frames();
        let virt_before = space.free_virtual_pages_from(0);

        let addr = space
            .mmap(&mut frames, 0x10_0000, 3 * PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(addr, 0x10_0000);
        assert_eq!(frames.free_frames(), free_before - 3);
        assert_eq!(space.free_virtual_pages_from(0), virt_before - 3);

        space.munmap(&mut frames, addr, 3 * PAGE_SIZE).unwrap();
        assert_eq!(frames.free_frames(), free_before);
        assert_eq!(space.free_virtual_pages_from(0), virt_before);
        assert_eq!(space.translate(addr), Err(MemoryError::NotMapped));
    }

    #[test]
    fn mmap_rounds_length_up_and_zero_length_is_rejected() {
        let mut frames = pool(0..32);
        let mut space = AddressSpace::new();
        let addr = space
            .mmap(&mut frames, 0, PAGE_SIZE + 1, EntryFlags::WRITABLE)
            .unwrap();
        assert!(space.translate(addr + PAGE_SIZE as u32).is_ok());
        assert_eq!(
            space.mmap(&mut frames, 0, 0, EntryFlags::WRITABLE),
            Err(MemoryError::InvalidRange)
        );
    }

    #[test]
    fn mmap_rolls_back_when_frames_run_out() {
        let mut frames = pool(0..2);
        let mut space = AddressSpace::new();
        let virt_before = space.free_virtual_pages_from(0);
        assert_eq!(
            space.mmap(&mut frames, 0, 4 * PAGE_SIZE, EntryFlags::WRITABLE),
            Err(MemoryError::OutOfPhysicalFrames)
        );
        assert_eq!(frames.free_frames(), 2);
        assert_eq!(space.free_virtual_pages_from(0), virt_before);
        assert_eq!(space.translate(0), Err(MemoryError::NotMapped));
    }

    #[test]
    fn munmap_of_partially_mapped_range_mutates_nothing() {
        let mut frames = pool(0..8);
        let mut space = AddressSpace::new();
        let addr = space
            .mmap(&mut frames, 0, PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        let free_before = frames.free_frames();
        assert_eq!(
            space.munmap(&mut frames, addr, 2 * PAGE_SIZE),
            Err(MemoryError::NotMapped)
        );
        assert_eq!(frames.free_frames(), free_before);
        assert!(space.translate(addr).is_ok());
    }

    #[test]
    fn mmap_respects_the_address_hint() {
        let mut frames = pool(0..8);
        let mut space = AddressSpace::new();
        let addr = space
            .mmap(&mut frames, 0x40_0000, PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(addr, 0x40_0000);
    }

    #[test]
    fn inspect_reports_entry_flags() {
        let mut frames = pool(0..8);
        let mut space = AddressSpace::new();
        let addr = space
            .mmap(
                &mut frames,
                0,
                PAGE_SIZE,
                EntryFlags::WRITABLE | EntryFlags::USER,
            )
            .unwrap();
        let entry = space.inspect(addr);
        assert!(entry.is_present());
        assert!(entry.flags().contains(EntryFlags::WRITABLE | EntryFlags::USER));
        assert_eq!(space.inspect(addr + 0x1000).raw(), 0);
    }

    #[test]
    fn release_all_returns_every_frame() {
        let mut frames = pool(0..16);
        let mut space = AddressSpace::new();
        space
            .mmap(&mut frames, 0, 4 * PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        space
            .mmap(&mut frames, 0x80_0000, 2 * PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(frames.free_frames(), 10);
        space.release_all(&mut frames);
        assert_eq!(frames.free_frames(), 16);
    }

    #[test]
    fn memory_manager_init_processes_the_boot_map() {
        // 0..640K usable, hole, 1M..16M usable containing the kernel image.
        let regions = [
            MemoryRegion {
                address: 0,
                length: 0xa0000,
                kind: RegionKind::Usable,
            },
            MemoryRegion {
                address: 0x100000,
                length: 0xf00000,
                kind: RegionKind::Usable,
            },
        ];
        let kernel_break = 0x30_0000;
        let mem = MemoryManager::init(&regions, kernel_break).unwrap();

        // Kernel image identity mapped, post-break page not mapped.
        assert_eq!(mem.kernel.translate(0x100000), Ok(0x100000));
        assert_eq!(mem.kernel.translate(0x2f_f000), Ok(0x2f_f000));
        assert_eq!(mem.kernel.translate(0x40_0000), Err(MemoryError::NotMapped));

        // The hole between regions is mapped too.
        assert_eq!(mem.kernel.translate(0xb8000), Ok(0xb8000));

        // Frames between the kernel break and the region end are free.
        assert!(mem.frames.free_frames() > 0);
        assert!(mem.frames.is_free((kernel_break as usize >> FRAME_SHIFT) + 1));
        assert!(!mem.frames.is_free(0x100));
        assert_eq!(mem.main_region_end(), 0x100_0000);
    }

    use crate::memory::RegionKind;
}
