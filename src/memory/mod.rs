pub mod bitmap;
pub mod frames;
pub mod heap;
pub mod paging;

use core::fmt;

/// Boot-loader memory map entry kinds, in the order the multiboot-style
/// loaders report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
}

impl RegionKind {
    pub fn is_usable(self) -> bool {
        self == RegionKind::Usable
    }
}

/// One entry of the boot-time memory map handed over by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub address: u64,
    pub length: u64,
    pub kind: RegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Range arguments out of order or past capacity.
    InvalidRange,
    /// No contiguous run of free virtual pages was found.
    OutOfVirtualPages,
    /// No free physical frame left.
    OutOfPhysicalFrames,
    /// `munmap` or `translate` touched a page with no present mapping.
    NotMapped,
    /// The heap could not obtain backing pages.
    OutOfMemory,
    /// `free` was called with an address that is not a chunk start.
    BadPointer,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemoryError::InvalidRange => "invalid range",
            MemoryError::OutOfVirtualPages => "out of virtual pages",
            MemoryError::OutOfPhysicalFrames => "out of physical frames",
            MemoryError::NotMapped => "page not mapped",
            MemoryError::OutOfMemory => "out of memory",
            MemoryError::BadPointer => "not an allocated chunk",
        };
        f.write_str(msg)
    }
}
