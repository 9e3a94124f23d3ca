//! Saved CPU state.
//!
//! Field order matches exactly what the interrupt entry stubs push: segment
//! registers, then the `pusha` block, the stub's interrupt number and error
//! code, and finally the frame the CPU itself pushed. `useresp`/`ss` are only
//! meaningful when the interrupt crossed from ring 3.

/// A full register snapshot as laid out on the interrupt stack.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "eax: {:#010x} ebx: {:#010x} ecx: {:#010x} edx: {:#010x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "esi: {:#010x} edi: {:#010x} ebp: {:#010x} esp: {:#010x}",
            self.esi, self.edi, self.ebp, self.esp
        )?;
        writeln!(
            f,
            "eip: {:#010x} eflags: {:#010x} useresp: {:#010x}",
            self.eip, self.eflags, self.useresp
        )?;
        write!(
            f,
            "cs: {:#06x} ds: {:#06x} ss: {:#06x} int: {} err: {:#x}",
            self.cs, self.ds, self.ss, self.int_no, self.err_code
        )
    }
}
