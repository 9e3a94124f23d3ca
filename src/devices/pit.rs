//! Intel 8253/8254 programmable interval timer, channel 0, mode 0.
//!
//! Each arm programs a single countdown; IRQ0 fires once when it expires.
//! One scheduler tick is one millisecond.

use crate::devices::OneShotTimer;

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, access lobyte/hibyte, mode 0 (interrupt on terminal count).
const MODE0_LOHI: u8 = 0x30;

const PIT_HZ: u64 = 1_193_182;
const TICK_MS: u64 = 1;

pub struct Pit;

impl Pit {
    pub const fn new() -> Self {
        Pit
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotTimer for Pit {
    fn arm(&mut self, ticks: u64) {
        // The counter is 16 bits; longer slices saturate and the scheduler
        // simply runs again sooner.
        let reload = (ticks * TICK_MS * PIT_HZ / 1000).clamp(1, 0xffff) as u16;
        outb(COMMAND, MODE0_LOHI);
        outb(CHANNEL0_DATA, reload as u8);
        outb(CHANNEL0_DATA, (reload >> 8) as u8);
    }
}

#[cfg(target_arch = "x86")]
fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86"))]
fn outb(_port: u16, _value: u8) {}
