//! Hardware device abstractions.

pub mod pit;

/// A timer that fires one interrupt after the programmed number of scheduler
/// ticks. The scheduler re-arms it on every context switch, which is how
/// priorities turn into time slices.
pub trait OneShotTimer: Send {
    fn arm(&mut self, ticks: u64);
}
