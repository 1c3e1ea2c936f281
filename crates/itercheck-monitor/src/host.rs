//! The seam between the detector and its binary-instrumentation host.
//!
//! The host owns everything the detector deliberately does not: it rewrites
//! the monitored program so every load/store/modify reaches the hooks, it
//! can read the program's memory, it knows the running thread's stack
//! metadata, and it can unwind a call stack for diagnostics. The detector
//! consumes those services through this trait and nothing else.

use itercheck_types::{StackTrace, VirtAddr};

/// Services the instrumentation host provides to the detector.
///
/// Implementations must uphold the event-serialization contract documented
/// on [`crate::Detector`]: each hook invocation runs to completion before
/// the next event is delivered, however many threads the monitored program
/// runs.
pub trait Host {
    /// Read `buf.len()` bytes of monitored-program memory at `addr` into
    /// `buf`. Returns `false` if the range is not fully readable; the
    /// detector treats an unreadable range as ordinary data (a command tag
    /// can never straddle unmapped memory in a correct runtime).
    fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> bool;

    /// Low end of the running thread's stack as the host currently maps it.
    ///
    /// Queried when a `stackbot` command records the suppressed stack span
    /// and re-queried once per out-of-range observation to tolerate stack
    /// growth.
    fn stack_floor(&self) -> VirtAddr;

    /// Capture up to `max_frames` frames of the running thread's call
    /// stack, innermost first. May return an empty trace if the host
    /// cannot unwind here.
    fn capture_stack(&self, max_frames: usize) -> StackTrace;
}
