//! A fully scripted instrumentation host.
//!
//! [`ScriptedHost`] models the services a real binary-instrumentation
//! engine provides — readable guest memory, stack metadata, stack capture —
//! over a sparse in-memory address space the test drives directly. Handles
//! are cheap clones sharing one state, so a test can keep writing guest
//! memory while the detector owns its own handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use itercheck::{Host, PAGE_BITS, PAGE_SIZE, StackTrace, VirtAddr};

struct HostInner {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
    stack_floor: VirtAddr,
    frames: Vec<VirtAddr>,
}

/// Scripted stand-in for the instrumentation host.
#[derive(Clone)]
pub struct ScriptedHost {
    inner: Arc<Mutex<HostInner>>,
}

impl ScriptedHost {
    /// Empty address space, stack floor at 0 (no suppression until a test
    /// scripts one), no canned stack frames.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HostInner {
                pages: HashMap::new(),
                stack_floor: VirtAddr::ZERO,
                frames: Vec::new(),
            })),
        }
    }

    /// Write `bytes` into guest memory at `addr`, materializing pages as
    /// needed. This is the "monitored program executes a store" half; the
    /// matching hook call is the test's business.
    pub fn write_memory(&self, addr: VirtAddr, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        for (i, &byte) in bytes.iter().enumerate() {
            let at = addr.get() + i as u64;
            let page = inner
                .pages
                .entry(at >> PAGE_BITS)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[(at & (PAGE_SIZE as u64 - 1)) as usize] = byte;
        }
    }

    /// Read one byte back, if its page was ever written.
    #[must_use]
    pub fn byte_at(&self, addr: VirtAddr) -> Option<u8> {
        let inner = self.inner.lock();
        inner
            .pages
            .get(&(addr.get() >> PAGE_BITS))
            .map(|page| page[(addr.get() & (PAGE_SIZE as u64 - 1)) as usize])
    }

    /// Script the stack floor the host will report.
    pub fn set_stack_floor(&self, floor: VirtAddr) {
        self.inner.lock().stack_floor = floor;
    }

    /// Script the frames returned by stack capture.
    pub fn set_stack_frames(&self, frames: Vec<VirtAddr>) {
        self.inner.lock().frames = frames;
    }
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ScriptedHost {
    fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> bool {
        let inner = self.inner.lock();
        for (i, slot) in buf.iter_mut().enumerate() {
            let at = addr.get() + i as u64;
            let Some(page) = inner.pages.get(&(at >> PAGE_BITS)) else {
                // Unreadable range: the detector must treat this as
                // ordinary data, never crash.
                return false;
            };
            *slot = page[(at & (PAGE_SIZE as u64 - 1)) as usize];
        }
        true
    }

    fn stack_floor(&self) -> VirtAddr {
        self.inner.lock().stack_floor
    }

    fn capture_stack(&self, max_frames: usize) -> StackTrace {
        let inner = self.inner.lock();
        StackTrace::from_frames(inner.frames.iter().copied().take(max_frames).collect())
    }
}
