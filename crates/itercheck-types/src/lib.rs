//! Shared vocabulary for the itercheck race detector.
//!
//! Everything here is hot-path material: these types appear once per
//! monitored machine instruction, so they are all thin `#[repr(transparent)]`
//! newtypes or plain enums with no allocation.

use std::fmt;
use std::ops::Range;

// ---------------------------------------------------------------------------
// Sizing constants
// ---------------------------------------------------------------------------

/// Bits of address consumed by the in-page byte offset (pages are 4096 bytes).
pub const PAGE_BITS: u32 = 12;

/// Shadow page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Bits of address consumed by each table level (4096 slots per level).
pub const LEVEL_BITS: u32 = 12;

/// Slot count of each table level.
pub const LEVEL_SLOTS: usize = 1 << LEVEL_BITS;

/// Supported virtual address width. Three 12-bit levels plus the 12-bit
/// page offset cover exactly this range; addresses with higher bits set are
/// rejected as an invariant violation rather than silently aliased.
pub const ADDR_BITS: u32 = PAGE_BITS + 3 * LEVEL_BITS;

/// Largest data access the instrumentation host may deliver, in bytes.
pub const MAX_DATA_SIZE: usize = 512;

/// Owner ids are byte-wide and 0 is reserved for "unowned", so at most this
/// many workers can be live in one region.
pub const MAX_WORKERS: u32 = u8::MAX as u32;

/// Frames captured per diagnostic stack trace.
pub const STACK_TRACE_DEPTH: usize = 20;

// ---------------------------------------------------------------------------
// VirtAddr
// ---------------------------------------------------------------------------

/// A virtual address in the monitored program.
///
/// Plain wrapper over `u64`; whether the address fits the supported
/// [`ADDR_BITS`] range is checked where it matters (the shadow table walk),
/// not at construction, because hooks receive addresses once per instruction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// The zero address.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw address.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw address value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether the address fits the supported [`ADDR_BITS`] range.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 >> ADDR_BITS == 0
    }

    /// Address `count` bytes above this one, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn offset(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// In-page byte offset of this address.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for VirtAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// AddrRange
// ---------------------------------------------------------------------------

/// A half-open address range `[start, end)`.
///
/// Used for the suppressed stack span and the live command object's
/// footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AddrRange {
    /// Inclusive lower bound.
    pub start: VirtAddr,
    /// Exclusive upper bound.
    pub end: VirtAddr,
}

impl AddrRange {
    /// Range covering `len` bytes starting at `start`.
    #[inline]
    #[must_use]
    pub const fn from_len(start: VirtAddr, len: u64) -> Self {
        Self {
            start,
            end: start.offset(len),
        }
    }

    /// Whether `addr` falls inside the range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.get() >= self.start.get() && addr.get() < self.end.get()
    }

    /// The range as raw bounds.
    #[inline]
    #[must_use]
    pub const fn as_raw(&self) -> Range<u64> {
        self.start.get()..self.end.get()
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// WorkerId / OwnerId
// ---------------------------------------------------------------------------

/// A worker's identity in the runtime's own 0-based numbering.
///
/// Workers announce themselves over the command protocol (`thrd`); the
/// detector never derives this from OS thread identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Wrap a raw worker number.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw worker number.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-byte ownership tag stored in the shadow table.
///
/// Encodes worker-id-plus-one in a single byte; 0 is [`OwnerId::UNOWNED`],
/// meaning the byte is safe for anyone to touch. The byte-wide encoding is
/// what caps live workers at [`MAX_WORKERS`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct OwnerId(u8);

impl OwnerId {
    /// Nobody has written the byte this region.
    pub const UNOWNED: Self = Self(0);

    /// Encode a worker id. Returns `None` if the id cannot fit the byte-wide
    /// plus-one encoding (caller reports the overflow as fatal).
    #[inline]
    #[must_use]
    pub const fn from_worker(worker: WorkerId) -> Option<Self> {
        if worker.get() >= MAX_WORKERS {
            None
        } else {
            Some(Self((worker.get() + 1) as u8))
        }
    }

    /// Decode back to the runtime's numbering; `None` for [`Self::UNOWNED`].
    #[inline]
    #[must_use]
    pub const fn as_worker(self) -> Option<WorkerId> {
        if self.0 == 0 {
            None
        } else {
            Some(WorkerId::new(self.0 as u32 - 1))
        }
    }

    /// Whether any worker owns the byte.
    #[inline]
    #[must_use]
    pub const fn is_owned(self) -> bool {
        self.0 != 0
    }

    /// Raw stored byte.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Rebuild from a raw stored byte.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_worker() {
            Some(worker) => write!(f, "worker {worker}"),
            None => f.write_str("unowned"),
        }
    }
}

// ---------------------------------------------------------------------------
// AccessKind
// ---------------------------------------------------------------------------

/// Kind of a delivered data-access event.
///
/// `Modify` is a read-modify-write merged by the host from a load and a
/// store of the same address and size (load-op-store instructions); the
/// detector treats it as one access so the read half never conflicts with
/// its own write half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AccessKind {
    /// Data load.
    Load,
    /// Data store.
    Store,
    /// Read-modify-write.
    Modify,
}

impl AccessKind {
    /// Whether the access writes memory (and therefore takes ownership).
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Store | Self::Modify)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Store => "store",
            Self::Modify => "modify",
        })
    }
}

// ---------------------------------------------------------------------------
// StackTrace
// ---------------------------------------------------------------------------

/// A bounded, unsymbolicated call stack captured by the host.
///
/// Symbolication is the host's business; the detector only carries the
/// frame addresses through to diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StackTrace {
    frames: Vec<VirtAddr>,
}

impl StackTrace {
    /// An empty trace (host could not unwind).
    #[must_use]
    pub const fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    /// Build from captured frames, truncating to [`STACK_TRACE_DEPTH`].
    #[must_use]
    pub fn from_frames(mut frames: Vec<VirtAddr>) -> Self {
        frames.truncate(STACK_TRACE_DEPTH);
        Self { frames }
    }

    /// The captured frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[VirtAddr] {
        &self.frames
    }

    /// Whether the host captured anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return f.write_str("   (no stack trace)");
        }
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "   {} {frame}", if i == 0 { "at" } else { "by" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_slicing_constants_cover_48_bits() {
        assert_eq!(ADDR_BITS, 48);
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(LEVEL_SLOTS, 4096);
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtAddr::new((1 << 48) - 1).is_canonical());
        assert!(!VirtAddr::new(1 << 48).is_canonical());
        assert!(VirtAddr::ZERO.is_canonical());
    }

    #[test]
    fn owner_id_round_trip() {
        let owner = OwnerId::from_worker(WorkerId::new(0)).expect("worker 0 fits");
        assert_eq!(owner.raw(), 1);
        assert_eq!(owner.as_worker(), Some(WorkerId::new(0)));
        assert!(owner.is_owned());
        assert!(!OwnerId::UNOWNED.is_owned());
        assert_eq!(OwnerId::UNOWNED.as_worker(), None);
    }

    #[test]
    fn owner_id_overflow_is_refused() {
        assert!(OwnerId::from_worker(WorkerId::new(MAX_WORKERS - 1)).is_some());
        assert!(OwnerId::from_worker(WorkerId::new(MAX_WORKERS)).is_none());
    }

    #[test]
    fn range_contains_is_half_open() {
        let range = AddrRange::from_len(VirtAddr::new(0x1000), 16);
        assert!(range.contains(VirtAddr::new(0x1000)));
        assert!(range.contains(VirtAddr::new(0x100f)));
        assert!(!range.contains(VirtAddr::new(0x1010)));
        assert!(!range.contains(VirtAddr::new(0xfff)));
    }

    #[test]
    fn stack_trace_is_depth_bounded() {
        let frames: Vec<VirtAddr> = (0..64).map(|i| VirtAddr::new(0x4000 + i)).collect();
        let trace = StackTrace::from_frames(frames);
        assert_eq!(trace.frames().len(), STACK_TRACE_DEPTH);
    }

    #[test]
    fn display_formats() {
        assert_eq!(VirtAddr::new(0xbeef).to_string(), "0xbeef");
        assert_eq!(
            AddrRange::from_len(VirtAddr::new(0x10), 4).to_string(),
            "[0x10,0x14)"
        );
        assert_eq!(OwnerId::UNOWNED.to_string(), "unowned");
        assert_eq!(
            OwnerId::from_worker(WorkerId::new(3)).unwrap().to_string(),
            "worker 3"
        );
        assert_eq!(AccessKind::Modify.to_string(), "modify");
    }
}
