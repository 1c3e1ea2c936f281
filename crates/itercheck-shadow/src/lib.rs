//! Sparse, byte-granular ownership shadow table.
//!
//! Maps any address in a 48-bit virtual space to the [`OwnerId`] of the
//! worker that last wrote it. Real address spaces are astronomically sparse
//! relative to that domain, so the table is a three-level radix tree: the
//! root and each interior node slice 12 address bits apiece, leaves shadow
//! one 4096-byte page with one owner byte per program byte. A point lookup
//! is three array dereferences; memory is O(touched pages).
//!
//! Nodes live in per-level arenas ([`Vec`]s) and interior slots hold indices
//! into the child arena. Region teardown ([`OwnershipStore::clear`]) is a
//! truncation of the three arenas plus a wipe of the root slot array, which
//! releases exactly the allocated nodes without scanning slot arrays.
//!
//! Reads never allocate: an absent path means every byte under it is
//! unowned. Writes allocate the missing interior nodes and leaf on first
//! touch.

use std::fmt;

use itercheck_error::{ItercheckError, Result};
use itercheck_types::{LEVEL_BITS, LEVEL_SLOTS, OwnerId, PAGE_BITS, PAGE_SIZE, VirtAddr};

// ---------------------------------------------------------------------------
// Arena indices
// ---------------------------------------------------------------------------

/// Index of an L2 node in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct L2Idx(u32);

/// Index of an L1 node in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct L1Idx(u32);

/// Index of a shadow page in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct PageIdx(u32);

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Interior node selecting an L1 node by address bits 24..36.
struct L2Node {
    slots: Box<[Option<L1Idx>]>,
}

/// Interior node selecting a shadow page by address bits 12..24.
struct L1Node {
    slots: Box<[Option<PageIdx>]>,
}

impl L2Node {
    fn new() -> Self {
        Self {
            slots: vec![None; LEVEL_SLOTS].into_boxed_slice(),
        }
    }
}

impl L1Node {
    fn new() -> Self {
        Self {
            slots: vec![None; LEVEL_SLOTS].into_boxed_slice(),
        }
    }
}

/// Leaf shadowing one 4096-byte page: one owner byte per program byte.
pub struct ShadowPage {
    owners: Box<[u8; PAGE_SIZE]>,
}

impl ShadowPage {
    fn new() -> Self {
        Self {
            owners: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Owner recorded for the byte at `offset` within this page.
    #[inline]
    #[must_use]
    pub fn owner_at(&self, offset: usize) -> OwnerId {
        OwnerId::from_raw(self.owners[offset])
    }

    /// Record `owner` for the byte at `offset` within this page.
    #[inline]
    pub fn set_owner_at(&mut self, offset: usize, owner: OwnerId) {
        self.owners[offset] = owner.raw();
    }
}

impl fmt::Debug for ShadowPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owned = self.owners.iter().filter(|&&o| o != 0).count();
        f.debug_struct("ShadowPage").field("owned_bytes", &owned).finish()
    }
}

// ---------------------------------------------------------------------------
// Address slicing
// ---------------------------------------------------------------------------

#[inline]
fn level_indices(addr: VirtAddr) -> Result<(usize, usize, usize, usize)> {
    if !addr.is_canonical() {
        return Err(ItercheckError::AddressOutOfRange { addr });
    }
    let raw = addr.get();
    let mask = (LEVEL_SLOTS - 1) as u64;
    let root = ((raw >> (PAGE_BITS + 2 * LEVEL_BITS)) & mask) as usize;
    let l2 = ((raw >> (PAGE_BITS + LEVEL_BITS)) & mask) as usize;
    let l1 = ((raw >> PAGE_BITS) & mask) as usize;
    Ok((root, l2, l1, addr.page_offset()))
}

/// Split `[base, base+len)` into per-page chunks of `(chunk_base, chunk_len)`.
///
/// Accesses are bounded at 512 bytes, so a chunked walk touches at most two
/// pages; callers resolve each page once instead of once per byte.
pub fn page_chunks(base: VirtAddr, len: usize) -> impl Iterator<Item = (VirtAddr, usize)> {
    let mut addr = base;
    let mut remaining = len;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let span = PAGE_SIZE - addr.page_offset();
        let chunk = span.min(remaining);
        let out = (addr, chunk);
        addr = addr.offset(chunk as u64);
        remaining -= chunk;
        Some(out)
    })
}

// ---------------------------------------------------------------------------
// OwnershipStore
// ---------------------------------------------------------------------------

/// The process-wide ownership table for one detector instance.
///
/// Not internally synchronized: the host delivers events strictly one at a
/// time, so the store is driven as if single-threaded (callers hold
/// `&mut`).
pub struct OwnershipStore {
    root: Box<[Option<L2Idx>]>,
    l2: Vec<L2Node>,
    l1: Vec<L1Node>,
    pages: Vec<ShadowPage>,
}

impl OwnershipStore {
    /// An empty store; no nodes are allocated until the first write.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: vec![None; LEVEL_SLOTS].into_boxed_slice(),
            l2: Vec::new(),
            l1: Vec::new(),
            pages: Vec::new(),
        }
    }

    /// Owner recorded for `addr`, or [`OwnerId::UNOWNED`] if no write has
    /// touched its page this region. Never allocates.
    pub fn owner_of(&self, addr: VirtAddr) -> Result<OwnerId> {
        let (root, l2, l1, offset) = level_indices(addr)?;
        match self.page_at(root, l2, l1)? {
            Some(page) => Ok(page.owner_at(offset)),
            None => Ok(OwnerId::UNOWNED),
        }
    }

    /// Record `owner` for the single byte at `addr`, allocating the path to
    /// its shadow page on first touch.
    pub fn set_owner(&mut self, addr: VirtAddr, owner: OwnerId) -> Result<()> {
        let offset = addr.page_offset();
        self.page_mut(addr)?.set_owner_at(offset, owner);
        Ok(())
    }

    /// The shadow page covering `addr`, if any write has materialized it.
    pub fn page(&self, addr: VirtAddr) -> Result<Option<&ShadowPage>> {
        let (root, l2, l1, _) = level_indices(addr)?;
        self.page_at(root, l2, l1)
    }

    /// The shadow page covering `addr`, lazily allocating any missing L2/L1
    /// node and the page itself along the path.
    pub fn page_mut(&mut self, addr: VirtAddr) -> Result<&mut ShadowPage> {
        let (root, l2_sel, l1_sel, _) = level_indices(addr)?;

        let l2_idx = match self.root[root] {
            Some(idx) => idx,
            None => {
                let idx = L2Idx(arena_push(&mut self.l2, L2Node::new())?);
                self.root[root] = Some(idx);
                idx
            }
        };
        let l2_node = self
            .l2
            .get_mut(l2_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("root slot points past L2 arena"))?;

        let l1_idx = match l2_node.slots[l2_sel] {
            Some(idx) => idx,
            None => {
                let idx = L1Idx(arena_push(&mut self.l1, L1Node::new())?);
                l2_node.slots[l2_sel] = Some(idx);
                idx
            }
        };
        let l1_node = self
            .l1
            .get_mut(l1_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("L2 slot points past L1 arena"))?;

        let page_idx = match l1_node.slots[l1_sel] {
            Some(idx) => idx,
            None => {
                let idx = PageIdx(arena_push(&mut self.pages, ShadowPage::new())?);
                l1_node.slots[l1_sel] = Some(idx);
                idx
            }
        };
        self.pages
            .get_mut(page_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("L1 slot points past page arena"))
    }

    /// Bulk reset at region end: truncate every level's arena and wipe the
    /// root slot array. Afterwards `owner_of` on any previously-touched
    /// address reads unowned, and [`Self::allocated_nodes`] is 0. Arena
    /// capacity is retained so the next region reuses the allocations.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.l1.clear();
        self.l2.clear();
        self.root.fill(None);
    }

    /// Total live nodes across all levels (interior nodes plus pages).
    #[must_use]
    pub fn allocated_nodes(&self) -> usize {
        self.l2.len() + self.l1.len() + self.pages.len()
    }

    /// Live shadow pages only.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    fn page_at(&self, root: usize, l2_sel: usize, l1_sel: usize) -> Result<Option<&ShadowPage>> {
        let Some(l2_idx) = self.root[root] else {
            return Ok(None);
        };
        let l2_node = self
            .l2
            .get(l2_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("root slot points past L2 arena"))?;
        let Some(l1_idx) = l2_node.slots[l2_sel] else {
            return Ok(None);
        };
        let l1_node = self
            .l1
            .get(l1_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("L2 slot points past L1 arena"))?;
        let Some(page_idx) = l1_node.slots[l1_sel] else {
            return Ok(None);
        };
        let page = self
            .pages
            .get(page_idx.0 as usize)
            .ok_or_else(|| ItercheckError::invariant("L1 slot points past page arena"))?;
        Ok(Some(page))
    }
}

impl Default for OwnershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OwnershipStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipStore")
            .field("l2_nodes", &self.l2.len())
            .field("l1_nodes", &self.l1.len())
            .field("pages", &self.pages.len())
            .finish()
    }
}

fn arena_push<T>(arena: &mut Vec<T>, node: T) -> Result<u32> {
    let idx = u32::try_from(arena.len())
        .map_err(|_| ItercheckError::invariant("arena exceeds u32 index space"))?;
    arena.push(node);
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use itercheck_types::WorkerId;

    use super::*;

    fn owner(worker: u32) -> OwnerId {
        OwnerId::from_worker(WorkerId::new(worker)).expect("worker id fits")
    }

    #[test]
    fn fresh_store_reads_unowned_everywhere() {
        let store = OwnershipStore::new();
        assert_eq!(store.owner_of(VirtAddr::ZERO).unwrap(), OwnerId::UNOWNED);
        assert_eq!(
            store.owner_of(VirtAddr::new(0x7fff_ffff_f000)).unwrap(),
            OwnerId::UNOWNED
        );
        assert_eq!(store.allocated_nodes(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = OwnershipStore::new();
        let addr = VirtAddr::new(0x5555_4444_3333);
        store.set_owner(addr, owner(7)).unwrap();
        assert_eq!(store.owner_of(addr).unwrap(), owner(7));
        // Neighbouring byte in the same page is untouched.
        assert_eq!(store.owner_of(addr.offset(1)).unwrap(), OwnerId::UNOWNED);
    }

    #[test]
    fn ownership_reflects_most_recent_writer() {
        let mut store = OwnershipStore::new();
        let addr = VirtAddr::new(0x1000);
        store.set_owner(addr, owner(1)).unwrap();
        store.set_owner(addr, owner(2)).unwrap();
        assert_eq!(store.owner_of(addr).unwrap(), owner(2));
    }

    #[test]
    fn reads_do_not_allocate() {
        let store = OwnershipStore::new();
        let _ = store.owner_of(VirtAddr::new(0xdead_beef)).unwrap();
        assert_eq!(store.allocated_nodes(), 0);
        assert!(store.page(VirtAddr::new(0xdead_beef)).unwrap().is_none());
    }

    #[test]
    fn one_write_allocates_one_path() {
        let mut store = OwnershipStore::new();
        store.set_owner(VirtAddr::new(0x1234), owner(0)).unwrap();
        // One L2 node, one L1 node, one page.
        assert_eq!(store.allocated_nodes(), 3);
        assert_eq!(store.allocated_pages(), 1);

        // A second write in the same page allocates nothing new.
        store.set_owner(VirtAddr::new(0x1235), owner(0)).unwrap();
        assert_eq!(store.allocated_nodes(), 3);

        // A write in a distant region allocates a fresh path.
        store
            .set_owner(VirtAddr::new(0x8000_0000_0000 - 1), owner(0))
            .unwrap();
        assert_eq!(store.allocated_nodes(), 6);
    }

    #[test]
    fn clear_resets_completely() {
        let mut store = OwnershipStore::new();
        let touched = [
            VirtAddr::new(0x1000),
            VirtAddr::new(0x7654_3210),
            VirtAddr::new(0x2fff_ffff_ffff),
        ];
        for (i, addr) in touched.iter().enumerate() {
            store.set_owner(*addr, owner(i as u32)).unwrap();
        }
        assert!(store.allocated_nodes() > 0);

        store.clear();
        assert_eq!(store.allocated_nodes(), 0);
        for addr in touched {
            assert_eq!(store.owner_of(addr).unwrap(), OwnerId::UNOWNED);
        }
    }

    #[test]
    fn store_is_reusable_after_clear() {
        let mut store = OwnershipStore::new();
        let addr = VirtAddr::new(0x4000);
        store.set_owner(addr, owner(1)).unwrap();
        store.clear();
        store.set_owner(addr, owner(2)).unwrap();
        assert_eq!(store.owner_of(addr).unwrap(), owner(2));
        assert_eq!(store.allocated_nodes(), 3);
    }

    #[test]
    fn non_canonical_address_is_fatal() {
        let mut store = OwnershipStore::new();
        let bad = VirtAddr::new(1 << 48);
        assert!(matches!(
            store.owner_of(bad),
            Err(ItercheckError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            store.set_owner(bad, owner(0)),
            Err(ItercheckError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn page_chunks_split_on_page_boundaries() {
        let chunks: Vec<_> = page_chunks(VirtAddr::new(0x1ff0), 0x20).collect();
        assert_eq!(
            chunks,
            vec![(VirtAddr::new(0x1ff0), 0x10), (VirtAddr::new(0x2000), 0x10)]
        );

        let chunks: Vec<_> = page_chunks(VirtAddr::new(0x3000), 4).collect();
        assert_eq!(chunks, vec![(VirtAddr::new(0x3000), 4)]);

        assert_eq!(page_chunks(VirtAddr::new(0x3000), 0).count(), 0);
    }

    #[test]
    fn distinct_pages_do_not_alias() {
        let mut store = OwnershipStore::new();
        // Same in-page offset, different pages under the same L1 node.
        let a = VirtAddr::new(0x10_0000);
        let b = VirtAddr::new(0x10_1000);
        store.set_owner(a, owner(1)).unwrap();
        store.set_owner(b, owner(2)).unwrap();
        assert_eq!(store.owner_of(a).unwrap(), owner(1));
        assert_eq!(store.owner_of(b).unwrap(), owner(2));
    }
}
