//! The buddy tree over one chunk, and the facade that dispatches a
//! normalized request to either the buddy tree (page-or-larger) or a
//! [`Subpage`] (sub-page).
//!
//! The tree is the flat, 1-indexed complete-binary-tree-in-an-array encoding
//! familiar from `frame_allocator::Region`'s bitmap-per-order scheme, just
//! walked with a single `memoryMap`/`depthMap` pair instead of one bitmap per
//! order.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use intrusive_collections::UnsafeRef;
use log::{trace, warn};

use crate::error::ChunkError;
use crate::handle::Handle;
use crate::layout::{ChunkLayout, MIN_SUBPAGE_SIZE};
use crate::subpage::{Subpage, SubpagePoolHead};

/// Where a successful allocation lives, and how big a region the caller may
/// use. `length` is the caller's originally requested size; `max_length` is
/// the full size actually reserved (`normCapacity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: Handle,
    pub offset: usize,
    pub length: usize,
    pub max_length: usize,
}

/// One contiguous, preallocated memory region subdivided by a buddy tree,
/// with bitmap subpages layered onto individual leaves for sub-page
/// requests.
///
/// All mutating methods take `&mut self`: ownership of the lock guarding a
/// chunk's `memoryMap`/`freeBytes` sits with the external arena, so this type
/// carries no lock of its own — the `&mut` borrow is exactly that
/// single-writer contract, enforced by the compiler instead of a runtime
/// lock.
pub struct Chunk {
    layout: ChunkLayout,
    memory_map: Vec<u8>,
    depth_map: Vec<u8>,
    subpages: Vec<Option<Box<Subpage>>>,
    free_bytes: usize,
    base_offset: usize,
}

impl Chunk {
    pub fn new(layout: ChunkLayout, base_offset: usize) -> Chunk {
        let tree_len = layout.tree_len();
        let mut depth_map = vec![0u8; tree_len];
        for (id, slot) in depth_map.iter_mut().enumerate().skip(1) {
            *slot = ChunkLayout::depth_of(id as u32) as u8;
        }
        let memory_map = depth_map.clone();
        let subpages = (0..layout.num_leaves()).map(|_| None).collect();

        Chunk {
            free_bytes: layout.chunk_size(),
            layout,
            memory_map,
            depth_map,
            subpages,
            base_offset,
        }
    }

    #[inline]
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.layout.chunk_size()
    }

    /// Percent full, special-cased so 100 means truly exhausted and a chunk
    /// with any free bytes at all never rounds up past 99.
    pub fn usage(&self) -> u8 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = (self.free_bytes * 100 / self.layout.chunk_size()) as u8;
        let usage = 100 - free_pct;
        if usage == 100 {
            99
        } else {
            usage
        }
    }

    pub fn subpage_at(&self, slot: usize) -> Option<&Subpage> {
        self.subpages[slot].as_deref()
    }

    /// Reserve `norm_capacity` bytes (already power-of-two normalized by the
    /// caller) and report back the original `req_capacity` alongside it.
    pub fn allocate(
        &mut self,
        req_capacity: usize,
        norm_capacity: usize,
        head: &mut SubpagePoolHead,
    ) -> Result<Option<Allocation>, ChunkError> {
        self.validate_capacity(norm_capacity)?;

        let handle = if self.layout.is_page_or_larger(norm_capacity) {
            self.allocate_run(norm_capacity)
        } else {
            self.allocate_subpage(norm_capacity, head)
        };

        Ok(handle.map(|handle| Allocation {
            handle,
            offset: self.offset_of(handle),
            length: req_capacity,
            max_length: norm_capacity,
        }))
    }

    /// Release a previously allocated handle back to this chunk. Any
    /// caller-owned user-data slot associated with the allocation is not
    /// modeled here; that bookkeeping belongs entirely to the arena.
    pub fn free(&mut self, handle: Handle, head: &mut SubpagePoolHead) {
        let memory_map_idx = handle.memory_map_idx();

        if handle.is_subpage() {
            let slot = self.layout.subpage_slot(memory_map_idx);
            let subpage = self.subpages[slot]
                .as_ref()
                .expect("handle names a subpage slot with no backing subpage");
            // Safety: `subpage` is a `Box` owned by this chunk's slot array;
            // this handle is a non-owning alias used only for the duration
            // of this call.
            let self_ref = unsafe { UnsafeRef::from_raw(&**subpage as *const Subpage) };
            let still_alive = unsafe { Subpage::free(self_ref, head, handle.bitmap_idx()) };
            if still_alive {
                return;
            }
            // Subpage released its last cell into a multi-member pool and
            // was unlinked; the leaf goes back to the buddy tree.
            self.free_run(memory_map_idx);
        } else {
            self.free_run(memory_map_idx);
        }
    }

    fn validate_capacity(&self, norm_capacity: usize) -> Result<(), ChunkError> {
        if !norm_capacity.is_power_of_two() {
            return Err(ChunkError::NotPowerOfTwo(norm_capacity));
        }
        let chunk_size = self.layout.chunk_size();
        if norm_capacity < MIN_SUBPAGE_SIZE || norm_capacity > chunk_size {
            return Err(ChunkError::OutOfRange { requested: norm_capacity, chunk_size });
        }
        Ok(())
    }

    fn offset_of(&self, handle: Handle) -> usize {
        if handle.is_subpage() {
            let slot = self.layout.subpage_slot(handle.memory_map_idx());
            let subpage = self.subpages[slot].as_ref().expect("dangling subpage handle");
            subpage.run_offset() + (handle.bitmap_idx() as usize) * subpage.elem_size() + self.base_offset
        } else {
            self.layout.run_offset(handle.memory_map_idx()) + self.base_offset
        }
    }

    /// Reserve a whole run (page or larger) of `norm_capacity` bytes.
    fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
        let depth = self.layout.depth_for_capacity(norm_capacity);
        let id = match self.allocate_node(depth) {
            Some(id) => id,
            None => {
                warn!("chunk has no run of {norm_capacity} bytes available");
                return None;
            }
        };
        let run_length = self.layout.run_length_at_depth(depth);
        self.free_bytes -= run_length;
        trace!("allocated run at node {id} ({run_length} bytes)");
        Some(Handle::for_run(id))
    }

    fn free_run(&mut self, memory_map_idx: u32) {
        debug_assert_eq!(
            self.memory_map[memory_map_idx as usize],
            self.layout.unusable(),
            "freeing a run that isn't allocated"
        );
        let depth = ChunkLayout::depth_of(memory_map_idx);
        let run_length = self.layout.run_length_at_depth(depth);
        self.free_node(memory_map_idx);
        self.free_bytes += run_length;
        trace!("freed run at node {memory_map_idx} ({run_length} bytes)");
    }

    /// Mint a fresh leaf page and carve a `norm_capacity`-sized cell out of
    /// it. Always allocates a brand-new leaf; reusing an already-linked
    /// subpage with spare cells is the caller's fast path, one layer up.
    fn allocate_subpage(&mut self, norm_capacity: usize, head: &mut SubpagePoolHead) -> Option<Handle> {
        let max_order = self.layout.max_order();
        let leaf_id = match self.allocate_node(max_order) {
            Some(id) => id,
            None => {
                warn!("chunk has no leaf page available for a {norm_capacity}-byte subpage request");
                return None;
            }
        };
        self.free_bytes -= self.layout.page_size();

        let slot = self.layout.subpage_slot(leaf_id);
        if self.subpages[slot].is_none() {
            let run_offset = self.layout.run_offset(leaf_id);
            let bitmap_words = subpage_bitmap_words(self.layout.page_size());
            self.subpages[slot] =
                Some(Box::new(Subpage::new_leaf(leaf_id, run_offset, self.layout.page_size(), bitmap_words)));
        }

        let subpage = self.subpages[slot].as_ref().unwrap();
        // Safety: `subpage` is owned by this chunk's slot array and outlives
        // this call; `self_ref` is a non-owning alias used only here.
        let self_ref = unsafe { UnsafeRef::from_raw(&**subpage as *const Subpage) };
        unsafe { Subpage::init(self_ref, head, norm_capacity) };

        match unsafe { Subpage::allocate(self_ref, head) } {
            Some(bitmap_idx) => Some(Handle::for_subpage(leaf_id, bitmap_idx)),
            None => {
                // Unreachable under the stated invariants (a freshly
                // initialized subpage always has >=1 free cell), but no path
                // here should leave partial state, so roll the leaf
                // reservation back rather than assert.
                self.free_run(leaf_id);
                None
            }
        }
    }

    /// Find and reserve the leftmost free node at depth `d`, or `None` if
    /// the subtree rooted at 1 has no node that shallow available.
    fn allocate_node(&mut self, d: u32) -> Option<u32> {
        if self.memory_map[1] as u32 > d {
            return None;
        }

        let mut id: u32 = 1;
        while ChunkLayout::depth_of(id) != d {
            let left = 2 * id;
            id = if (self.memory_map[left as usize] as u32) <= d { left } else { left + 1 };
        }

        self.memory_map[id as usize] = self.layout.unusable();
        self.update_parents_alloc(id);
        Some(id)
    }

    fn update_parents_alloc(&mut self, mut id: u32) {
        while id > 1 {
            id >>= 1;
            let left = self.memory_map[(id * 2) as usize];
            let right = self.memory_map[(id * 2 + 1) as usize];
            self.memory_map[id as usize] = left.min(right);
        }
    }

    /// Undo a previous `allocate_node`, restoring `id`'s subtree to free.
    fn free_node(&mut self, id: u32) {
        self.memory_map[id as usize] = self.depth_map[id as usize];
        self.update_parents_free(id);
    }

    fn update_parents_free(&mut self, start_id: u32) {
        let mut child = start_id;
        while child > 1 {
            let parent = child >> 1;
            // Both children of `parent` sit at the same depth by
            // construction, so either child's depthMap entry names it.
            let log_child = self.depth_map[(parent * 2) as usize];
            let left = self.memory_map[(parent * 2) as usize];
            let right = self.memory_map[(parent * 2 + 1) as usize];

            self.memory_map[parent as usize] =
                if left == log_child && right == log_child { log_child - 1 } else { left.min(right) };

            child = parent;
        }
    }
}

fn subpage_bitmap_words(page_size: usize) -> usize {
    (page_size / MIN_SUBPAGE_SIZE).div_ceil(u64::BITS as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layout() -> ChunkLayout {
        ChunkLayout::new(8192, 11).unwrap()
    }

    #[test]
    fn fresh_chunk_is_entirely_free() {
        let chunk = Chunk::new(test_layout(), 0);
        assert_eq!(chunk.free_bytes(), 16 * 1024 * 1024);
        assert_eq!(chunk.usage(), 0);
    }

    #[test]
    fn two_page_allocations_take_adjacent_leaves() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let a = chunk.allocate(8192, 8192, &mut head).unwrap().unwrap();
        let b = chunk.allocate(8192, 8192, &mut head).unwrap().unwrap();
        assert_eq!(a.handle.memory_map_idx(), 2048);
        assert_eq!(b.handle.memory_map_idx(), 2049);
        assert_eq!(chunk.free_bytes(), 16 * 1024 * 1024 - 16384);
        assert_eq!(chunk.memory_map[1024], chunk.layout.unusable());
    }

    #[test]
    fn sixteen_byte_allocation_on_fresh_chunk() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let a = chunk.allocate(16, 16, &mut head).unwrap().unwrap();
        assert!(a.handle.is_subpage());
        assert_eq!(a.handle.memory_map_idx(), 2048);
        assert_eq!(a.handle.bitmap_idx(), 0);
        assert_eq!(a.offset, 0);
        assert_eq!(chunk.subpage_at(0).unwrap().num_avail(), 511);
    }

    /// Stands in for the arena's fast path: if the size-class pool already
    /// has a usable subpage, allocate from it directly; only call into the
    /// chunk (minting a fresh leaf) when the pool is empty. `Chunk::allocate`
    /// deliberately does not do this itself — the pool can hold subpages
    /// belonging to other chunks too.
    fn alloc_small(chunk: &mut Chunk, head: &mut SubpagePoolHead, size: usize) -> Handle {
        if let Some(existing) = head.front() {
            if let Some(bitmap_idx) = unsafe { Subpage::allocate(existing, head) } {
                return Handle::for_subpage(existing.memory_map_idx(), bitmap_idx);
            }
        }
        chunk.allocate(size, size, head).unwrap().unwrap().handle
    }

    #[test]
    fn exhausting_a_subpage_leaf_allocates_a_new_one() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        for _ in 0..512 {
            alloc_small(&mut chunk, &mut head, 16);
        }
        assert_eq!(chunk.subpage_at(0).unwrap().num_avail(), 0);

        let next = alloc_small(&mut chunk, &mut head, 16);
        assert_eq!(next.memory_map_idx(), 2049);
    }

    #[test]
    fn freeing_all_cells_relinks_then_retains_subpage() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let handles: Vec<Handle> = (0..512).map(|_| alloc_small(&mut chunk, &mut head, 16)).collect();

        for h in handles {
            chunk.free(h, &mut head);
        }

        assert_eq!(chunk.subpage_at(0).unwrap().num_avail(), 512);
        assert_eq!(chunk.free_bytes(), 16 * 1024 * 1024 - 8192);
    }

    #[test]
    fn allocating_the_whole_chunk_exhausts_it() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let whole = chunk.allocate(16 * 1024 * 1024, 16 * 1024 * 1024, &mut head).unwrap().unwrap();
        assert_eq!(whole.handle.memory_map_idx(), 1);
        assert_eq!(chunk.free_bytes(), 0);
        assert_eq!(chunk.usage(), 100);

        assert!(chunk.allocate(16, 16, &mut head).unwrap().is_none());
    }

    #[test]
    fn allocate_then_free_one_cell_retains_subpage_as_sole_member() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let a = chunk.allocate(32, 32, &mut head).unwrap().unwrap();
        chunk.free(a.handle, &mut head);

        assert_eq!(chunk.memory_map, chunk.depth_map);
        assert!(chunk.subpage_at(0).is_some());
        assert!(chunk.subpage_at(0).unwrap().do_not_destroy());
        assert_eq!(chunk.subpage_at(0).unwrap().num_avail(), chunk.subpage_at(0).unwrap().max_num_elems());
    }

    #[test]
    fn round_trip_allocate_free_restores_memory_map() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let a = chunk.allocate(8192, 8192, &mut head).unwrap().unwrap();
        let b = chunk.allocate(65536, 65536, &mut head).unwrap().unwrap();

        chunk.free(a.handle, &mut head);
        chunk.free(b.handle, &mut head);

        assert_eq!(chunk.memory_map, chunk.depth_map);
        assert_eq!(chunk.free_bytes(), chunk.chunk_size());
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        assert_eq!(chunk.allocate(100, 100, &mut head), Err(ChunkError::NotPowerOfTwo(100)));
    }

    #[test]
    fn rejects_capacity_above_chunk_size() {
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        let too_big = 32 * 1024 * 1024;
        assert_eq!(
            chunk.allocate(too_big, too_big, &mut head),
            Err(ChunkError::OutOfRange { requested: too_big, chunk_size: chunk.chunk_size() })
        );
    }

    #[test]
    fn base_offset_shifts_every_reported_offset() {
        let mut chunk = Chunk::new(test_layout(), 0x1000);
        let mut head = SubpagePoolHead::new();
        let a = chunk.allocate(16, 16, &mut head).unwrap().unwrap();
        assert_eq!(a.offset, 0x1000);
    }

    #[test]
    fn multi_word_bitmap_is_exercised_by_small_cells() {
        // 8192 / 16 == 512 cells, more than 64 bits wide.
        let mut chunk = Chunk::new(test_layout(), 0);
        let mut head = SubpagePoolHead::new();
        for i in 0..130 {
            let h = alloc_small(&mut chunk, &mut head, 16);
            assert_eq!(h.bitmap_idx(), i);
        }
        assert_eq!(chunk.subpage_at(0).unwrap().num_avail(), 512 - 130);
    }
}
