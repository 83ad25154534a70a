//! Bitmap-based slab allocator over a single leaf page, threaded into an
//! arena-owned, per-size-class free list.
//!
//! The free-list linkage follows the same shape as
//! `kernel::mm::root_allocator::Run`: mutable allocator state lives behind a
//! `RefCell` alongside an `intrusive_collections::LinkedListLink`, because
//! (per that module's own comment, citing
//! <https://github.com/Amanieu/intrusive-rs/issues/38>) intrusive collection
//! element types are otherwise stuck being immutable. `Chunk` owns every
//! `Subpage` behind a `Box` in its `subpages` slot array; the free list holds
//! non-owning `UnsafeRef<Subpage>` handles into that same memory, exactly the
//! pattern `intrusive_collections::UnsafeRef` exists for.

use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use log::{debug, trace};

/// `-1` sentinel meaning "no cached next-free hint; scan required".
const NO_HINT: i64 = -1;

struct SubpageInner {
    elem_size: usize,
    max_num_elems: u32,
    bitmap: Vec<u64>,
    bitmap_length: usize,
    num_avail: u32,
    next_avail: i64,
    do_not_destroy: bool,
}

/// One leaf page, subdivided into `max_num_elems` equal-sized cells.
///
/// Created once per leaf (see `Chunk::allocate_subpage`) and reused across
/// size classes for the chunk's lifetime; never freed individually.
pub struct Subpage {
    link: LinkedListLink,
    memory_map_idx: u32,
    run_offset: usize,
    page_size: usize,
    inner: RefCell<SubpageInner>,
}

intrusive_adapter!(SubpageAdapter = UnsafeRef<Subpage>: Subpage { link: LinkedListLink });

impl Subpage {
    /// Construct a not-yet-active subpage for the leaf at `memory_map_idx`.
    /// `bitmap_words` should be sized for the worst case (smallest supported
    /// `elemSize`) so later reinitialization at a different size class never
    /// reallocates.
    pub(crate) fn new_leaf(memory_map_idx: u32, run_offset: usize, page_size: usize, bitmap_words: usize) -> Subpage {
        Subpage {
            link: LinkedListLink::new(),
            memory_map_idx,
            run_offset,
            page_size,
            inner: RefCell::new(SubpageInner {
                elem_size: 0,
                max_num_elems: 0,
                bitmap: vec![0u64; bitmap_words],
                bitmap_length: 0,
                num_avail: 0,
                next_avail: NO_HINT,
            do_not_destroy: false,
            }),
        }
    }

    #[inline]
    pub fn memory_map_idx(&self) -> u32 {
        self.memory_map_idx
    }

    #[inline]
    pub fn run_offset(&self) -> usize {
        self.run_offset
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.inner.borrow().elem_size
    }

    #[inline]
    pub fn max_num_elems(&self) -> u32 {
        self.inner.borrow().max_num_elems
    }

    #[inline]
    pub fn num_avail(&self) -> u32 {
        self.inner.borrow().num_avail
    }

    #[inline]
    pub fn do_not_destroy(&self) -> bool {
        self.inner.borrow().do_not_destroy
    }

    /// Reset the bitmap for a new element size and link at the front of
    /// `head`'s pool.
    ///
    /// # Safety
    /// `self_ref` must be a non-owning handle to this same `Subpage`.
    pub(crate) unsafe fn init(self_ref: UnsafeRef<Subpage>, head: &mut SubpagePoolHead, elem_size: usize) {
        debug_assert!(elem_size > 0, "elemSize == 0 is an unreachable precondition");
        let subpage = &*self_ref;
        let max_num_elems = (subpage.page_size / elem_size) as u32;
        let bitmap_length = (max_num_elems as usize).div_ceil(u64::BITS as usize);

        {
            let mut inner = subpage.inner.borrow_mut();
            debug_assert!(bitmap_length <= inner.bitmap.len(), "bitmap undersized for elem_size");
            inner.elem_size = elem_size;
            inner.max_num_elems = max_num_elems;
            inner.num_avail = max_num_elems;
            inner.next_avail = 0;
            inner.bitmap_length = bitmap_length;
            inner.bitmap[..bitmap_length].fill(0);
            inner.do_not_destroy = true;
        }

        debug!(
            "subpage at leaf {} initialized: elem_size={elem_size} max_num_elems={max_num_elems}",
            subpage.memory_map_idx
        );
        head.push_front(self_ref);
    }

    /// Reserve one cell, returning its bitmap index.
    ///
    /// # Safety
    /// `self_ref` must be a non-owning handle to this same `Subpage`.
    pub(crate) unsafe fn allocate(self_ref: UnsafeRef<Subpage>, head: &mut SubpagePoolHead) -> Option<u32> {
        let subpage = &*self_ref;
        let mut inner = subpage.inner.borrow_mut();
        if inner.num_avail == 0 || !inner.do_not_destroy {
            return None;
        }

        let bitmap_idx = if inner.next_avail >= 0 {
            let idx = inner.next_avail as u32;
            inner.next_avail = NO_HINT;
            idx
        } else {
            scan_for_free_bit(&inner.bitmap[..inner.bitmap_length], inner.max_num_elems)?
        };

        set_bit(&mut inner.bitmap, bitmap_idx);
        inner.num_avail -= 1;
        let exhausted = inner.num_avail == 0;
        drop(inner);

        if exhausted {
            head.remove(subpage);
        }

        trace!("subpage at leaf {} allocated cell {bitmap_idx}", subpage.memory_map_idx);
        Some(bitmap_idx)
    }

    /// Release one cell. Returns whether the subpage is still alive (true)
    /// or should be released back to the buddy tree by the caller (false).
    ///
    /// # Safety
    /// `self_ref` must be a non-owning handle to this same `Subpage`.
    pub(crate) unsafe fn free(self_ref: UnsafeRef<Subpage>, head: &mut SubpagePoolHead, bitmap_idx: u32) -> bool {
        let subpage = &*self_ref;
        let mut inner = subpage.inner.borrow_mut();

        debug_assert!(is_bit_set(&inner.bitmap, bitmap_idx), "double free of subpage cell {bitmap_idx}");
        clear_bit(&mut inner.bitmap, bitmap_idx);
        inner.next_avail = bitmap_idx as i64;

        let was_exhausted = inner.num_avail == 0;
        inner.num_avail += 1;

        if was_exhausted {
            // Was unlinked on exhaustion; relink now that it has a free cell.
            let leaf = subpage.memory_map_idx;
            drop(inner);
            head.push_front(self_ref);
            trace!("subpage at leaf {leaf} relinked after free");
            return true;
        }

        let max_num_elems = inner.max_num_elems;
        if inner.num_avail < max_num_elems {
            trace!("subpage at leaf {} freed cell {bitmap_idx}", subpage.memory_map_idx);
            return true;
        }

        // Fully free. Keep it warm if it's the pool's only member.
        if head.is_only_member(subpage) {
            trace!("subpage at leaf {} fully free, retained as sole pool member", subpage.memory_map_idx);
            return true;
        }

        inner.do_not_destroy = false;
        drop(inner);
        head.remove(subpage);
        trace!("subpage at leaf {} fully free, released", subpage.memory_map_idx);
        false
    }
}

impl fmt::Display for Subpage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) if inner.do_not_destroy => write!(
                f,
                "(memoryMapIdx: {}, {}/{}, offset: {}, length: {}, elemSize: {})",
                self.memory_map_idx,
                inner.max_num_elems - inner.num_avail,
                inner.max_num_elems,
                self.run_offset,
                self.page_size,
                inner.elem_size
            ),
            Ok(_) => write!(f, "(memoryMapIdx: {}: not in use)", self.memory_map_idx),
            Err(_) => write!(f, "(memoryMapIdx: {}: locked)", self.memory_map_idx),
        }
    }
}

/// Sentinel anchoring one size class's circular free list.
///
/// A dummy `Subpage` whose `prev`/`next` self-loop when empty is the classic
/// shape for this; `intrusive_collections::LinkedList` already is that
/// container, so this is a thin wrapper rather than a literal sentinel node.
pub struct SubpagePoolHead {
    list: LinkedList<SubpageAdapter>,
}

impl SubpagePoolHead {
    pub fn new() -> SubpagePoolHead {
        SubpagePoolHead { list: LinkedList::new(SubpageAdapter::new()) }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The subpage at the front of this pool, if any.
    ///
    /// A caller sitting above `Chunk` (an arena, or a test standing in for
    /// one) uses this to serve repeat requests for a size class directly
    /// against an already-linked subpage, without touching a `Chunk` at all
    /// — which is exactly why `Chunk::allocate` never performs this check
    /// itself: it always mints a fresh leaf, and reuse is the caller's fast
    /// path, one layer up.
    pub fn front(&self) -> Option<UnsafeRef<Subpage>> {
        self.list.front().get().map(|subpage| unsafe { UnsafeRef::from_raw(subpage as *const Subpage) })
    }

    fn push_front(&mut self, subpage: UnsafeRef<Subpage>) {
        debug_assert!(!subpage.link.is_linked(), "subpage already linked");
        self.list.push_front(subpage);
    }

    fn remove(&mut self, subpage: &Subpage) {
        debug_assert!(subpage.link.is_linked(), "subpage not linked");
        // Safety: `subpage` is linked in this exact list by construction -
        // every `push_front` in this module goes through this head.
        unsafe { self.list.cursor_mut_from_ptr(subpage) }.remove();
    }

    fn is_only_member(&self, subpage: &Subpage) -> bool {
        match (self.list.front().get(), self.list.back().get()) {
            (Some(front), Some(back)) => {
                core::ptr::eq(front, subpage) && core::ptr::eq(back, subpage)
            }
            _ => false,
        }
    }
}

impl Default for SubpagePoolHead {
    fn default() -> Self {
        Self::new()
    }
}

fn word_index(bitmap_idx: u32) -> usize {
    (bitmap_idx / u64::BITS) as usize
}

fn bit_offset(bitmap_idx: u32) -> u32 {
    bitmap_idx % u64::BITS
}

fn is_bit_set(bitmap: &[u64], bitmap_idx: u32) -> bool {
    bitmap[word_index(bitmap_idx)] & (1u64 << bit_offset(bitmap_idx)) != 0
}

fn set_bit(bitmap: &mut [u64], bitmap_idx: u32) {
    bitmap[word_index(bitmap_idx)] |= 1u64 << bit_offset(bitmap_idx);
}

fn clear_bit(bitmap: &mut [u64], bitmap_idx: u32) {
    bitmap[word_index(bitmap_idx)] &= !(1u64 << bit_offset(bitmap_idx));
}

/// Lowest-word-first, lowest-bit-first scan for a free cell, biasing reuse
/// toward low addresses within the page.
fn scan_for_free_bit(bitmap: &[u64], max_num_elems: u32) -> Option<u32> {
    for (word_idx, &word) in bitmap.iter().enumerate() {
        if word == u64::MAX {
            continue;
        }
        let bit_pos = (!word).trailing_zeros();
        let idx = (word_idx as u32) * u64::BITS + bit_pos;
        if idx < max_num_elems {
            return Some(idx);
        }
        // Every lower bit in this word is set and the one free bit found is
        // padding past max_num_elems; the real portion of this word is full.
    }
    None
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    fn leaked(subpage: Subpage) -> (Box<Subpage>, UnsafeRef<Subpage>) {
        let boxed = Box::new(subpage);
        let r = unsafe { UnsafeRef::from_raw(&*boxed as *const Subpage) };
        (boxed, r)
    }

    #[test]
    fn init_sets_full_availability() {
        let (subpage, r) = leaked(Subpage::new_leaf(2048, 0, 8192, 8));
        let mut head = SubpagePoolHead::new();
        unsafe { Subpage::init(r, &mut head, 16) };
        assert_eq!(subpage.max_num_elems(), 512);
        assert_eq!(subpage.num_avail(), 512);
        assert!(!head.is_empty());
    }

    #[test]
    fn allocate_consumes_hint_first() {
        let (subpage, r) = leaked(Subpage::new_leaf(2048, 0, 8192, 8));
        let mut head = SubpagePoolHead::new();
        unsafe {
            Subpage::init(r, &mut head, 16);
            let first = Subpage::allocate(r, &mut head).unwrap();
            assert_eq!(first, 0);
            let second = Subpage::allocate(r, &mut head).unwrap();
            assert_eq!(second, 1);
        }
        assert_eq!(subpage.num_avail(), 510);
    }

    #[test]
    fn exhausting_all_cells_unlinks_subpage() {
        let (subpage, r) = leaked(Subpage::new_leaf(2048, 0, 8192, 8));
        let mut head = SubpagePoolHead::new();
        unsafe {
            Subpage::init(r, &mut head, 16);
            for _ in 0..512 {
                assert!(Subpage::allocate(r, &mut head).is_some());
            }
            assert!(Subpage::allocate(r, &mut head).is_none());
        }
        assert_eq!(subpage.num_avail(), 0);
        assert!(head.is_empty());
    }

    #[test]
    fn freeing_all_cells_keeps_sole_member_warm() {
        let (subpage, r) = leaked(Subpage::new_leaf(2048, 0, 8192, 8));
        let mut head = SubpagePoolHead::new();
        let mut allocated = Vec::new();
        unsafe {
            Subpage::init(r, &mut head, 16);
            for _ in 0..512 {
                allocated.push(Subpage::allocate(r, &mut head).unwrap());
            }
            for (i, idx) in allocated.into_iter().enumerate() {
                let still_alive = Subpage::free(r, &mut head, idx);
                assert!(still_alive, "free #{i} should report the subpage still alive");
            }
        }
        assert_eq!(subpage.num_avail(), 512);
        assert!(subpage.do_not_destroy());
        assert!(!head.is_empty(), "sole pool member is retained rather than unlinked");
    }

    #[test]
    fn freeing_into_a_multi_member_pool_unlinks_when_fully_free() {
        let (a, ra) = leaked(Subpage::new_leaf(2048, 0, 8192, 8));
        let (b, rb) = leaked(Subpage::new_leaf(2049, 8192, 8192, 8));
        let mut head = SubpagePoolHead::new();
        unsafe {
            Subpage::init(ra, &mut head, 32);
            Subpage::init(rb, &mut head, 32);
            let idx = Subpage::allocate(ra, &mut head).unwrap();
            assert!(!Subpage::free(ra, &mut head, idx));
        }
        assert!(!a.do_not_destroy());
        assert!(b.do_not_destroy());
    }

    #[test]
    fn scan_skips_full_words() {
        let bitmap = [u64::MAX, 0b1];
        assert_eq!(scan_for_free_bit(&bitmap, 128), Some(65));
    }

    #[test]
    fn scan_respects_padding_past_max_elems() {
        // Only the low 4 bits of the second word are real; bit 64 is set
        // (allocated), bits 68.. are padding that must never be handed out.
        let bitmap = [u64::MAX, 0b1];
        assert_eq!(scan_for_free_bit(&bitmap, 68), None);
    }
}
