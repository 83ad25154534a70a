//! Packs a live allocation's identity into one 64-bit token.
//!
//! ```text
//! bit 63       62 ────────── 32   31 ──────────── 0
//!  0           bitmapIdx (30)      memoryMapIdx (32)
//!              marker bit 62 = 1 iff subpage allocation
//! ```
//!
//! `bit_field` is already a dependency for the bitmap layer's per-bit access;
//! its `BitField` trait is also the natural fit for packing the three fields
//! here into a single machine word.

use bit_field::BitField;

const MARKER_BIT: usize = 62;
const BITMAP_IDX_RANGE: core::ops::Range<usize> = 32..62;
const MEMORY_MAP_IDX_RANGE: core::ops::Range<usize> = 0..32;
const BITMAP_IDX_MASK: u32 = 0x3FFF_FFFF;

/// Opaque token naming one live allocation on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Encode a run (possibly multi-page) allocation: no subpage component.
    pub fn for_run(memory_map_idx: u32) -> Handle {
        let mut bits: u64 = 0;
        bits.set_bits(MEMORY_MAP_IDX_RANGE, memory_map_idx as u64);
        Handle(bits)
    }

    /// Encode a subpage cell allocation at `memory_map_idx`'s leaf.
    pub fn for_subpage(memory_map_idx: u32, bitmap_idx: u32) -> Handle {
        debug_assert!(bitmap_idx & !BITMAP_IDX_MASK == 0, "bitmap_idx must fit in 30 bits");
        let mut bits: u64 = 0;
        bits.set_bits(MEMORY_MAP_IDX_RANGE, memory_map_idx as u64);
        bits.set_bits(BITMAP_IDX_RANGE, bitmap_idx as u64);
        bits.set_bit(MARKER_BIT, true);
        Handle(bits)
    }

    #[inline]
    pub fn memory_map_idx(&self) -> u32 {
        self.0.get_bits(MEMORY_MAP_IDX_RANGE) as u32
    }

    /// The cell index within the leaf's subpage. Only meaningful when
    /// [`Handle::is_subpage`] is true.
    #[inline]
    pub fn bitmap_idx(&self) -> u32 {
        self.0.get_bits(BITMAP_IDX_RANGE) as u32
    }

    #[inline]
    pub fn is_subpage(&self) -> bool {
        self.0.get_bit(MARKER_BIT)
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }
}
