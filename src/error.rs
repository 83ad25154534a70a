//! Precondition-violation errors. There's a hard line between this category
//! (caller normalized the request wrong) and "capacity unavailable" (not an
//! error — `allocate` just returns `None` so the arena can try another
//! chunk, matching `frame_allocator::Region::alloc`'s `Option<usize>`).

use core::fmt;

/// `normCapacity` failed the preconditions `Chunk::allocate` requires of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    /// Not a power of two.
    NotPowerOfTwo(usize),
    /// Outside `[MIN_SUBPAGE_SIZE, chunk_size]`.
    OutOfRange { requested: usize, chunk_size: usize },
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::NotPowerOfTwo(v) => {
                write!(f, "normalized capacity {v} is not a power of two")
            }
            ChunkError::OutOfRange { requested, chunk_size } => write!(
                f,
                "normalized capacity {requested} is outside [{}, {chunk_size}]",
                crate::layout::MIN_SUBPAGE_SIZE
            ),
        }
    }
}
