//!
//! Pooled byte-buffer allocator core.
//!
//! A chunk carves a large preallocated region into variable-sized segments
//! with a buddy tree ([`chunk::Chunk`], over a flat array exactly like
//! `frame_allocator::Region`'s bitmap-per-order tree, just walked with one
//! `memoryMap`/`depthMap` pair covering every order at once), and further
//! subdivides individual leaf pages into fixed-size cells for small requests
//! ([`subpage::Subpage`]). A 64-bit [`handle::Handle`] names a live
//! allocation and routes `free` back to the right layer.
//!
//! Out of scope, left to the embedding arena: the linked lists of chunks by
//! fullness and subpage pools by size class, any thread-local cache, the
//! user-facing buffer wrapper (cursors, refcounting, I/O), and capacity
//! normalization (this crate assumes `normCapacity` already a power of two
//! in range before it sees a request). The arena also owns every lock: every
//! mutating method here takes `&mut self` rather than embedding one, so that
//! borrow stands in for whatever external mutex the arena uses.
#![no_std]

#[macro_use]
extern crate alloc;

pub mod chunk;
pub mod error;
pub mod handle;
pub mod layout;
pub mod subpage;

pub use chunk::{Allocation, Chunk};
pub use error::ChunkError;
pub use handle::Handle;
pub use layout::{ChunkLayout, LayoutError, MIN_SUBPAGE_SIZE};
pub use subpage::{Subpage, SubpagePoolHead};
