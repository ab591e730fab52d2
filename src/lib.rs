//! Layered virtual-memory allocation for 64-bit Unix processes.
//!
//! This crate provides:
//! - General-purpose `alloc`/`realloc`/`free` over a single 35 TiB
//!   reserved window, one power-of-two size class per 1 TiB layer
//! - Zero external fragmentation for blocks of a page or larger: a freed
//!   block is exactly reusable because every block in its layer has the
//!   same size
//! - O(1) resizing above a tunable threshold by remapping physical pages
//!   to the new block instead of copying bytes
//! - A fixed-size chunk arena over caller-provided memory
//!
//! The entry points are the module-level [`alloc`], [`realloc`] and
//! [`free`] functions (one shared window per process, guarded by a single
//! spinlock), the [`LayeredAlloc`] handle for code that wants its own
//! window, and the [`Heap`] adapter for use as the Rust global allocator.

pub mod arena;
pub mod layered;
pub mod vmem;

pub use arena::{ChunkArena, CommitRange, MemFull, PhysBacked};
pub use layered::alloc::{Heap, LayeredAlloc, alloc, free, layer_stats, realloc};
pub use layered::layer::{
    LAYER_COUNT, LAYER_SIZE, LayerStats, MAX_BLOCK, MEMCPY_THRESHOLD, MIN_BLOCK, VSPACE_SIZE,
};

// A 35 TiB reservation cannot exist in a 32-bit address space.
const _: () = assert!(size_of::<usize>() == 8);
