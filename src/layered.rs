//! The layered size-class engine.
//!
//! This module provides:
//! - The 35-layer partition of the reserved window, one power-of-two
//!   size class per layer
//! - Per-layer free lists threaded through the freed blocks themselves
//! - The `alloc`/`realloc`/`free` façade and its commit/decommit/remap
//!   protocol against [`crate::vmem`]

pub mod alloc;
pub mod freelist;
pub mod layer;


pub use alloc::{Heap, LayeredAlloc};
pub use layer::LayerStats;
