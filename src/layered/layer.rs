//! Geometry of the layered window: constants, the per-layer header, and
//! the size/address to class mappings.

use core::ptr::NonNull;

use super::freelist::FreeList;

/// Smallest block handed out, 64 B.
pub const MIN_BLOCK: u64 = 64;

/// log2 of [`MIN_BLOCK`].
pub const MIN_BLOCK_SHIFT: u32 = 6;

/// Largest block handed out, 1 TiB. Requests above this fail.
pub const MAX_BLOCK: u64 = 1 << 40;

/// Span of a single layer. Each layer holds blocks of exactly one size,
/// so the largest class fits exactly one block.
pub const LAYER_SIZE: u64 = MAX_BLOCK;

/// Number of layers, one per size class from 64 B to 1 TiB.
pub const LAYER_COUNT: usize = 35;

/// Total virtual reservation backing the allocator, 35 TiB.
pub const VSPACE_SIZE: u64 = LAYER_SIZE * LAYER_COUNT as u64;

/// Resizes into a class at least this large move pages instead of
/// copying bytes. Remapping is O(1) but costs a round trip into the
/// kernel, so the crossover is workload dependent; profile `realloc` if
/// you need the optimum. Must exceed the page size.
pub const MEMCPY_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Per-layer bookkeeping.
///
/// All other layer attributes derive from these fields: the layer's end
/// is `layer_base + LAYER_SIZE`, the n-th block sits at
/// `layer_base + n * block_size`.
#[derive(Clone, Copy, Debug)]
pub struct LayerHeader {
    /// Start of this layer's 1 TiB slice of the window.
    pub layer_base: NonNull<u8>,
    /// Block size of this layer's class, a power of two.
    pub block_size: u64,
    /// Currently live blocks.
    pub block_count: u64,
    /// Capacity of the layer in blocks, `LAYER_SIZE / block_size`.
    pub block_max: u64,
    /// Next never-handed-out block. Monotonic; freed blocks re-enter
    /// service through `free` instead of moving this back.
    pub bump_index: u64,
    /// Freed blocks awaiting reuse.
    pub free: FreeList,
}

unsafe impl Send for LayerHeader {}

impl LayerHeader {
    /// Builds the header for `class` within the window at `vspace_base`.
    pub fn new(vspace_base: NonNull<u8>, class: usize) -> Self {
        let block_size = MIN_BLOCK << class;
        let layer_base = unsafe {
            NonNull::new_unchecked(vspace_base.as_ptr().add(class * LAYER_SIZE as usize))
        };

        LayerHeader {
            layer_base,
            block_size,
            block_count: 0,
            block_max: LAYER_SIZE / block_size,
            bump_index: 0,
            free: FreeList::new(),
        }
    }

    /// Address of the `index`-th block of this layer.
    pub fn block_at(&self, index: u64) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(
                self.layer_base
                    .as_ptr()
                    .add((index * self.block_size) as usize),
            )
        }
    }
}

/// Snapshot of one layer's accounting, taken under the allocator lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerStats {
    /// Currently live blocks.
    pub block_count: u64,
    /// Capacity of the layer in blocks.
    pub block_max: u64,
    /// Blocks ever handed out of this layer.
    pub bump_index: u64,
    /// Freed blocks reachable through the free list.
    pub free_len: u64,
}

/// Maps a requested size to its class index: the smallest class whose
/// block size covers the request. Zero promotes to class 0; callers
/// reject sizes above [`MAX_BLOCK`] before mapping.
pub const fn class_of_size(size: u64) -> usize {
    let size = if size < MIN_BLOCK { MIN_BLOCK } else { size };
    (size.next_power_of_two().trailing_zeros() - MIN_BLOCK_SHIFT) as usize
}

/// Maps an address inside the window back to the class of the layer it
/// lies in. The caller guarantees `addr` was handed out of the window
/// starting at `vspace_base`.
pub fn class_of_addr(vspace_base: NonNull<u8>, addr: NonNull<u8>) -> usize {
    ((addr.as_ptr() as u64 - vspace_base.as_ptr() as u64) / LAYER_SIZE) as usize
}
