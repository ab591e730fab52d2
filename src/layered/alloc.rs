//! The allocator proper: a 35 TiB reserved window carved into layers,
//! one handle method per public operation, and the process-wide façade
//! behind the single spinlock.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use log::{debug, error, warn};
use spin::Mutex;

use super::freelist::PackedPop;
use super::layer::{
    self, LAYER_COUNT, LayerHeader, LayerStats, MAX_BLOCK, MEMCPY_THRESHOLD, VSPACE_SIZE,
};
use crate::vmem;

/// The process-wide allocator, created under the lock on first use. A
/// failed window reservation leaves this unset so a later call retries.
static GLOBAL: Mutex<Option<LayeredAlloc>> = Mutex::new(None);

/// A layered allocator over its own reserved window.
///
/// One instance normally exists per process, owned by the module-level
/// [`alloc`]/[`realloc`]/[`free`] functions, but additional windows can
/// be created for isolation (tests do). The handle is not internally
/// synchronized; wrap it in a lock to share it.
pub struct LayeredAlloc {
    vspace_base: NonNull<u8>,
    page_size: u64,
    headers: [LayerHeader; LAYER_COUNT],
}

// Safety: the handle owns its window exclusively; all shared use goes
// through the `GLOBAL` mutex.
unsafe impl Send for LayeredAlloc {}

impl LayeredAlloc {
    /// Reserves a fresh 35 TiB window and builds the layer table over
    /// it. The window starts on a 1 TiB boundary so every block is
    /// aligned to its own size. Returns `None` when the OS refuses the
    /// reservation; no state survives a failed attempt.
    pub fn new() -> Option<Self> {
        let vspace_base = vmem::reserve_aligned(VSPACE_SIZE, MAX_BLOCK).ok()?;
        let headers = core::array::from_fn(|class| LayerHeader::new(vspace_base, class));
        let page_size = vmem::page_size();

        debug!(
            "layered window reserved: {:p}, {} layers, {} byte pages",
            vspace_base, LAYER_COUNT, page_size
        );

        Some(LayeredAlloc {
            vspace_base,
            page_size,
            headers,
        })
    }

    /// Allocates a block covering `size` bytes, rounded up to the next
    /// power of two (at least 64 B). The block is aligned to its own
    /// size. Returns `None` for requests above 1 TiB or when the
    /// block's layer is exhausted.
    pub fn alloc(&mut self, size: u64) -> Option<NonNull<u8>> {
        if size > MAX_BLOCK {
            return None;
        }

        let class = layer::class_of_size(size);
        let block_size = self.headers[class].block_size;

        let addr = self.get_slot(class)?;
        if let Err(err) = self.commit_block(addr, block_size) {
            error!("committing {block_size} bytes at {addr:p} failed: {err}");
            return None;
        }

        Some(addr)
    }

    /// Moves an allocation to a (possibly differently sized) block and
    /// frees the old one. Blocks whose new class is at least
    /// [`MEMCPY_THRESHOLD`] are resized by remapping their physical
    /// pages in O(1); smaller ones are copied.
    ///
    /// # Safety
    /// `addr` must be a live block previously returned by this handle
    /// and is dead once the call returns a new address.
    pub unsafe fn realloc(&mut self, addr: NonNull<u8>, size: u64) -> Option<NonNull<u8>> {
        if size > MAX_BLOCK {
            return None;
        }

        let old_class = layer::class_of_addr(self.vspace_base, addr);
        let old_size = self.headers[old_class].block_size;
        let new_class = layer::class_of_size(size);
        let new_size = self.headers[new_class].block_size;

        let new_addr = self.get_slot(new_class)?;
        let preserved = old_size.min(new_size);

        if new_size < MEMCPY_THRESHOLD {
            if let Err(err) = self.commit_block(new_addr, new_size) {
                error!("committing {new_size} bytes at {new_addr:p} failed: {err}");
                return None;
            }
            unsafe {
                ptr::copy_nonoverlapping(addr.as_ptr(), new_addr.as_ptr(), preserved as usize);
            }
        } else if let Err(err) = unsafe { self.remap_block(addr, new_addr, preserved, new_size) } {
            error!("moving {preserved} bytes from {addr:p} to {new_addr:p} failed: {err}");
            return None;
        }

        unsafe { self.del_slot(old_class, addr) };

        Some(new_addr)
    }

    /// Returns a block to its layer's free list.
    ///
    /// # Safety
    /// `addr` must be a live block previously returned by this handle;
    /// freeing it twice corrupts the free list.
    pub unsafe fn free(&mut self, addr: NonNull<u8>) {
        let class = layer::class_of_addr(self.vspace_base, addr);
        unsafe { self.del_slot(class, addr) };
    }

    /// Accounting snapshot of one layer, or `None` past the last class.
    pub fn layer_stats(&self, class: usize) -> Option<LayerStats> {
        let header = self.headers.get(class)?;

        let free_len = if header.block_size < self.page_size {
            unsafe { header.free.len_unpacked() }
        } else {
            unsafe { header.free.len_packed() }
        };

        Some(LayerStats {
            block_count: header.block_count,
            block_max: header.block_max,
            bump_index: header.bump_index,
            free_len,
        })
    }

    /// Committed index-node pages held by a packed layer's free list.
    #[cfg(test)]
    pub(crate) fn packed_nodes(&self, class: usize) -> u64 {
        unsafe { self.headers[class].free.node_count() }
    }

    /// Base of this handle's reserved window.
    #[cfg(test)]
    pub(crate) fn window_base(&self) -> NonNull<u8> {
        self.vspace_base
    }

    /// How many block addresses fit in one packed index node: one page
    /// of words minus the next-node word and the link count.
    fn link_cap(&self) -> u64 {
        self.page_size / size_of::<u64>() as u64 - 2
    }

    /// Hands out a dead block of `class`, preferring the free list over
    /// the bump frontier. The caller commits the block's pages.
    fn get_slot(&mut self, class: usize) -> Option<NonNull<u8>> {
        let page_size = self.page_size;
        let header = &mut self.headers[class];

        if header.free.is_empty() {
            if header.bump_index == header.block_max {
                return None;
            }

            let addr = header.block_at(header.bump_index);
            header.bump_index += 1;
            header.block_count += 1;
            return Some(addr);
        }

        header.block_count += 1;

        if header.block_size < page_size {
            unsafe { header.free.pop_unpacked() }
        } else {
            let PackedPop { slot, emptied } = unsafe { header.free.pop_packed() }?;
            if let Some(node) = emptied {
                // The head index node drained; its one resident page goes
                // back to the OS before the slot re-enters service.
                if let Err(err) = vmem::decommit(node, page_size) {
                    warn!("decommitting a drained index node at {node:p} failed: {err}");
                }
            }
            Some(slot)
        }
    }

    /// Returns a dead block to `class`. For packed layers this may turn
    /// the block into the new head index node, in which case everything
    /// past its first page is decommitted.
    unsafe fn del_slot(&mut self, class: usize, addr: NonNull<u8>) {
        let page_size = self.page_size;
        let link_cap = self.link_cap();
        let header = &mut self.headers[class];

        if header.block_size < page_size {
            unsafe { header.free.push_unpacked(addr) };
        } else {
            let promoted = unsafe { header.free.push_packed(addr, link_cap) };
            if promoted && header.block_size > page_size {
                let tail = unsafe { NonNull::new_unchecked(addr.as_ptr().add(page_size as usize)) };
                if let Err(err) = vmem::decommit(tail, header.block_size - page_size) {
                    warn!("decommitting a freed block's tail at {tail:p} failed: {err}");
                }
            }
        }

        header.block_count -= 1;
    }

    /// Commits the pages covering a block. Sub-page blocks share pages
    /// with their neighbours, so the containing page range is rounded
    /// outwards; page-or-larger blocks are already page-aligned.
    fn commit_block(&self, addr: NonNull<u8>, block_size: u64) -> vmem::Result<()> {
        let start = vmem::round_down_to(addr.as_ptr() as u64, self.page_size);
        let len = vmem::round_up_to(block_size, self.page_size);
        vmem::commit(unsafe { NonNull::new_unchecked(start as *mut u8) }, len)
    }

    /// Moves `preserved` bytes of physical pages from `addr` to
    /// `new_addr` and commits whatever the new block needs beyond them.
    /// Falls back to commit-and-copy where the OS cannot move pages.
    ///
    /// On success the source block is uncommitted except for its first
    /// page, which is recommitted so `del_slot` can write free-list
    /// metadata into it.
    unsafe fn remap_block(
        &mut self,
        addr: NonNull<u8>,
        new_addr: NonNull<u8>,
        preserved: u64,
        new_size: u64,
    ) -> vmem::Result<()> {
        match unsafe { vmem::remap(addr, preserved, new_addr) } {
            Ok(()) => {
                if new_size > preserved {
                    let rest =
                        unsafe { NonNull::new_unchecked(new_addr.as_ptr().add(preserved as usize)) };
                    vmem::commit(rest, new_size - preserved)?;
                }
                vmem::commit(addr, self.page_size)
            }
            Err(vmem::Error::NotSupported) => {
                warn!("page remap unavailable; copying {preserved} bytes instead");
                self.commit_block(new_addr, new_size)?;
                unsafe {
                    ptr::copy_nonoverlapping(addr.as_ptr(), new_addr.as_ptr(), preserved as usize);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for LayeredAlloc {
    fn drop(&mut self) {
        unsafe { vmem::release(self.vspace_base, VSPACE_SIZE) };
    }
}

fn ensure_init(heap: &mut Option<LayeredAlloc>) -> Option<&mut LayeredAlloc> {
    if heap.is_none() {
        *heap = LayeredAlloc::new();
    }
    heap.as_mut()
}

/// Allocates `size` bytes from the process-wide window. The block is a
/// power of two of at least 64 B, aligned to its own size. Returns
/// `None` for requests above 1 TiB, when the window reservation fails,
/// or when the size class is exhausted.
pub fn alloc(size: u64) -> Option<NonNull<u8>> {
    let mut heap = GLOBAL.lock();
    ensure_init(&mut heap)?.alloc(size)
}

/// Resizes an allocation from the process-wide window, preserving the
/// common prefix of the old and new blocks. `None` behaves like a plain
/// [`alloc`].
///
/// # Safety
/// A non-null `addr` must be a live block previously returned by
/// [`alloc`] or [`realloc`] and is dead once a new address is returned.
pub unsafe fn realloc(addr: Option<NonNull<u8>>, size: u64) -> Option<NonNull<u8>> {
    let Some(addr) = addr else {
        // No lock is held here; the plain allocation takes it itself.
        return alloc(size);
    };

    let mut heap = GLOBAL.lock();
    unsafe { ensure_init(&mut heap)?.realloc(addr, size) }
}

/// Returns a block to the process-wide window. A `None` address is a
/// no-op.
///
/// # Safety
/// A non-null `addr` must be a live block previously returned by
/// [`alloc`] or [`realloc`]; freeing it twice corrupts the free list.
pub unsafe fn free(addr: Option<NonNull<u8>>) {
    let Some(addr) = addr else { return };

    let mut heap = GLOBAL.lock();
    if let Some(heap) = heap.as_mut() {
        unsafe { heap.free(addr) };
    }
}

/// Accounting snapshot of one of the process-wide window's layers.
/// `None` past the last class or before the window exists.
pub fn layer_stats(class: usize) -> Option<LayerStats> {
    GLOBAL.lock().as_ref()?.layer_stats(class)
}

/// Adapter exposing the process-wide window as a Rust allocator.
///
/// ```no_run
/// #[global_allocator]
/// static HEAP: strata::Heap = strata::Heap;
///
/// fn main() {
///     let held = vec![1u8, 2, 3];
///     assert_eq!(held.len(), 3);
/// }
/// ```
pub struct Heap;

// Safety: blocks are exclusively owned between alloc and dealloc,
// naturally aligned to a power of two covering the layout's alignment,
// and at least `layout.size()` bytes large.
unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align()) as u64;
        match alloc(size) {
            Some(block) => block.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { free(NonNull::new(ptr)) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let size = new_size.max(layout.align()) as u64;
        match unsafe { realloc(NonNull::new(ptr), size) } {
            Some(block) => block.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
