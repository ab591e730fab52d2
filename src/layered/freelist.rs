//! Free lists threaded through the freed blocks themselves.
//!
//! One list head serves two on-memory representations, chosen by the
//! owning layer's block size:
//!
//! - **Unpacked** (block < page): a singly-linked LIFO where each freed
//!   block stores the previous head in its first word. Sub-page layers
//!   share pages between blocks, so their pages stay committed for the
//!   life of the process and the list can always be walked.
//! - **Packed** (block ≥ page): a linked list of *nodes*, where each
//!   node is itself a freed block whose first page indexes up to
//!   `link_cap` freed-block addresses. Word 0 holds the next node,
//!   word 1 the live link count, words 2.. the addresses. Only the
//!   node's first page must stay committed, so up to
//!   `link_cap = page / word - 2` freed blocks cost one resident page
//!   of metadata between them.
//!
//! The operations here are pure pointer manipulation. Every commit or
//! decommit they imply is reported back through the return values and
//! performed by the caller, which owns the window.

use core::ptr::NonNull;

/// Head of one layer's free list.
#[derive(Clone, Copy, Debug)]
pub struct FreeList {
    head: Option<NonNull<u8>>,
}

// Safety: the pointer graph is only ever touched under the allocator
// lock that owns the layer table.
unsafe impl Send for FreeList {}

/// First words of a packed index node, overlaid on a freed block.
#[repr(C)]
struct PackedNode {
    next: Option<NonNull<u8>>,
    links: u64,
}

/// Word index of the first link slot in a packed node, past the
/// next-node word and the link count.
const LINKS_START: usize = 2;

/// Result of [`FreeList::pop_packed`].
#[derive(Debug)]
pub struct PackedPop {
    /// The freed block returning to live service.
    pub slot: NonNull<u8>,
    /// The head node drained by this pop, if any; its page can go back
    /// to the OS. A drained node's last link is always the node itself,
    /// so when present this equals `slot`.
    pub emptied: Option<NonNull<u8>>,
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

impl FreeList {
    /// Creates a new empty free list.
    pub const fn new() -> Self {
        FreeList { head: None }
    }

    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a freed sub-page block.
    ///
    /// # Safety
    /// `block` must be dead, at least one word large, committed, and not
    /// already on the list.
    pub unsafe fn push_unpacked(&mut self, block: NonNull<u8>) {
        unsafe { write_next(block, self.head) };
        self.head = Some(block);
    }

    /// Pops the most recently freed sub-page block. Its pages are still
    /// committed from the block's previous life.
    ///
    /// # Safety
    /// The list must be in its unpacked representation.
    pub unsafe fn pop_unpacked(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        self.head = unsafe { read_next(block) };
        Some(block)
    }

    /// Records a freed block of at least page size.
    ///
    /// Returns `true` when the block was promoted to a new head node
    /// (the list was empty or the head was full). The caller then owns
    /// decommitting everything past the node's first page. A promoted
    /// node immediately indexes itself, so the block is accounted for
    /// either way.
    ///
    /// # Safety
    /// `block` must be dead with its first page committed, not already
    /// on the list, and `link_cap` must be at least 1 and constant for
    /// the life of the list.
    pub unsafe fn push_packed(&mut self, block: NonNull<u8>, link_cap: u64) -> bool {
        let head_with_room = match self.head {
            Some(head) if unsafe { (*node(head)).links } < link_cap => Some(head),
            _ => None,
        };

        let (head, promoted) = match head_with_room {
            Some(head) => (head, false),
            None => {
                unsafe {
                    block.cast::<PackedNode>().write(PackedNode {
                        next: self.head,
                        links: 0,
                    });
                }
                self.head = Some(block);
                (block, true)
            }
        };

        unsafe {
            let links = (*node(head)).links;
            link_slot(head, links).write(block.as_ptr() as u64);
            (*node(head)).links = links + 1;
        }

        promoted
    }

    /// Takes the most recently recorded packed block.
    ///
    /// When the pop drains the head node, the node is unlinked and
    /// reported through [`PackedPop::emptied`] so the caller can
    /// decommit its page.
    ///
    /// # Safety
    /// The list must be in its packed representation.
    pub unsafe fn pop_packed(&mut self) -> Option<PackedPop> {
        let head = self.head?;

        unsafe {
            let links = (*node(head)).links;
            let slot = link_slot(head, links - 1).read() as *mut u8;
            (*node(head)).links = links - 1;

            let emptied = if links == 1 {
                self.head = (*node(head)).next;
                Some(head)
            } else {
                None
            };

            Some(PackedPop {
                slot: NonNull::new_unchecked(slot),
                emptied,
            })
        }
    }

    /// Counts the freed blocks reachable through an unpacked list.
    ///
    /// This walk takes O(n) time.
    ///
    /// # Safety
    /// The list must be in its unpacked representation.
    pub unsafe fn len_unpacked(&self) -> u64 {
        let mut count = 0;
        let mut current = self.head;

        while let Some(block) = current {
            count += 1;
            current = unsafe { read_next(block) };
        }

        count
    }

    /// Counts the freed blocks recorded across a packed list's nodes.
    ///
    /// # Safety
    /// The list must be in its packed representation.
    pub unsafe fn len_packed(&self) -> u64 {
        let mut count = 0;
        let mut current = self.head;

        while let Some(head) = current {
            unsafe {
                count += (*node(head)).links;
                current = (*node(head)).next;
            }
        }

        count
    }

    /// Counts the index nodes of a packed list, each pinning one
    /// committed page.
    ///
    /// # Safety
    /// The list must be in its packed representation.
    pub unsafe fn node_count(&self) -> u64 {
        let mut count = 0;
        let mut current = self.head;

        while let Some(head) = current {
            count += 1;
            current = unsafe { (*node(head)).next };
        }

        count
    }
}

fn node(head: NonNull<u8>) -> *mut PackedNode {
    head.as_ptr().cast()
}

unsafe fn link_slot(head: NonNull<u8>, index: u64) -> *mut u64 {
    unsafe { head.as_ptr().cast::<u64>().add(LINKS_START + index as usize) }
}

unsafe fn read_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    unsafe { block.cast::<Option<NonNull<u8>>>().read() }
}

unsafe fn write_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    unsafe { block.cast::<Option<NonNull<u8>>>().write(next) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A heap-backed stand-in for a freed block, large enough for a
    /// packed node with a small link capacity.
    fn block() -> NonNull<u8> {
        NonNull::new(Box::into_raw(Box::new([0u64; 8])).cast::<u8>()).unwrap()
    }

    fn reclaim(block: NonNull<u8>) {
        drop(unsafe { Box::from_raw(block.as_ptr().cast::<[u64; 8]>()) });
    }

    #[test]
    fn unpacked_is_lifo() {
        let mut list = FreeList::new();
        let (a, b, c) = (block(), block(), block());

        unsafe {
            list.push_unpacked(a);
            list.push_unpacked(b);
            list.push_unpacked(c);

            assert_eq!(list.len_unpacked(), 3);
            assert_eq!(list.pop_unpacked(), Some(c));
            assert_eq!(list.pop_unpacked(), Some(b));
            assert_eq!(list.len_unpacked(), 1);
            assert_eq!(list.pop_unpacked(), Some(a));
            assert_eq!(list.pop_unpacked(), None);
        }
        assert!(list.is_empty());

        for ptr in [a, b, c] {
            reclaim(ptr);
        }
    }

    #[test]
    fn packed_promotes_on_empty_and_full_heads() {
        const CAP: u64 = 2;
        let mut list = FreeList::new();
        let (a, b, c) = (block(), block(), block());

        unsafe {
            // First free becomes the head node and indexes itself.
            assert!(list.push_packed(a, CAP));
            assert_eq!(list.len_packed(), 1);
            assert_eq!(list.node_count(), 1);

            // Second free fits in the existing head.
            assert!(!list.push_packed(b, CAP));
            assert_eq!(list.len_packed(), 2);
            assert_eq!(list.node_count(), 1);

            // The head is now full, so the third free starts a new node.
            assert!(list.push_packed(c, CAP));
            assert_eq!(list.len_packed(), 3);
            assert_eq!(list.node_count(), 2);
        }

        for ptr in [a, b, c] {
            reclaim(ptr);
        }
    }

    #[test]
    fn packed_pops_in_reverse_and_reports_drained_nodes() {
        const CAP: u64 = 2;
        let mut list = FreeList::new();
        let (a, b, c) = (block(), block(), block());

        unsafe {
            list.push_packed(a, CAP);
            list.push_packed(b, CAP);
            list.push_packed(c, CAP);

            // c sits alone in the newest node; popping it drains that node.
            let pop = list.pop_packed().unwrap();
            assert_eq!(pop.slot, c);
            assert_eq!(pop.emptied, Some(c));

            let pop = list.pop_packed().unwrap();
            assert_eq!(pop.slot, b);
            assert_eq!(pop.emptied, None);

            // a's node drains with a itself as the final link.
            let pop = list.pop_packed().unwrap();
            assert_eq!(pop.slot, a);
            assert_eq!(pop.emptied, Some(a));

            assert!(list.pop_packed().is_none());
            assert_eq!(list.len_packed(), 0);
        }

        for ptr in [a, b, c] {
            reclaim(ptr);
        }
    }

    #[test]
    fn packed_refills_a_partially_drained_head() {
        const CAP: u64 = 3;
        let mut list = FreeList::new();
        let (a, b, c) = (block(), block(), block());

        unsafe {
            list.push_packed(a, CAP);
            list.push_packed(b, CAP);
            assert_eq!(list.pop_packed().unwrap().slot, b);

            // The head has room again; no promotion happens.
            assert!(!list.push_packed(c, CAP));
            assert_eq!(list.node_count(), 1);
            assert_eq!(list.pop_packed().unwrap().slot, c);

            let pop = list.pop_packed().unwrap();
            assert_eq!(pop.slot, a);
            assert_eq!(pop.emptied, Some(a));
        }

        for ptr in [a, b, c] {
            reclaim(ptr);
        }
    }
}
