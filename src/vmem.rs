//! Thin façade over the operating system's virtual-memory primitives.
//!
//! The layered engine talks to the OS exclusively through this module:
//! reserving address space with no access rights, committing and
//! decommitting page ranges, and remapping the physical pages behind one
//! virtual range to another. Every address and size crossing this
//! boundary is page-aligned; callers round with [`round_down_to`] and
//! [`round_up_to`] first. Committing a range that was previously
//! decommitted yields zero-filled pages on first touch.

use core::ptr::{self, NonNull};
use std::fmt;
use std::io;

use bitflags::bitflags;
use conquer_once::spin::Lazy;
use log::error;

/// Cached so repeated page rounding does not re-enter the OS.
static PAGE_SIZE: Lazy<u64> = Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64);

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the façade.
#[derive(Debug)]
pub enum Error {
    /// The underlying system call failed.
    SystemCall(io::Error),
    /// The operation has no O(1) implementation on this platform; the
    /// caller should fall back to copying.
    NotSupported,
    /// A precondition on the arguments was violated.
    InvalidParameter(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SystemCall(err) => write!(f, "system call failed: {err}"),
            Error::NotSupported => write!(f, "operation not supported on this platform"),
            Error::InvalidParameter(which) => write!(f, "invalid parameter: {which}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SystemCall(err) => Some(err),
            _ => None,
        }
    }
}

bitflags! {
    /// Access rights for a page range.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u32 {
        const NONE = 0;
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Protection {
    fn to_native(self) -> libc::c_int {
        const MAPPINGS: &[(Protection, libc::c_int)] = &[
            (Protection::READ, libc::PROT_READ),
            (Protection::WRITE, libc::PROT_WRITE),
        ];

        MAPPINGS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(libc::PROT_NONE, |acc, (_, prot)| acc | *prot)
    }
}

/// Returns the OS page granularity in bytes.
pub fn page_size() -> u64 {
    *PAGE_SIZE
}

/// Rounds `value` down to the nearest multiple of `to`.
pub const fn round_down_to(value: u64, to: u64) -> u64 {
    value - value % to
}

/// Rounds `value` up to the nearest multiple of `to`.
pub const fn round_up_to(value: u64, to: u64) -> u64 {
    round_down_to(value + to - 1, to)
}

/// Reserves a contiguous range of virtual addresses with no access
/// rights and no physical backing.
pub fn reserve(size: u64) -> Result<NonNull<u8>> {
    if size == 0 {
        return Err(Error::InvalidParameter("size"));
    }

    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as libc::size_t,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED || base.is_null() {
        let err = io::Error::last_os_error();
        error!("reserving {size} bytes of address space failed: {err}");
        return Err(Error::SystemCall(err));
    }

    Ok(unsafe { NonNull::new_unchecked(base.cast()) })
}

/// Reserves a range whose base is aligned to `align`, a power of two of
/// at least the page size. Over-reserves by the alignment, then trims
/// the misaligned head and the unused tail back to the OS, so the
/// result costs no more address space than `size`.
pub fn reserve_aligned(size: u64, align: u64) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() || align < page_size() {
        return Err(Error::InvalidParameter("align"));
    }

    let base = reserve(size + align)?;
    let aligned = round_up_to(base.as_ptr() as u64, align);

    let head = aligned - base.as_ptr() as u64;
    let tail = align - head;
    unsafe {
        if head != 0 {
            release(base, head);
        }
        if tail != 0 {
            release(NonNull::new_unchecked((aligned + size) as *mut u8), tail);
        }
        Ok(NonNull::new_unchecked(aligned as *mut u8))
    }
}

/// Returns a reservation to the OS.
///
/// # Safety
/// `base` and `size` must describe exactly one range previously returned
/// by [`reserve`], and nothing may touch the range afterwards.
pub unsafe fn release(base: NonNull<u8>, size: u64) {
    let result = unsafe { libc::munmap(base.as_ptr().cast(), size as libc::size_t) };
    debug_assert!(result == 0, "releasing a reservation failed");
}

/// Changes the access rights of a page-aligned range.
pub fn protect(addr: NonNull<u8>, size: u64, protection: Protection) -> Result<()> {
    match unsafe {
        libc::mprotect(
            addr.as_ptr().cast(),
            size as libc::size_t,
            protection.to_native(),
        )
    } {
        0 => Ok(()),
        _ => Err(Error::SystemCall(io::Error::last_os_error())),
    }
}

/// Backs a page-aligned range with zero-filled memory and grants
/// read/write access. Pages that were already committed keep their
/// contents.
pub fn commit(addr: NonNull<u8>, size: u64) -> Result<()> {
    protect(addr, size, Protection::READ_WRITE)
}

/// Hints that the physical pages behind a page-aligned range may be
/// reclaimed and revokes all access. A later [`commit`] observes
/// zero-filled pages.
pub fn decommit(addr: NonNull<u8>, size: u64) -> Result<()> {
    if unsafe { libc::madvise(addr.as_ptr().cast(), size as libc::size_t, libc::MADV_DONTNEED) }
        != 0
    {
        return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    protect(addr, size, Protection::NONE)
}

/// Moves the physical pages backing `[src, src + size)` so they appear
/// at `[dst, dst + size)`, in O(1) page-table work. The source range is
/// left reserved but uncommitted; the destination carries the source's
/// former contents with read/write access.
///
/// Returns [`Error::NotSupported`] where the OS cannot move pages in
/// place; the caller then commits the destination and copies instead.
///
/// # Safety
/// Both ranges must be page-aligned, `size` bytes large, disjoint, and
/// owned by the caller; `src` must be committed.
#[cfg(target_os = "linux")]
pub unsafe fn remap(src: NonNull<u8>, size: u64, dst: NonNull<u8>) -> Result<()> {
    let moved = unsafe {
        libc::mremap(
            src.as_ptr().cast(),
            size as libc::size_t,
            size as libc::size_t,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED | libc::MREMAP_DONTUNMAP,
            dst.as_ptr().cast::<libc::c_void>(),
        )
    };

    if moved == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            // Pre-5.7 kernels reject MREMAP_DONTUNMAP; a source spread
            // over several mappings by earlier remaps raises EFAULT.
            // Both are recoverable by copying.
            Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EFAULT) => {
                Err(Error::NotSupported)
            }
            _ => Err(Error::SystemCall(err)),
        };
    }

    // The moved-out range stays mapped readable; drop it back to
    // reserved-only so it behaves like the rest of the window.
    protect(src, size, Protection::NONE)
}

/// See the Linux implementation; this platform has no in-place page
/// move, so resizing always copies.
#[cfg(not(target_os = "linux"))]
pub unsafe fn remap(_src: NonNull<u8>, _size: u64, _dst: NonNull<u8>) -> Result<()> {
    Err(Error::NotSupported)
}

/// Commits whole pages of `[base + offset, base + offset + range)`,
/// clamped to a region of `total` bytes. Offsets and ranges are rounded
/// to page multiples; an empty rounded range is a no-op.
pub fn commit_range(base: NonNull<u8>, total: u64, offset: u64, range: u64) -> Result<()> {
    let page = page_size();

    let offset = round_down_to(offset, page);
    let mut range = round_down_to(range, page);

    if range == 0 || offset >= total {
        return Ok(());
    }
    if offset + range > total {
        range = total - offset;
    }

    commit(
        unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) },
        range,
    )
}

/// Decommits whole pages strictly past `offset` within a region of
/// `total` bytes: the page containing `offset` is always preserved, so a
/// partially used page survives. An empty rounded range is a no-op.
pub fn decommit_range(base: NonNull<u8>, total: u64, offset: u64, range: u64) -> Result<()> {
    let page = page_size();

    let offset = round_down_to(offset, page) + page;
    let mut range = round_down_to(range, page);

    if range == 0 || offset >= total {
        return Ok(());
    }
    if offset + range > total {
        range = total - offset;
    }

    decommit(
        unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) },
        range,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 512);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_down_to(0, 4096), 0);
        assert_eq!(round_down_to(4095, 4096), 0);
        assert_eq!(round_down_to(4096, 4096), 4096);
        assert_eq!(round_up_to(1, 4096), 4096);
        assert_eq!(round_up_to(4096, 4096), 4096);
        assert_eq!(round_up_to(4097, 4096), 8192);
    }

    #[test]
    fn protection_flags_are_mapped_to_native() {
        assert_eq!(Protection::NONE.to_native(), libc::PROT_NONE);
        assert_eq!(Protection::READ.to_native(), libc::PROT_READ);
        assert_eq!(
            Protection::READ_WRITE.to_native(),
            libc::PROT_READ | libc::PROT_WRITE
        );
    }

    #[test]
    fn reserve_rejects_empty_reservation() {
        assert!(matches!(reserve(0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn reserve_aligned_honors_large_alignments() {
        let page = page_size();
        let align = 64 * 1024 * 1024;
        let base = reserve_aligned(4 * page, align).unwrap();

        assert_eq!(base.as_ptr() as u64 % align, 0);
        commit(base, 4 * page).unwrap();
        unsafe {
            base.as_ptr().write_bytes(0x11, (4 * page) as usize);
            release(base, 4 * page);
        }

        assert!(matches!(
            reserve_aligned(page, page / 2),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn commit_write_decommit_round_trip() {
        let page = page_size();
        let base = reserve(4 * page).unwrap();

        commit(base, 2 * page).unwrap();
        unsafe {
            base.as_ptr().write_bytes(0xAB, (2 * page) as usize);
            assert_eq!(*base.as_ptr().add(page as usize), 0xAB);
        }

        // Decommitted pages read back as zeros once recommitted.
        decommit(base, 2 * page).unwrap();
        commit(base, 2 * page).unwrap();
        unsafe {
            assert_eq!(*base.as_ptr(), 0);
            assert_eq!(*base.as_ptr().add((2 * page - 1) as usize), 0);
        }

        unsafe { release(base, 4 * page) };
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remap_moves_page_contents() {
        let page = page_size();
        let base = reserve(4 * page).unwrap();
        let dst = unsafe { NonNull::new_unchecked(base.as_ptr().add((2 * page) as usize)) };

        commit(base, page).unwrap();
        unsafe { base.as_ptr().write_bytes(0x5C, page as usize) };

        unsafe { remap(base, page, dst).unwrap() };
        unsafe {
            assert_eq!(*dst.as_ptr(), 0x5C);
            assert_eq!(*dst.as_ptr().add((page - 1) as usize), 0x5C);
        }

        // The source reads as fresh zero pages after a recommit.
        commit(base, page).unwrap();
        unsafe { assert_eq!(*base.as_ptr(), 0) };

        unsafe { release(base, 4 * page) };
    }

    #[test]
    fn decommit_range_preserves_the_offset_page() {
        let page = page_size();
        let total = 4 * page;
        let base = reserve(total).unwrap();

        commit(base, total).unwrap();
        unsafe { base.as_ptr().write_bytes(0x77, total as usize) };

        // Pages past offset zero go away; the page holding the offset stays.
        decommit_range(base, total, 0, 2 * page).unwrap();
        unsafe { assert_eq!(*base.as_ptr().add((page - 1) as usize), 0x77) };

        commit(base, total).unwrap();
        unsafe {
            assert_eq!(*base.as_ptr(), 0x77);
            assert_eq!(*base.as_ptr().add(page as usize), 0);
            assert_eq!(*base.as_ptr().add((3 * page) as usize), 0x77);
        }

        unsafe { release(base, total) };
    }

    #[test]
    fn range_helpers_ignore_empty_and_out_of_bounds_requests() {
        let page = page_size();
        let base = reserve(2 * page).unwrap();

        // Sub-page ranges round to nothing; offsets past the region are
        // clamped away. None of these may touch the OS with bad arguments.
        decommit_range(base, 2 * page, 0, page - 1).unwrap();
        decommit_range(base, 2 * page, 4 * page, page).unwrap();
        commit_range(base, 2 * page, 0, page - 1).unwrap();
        commit_range(base, 2 * page, 4 * page, page).unwrap();

        // A clamped commit still commits the in-bounds prefix.
        commit_range(base, 2 * page, page, 8 * page).unwrap();
        unsafe {
            base.as_ptr().add(page as usize).write_bytes(0x31, page as usize);
            assert_eq!(*base.as_ptr().add((2 * page - 1) as usize), 0x31);
        }

        unsafe { release(base, 2 * page) };
    }
}
