//! # Allocator
//!
//! Lane arrays live in over-sized regions so they can be moved to a cache-aware offset (see
//! [`crate::placement`]). A region is obtained with one of three policies:
//!
//! - [`AllocPolicy::Heap`]: the global allocator, zero-initialised and cache-line aligned
//! - [`AllocPolicy::HugePageBacked`]: anonymous `mmap` with `MAP_HUGETLB`, rounded to 2 MiB
//! - [`AllocPolicy::NumaLocal`]: anonymous `mmap` bound with `mbind` to the NUMA node of the CPU
//!   the calling lane is pinned to
//!
//! Regions are released when the [`Allocation`] is dropped, so every successful [`acquire`] is
//! paired with exactly one release.
use crate::error::{BenchError, ConfigError, Result};
use crate::placement::Placement;
use crate::topology;
use log::{debug, warn};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Granularity of huge-page-backed regions
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Alignment requested from the global allocator
const HEAP_ALIGN: usize = 64;

/// Where lane memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    Heap,
    HugePageBacked,
    NumaLocal,
}

impl AllocPolicy {
    /// Fail at startup instead of silently falling back when the platform lacks support.
    pub fn ensure_supported(&self) -> std::result::Result<(), ConfigError> {
        match self {
            AllocPolicy::Heap => Ok(()),
            AllocPolicy::HugePageBacked => {
                if topology::huge_page_pool_size() > 0 {
                    Ok(())
                } else {
                    Err(ConfigError::Unsupported("huge page backed allocation"))
                }
            }
            AllocPolicy::NumaLocal => {
                if topology::numa_available() {
                    Ok(())
                } else {
                    Err(ConfigError::Unsupported("NUMA-local allocation"))
                }
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for usize {}
}

/// Element types lane arrays can be carved into. All-zero bytes must be a valid value.
pub trait Element: sealed::Sealed + Copy {}
impl Element for f64 {}
impl Element for usize {}

/// An owned memory region, released on drop
#[derive(Debug)]
pub struct Allocation {
    base: NonNull<u8>,
    len: usize,
    policy: AllocPolicy,
}

// SAFETY: the region is exclusively owned by this value and holds plain data
unsafe impl Send for Allocation {}

/// Acquire a region able to hold `size_bytes` at any placement offset of `placement`.
pub fn acquire(size_bytes: usize, policy: AllocPolicy, placement: &Placement) -> Result<Allocation> {
    let requested_size = size_bytes
        .checked_add(placement.slack())
        .ok_or(BenchError::AllocationFailure {
            requested_size: usize::MAX,
        })?;
    let failure = || BenchError::AllocationFailure { requested_size };

    let (base, len) = match policy {
        AllocPolicy::Heap => {
            let layout =
                Layout::from_size_align(requested_size, HEAP_ALIGN).map_err(|_| failure())?;
            // SAFETY: the layout has a non-zero size, slack is always at least two cache lines
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            (NonNull::new(ptr).ok_or_else(failure)?, requested_size)
        }
        AllocPolicy::HugePageBacked => {
            let len = requested_size
                .checked_next_multiple_of(HUGE_PAGE_SIZE)
                .ok_or_else(failure)?;
            let ptr = map_anonymous(len, true)
                .ok_or(BenchError::AllocationFailure { requested_size: len })?;
            (ptr, len)
        }
        AllocPolicy::NumaLocal => {
            let ptr = map_anonymous(requested_size, false).ok_or_else(failure)?;
            match topology::current_cpu().and_then(topology::numa_node_of_cpu) {
                Some(node) => bind_to_node(ptr, requested_size, node),
                None => warn!("Couldn't determine the NUMA node of this lane, memory stays unbound"),
            }
            (ptr, requested_size)
        }
    };

    debug!("Acquired {len} bytes ({policy:?}) at {:p}", base.as_ptr());
    Ok(Allocation { base, len, policy })
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Borrow `len` elements starting at the placed address for (`share`, `rank`).
    pub fn carve<T: Element>(
        &mut self,
        placement: &Placement,
        share: usize,
        rank: usize,
        len: usize,
    ) -> Result<&mut [T]> {
        let base = self.base_addr();
        let start = placement.place(base, share, rank);
        let end = len
            .checked_mul(size_of::<T>())
            .and_then(|bytes| start.checked_add(bytes))
            .ok_or(BenchError::PlacementOverflow)?;
        if end > base + self.len || start % align_of::<T>() != 0 {
            return Err(BenchError::PlacementOverflow);
        }

        // SAFETY: [start, end) lies inside the region owned by `self` and is aligned for `T`. The
        // region is zero-initialised, which is a valid `T`, and the mutable borrow of `self` keeps
        // the slice exclusive.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(start - base).cast::<T>(), len)
        })
    }

    /// Return the region. Equivalent to dropping the allocation.
    pub fn release(self) {}
}

impl Drop for Allocation {
    fn drop(&mut self) {
        match self.policy {
            AllocPolicy::Heap => {
                // SAFETY: the same layout was used by `acquire`
                unsafe {
                    let layout = Layout::from_size_align_unchecked(self.len, HEAP_ALIGN);
                    std::alloc::dealloc(self.base.as_ptr(), layout);
                }
            }
            AllocPolicy::HugePageBacked | AllocPolicy::NumaLocal => unmap(self.base, self.len),
        }
    }
}

#[cfg(target_os = "linux")]
fn map_anonymous(len: usize, huge: bool) -> Option<NonNull<u8>> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if huge {
        flags |= libc::MAP_HUGETLB;
    }
    // SAFETY: a fresh anonymous private mapping does not alias any existing memory
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        warn!(
            "mmap of {} MiB failed: {}",
            len / (1024 * 1024),
            std::io::Error::last_os_error()
        );
        return None;
    }
    NonNull::new(ptr.cast())
}

#[cfg(not(target_os = "linux"))]
fn map_anonymous(_len: usize, _huge: bool) -> Option<NonNull<u8>> {
    None
}

#[cfg(target_os = "linux")]
fn unmap(base: NonNull<u8>, len: usize) {
    // SAFETY: `base` and `len` describe a mapping created by `map_anonymous`
    if unsafe { libc::munmap(base.as_ptr().cast(), len) } != 0 {
        warn!("munmap failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn unmap(_base: NonNull<u8>, _len: usize) {}

/// Bind a mapping to one NUMA node. Failure only costs locality, so it is logged and tolerated.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: NonNull<u8>, len: usize, node: usize) {
    const MPOL_BIND: libc::c_int = 2;
    const MPOL_MF_MOVE: libc::c_uint = 2;

    if node >= u64::BITS as usize {
        warn!("NUMA node {node} is outside the supported node mask, memory stays unbound");
        return;
    }
    let nodemask: u64 = 1 << node;

    // SAFETY: the range is a live mapping we own and the mask outlives the call
    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr.as_ptr(),
            len,
            MPOL_BIND,
            &raw const nodemask,
            u64::BITS as usize + 1,
            MPOL_MF_MOVE,
        )
    };
    if result < 0 {
        warn!(
            "mbind to NUMA node {node} failed: {}",
            std::io::Error::last_os_error()
        );
    } else {
        debug!("Bound {len} bytes to NUMA node {node}");
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: NonNull<u8>, _len: usize, _node: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_has_slack() {
        let placement = Placement::new(32 * 1024, 64);
        let region = acquire(4096, AllocPolicy::Heap, &placement).unwrap();
        assert_eq!(region.len(), 4096 + placement.slack());
        assert_eq!(region.base_addr() % HEAP_ALIGN, 0);
        region.release();
    }

    #[test]
    fn carved_arrays_are_placed_and_zeroed() {
        let placement = Placement::new(32 * 1024, 64);
        let mut region = acquire(1024 * 8, AllocPolicy::Heap, &placement).unwrap();
        let base = region.base_addr();

        let expected = placement.place(base, 3, 2);
        let array: &mut [f64] = region.carve(&placement, 3, 2, 1024).unwrap();
        assert_eq!(array.as_ptr() as usize, expected);
        assert_eq!(array.as_ptr() as usize % 64, 0);
        assert!(array.iter().all(|&x| x == 0.0));
        array.fill(1.5);
        assert_eq!(array[1023], 1.5);
    }

    #[test]
    fn carve_rejects_oversized_arrays() {
        let placement = Placement::new(32 * 1024, 64);
        let mut region = acquire(1024, AllocPolicy::Heap, &placement).unwrap();
        let len = region.len() / 8 + 1;
        assert!(matches!(
            region.carve::<usize>(&placement, 1, 0, len),
            Err(BenchError::PlacementOverflow)
        ));
    }

    #[test]
    fn heap_is_always_supported() {
        AllocPolicy::Heap.ensure_supported().unwrap();
    }

    #[test]
    fn huge_pages_need_a_reserved_pool() {
        let supported = AllocPolicy::HugePageBacked.ensure_supported();
        if topology::huge_page_pool_size() == 0 {
            assert!(matches!(
                supported,
                Err(ConfigError::Unsupported("huge page backed allocation"))
            ));
        } else {
            supported.unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn huge_page_region_is_rounded_to_whole_pages() {
        if AllocPolicy::HugePageBacked.ensure_supported().is_err() {
            return;
        }
        let placement = Placement::new(32 * 1024, 64);
        // the pool may be reserved but already in use
        let Ok(region) = acquire(4096, AllocPolicy::HugePageBacked, &placement) else {
            return;
        };
        assert_eq!(region.len() % HUGE_PAGE_SIZE, 0);
        assert!(region.len() >= 4096 + placement.slack());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn numa_local_region_is_usable_when_available() {
        if AllocPolicy::NumaLocal.ensure_supported().is_err() {
            return;
        }
        let placement = Placement::new(0, 64);
        let mut region = acquire(64 * 1024, AllocPolicy::NumaLocal, &placement).unwrap();
        let array: &mut [usize] = region.carve(&placement, 1, 0, 8 * 1024).unwrap();
        array.iter_mut().enumerate().for_each(|(i, x)| *x = i);
        assert_eq!(array[8191], 8191);
    }
}
