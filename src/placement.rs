//! Cache-aware placement of arrays inside over-sized allocations.
//!
//! Each array is moved to the start of a cache-sized block and then shifted by its share of the
//! cache, so that arrays used together (a lane's A, B and C, or every lane's arrays in shared cache
//! mode) map to disjoint slices of the cache instead of evicting each other.

/// Return the address an array should start at.
///
/// With `cache_size > 0` the address is `base` rounded up to a multiple of `cache_size`, plus
/// `rank / share_count` of the cache's lines. With `cache_size == 0` cache alignment is disabled
/// and only cache-line alignment is applied. The result never exceeds
/// `base + 2 * cache_size + 2 * cache_line_size`.
///
/// Expects `rank < share_count` and `share_count <= cache_size / cache_line_size`.
pub fn place(
    base: usize,
    cache_size: usize,
    cache_line_size: usize,
    share_count: usize,
    rank: usize,
) -> usize {
    debug_assert!(cache_line_size > 0);
    debug_assert!(rank < share_count);

    if cache_size == 0 {
        return base.next_multiple_of(cache_line_size);
    }

    let aligned = base.next_multiple_of(cache_size);
    let lines_in_cache = cache_size / cache_line_size;
    aligned + (lines_in_cache * rank / share_count) * cache_line_size
}

/// Cache geometry used for placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cache_size: usize,
    pub cache_line_size: usize,
}

impl Placement {
    pub fn new(cache_size: usize, cache_line_size: usize) -> Self {
        Placement {
            cache_size,
            cache_line_size,
        }
    }

    /// Bytes an allocation needs beyond its payload so any rank can be placed inside it
    pub fn slack(&self) -> usize {
        2 * self.cache_size + 2 * self.cache_line_size
    }

    pub fn place(&self, base: usize, share_count: usize, rank: usize) -> usize {
        place(base, self.cache_size, self.cache_line_size, share_count, rank)
    }

    /// Placement that only aligns to a cache line
    pub fn line_aligned(&self) -> Placement {
        Placement {
            cache_size: 0,
            cache_line_size: self.cache_line_size,
        }
    }

    /// Number of elements of `elem_size` bytes in one cache line
    pub fn stride(&self, elem_size: usize) -> usize {
        (self.cache_line_size / elem_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;

    #[test]
    fn single_share_is_cache_aligned() {
        assert_eq!(place(0x1_0000, 32 * KB, 64, 1, 0), 0x1_0000);
        assert_eq!(place(0x1_0001, 32 * KB, 64, 1, 0), 0x1_0000 + 32 * KB);
    }

    #[test]
    fn thirds_of_a_cache() {
        // 512 lines split in three: 0, 170 and 341 lines in
        let base = 0x4000_0010;
        let aligned = 0x4000_0000 + 32 * KB;
        assert_eq!(place(base, 32 * KB, 64, 3, 0), aligned);
        assert_eq!(place(base, 32 * KB, 64, 3, 1), aligned + 170 * 64);
        assert_eq!(place(base, 32 * KB, 64, 3, 2), aligned + 341 * 64);
    }

    #[test]
    fn non_power_of_two_cache() {
        let cache = 12 * KB * KB;
        let placed = place(12345, cache, 64, 4, 3);
        assert_eq!((placed - cache) % 64, 0);
        assert_eq!(placed, cache + (cache / 64 * 3 / 4) * 64);
    }

    #[test]
    fn zero_cache_only_aligns_to_line() {
        assert_eq!(place(1000, 0, 64, 1, 0), 1024);
        assert_eq!(place(1024, 0, 64, 1, 0), 1024);
    }

    #[test]
    fn stays_within_slack() {
        let geometry = Placement::new(32 * KB, 64);
        for base in [1usize, 63, 64, 4095, 32 * KB - 1, 32 * KB + 1] {
            for rank in 0..12 {
                let placed = geometry.place(base, 12, rank);
                assert!(placed >= base);
                assert!(placed - base < geometry.slack());
            }
        }
    }
}
