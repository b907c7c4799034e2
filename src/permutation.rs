//! # Permutation
//!
//! Pointer-chase chains for the latency kernel. Only every `stride`-th element (one per cache line)
//! takes part, and the participating elements form a single cycle through index 0 so a traversal
//! from 0 touches every line of the array exactly once per lap.
//!
//! The chain starts as the trivial cycle `0 -> stride -> 2*stride -> ... -> 0` and is then shuffled
//! by exchanging the positions of pairs of nodes in the cycle. Exchanging two nodes of a single
//! cycle always yields a single cycle again, whatever pair is picked, so limiting partners to a
//! window of nearby lines (to bound TLB pressure) keeps the chain valid.
use rand::Rng;

/// Build a chain of `element_count` entries, see [`fill_cycle`].
pub fn build_cycle<R: Rng + ?Sized>(
    element_count: usize,
    stride: usize,
    window: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut chain = vec![0usize; element_count];
    fill_cycle(&mut chain, stride, window, rng);
    chain
}

/// Turn `chain` into a single random cycle over its multiples of `stride`.
///
/// Swap partners for the entry at `i` are drawn uniformly from the aligned indices in
/// `[i, min(len, i + window))`; a `window` of 0 means the rest of the array. Entries that are not a
/// multiple of `stride` are left untouched.
///
/// # Panics
///
/// If `stride` is zero or `chain.len()` is not a positive multiple of `stride`.
pub fn fill_cycle<R: Rng + ?Sized>(chain: &mut [usize], stride: usize, window: usize, rng: &mut R) {
    let n = chain.len();
    assert!(stride > 0, "stride must be positive");
    assert!(
        n >= stride && n % stride == 0,
        "chain length {n} is not a positive multiple of the stride {stride}"
    );
    let last = n - stride;

    for i in (0..n).step_by(stride) {
        chain[i] = i + stride;
    }
    chain[last] = 0;

    let window_lines = if window == 0 {
        usize::MAX
    } else {
        (window / stride).max(1)
    };

    for i in (0..last).step_by(stride) {
        let candidates = ((last - i) / stride + 1).min(window_lines);
        let c = i + rng.random_range(0..candidates) * stride;

        // i -> x and c -> y; the two swaps put x where y was in the cycle and vice versa
        let x = chain[i];
        let y = chain[c];
        chain.swap(i, c);
        chain.swap(x, y);
    }

    debug_assert_eq!(cycle_length(chain, stride), Some(n / stride));
}

/// Follow the chain from index 0 until it returns there, counting the nodes visited.
///
/// Returns `None` if the walk leaves the aligned index set or falls into a cycle that does not
/// contain 0.
pub fn cycle_length(chain: &[usize], stride: usize) -> Option<usize> {
    if chain.is_empty() || stride == 0 {
        return None;
    }
    let mut seen = vec![false; chain.len() / stride + 1];
    let mut node = 0usize;
    let mut count = 0usize;
    loop {
        if node % stride != 0 || node >= chain.len() || seen[node / stride] {
            return None;
        }
        seen[node / stride] = true;
        count += 1;
        node = chain[node];
        if node == 0 {
            return Some(count);
        }
    }
}

/// Walk the chain `laps` times from index 0. Every load depends on the previous one, so the time
/// per hop is the access latency of whatever level of the hierarchy holds the array.
#[inline(never)]
pub fn chase(chain: &[usize], laps: u64) -> usize {
    let mut p = 0usize;
    for _ in 0..laps {
        p = chain[0];
        while p != 0 {
            p = chain[p];
        }
    }
    std::hint::black_box(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn full_window_visits_every_line() {
        let mut rng = SmallRng::seed_from_u64(7);
        let chain = build_cycle(1024, 8, 1024, &mut rng);
        assert_eq!(cycle_length(&chain, 8), Some(128));
    }

    #[test]
    fn single_line_is_a_self_loop() {
        let mut rng = SmallRng::seed_from_u64(1);
        let chain = build_cycle(8, 8, 0, &mut rng);
        assert_eq!(chain[0], 0);
        assert_eq!(cycle_length(&chain, 8), Some(1));
        assert_eq!(chase(&chain, 3), 0);
    }

    #[test]
    fn unaligned_entries_untouched() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut chain = vec![usize::MAX; 64];
        fill_cycle(&mut chain, 8, 0, &mut rng);
        for (i, &v) in chain.iter().enumerate() {
            if i % 8 != 0 {
                assert_eq!(v, usize::MAX);
            } else {
                assert_eq!(v % 8, 0);
            }
        }
    }

    #[test]
    fn shuffle_actually_moves_nodes() {
        let mut rng = SmallRng::seed_from_u64(11);
        let chain = build_cycle(4096, 1, 0, &mut rng);
        let trivial = (0..4096).filter(|&i| chain[i] == (i + 1) % 4096).count();
        assert!(trivial < 4096 / 2);
    }

    #[test]
    fn window_bounds_partners_but_not_validity() {
        for window in [1, 8, 16, 64, 512, 4096] {
            let mut rng = SmallRng::seed_from_u64(window as u64);
            let chain = build_cycle(4096, 8, window, &mut rng);
            assert_eq!(cycle_length(&chain, 8), Some(512), "window {window}");
        }
    }

    #[test]
    fn detects_split_cycles() {
        // 0 -> 8 -> 0 and 16 -> 24 -> 16
        let mut chain = vec![0usize; 32];
        chain[0] = 8;
        chain[8] = 0;
        chain[16] = 24;
        chain[24] = 16;
        // only the cycle through 0 is counted, so a split shows up as a short length
        assert_eq!(cycle_length(&chain, 8), Some(2));

        // 0 -> 8 -> 16 -> 8
        chain[16] = 8;
        chain[8] = 16;
        assert_eq!(cycle_length(&chain, 8), None);
    }

    #[test]
    #[should_panic(expected = "not a positive multiple")]
    fn rejects_ragged_length() {
        let mut rng = SmallRng::seed_from_u64(0);
        build_cycle(12, 8, 0, &mut rng);
    }
}
