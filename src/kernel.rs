//! # Kernels
//!
//! A kernel is the timed workload one lane runs during one iteration of the sweep. Every kernel
//! follows the same shape:
//!
//! 1. acquire and initialise lane-private memory
//! 2. vote on the barrier, so all lanes start timing together (or all give up together)
//! 3. for each phase: take a start timestamp, run, take an end timestamp, wait on the barrier
//! 4. release memory after the last barrier so frees do not disturb slower lanes
//!
//! The driver only sees the returned [`TimingRecord`] and turns the cross-lane windows into the two
//! reported metrics through [`Kernel::metrics`].
use crate::alloc::{self, Allocation};
use crate::barrier::Barrier;
use crate::config::{ExperimentConfig, lane_elements};
use crate::error::{BenchError, Result};
use crate::permutation;
use crate::placement::Placement;
use log::debug;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::hint::black_box;
use std::time::{Duration, Instant};

/// Identity of one lane within an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneContext {
    pub id: usize,
    /// Lanes taking part in this iteration
    pub lanes: usize,
}

/// Start and end of one timed phase on one lane
#[derive(Debug, Clone, Copy)]
pub struct PhaseSpan {
    pub start: Instant,
    pub end: Instant,
}

impl PhaseSpan {
    pub fn elapsed(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Per-lane timestamps, one span per phase
#[derive(Debug, Clone, Default)]
pub struct TimingRecord {
    pub phases: Vec<PhaseSpan>,
}

/// Common trait of a lane workload
pub trait Kernel: Sync {
    fn name(&self) -> &'static str;

    /// Names of the timed phases, in the order they appear in a [`TimingRecord`]
    fn phase_names(&self) -> &'static [&'static str];

    /// Labels of the two values returned by [`Kernel::metrics`], used in progress logs
    fn metric_labels(&self) -> [&'static str; 2];

    /// Run the workload on the calling lane
    fn run(&self, lane: &LaneContext, barrier: &Barrier) -> Result<TimingRecord>;

    /// Convert one window per phase (spanning all lanes) into the two reported metrics
    fn metrics(&self, windows: &[Duration], lanes: usize) -> [f64; 2];
}

/// Vote failure on the barrier so siblings do not wait for us, then hand back the error.
fn bail<T>(barrier: &Barrier, err: BenchError) -> Result<T> {
    barrier.vote(false);
    Err(err)
}

/// Add and Triad over three lane-private arrays of `f64`
#[derive(Debug)]
pub struct BandwidthKernel<'a> {
    config: &'a ExperimentConfig,
    /// Elements per array
    elements: usize,
    scale: u64,
}

impl<'a> BandwidthKernel<'a> {
    pub fn new(config: &'a ExperimentConfig, lane_bytes: u64, scale: u64) -> Self {
        BandwidthKernel {
            config,
            elements: lane_elements(lane_bytes, 3, config.stride()),
            scale: scale.max(1),
        }
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Bytes one lane reads or writes per repetition of a phase
    pub fn lane_bytes_touched(&self) -> u64 {
        3 * self.elements as u64 * size_of::<f64>() as u64
    }

    fn acquire_regions(&self) -> Result<[Allocation; 3]> {
        let bytes = self.elements * size_of::<f64>();
        let policy = self.config.alloc_policy;
        let placement = self.config.placement();
        Ok([
            alloc::acquire(bytes, policy, &placement)?,
            alloc::acquire(bytes, policy, &placement)?,
            alloc::acquire(bytes, policy, &placement)?,
        ])
    }

    /// Split the cache in thirds for A, B and C, or in `3 * lanes` pieces when lanes share it.
    fn share_and_rank(&self, lane: &LaneContext) -> (usize, usize) {
        if self.config.shared_cache {
            (3 * lane.lanes, 3 * lane.id)
        } else {
            (3, 0)
        }
    }
}

fn carve_arrays<'r>(
    regions: &'r mut [Allocation; 3],
    placement: &Placement,
    share: usize,
    first_rank: usize,
    len: usize,
) -> Result<[&'r mut [f64]; 3]> {
    let [a, b, c] = regions;
    Ok([
        a.carve(placement, share, first_rank, len)?,
        b.carve(placement, share, first_rank + 1, len)?,
        c.carve(placement, share, first_rank + 2, len)?,
    ])
}

/// `dst = x + y`
#[inline(never)]
fn add(dst: &mut [f64], x: &[f64], y: &[f64]) {
    for ((d, x), y) in dst.iter_mut().zip(x).zip(y) {
        *d = x + y;
    }
    black_box(dst);
}

/// `dst = x + scalar * y`
#[inline(never)]
fn triad(dst: &mut [f64], x: &[f64], y: &[f64], scalar: f64) {
    for ((d, x), y) in dst.iter_mut().zip(x).zip(y) {
        *d = x + scalar * y;
    }
    black_box(dst);
}

impl Kernel for BandwidthKernel<'_> {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn phase_names(&self) -> &'static [&'static str] {
        &["add", "triad"]
    }

    fn metric_labels(&self) -> [&'static str; 2] {
        ["add MB/s", "triad MB/s"]
    }

    fn run(&self, lane: &LaneContext, barrier: &Barrier) -> Result<TimingRecord> {
        let mut regions = match self.acquire_regions() {
            Ok(regions) => regions,
            Err(e) => return bail(barrier, e),
        };
        let (share, first_rank) = self.share_and_rank(lane);
        let placement = self.config.placement();
        let [a, b, c] = match carve_arrays(&mut regions, &placement, share, first_rank, self.elements)
        {
            Ok(arrays) => arrays,
            Err(e) => return bail(barrier, e),
        };
        debug!(
            "Lane {} arrays at {:p} {:p} {:p}, {} elements each",
            lane.id,
            a.as_ptr(),
            b.as_ptr(),
            c.as_ptr(),
            self.elements
        );

        a.fill(2.0);
        b.fill(0.5);
        c.fill(0.0);
        let scalar = 0.5 * a[1.min(a.len() - 1)];

        if !barrier.vote(true) {
            return Err(BenchError::Aborted);
        }

        // alternate operand roles so no repetition is redundant
        let add_start = Instant::now();
        for rep in 0..self.scale {
            if rep % 2 == 0 {
                add(c, a, b);
            } else {
                add(b, a, c);
            }
        }
        let add_end = Instant::now();
        barrier.wait();

        let triad_start = Instant::now();
        for _ in 0..self.scale {
            triad(a, b, c, scalar);
        }
        let triad_end = Instant::now();
        barrier.wait();

        black_box((&*a, &*b, &*c));
        drop(regions);

        Ok(TimingRecord {
            phases: vec![
                PhaseSpan {
                    start: add_start,
                    end: add_end,
                },
                PhaseSpan {
                    start: triad_start,
                    end: triad_end,
                },
            ],
        })
    }

    /// MB/s for Add and Triad across all lanes
    fn metrics(&self, windows: &[Duration], lanes: usize) -> [f64; 2] {
        let total_bytes = self.lane_bytes_touched() as f64 * lanes as f64 * self.scale as f64;
        let mut results = [0.0; 2];
        for (result, window) in results.iter_mut().zip(windows) {
            *result = total_bytes / window.as_secs_f64() / (1024.0 * 1024.0);
        }
        results
    }
}

/// Dependent-load pointer chase over one lane-private array
#[derive(Debug)]
pub struct LatencyKernel<'a> {
    config: &'a ExperimentConfig,
    elements: usize,
    scale: u64,
}

impl<'a> LatencyKernel<'a> {
    pub fn new(config: &'a ExperimentConfig, lane_bytes: u64, scale: u64) -> Self {
        LatencyKernel {
            config,
            elements: lane_elements(lane_bytes, 1, config.stride()),
            scale: scale.max(1),
        }
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Loads per lap, one per cache line
    pub fn hops(&self) -> usize {
        self.elements / self.config.stride()
    }
}

impl Kernel for LatencyKernel<'_> {
    fn name(&self) -> &'static str {
        "latency"
    }

    fn phase_names(&self) -> &'static [&'static str] {
        &["chase"]
    }

    fn metric_labels(&self) -> [&'static str; 2] {
        ["ns/hop", "ns/hop per lane"]
    }

    fn run(&self, lane: &LaneContext, barrier: &Barrier) -> Result<TimingRecord> {
        let bytes = self.elements * size_of::<usize>();
        let mut region = match alloc::acquire(bytes, self.config.alloc_policy, &self.config.placement())
        {
            Ok(region) => region,
            Err(e) => return bail(barrier, e),
        };
        let placement = self.config.placement().line_aligned();
        let chain: &mut [usize] = match region.carve(&placement, 1, 0, self.elements) {
            Ok(chain) => chain,
            Err(e) => return bail(barrier, e),
        };

        let mut rng = SmallRng::from_rng(&mut rand::rng());
        permutation::fill_cycle(
            chain,
            self.config.stride(),
            self.config.window_elements(),
            &mut rng,
        );
        debug!(
            "Lane {} chain of {} lines at {:p}",
            lane.id,
            self.hops(),
            chain.as_ptr()
        );

        if !barrier.vote(true) {
            return Err(BenchError::Aborted);
        }

        let start = Instant::now();
        permutation::chase(chain, self.scale);
        let end = Instant::now();
        barrier.wait();

        region.release();
        Ok(TimingRecord {
            phases: vec![PhaseSpan { start, end }],
        })
    }

    /// Nanoseconds per hop, aggregated over all lanes and as seen by a single lane
    fn metrics(&self, windows: &[Duration], lanes: usize) -> [f64; 2] {
        let Some(window) = windows.first() else {
            return [0.0; 2];
        };
        let ns = window.as_secs_f64() * 1.0e9;
        let hops = self.hops().max(1) as f64;
        let scale = self.scale as f64;
        [ns / (hops * lanes as f64) / scale, ns / hops / scale]
    }
}
