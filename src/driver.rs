//! # Driver
//!
//! Sweeps thread count (doubling from `min_threads` to `max_threads`) against working-set size
//! (shrinking from `max_working_set` to `min_working_set`). Every point of the sweep is one
//! iteration: fresh lanes are spawned, each runs the configured [`Kernel`] on its share of the
//! working set, and all are joined before the next iteration starts, so barriers and lane memory
//! never outlive their iteration.
//!
//! The measurement window of a phase is the earliest start to the latest end over all lanes. That
//! includes straggler skew on purpose: the barrier guarantees the lanes overlapped, not that they
//! finished together.
use crate::barrier::Barrier;
use crate::config::{AffinityMode, ExperimentConfig, Mode};
use crate::error::{BenchError, Result};
use crate::kernel::{BandwidthKernel, Kernel, LaneContext, LatencyKernel, TimingRecord};
use crate::{format_count, format_size, topology};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Metric pairs per thread-count bucket and working-set step
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMatrix {
    buckets: usize,
    steps: usize,
    cells: Vec<[f64; 2]>,
}

impl ResultMatrix {
    /// All cells start at zero, which is also what unmeasured cells report
    pub fn new(buckets: usize, steps: usize) -> Self {
        ResultMatrix {
            buckets,
            steps,
            cells: vec![[0.0; 2]; buckets * steps],
        }
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn get(&self, bucket: usize, step: usize) -> [f64; 2] {
        self.cells[self.index(bucket, step)]
    }

    pub fn set(&mut self, bucket: usize, step: usize, metrics: [f64; 2]) {
        let index = self.index(bucket, step);
        self.cells[index] = metrics;
    }

    fn index(&self, bucket: usize, step: usize) -> usize {
        assert!(
            bucket < self.buckets && step < self.steps,
            "cell ({bucket}, {step}) outside a {}x{} matrix",
            self.buckets,
            self.steps
        );
        step * self.buckets + bucket
    }
}

/// Result bucket of a thread count, `floor(log2(threads))`
pub fn bucket(threads: usize) -> usize {
    threads.max(1).ilog2() as usize
}

/// Thread counts of the outer sweep: `min`, `2*min`, ... up to `max`
pub fn thread_counts(min: usize, max: usize) -> Vec<usize> {
    std::iter::successors(Some(min.max(1)), |&t| t.checked_mul(2))
        .take_while(|&t| t <= max)
        .collect()
}

/// Working-set sizes of the inner sweep, largest first. Each size is the previous one times
/// `ratio`, truncated to whole bytes; the sweep stops below `min`.
pub fn working_set_steps(max: u64, min: u64, ratio: f64) -> Vec<u64> {
    let mut sizes = Vec::new();
    let mut size = max;
    while size >= min && size > 0 {
        sizes.push(size);
        let next = (size as f64 * ratio) as u64;
        if next >= size {
            break;
        }
        size = next;
    }
    sizes
}

/// Repeat count for the next step, scaled so the next measurement takes about `target`.
///
/// Never below 1, never lower than `scale` when the last measurement was too short and never
/// higher when it was too long.
pub fn next_scale(scale: u64, measured: Duration, target: Duration) -> u64 {
    let scale = scale.max(1);
    if measured.is_zero() {
        return scale;
    }
    // float to int casts saturate
    let next = (scale as f64 * (target.as_secs_f64() / measured.as_secs_f64())) as u64;
    let next = if measured < target {
        next.max(scale)
    } else {
        next.min(scale)
    };
    next.max(1)
}

/// Per phase, the span from the earliest lane start to the latest lane end
pub fn measurement_windows(records: &[TimingRecord], phases: usize) -> Vec<Duration> {
    (0..phases)
        .map(|phase| {
            let spans = records.iter().filter_map(|r| r.phases.get(phase));
            let start = spans.clone().map(|s| s.start).min();
            let end = spans.map(|s| s.end).max();
            match (start, end) {
                (Some(start), Some(end)) => end.saturating_duration_since(start),
                _ => Duration::ZERO,
            }
        })
        .collect()
}

/// Releases a lane's siblings if it panics before reaching the barrier
struct AbortOnPanic<'b>(&'b Barrier);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// One measurement: window of the first phase (drives scale adaptation) and the metrics
struct Measurement {
    window: Duration,
    metrics: [f64; 2],
}

/// Runs the full sweep for one configuration
#[derive(Debug)]
pub struct Experiment<'a> {
    config: &'a ExperimentConfig,
    /// Cores lanes are pinned to, if pinning is on
    cores: Option<Vec<core_affinity::CoreId>>,
    priority_warned: AtomicBool,
}

impl<'a> Experiment<'a> {
    pub fn new(config: &'a ExperimentConfig) -> Self {
        let cores = if config.pins_lanes() {
            let cores = core_affinity::get_core_ids();
            if cores.is_none() {
                warn!("Couldn't list CPU cores, lanes will not be pinned");
            }
            cores
        } else {
            None
        };

        Experiment {
            config,
            cores,
            priority_warned: AtomicBool::new(false),
        }
    }

    /// Run every (threads, working set) point and collect the results.
    ///
    /// Any lane failure aborts the whole sweep; partial matrices are never returned.
    pub fn run(&self) -> Result<ResultMatrix> {
        let config = self.config;
        let sizes = working_set_steps(
            config.max_working_set,
            config.min_working_set,
            config.shrink_ratio,
        );
        let mut matrix = ResultMatrix::new(bucket(config.max_threads) + 1, sizes.len());

        for threads in thread_counts(config.min_threads, config.max_threads) {
            info!("*** threads={threads}");
            let mut scale = 1;
            let mut last = config.time_step;

            for (step, &size) in sizes.iter().enumerate() {
                scale = next_scale(scale, last, config.time_step);
                let lane_bytes = size / threads as u64;

                let measured = match config.mode {
                    Mode::Bandwidth => {
                        let kernel = BandwidthKernel::new(config, lane_bytes, scale);
                        self.measure(&kernel, threads, size, scale)?
                    }
                    Mode::Latency => {
                        let kernel = LatencyKernel::new(config, lane_bytes, scale);
                        self.measure(&kernel, threads, size, scale)?
                    }
                };

                match measured {
                    Some(measurement) => {
                        last = measurement.window;
                        matrix.set(bucket(threads), step, measurement.metrics);
                    }
                    // keep the current scale
                    None => last = config.time_step,
                }
            }
        }

        Ok(matrix)
    }

    fn measure<K: Kernel>(
        &self,
        kernel: &K,
        threads: usize,
        size: u64,
        scale: u64,
    ) -> Result<Option<Measurement>> {
        let records = self.run_iteration(kernel, threads)?;
        let windows = measurement_windows(&records, kernel.phase_names().len());

        if windows.iter().any(|w| w.is_zero()) {
            warn!(
                "{threads} thread(s) size={}: a {} phase took no measurable time, skipping",
                format_size(size as f64),
                kernel.name()
            );
            return Ok(None);
        }

        let metrics = kernel.metrics(&windows, threads);
        let [label0, label1] = kernel.metric_labels();
        info!(
            "{threads} thread(s) size={} repeat={} diff={:.7}s {label0}={:.2} {label1}={:.2}",
            format_size(size as f64),
            format_count(scale as f64),
            windows[0].as_secs_f64(),
            metrics[0],
            metrics[1]
        );

        Ok(Some(Measurement {
            window: windows[0],
            metrics,
        }))
    }

    /// Spawn `lanes` lanes running `kernel`, join them all and return their timing records.
    fn run_iteration<K: Kernel>(&self, kernel: &K, lanes: usize) -> Result<Vec<TimingRecord>> {
        let barrier = Barrier::new(lanes);

        thread::scope(|s| {
            let mut handles = Vec::with_capacity(lanes);
            for id in 0..lanes {
                let lane = LaneContext { id, lanes };
                let barrier = &barrier;
                let spawned = thread::Builder::new()
                    .name(format!("lane-{id}"))
                    .spawn_scoped(s, move || {
                        let _guard = AbortOnPanic(barrier);
                        self.prepare_lane(&lane);
                        kernel.run(&lane, barrier)
                    });

                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        error!("Couldn't create lane {id}: {source}");
                        // lanes already parked on the barrier must be let go before the scope ends
                        barrier.abort();
                        return Err(BenchError::LaneSpawn { lane: id, source });
                    }
                }
            }

            let mut records = Vec::with_capacity(lanes);
            let mut failure: Option<BenchError> = None;
            for (id, handle) in handles.into_iter().enumerate() {
                let err = match handle.join() {
                    Ok(Ok(record)) => {
                        records.push(record);
                        continue;
                    }
                    Ok(Err(e)) => e,
                    Err(_) => BenchError::LanePanicked { lane: id },
                };
                // keep the root cause rather than a sibling's abort
                if failure.is_none() || matches!(failure, Some(BenchError::Aborted)) {
                    failure = Some(err);
                }
            }

            match failure {
                Some(err) => Err(err),
                None => Ok(records),
            }
        })
    }

    /// Pin the calling lane and raise its priority, before any memory is touched so first-touch
    /// and NUMA binding happen on the right node.
    fn prepare_lane(&self, lane: &LaneContext) {
        if let Some(cores) = &self.cores {
            let striped = self.config.affinity == AffinityMode::Striped;
            let cpu = topology::lane_cpu(lane.id, cores.len(), striped, self.config.spread);
            let core = cores[cpu];
            if core_affinity::set_for_current(core) {
                debug!("Lane {} pinned to CPU core {}", lane.id, core.id);
            } else {
                warn!(
                    "Couldn't pin lane {} to CPU core {} (NOTE: this is expected on macOS)",
                    lane.id, core.id
                );
            }
        }

        if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
            .is_err()
            && !self.priority_warned.swap(true, Ordering::Relaxed)
        {
            warn!("Couldn't set lanes to maximum thread priority");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PhaseSpan;
    use std::time::Instant;

    #[test]
    fn buckets_are_log2() {
        assert_eq!(bucket(1), 0);
        assert_eq!(bucket(2), 1);
        assert_eq!(bucket(3), 1);
        assert_eq!(bucket(4), 2);
        assert_eq!(bucket(1024), 10);
    }

    #[test]
    fn thread_counts_double() {
        assert_eq!(thread_counts(1, 8), vec![1, 2, 4, 8]);
        assert_eq!(thread_counts(3, 20), vec![3, 6, 12]);
        assert_eq!(thread_counts(4, 4), vec![4]);
    }

    #[test]
    fn working_set_shrinks_to_min() {
        let sizes = working_set_steps(1000, 500, 0.5);
        assert_eq!(sizes, vec![1000, 500]);

        let sizes = working_set_steps(2048 * 1024 * 1024, 500 * 1024 * 1024, 0.925);
        assert_eq!(sizes[0], 2048 * 1024 * 1024);
        assert!(sizes.windows(2).all(|w| w[1] < w[0]));
        assert!(*sizes.last().unwrap() >= 500 * 1024 * 1024);
        assert!((*sizes.last().unwrap() as f64 * 0.925) < (500 * 1024 * 1024) as f64);
    }

    #[test]
    fn scale_tracks_target() {
        let target = Duration::from_millis(250);
        assert_eq!(next_scale(1, Duration::from_millis(25), target), 10);
        assert_eq!(next_scale(10, Duration::from_millis(500), target), 5);
        assert_eq!(next_scale(1, Duration::from_secs(10), target), 1);
        assert_eq!(next_scale(7, Duration::ZERO, target), 7);
        assert_eq!(next_scale(7, target, target), 7);
    }

    #[test]
    fn windows_span_all_lanes() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let records = vec![
            TimingRecord {
                phases: vec![
                    PhaseSpan { start: t0 + ms(1), end: t0 + ms(5) },
                    PhaseSpan { start: t0 + ms(6), end: t0 + ms(9) },
                ],
            },
            TimingRecord {
                phases: vec![
                    PhaseSpan { start: t0, end: t0 + ms(4) },
                    PhaseSpan { start: t0 + ms(6), end: t0 + ms(12) },
                ],
            },
        ];
        assert_eq!(measurement_windows(&records, 2), vec![ms(5), ms(6)]);
        assert_eq!(measurement_windows(&[], 1), vec![Duration::ZERO]);
    }

    #[test]
    fn matrix_cells_are_independent() {
        let mut matrix = ResultMatrix::new(3, 2);
        matrix.set(2, 1, [1.0, 2.0]);
        assert_eq!(matrix.get(2, 1), [1.0, 2.0]);
        assert_eq!(matrix.get(1, 1), [0.0, 0.0]);
        assert_eq!(matrix.get(2, 0), [0.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn matrix_rejects_out_of_range() {
        ResultMatrix::new(1, 1).get(1, 0);
    }

    #[test]
    fn small_latency_sweep() {
        let config = ExperimentConfig {
            min_threads: 1,
            max_threads: 2,
            min_working_set: 32 * 1024,
            max_working_set: 64 * 1024,
            shrink_ratio: 0.5,
            time_step: Duration::from_millis(2),
            cache_size: 32 * 1024,
            cache_line_size: 64,
            page_size: 4096,
            mode: Mode::Latency,
            ..ExperimentConfig::default()
        };
        config.validate().unwrap();
        let matrix = Experiment::new(&config).run().unwrap();
        assert_eq!(matrix.buckets(), 2);
        assert_eq!(matrix.steps(), 2);
        for bucket in 0..2 {
            for step in 0..2 {
                let [aggregate, per_lane] = matrix.get(bucket, step);
                assert!(aggregate.is_finite() && aggregate >= 0.0);
                assert!(per_lane >= aggregate);
            }
        }
    }
}
