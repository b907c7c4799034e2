//! Experiment configuration.
//!
//! One [`ExperimentConfig`] is built per run, validated once, and then only borrowed by the driver
//! and every lane.
use crate::MAX_LANES;
use crate::alloc::AllocPolicy;
use crate::error::ConfigError;
use crate::placement::Placement;
use crate::topology;
use std::time::Duration;

/// Which kernel the lanes run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Add and Triad streaming kernels, reported in MB/s
    Bandwidth,
    /// Dependent-load pointer chase, reported in ns per hop
    Latency,
}

/// How lanes are pinned to CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMode {
    Off,
    /// Lane `n` runs on CPU `n`
    Compact,
    /// Lanes are striped over `spread` groups of CPUs
    Striped,
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Smallest total working set in bytes
    pub min_working_set: u64,
    /// Largest total working set in bytes, the sweep starts here
    pub max_working_set: u64,
    /// Factor applied to the working set after each step
    pub shrink_ratio: f64,
    /// Target duration of each measurement
    pub time_step: Duration,
    /// Cache size in bytes used for array alignment, 0 disables it
    pub cache_size: usize,
    pub cache_line_size: usize,
    pub page_size: usize,
    /// Bound on how many pages apart latency swap partners may be, 0 for unbounded
    pub page_window_count: usize,
    /// Give every lane its own slice of one shared cache instead of a whole cache each
    pub shared_cache: bool,
    pub affinity: AffinityMode,
    pub spread: usize,
    pub alloc_policy: AllocPolicy,
    pub mode: Mode,
}

impl Default for ExperimentConfig {
    /// Defaults derived from the machine we are running on
    fn default() -> Self {
        ExperimentConfig {
            min_threads: 1,
            max_threads: topology::online_cpus().min(MAX_LANES),
            min_working_set: 500 * 1024 * 1024,
            max_working_set: 2048 * 1024 * 1024,
            shrink_ratio: 0.925,
            time_step: Duration::from_millis(250),
            cache_size: topology::last_level_cache_size(),
            cache_line_size: topology::cache_line_size(),
            page_size: topology::page_size(),
            page_window_count: 1,
            shared_cache: false,
            affinity: AffinityMode::Off,
            spread: 1,
            alloc_policy: AllocPolicy::Heap,
            mode: Mode::Bandwidth,
        }
    }
}

impl ExperimentConfig {
    /// Check every field, and that the platform supports the requested allocation policy and
    /// affinity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads > MAX_LANES {
            return Err(ConfigError::TooManyThreads {
                requested: self.max_threads,
                limit: MAX_LANES,
            });
        }
        if self.min_threads == 0 || self.min_threads > self.max_threads {
            return Err(ConfigError::InvalidThreadRange {
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        if self.min_working_set == 0 || self.min_working_set > self.max_working_set {
            return Err(ConfigError::InvalidWorkingSet {
                min: self.min_working_set,
                max: self.max_working_set,
            });
        }
        if !(self.shrink_ratio > 0.0 && self.shrink_ratio < 1.0) {
            return Err(ConfigError::InvalidShrinkRatio(self.shrink_ratio));
        }
        if self.time_step.is_zero() {
            return Err(ConfigError::InvalidTimeStep);
        }

        let line = self.cache_line_size;
        if !line.is_power_of_two() || line < size_of::<f64>() {
            return Err(ConfigError::InvalidCacheGeometry(format!(
                "cache line size {line} must be a power of two of at least 8 bytes"
            )));
        }
        if self.cache_size % line != 0 {
            return Err(ConfigError::InvalidCacheGeometry(format!(
                "cache size {} is not a multiple of the cache line size {line}",
                self.cache_size
            )));
        }
        if self.page_size < line || self.page_size % line != 0 {
            return Err(ConfigError::InvalidCacheGeometry(format!(
                "page size {} is not a multiple of the cache line size {line}",
                self.page_size
            )));
        }
        if self.shared_cache && self.cache_size > 0 {
            let needed = 3 * self.max_threads;
            let available = self.cache_size / line;
            if available < needed {
                return Err(ConfigError::SharedCacheTooSmall { needed, available });
            }
        }

        if self.pins_lanes() && core_affinity::get_core_ids().is_none() {
            return Err(ConfigError::Unsupported("CPU affinity"));
        }
        self.alloc_policy.ensure_supported()
    }

    pub fn placement(&self) -> Placement {
        Placement::new(self.cache_size, self.cache_line_size)
    }

    /// Elements per cache line, the granularity of every lane array
    pub fn stride(&self) -> usize {
        self.placement().stride(size_of::<u64>())
    }

    /// Latency swap window in elements, 0 when unbounded
    pub fn window_elements(&self) -> usize {
        let lines_per_page = self.page_size / self.cache_line_size;
        self.page_window_count * lines_per_page * self.stride()
    }

    /// Lanes are pinned when affinity is requested, and for NUMA-local memory which needs a fixed
    /// CPU to be local to
    pub fn pins_lanes(&self) -> bool {
        self.affinity != AffinityMode::Off || self.alloc_policy == AllocPolicy::NumaLocal
    }
}

/// Elements per array when `lane_bytes` is split into `arrays` arrays of 8-byte elements, rounded
/// down to whole cache lines of `stride` elements, and never less than one line.
pub fn lane_elements(lane_bytes: u64, arrays: usize, stride: usize) -> usize {
    let elements = (lane_bytes / 8 / arrays as u64) as usize;
    let rounded = elements - elements % stride;
    rounded.max(stride)
}
