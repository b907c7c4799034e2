//! Error types for configuration and measurement failures.
//!
//! None of these are recoverable mid-run: a sweep either completes and produces a result file or
//! aborts with one of the errors below and produces nothing.

use std::io;

/// Problems detected before any measurement starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("an output file must be given with -f")]
    MissingOutputPath,

    #[error("exactly one of bandwidth (-b) and latency (-l) testing must be selected")]
    NoMode,

    #[error("bandwidth (-b) and latency (-l) testing cannot be combined")]
    ConflictingModes,

    #[error("maximum thread count {requested} exceeds the lane limit of {limit}")]
    TooManyThreads { requested: usize, limit: usize },

    #[error("invalid thread range: min={min} max={max}")]
    InvalidThreadRange { min: usize, max: usize },

    #[error("invalid working set range: min={min} max={max} bytes")]
    InvalidWorkingSet { min: u64, max: u64 },

    #[error("shrink ratio must be in (0, 1), got {0}")]
    InvalidShrinkRatio(f64),

    #[error("time step must be positive")]
    InvalidTimeStep,

    #[error("invalid cache geometry: {0}")]
    InvalidCacheGeometry(String),

    #[error("shared cache mode needs {needed} cache lines but the cache only has {available}")]
    SharedCacheTooSmall { needed: usize, available: usize },

    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Errors that abort a measurement run.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("memory allocation of {requested_size} bytes failed")]
    AllocationFailure { requested_size: usize },

    #[error("failed to create lane {lane}: {source}")]
    LaneSpawn {
        lane: usize,
        #[source]
        source: io::Error,
    },

    #[error("lane {lane} panicked")]
    LanePanicked { lane: usize },

    #[error("iteration aborted because a sibling lane failed")]
    Aborted,

    #[error("placed array does not fit inside its allocation")]
    PlacementOverflow,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
