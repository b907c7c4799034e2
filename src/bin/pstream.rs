//! Parallel memory bandwidth and latency sweep
//!
//! Runs Add/Triad (`-b`) or pointer-chase (`-l`) kernels over a range of thread counts and working
//! set sizes and writes the results to the file given with `-f`, e.g.
//!
//! ```text
//! pstream -b -f results.txt -t 1 -T 8 -m 1024 -M 512
//! ```

use clap::Parser;
use log::{error, info};
use pstream_rs::alloc::AllocPolicy;
use pstream_rs::report::save_report;
use pstream_rs::{AffinityMode, BenchError, ConfigError, Experiment, ExperimentConfig, Mode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Measure memory bandwidth or latency as a function of thread count and working set size
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Pin lane n to CPU n
    #[arg(short = 'a')]
    affinity: bool,

    /// Pin lanes striped across CPUs (see -S)
    #[arg(short = 'A')]
    affinity_wide: bool,

    /// Cache size in KB to align arrays to, 0 disables alignment [default: detected]
    #[arg(short = 'c', value_name = "KB")]
    cache_kb: Option<usize>,

    /// File to write results to
    #[arg(short = 'f', value_name = "PATH")]
    file: Option<PathBuf>,

    /// Percentage of the working set kept at each step [default: 92.5]
    #[arg(short = 'i', value_name = "PERCENT")]
    shrink_percent: Option<f64>,

    /// Minimum working set size in KB [default: 512000]
    #[arg(short = 'm', value_name = "KB")]
    min_kb: Option<u64>,

    /// Maximum working set size in MB [default: 2048]
    #[arg(short = 'M', value_name = "MB")]
    max_mb: Option<u64>,

    /// Keep latency swap partners within N pages, 0 disables [default: 1]
    #[arg(short = 'p', value_name = "N")]
    pages: Option<usize>,

    /// Seconds each measurement should take [default: 0.25]
    #[arg(short = 's', value_name = "SECONDS")]
    seconds: Option<f64>,

    /// Number of CPU groups lanes are striped over with -A [default: 1]
    #[arg(short = 'S', value_name = "N")]
    spread: Option<usize>,

    /// Minimum number of threads [default: 1]
    #[arg(short = 't', value_name = "N")]
    min_threads: Option<usize>,

    /// Maximum number of threads [default: online CPUs]
    #[arg(short = 'T', value_name = "N")]
    max_threads: Option<usize>,

    /// Allocate lane memory on the lane's NUMA node
    #[arg(short = 'U', overrides_with = "no_numa")]
    numa: bool,

    /// Use regular allocation (default)
    #[arg(short = 'u', overrides_with = "numa")]
    no_numa: bool,

    /// Back lane memory with huge pages
    #[arg(long, conflicts_with = "numa")]
    huge_pages: bool,

    /// Cache line size in bytes [default: detected]
    #[arg(short = 'z', value_name = "BYTES")]
    line_size: Option<usize>,

    /// Give every lane its own slice of a shared cache
    #[arg(long)]
    shared: bool,

    /// Run the bandwidth (Add/Triad) test
    #[arg(short = 'b')]
    bandwidth: bool,

    /// Run the latency (pointer chase) test
    #[arg(short = 'l')]
    latency: bool,
}

impl Args {
    /// Overlay the given flags on the detected defaults
    fn into_config(self) -> Result<(ExperimentConfig, PathBuf), ConfigError> {
        let path = self.file.ok_or(ConfigError::MissingOutputPath)?;
        let mode = match (self.bandwidth, self.latency) {
            (true, false) => Mode::Bandwidth,
            (false, true) => Mode::Latency,
            (true, true) => return Err(ConfigError::ConflictingModes),
            (false, false) => return Err(ConfigError::NoMode),
        };

        let mut config = ExperimentConfig {
            mode,
            shared_cache: self.shared,
            ..ExperimentConfig::default()
        };

        if let Some(kb) = self.cache_kb {
            config.cache_size = kb * 1024;
        }
        if let Some(percent) = self.shrink_percent {
            config.shrink_ratio = percent / 100.0;
        }
        if let Some(kb) = self.min_kb {
            config.min_working_set = kb * 1024;
        }
        if let Some(mb) = self.max_mb {
            config.max_working_set = mb * 1024 * 1024;
        }
        if let Some(pages) = self.pages {
            config.page_window_count = pages;
        }
        if let Some(seconds) = self.seconds {
            config.time_step =
                Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidTimeStep)?;
        }
        if let Some(spread) = self.spread {
            config.spread = spread;
        }
        if let Some(min) = self.min_threads {
            config.min_threads = min;
        }
        if let Some(max) = self.max_threads {
            config.max_threads = max;
        }
        if let Some(line) = self.line_size {
            config.cache_line_size = line;
        }

        config.affinity = if self.affinity_wide {
            AffinityMode::Striped
        } else if self.affinity {
            AffinityMode::Compact
        } else {
            AffinityMode::Off
        };
        config.alloc_policy = if self.numa && !self.no_numa {
            AllocPolicy::NumaLocal
        } else if self.huge_pages {
            AllocPolicy::HugePageBacked
        } else {
            AllocPolicy::Heap
        };

        Ok((config, path))
    }
}

fn run(args: Args) -> Result<(), BenchError> {
    let (config, path) = args.into_config()?;
    config.validate()?;

    info!(
        "minMemory={} maxMemory={} minThreads={} maxThreads={} writing to {} mode={:?}",
        config.min_working_set,
        config.max_working_set,
        config.min_threads,
        config.max_threads,
        path.display(),
        config.mode
    );
    info!(
        "increaseArray={} timestep={:?} cacheSize={} cacheLineSize={}",
        config.shrink_ratio, config.time_step, config.cache_size, config.cache_line_size
    );
    info!(
        "affinity={:?} spread={} shared={} policy={:?} numPages={}",
        config.affinity,
        config.spread,
        config.shared_cache,
        config.alloc_policy,
        config.page_window_count
    );

    let matrix = Experiment::new(&config).run()?;
    save_report(&path, &config, &matrix)?;
    info!("Results written to {}", path.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<(ExperimentConfig, PathBuf), ConfigError> {
        Args::try_parse_from(std::iter::once("pstream").chain(args.iter().copied()))
            .unwrap()
            .into_config()
    }

    #[test]
    fn output_file_is_required() {
        assert!(matches!(parse(&["-b"]), Err(ConfigError::MissingOutputPath)));
    }

    #[test]
    fn exactly_one_mode() {
        assert!(matches!(parse(&["-f", "x"]), Err(ConfigError::NoMode)));
        assert!(matches!(
            parse(&["-f", "x", "-b", "-l"]),
            Err(ConfigError::ConflictingModes)
        ));
        let (config, _) = parse(&["-f", "x", "-l"]).unwrap();
        assert_eq!(config.mode, Mode::Latency);
    }

    #[test]
    fn units_are_converted() {
        let (config, path) = parse(&[
            "-b", "-f", "out.txt", "-c", "1024", "-m", "64", "-M", "8", "-i", "50", "-s", "0.5",
            "-t", "2", "-T", "4", "-z", "128", "-p", "0",
        ])
        .unwrap();
        assert_eq!(path, PathBuf::from("out.txt"));
        assert_eq!(config.cache_size, 1024 * 1024);
        assert_eq!(config.min_working_set, 64 * 1024);
        assert_eq!(config.max_working_set, 8 * 1024 * 1024);
        assert_eq!(config.shrink_ratio, 0.5);
        assert_eq!(config.time_step, Duration::from_millis(500));
        assert_eq!((config.min_threads, config.max_threads), (2, 4));
        assert_eq!(config.cache_line_size, 128);
        assert_eq!(config.page_window_count, 0);
    }

    #[test]
    fn affinity_and_numa_flags() {
        let (config, _) = parse(&["-b", "-f", "x", "-A", "-S", "2", "--shared"]).unwrap();
        assert_eq!(config.affinity, AffinityMode::Striped);
        assert_eq!(config.spread, 2);
        assert!(config.shared_cache);

        let (config, _) = parse(&["-b", "-f", "x", "-U", "-u"]).unwrap();
        assert_eq!(config.alloc_policy, AllocPolicy::Heap);
        let (config, _) = parse(&["-b", "-f", "x", "-u", "-U"]).unwrap();
        assert_eq!(config.alloc_policy, AllocPolicy::NumaLocal);
    }

    #[test]
    fn too_many_threads_fails_validation() {
        let (config, _) = parse(&["-b", "-f", "x", "-T", "4096"]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyThreads { requested: 4096, .. })
        ));
    }
}
