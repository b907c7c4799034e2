pub mod alloc;
pub mod barrier;
pub mod config;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod permutation;
pub mod placement;
pub mod report;
pub mod topology;

pub use config::{AffinityMode, ExperimentConfig, Mode};
pub use driver::{Experiment, ResultMatrix};
pub use error::{BenchError, ConfigError};

/// Most lanes a single iteration may run
pub const MAX_LANES: usize = 1024;

/// Convert number of bytes to formatted string
pub fn format_size(bytes: f64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const KB: f64 = 1024.0;

    if bytes >= GB {
        format!("{:.2} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

/// Convert a count to a short decimal string, e.g. 1500 -> "1.500k"
pub fn format_count(count: f64) -> String {
    const SUFFIXES: [&str; 6] = ["", "k", "m", "g", "t", "p"];

    let mut value = count;
    let mut shift = 0;
    while value >= 1000.0 && shift < SUFFIXES.len() - 1 {
        value /= 1000.0;
        shift += 1;
    }

    if value < 10.0 {
        format!("{:.3}{}", value, SUFFIXES[shift])
    } else if value < 100.0 {
        format!("{:.2}{}", value, SUFFIXES[shift])
    } else {
        format!("{:.1}{}", value, SUFFIXES[shift])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_pick_binary_units() {
        assert_eq!(format_size(512.0), "512.00 B");
        assert_eq!(format_size(1536.0), "1.50 KiB");
        assert_eq!(format_size(2.0 * 1024.0 * 1024.0 * 1024.0), "2.00 GiB");
    }

    #[test]
    fn counts_pick_decimal_units() {
        assert_eq!(format_count(7.0), "7.000");
        assert_eq!(format_count(1500.0), "1.500k");
        assert_eq!(format_count(42_000_000.0), "42.00m");
        assert_eq!(format_count(250.0), "250.0");
    }
}
