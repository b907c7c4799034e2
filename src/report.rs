//! Result file writer.
//!
//! The file is plain text: `#` header lines echoing the configuration, then one line per
//! working-set step of the form
//!
//! ```text
//! ar= <size in KiB> <metric0> <metric1> <metric0> <metric1> ...
//! ```
//!
//! with one metric pair per thread-count bucket (bucket `n` holds runs with `2^n` to `2^(n+1) - 1`
//! threads). Buckets that were never measured are written as zeros.
use crate::alloc::AllocPolicy;
use crate::config::{AffinityMode, ExperimentConfig, Mode};
use crate::driver::{ResultMatrix, working_set_steps};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Write the header and data lines for `matrix` to `out`. `destination` is only echoed.
pub fn write_report<W: Write>(
    out: &mut W,
    config: &ExperimentConfig,
    destination: &str,
    matrix: &ResultMatrix,
) -> io::Result<()> {
    let flag = |on: bool| u8::from(on);

    writeln!(
        out,
        "#minMemory={} maxMemory={} minThreads={} maxThreads={} writing to {} band={} lat={}",
        config.min_working_set,
        config.max_working_set,
        config.min_threads,
        config.max_threads,
        destination,
        flag(config.mode == Mode::Bandwidth),
        flag(config.mode == Mode::Latency),
    )?;
    writeln!(
        out,
        "#increaseArray={:.6} timestep={:.6} cacheSize={} cacheLineSize={}",
        config.shrink_ratio,
        config.time_step.as_secs_f64(),
        config.cache_size,
        config.cache_line_size,
    )?;
    writeln!(
        out,
        "#affinity={} affinity_wide={} spread={} usenuma={} hugepages={} shared={}",
        flag(config.affinity != AffinityMode::Off),
        flag(config.affinity == AffinityMode::Striped),
        config.spread,
        flag(config.alloc_policy == AllocPolicy::NumaLocal),
        flag(config.alloc_policy == AllocPolicy::HugePageBacked),
        flag(config.shared_cache),
    )?;
    writeln!(out, "#numPages={}", config.page_window_count)?;

    let sizes = working_set_steps(
        config.max_working_set,
        config.min_working_set,
        config.shrink_ratio,
    );
    for (step, size) in sizes.iter().enumerate().take(matrix.steps()) {
        write!(out, "ar= {:8.2} ", *size as f64 / 1024.0)?;
        for bucket in 0..matrix.buckets() {
            let [m0, m1] = matrix.get(bucket, step);
            write!(out, "{m0:7.2} {m1:7.2} ")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Write the report to `path`, replacing any existing file.
pub fn save_report(
    path: &Path,
    config: &ExperimentConfig,
    matrix: &ResultMatrix,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_report(&mut out, config, &path.display().to_string(), matrix)?;
    out.flush()
}
