//! Hardware discovery used for configuration defaults, CPU pinning and NUMA-local allocation.
//!
//! Everything here degrades to conservative defaults when the information is not available, e.g.
//! outside Linux or in containers that hide sysfs.
use log::{debug, warn};
use std::path::Path;

/// Used when the cache line size cannot be detected
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;
/// Used when no cache size can be detected
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024;
/// Used when the page size cannot be detected
pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[cfg(target_os = "linux")]
const CPU_SYSFS: &str = "/sys/devices/system/cpu";
#[cfg(target_os = "linux")]
const NODE_SYSFS: &str = "/sys/devices/system/node";
#[cfg(target_os = "linux")]
const HUGE_PAGE_POOL: &str = "/sys/kernel/mm/hugepages/hugepages-2048kB/nr_hugepages";

/// Number of CPUs this process may run on
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    DEFAULT_PAGE_SIZE
}

/// Coherency line size of the first data cache of CPU 0
pub fn cache_line_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Some(size) = read_usize(&format!("{CPU_SYSFS}/cpu0/cache/index0/coherency_line_size"))
        {
            if size > 0 {
                return size;
            }
        }
    }
    DEFAULT_CACHE_LINE_SIZE
}

/// Size in bytes of the highest level data or unified cache of CPU 0
pub fn last_level_cache_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        let mut best: Option<(usize, usize)> = None;
        let cache_dir = format!("{CPU_SYSFS}/cpu0/cache");
        if let Ok(entries) = std::fs::read_dir(&cache_dir) {
            for entry in entries.flatten() {
                let dir = entry.path();
                let Ok(kind) = std::fs::read_to_string(dir.join("type")) else {
                    continue;
                };
                if kind.trim() == "Instruction" {
                    continue;
                }
                let level = read_usize(&dir.join("level").to_string_lossy());
                let size = std::fs::read_to_string(dir.join("size"))
                    .ok()
                    .and_then(|s| parse_cache_size(s.trim()));
                if let (Some(level), Some(size)) = (level, size) {
                    if best.is_none_or(|(best_level, _)| level > best_level) {
                        best = Some((level, size));
                    }
                }
            }
        }
        if let Some((level, size)) = best {
            debug!("Detected L{level} cache of {size} bytes");
            return size;
        }
    }
    DEFAULT_CACHE_SIZE
}

/// Parse sysfs cache sizes like "32K", "1024K" or "32M"
pub fn parse_cache_size(s: &str) -> Option<usize> {
    let (digits, multiplier) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 1024),
        'M' | 'm' => (&s[..s.len() - 1], 1024 * 1024),
        'G' | 'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.trim().parse::<usize>().ok().map(|n| n * multiplier)
}

/// Whether the kernel exposes NUMA nodes
pub fn numa_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(NODE_SYSFS).join("node0").exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Number of 2 MiB pages reserved in the kernel's huge page pool, 0 when there is none
pub fn huge_page_pool_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        read_usize(HUGE_PAGE_POOL).unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// CPU the calling thread currently runs on
pub fn current_cpu() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu has no preconditions
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return Some(cpu as usize);
        }
    }
    None
}

/// NUMA node owning `cpu`, found through the `nodeN` link in the CPU's sysfs directory
pub fn numa_node_of_cpu(cpu: usize) -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let cpu_dir = format!("{CPU_SYSFS}/cpu{cpu}");
        let entries = match std::fs::read_dir(&cpu_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Couldn't read {cpu_dir}: {e}");
                return None;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(node) = name.strip_prefix("node") {
                if let Ok(node) = node.parse::<usize>() {
                    return Some(node);
                }
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
        None
    }
}

/// CPU index a lane should be pinned to.
///
/// Compact placement uses the lane id directly. Striped placement with `spread > 1` deals lanes
/// round-robin over `spread` equally sized groups of CPUs, e.g. with 8 CPUs and a spread of 2
/// lanes 0,1,2,3 land on CPUs 0,4,1,5.
pub fn lane_cpu(lane: usize, cpus: usize, striped: bool, spread: usize) -> usize {
    let cpus = cpus.max(1);
    let cpu = if striped && spread > 1 {
        (lane % spread) * cpus / spread + lane / spread
    } else {
        lane
    };
    cpu % cpus
}

#[cfg(target_os = "linux")]
fn read_usize(path: &str) -> Option<usize> {
    std::fs::read_to_string(Path::new(path))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
