use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, WorkerError};

/// Cumulative CPU tick counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

impl CpuSample {
    /// Usage fraction between two samples: `1 - Δidle/Δtotal`.
    pub fn usage_since(&self, earlier: &CpuSample) -> Result<f64> {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return Err(WorkerError::ResourceData(
                "total time of CPU is zero".to_string(),
            ));
        }
        let idle = self.idle.saturating_sub(earlier.idle).min(total);
        Ok(1.0 - idle as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySample {
    pub fn usage_fraction(&self) -> f64 {
        1.0 - self.available_bytes as f64 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSample {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskSample {
    pub fn usage_fraction(&self) -> f64 {
        1.0 - self.free_bytes as f64 / self.total_bytes as f64
    }
}

/// Reads OS resource counters. No caching, no retries.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample_cpu(&self) -> Result<CpuSample>;

    async fn sample_memory(&self) -> Result<MemorySample>;

    /// Capacity of the filesystem holding `path`; the directory is created if missing.
    async fn sample_disk(&self, path: &Path) -> Result<DiskSample>;
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// Fields: user nice system idle iowait irq softirq steal guest guest_nice.
pub fn parse_cpu_stat(content: &str) -> Result<CpuSample> {
    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| WorkerError::ResourceData("no aggregate cpu line".to_string()))?;

    let ticks = line
        .split_whitespace()
        .skip(1)
        .map(|field| {
            field.parse::<u64>().map_err(|e| {
                WorkerError::ResourceData(format!("malformed cpu counter '{field}': {e}"))
            })
        })
        .collect::<Result<Vec<u64>>>()?;

    if ticks.len() < 4 {
        return Err(WorkerError::ResourceData(format!(
            "expected at least 4 cpu counters, found {}",
            ticks.len()
        )));
    }

    let total: u64 = ticks.iter().sum();
    if total == 0 {
        return Err(WorkerError::ResourceData(
            "total time of CPU is zero".to_string(),
        ));
    }

    Ok(CpuSample {
        idle: ticks[3],
        total,
    })
}

fn meminfo_kib(content: &str, key: &str) -> Result<u64> {
    let line = content
        .lines()
        .find(|line| line.starts_with(key) && line[key.len()..].starts_with(':'))
        .ok_or_else(|| WorkerError::ResourceData(format!("{key} is missing")))?;

    let value = line[key.len() + 1..]
        .split_whitespace()
        .next()
        .ok_or_else(|| WorkerError::ResourceData(format!("{key} has no value")))?;

    value
        .parse::<u64>()
        .map_err(|e| WorkerError::ResourceData(format!("malformed {key} '{value}': {e}")))
}

/// Parses `MemTotal` and `MemAvailable` from `/proc/meminfo` (values in kB).
pub fn parse_meminfo(content: &str) -> Result<MemorySample> {
    let total = meminfo_kib(content, "MemTotal")?;
    if total == 0 {
        return Err(WorkerError::ResourceData("total memory is zero".to_string()));
    }
    let available = meminfo_kib(content, "MemAvailable")?;

    Ok(MemorySample {
        total_bytes: total * 1024,
        available_bytes: available * 1024,
    })
}

/// Sampler backed by procfs and `statvfs`.
#[derive(Debug, Clone)]
pub struct LinuxResourceSampler {
    cpu_stat_path: PathBuf,
    mem_info_path: PathBuf,
}

impl Default for LinuxResourceSampler {
    fn default() -> Self {
        Self {
            cpu_stat_path: PathBuf::from("/proc/stat"),
            mem_info_path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl LinuxResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads counters from alternative files, e.g. captured procfs snapshots.
    pub fn with_paths(cpu_stat_path: impl Into<PathBuf>, mem_info_path: impl Into<PathBuf>) -> Self {
        Self {
            cpu_stat_path: cpu_stat_path.into(),
            mem_info_path: mem_info_path.into(),
        }
    }
}

#[async_trait]
impl ResourceSampler for LinuxResourceSampler {
    async fn sample_cpu(&self) -> Result<CpuSample> {
        let content = tokio::fs::read_to_string(&self.cpu_stat_path).await?;
        parse_cpu_stat(&content)
    }

    async fn sample_memory(&self) -> Result<MemorySample> {
        let content = tokio::fs::read_to_string(&self.mem_info_path).await?;
        parse_meminfo(&content)
    }

    async fn sample_disk(&self, path: &Path) -> Result<DiskSample> {
        tokio::fs::create_dir_all(path).await?;
        let path = path.to_path_buf();

        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(|e| WorkerError::Internal(format!("statvfs task failed: {e}")))?
            .map_err(|errno| WorkerError::Io(errno.into()))?;

        let fragment = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * fragment;
        if total_bytes == 0 {
            return Err(WorkerError::ResourceData("total disk size is zero".to_string()));
        }

        Ok(DiskSample {
            total_bytes,
            free_bytes: stat.blocks_available() as u64 * fragment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "\
cpu  4705 356 584 2884481 408 0 82 0 0 0
cpu0 1393 83 181 720984 111 0 21 0 0 0
intr 114930548 113199788 3 0 5 263 0 4 [... lots more numbers ...]
ctxt 1990473
btime 1062191376
";

    const MEMINFO: &str = "\
MemTotal:        8034304 kB
MemFree:         6512344 kB
MemAvailable:    7627168 kB
Buffers:           38968 kB
Cached:          1131120 kB
";

    #[test]
    fn parses_aggregate_cpu_line() {
        let sample = parse_cpu_stat(PROC_STAT).unwrap();
        assert_eq!(sample.idle, 2884481);
        assert_eq!(sample.total, 4705 + 356 + 584 + 2884481 + 408 + 82);
    }

    #[test]
    fn empty_cpu_stat_is_data_error() {
        assert!(matches!(
            parse_cpu_stat(""),
            Err(WorkerError::ResourceData(_))
        ));
    }

    #[test]
    fn zero_cpu_counters_are_data_error() {
        assert!(matches!(
            parse_cpu_stat("cpu  0 0 0 0 0 0 0\n"),
            Err(WorkerError::ResourceData(_))
        ));
    }

    #[test]
    fn malformed_cpu_counter_is_data_error() {
        assert!(parse_cpu_stat("cpu  1 x 3 4\n").is_err());
    }

    #[test]
    fn cpu_usage_between_samples() {
        let first = CpuSample { idle: 0, total: 100 };
        let second = CpuSample { idle: 50, total: 150 };
        assert_eq!(second.usage_since(&first).unwrap(), 0.0);

        let busy = CpuSample { idle: 0, total: 150 };
        assert_eq!(busy.usage_since(&first).unwrap(), 1.0);

        assert!(first.usage_since(&first).is_err());
    }

    #[test]
    fn parses_meminfo_in_bytes() {
        let sample = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(sample.total_bytes, 8034304 * 1024);
        assert_eq!(sample.available_bytes, 7627168 * 1024);
    }

    #[test]
    fn zero_total_memory_is_data_error() {
        let err = parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n").unwrap_err();
        assert!(err.to_string().contains("total memory is zero"));
    }

    #[test]
    fn missing_mem_available_is_data_error() {
        assert!(parse_meminfo("MemTotal: 1024 kB\n").is_err());
    }

    #[test]
    fn usage_fractions() {
        let memory = MemorySample {
            total_bytes: 1000,
            available_bytes: 250,
        };
        assert_eq!(memory.usage_fraction(), 0.75);

        let disk = DiskSample {
            total_bytes: 1000,
            free_bytes: 100,
        };
        assert_eq!(disk.usage_fraction(), 0.9);
    }

    #[tokio::test]
    async fn reads_counters_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let stat = dir.path().join("stat");
        let meminfo = dir.path().join("meminfo");
        std::fs::write(&stat, PROC_STAT).unwrap();
        std::fs::write(&meminfo, MEMINFO).unwrap();

        let sampler = LinuxResourceSampler::with_paths(&stat, &meminfo);
        assert_eq!(sampler.sample_cpu().await.unwrap().idle, 2884481);
        assert_eq!(
            sampler.sample_memory().await.unwrap().total_bytes,
            8034304 * 1024
        );
    }

    #[tokio::test]
    async fn samples_disk_and_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = dir.path().join("jobs");

        let disk = LinuxResourceSampler::new().sample_disk(&jobs).await.unwrap();
        assert!(jobs.is_dir());
        assert!(disk.total_bytes > 0);
        assert!(disk.free_bytes <= disk.total_bytes);
    }
}
