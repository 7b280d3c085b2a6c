//! Periodic system resource sampling (CPU, RAM, disk I/O, first GPU).

use std::process::Command;

use chrono::{DateTime, Local};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

const MIB: f64 = 1024.0 * 1024.0;

/// First-GPU utilisation as reported by `nvidia-smi`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub utilization_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

/// One monitor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub timestamp: DateTime<Local>,
    pub cpu_percent: f32,
    pub ram_percent: f64,
    pub gpu: Option<GpuSample>,
    /// Cumulative bytes read/written by the processes alive at sample time.
    ///
    /// sysinfo 0.33 exposes disk I/O per process only, so I/O of processes
    /// that have already exited is not included; this is not a system-wide
    /// device counter.
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// Parse one line of
/// `nvidia-smi --query-gpu=utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits`.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuSample> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(|f| f.trim().parse::<f64>());
    let utilization_percent = fields.next()?.ok()?;
    let memory_used_mb = fields.next()?.ok()?;
    let memory_total_mb = fields.next()?.ok()?;
    Some(GpuSample {
        utilization_percent,
        memory_used_mb,
        memory_total_mb,
    })
}

fn query_gpu() -> Option<GpuSample> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        log::debug!("nvidia-smi exited with {}", output.status);
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Reuses one `sysinfo::System` across samples so CPU usage has a baseline.
pub struct ResourceMonitor {
    system: System,
    query_gpu: bool,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            query_gpu: true,
        }
    }

    /// Skip the `nvidia-smi` probe.
    pub fn without_gpu(mut self) -> Self {
        self.query_gpu = false;
        self
    }

    /// Take a reading. CPU usage is measured since the previous refresh.
    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_disk_usage(),
        );

        let total = self.system.total_memory();
        let ram_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        let (disk_read_bytes, disk_write_bytes) = sum_disk_usage(
            self.system
                .processes()
                .values()
                .map(|p| p.disk_usage())
                .map(|usage| (usage.total_read_bytes, usage.total_written_bytes)),
        );

        ResourceSample {
            timestamp: Local::now(),
            cpu_percent: self.system.global_cpu_usage(),
            ram_percent,
            gpu: if self.query_gpu { query_gpu() } else { None },
            disk_read_bytes,
            disk_write_bytes,
        }
    }
}

/// Total `(read, written)` bytes over per-process counters. Saturates.
pub fn sum_disk_usage(usages: impl IntoIterator<Item = (u64, u64)>) -> (u64, u64) {
    usages.into_iter().fold((0, 0), |(r, w), (read, written)| {
        (r.saturating_add(read), w.saturating_add(written))
    })
}

/// `[HH:MM:SS] CPU: x% | RAM: y% | GPU: z% | VRAM: a/bMB | Disk R/W: r/w MB`
pub fn format_sample(sample: &ResourceSample) -> String {
    let (gpu_util, gpu_mem) = match &sample.gpu {
        Some(gpu) => (
            format!("{:.0}%", gpu.utilization_percent),
            format!("{:.0}/{:.0}MB", gpu.memory_used_mb, gpu.memory_total_mb),
        ),
        None => ("N/A".to_string(), "N/A".to_string()),
    };

    format!(
        "[{}] CPU: {:.1}% | RAM: {:.1}% | GPU: {} | VRAM: {} | Disk R/W: {:.0}/{:.0} MB",
        sample.timestamp.format("%H:%M:%S"),
        sample.cpu_percent,
        sample.ram_percent,
        gpu_util,
        gpu_mem,
        sample.disk_read_bytes as f64 / MIB,
        sample.disk_write_bytes as f64 / MIB,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_nvidia_smi() {
        let gpu = parse_nvidia_smi("87, 20480, 24576\n").unwrap();
        assert_eq!(gpu.utilization_percent, 87.0);
        assert_eq!(gpu.memory_used_mb, 20480.0);
        assert_eq!(gpu.memory_total_mb, 24576.0);

        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("[N/A], 1, 2").is_none());
        assert!(parse_nvidia_smi("12, 34").is_none());
    }

    #[test]
    fn test_sum_disk_usage() {
        assert_eq!(sum_disk_usage(Vec::new()), (0, 0));
        assert_eq!(sum_disk_usage([(10, 1), (5, 2), (0, 7)]), (15, 10));
        assert_eq!(sum_disk_usage([(u64::MAX, 0), (1, 0)]), (u64::MAX, 0));
    }

    #[test]
    fn test_format_sample() {
        let sample = ResourceSample {
            timestamp: Local.with_ymd_and_hms(2025, 3, 1, 14, 5, 9).unwrap(),
            cpu_percent: 12.34,
            ram_percent: 56.78,
            gpu: Some(GpuSample {
                utilization_percent: 99.4,
                memory_used_mb: 1000.2,
                memory_total_mb: 24576.0,
            }),
            disk_read_bytes: 10 * 1024 * 1024,
            disk_write_bytes: 3 * 1024 * 1024,
        };
        assert_eq!(
            format_sample(&sample),
            "[14:05:09] CPU: 12.3% | RAM: 56.8% | GPU: 99% | VRAM: 1000/24576MB | Disk R/W: 10/3 MB"
        );

        let no_gpu = ResourceSample { gpu: None, ..sample };
        assert!(format_sample(&no_gpu).contains("GPU: N/A | VRAM: N/A"));
    }

    #[test]
    fn test_sample_without_gpu() {
        let mut monitor = ResourceMonitor::new().without_gpu();
        let sample = monitor.sample();
        assert!(sample.gpu.is_none());
        assert!((0.0..=100.0).contains(&sample.ram_percent));
    }
}
