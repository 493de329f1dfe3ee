//! Host metrics collection for Hearth agents
//!
//! Provides the heartbeat payload:
//! - Global CPU usage
//! - Memory usage percentage
//! - Free/total space of the filesystem holding the data path
//! - Host uptime

use hearth_protocol::HeartbeatData;
use std::path::Path;
use sysinfo::{Disks, System};
use tracing::debug;

/// Disk usage of one filesystem, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskUsage {
    pub free: u64,
    pub total: u64,
}

/// Collect a heartbeat for `token`
pub async fn collect_heartbeat(token: &str, data_path: &Path) -> HeartbeatData {
    debug!("Collecting host metrics...");

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    // Wait a moment for accurate CPU readings
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
    let mem_usage = memory_percent(sys.used_memory(), sys.total_memory());

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(&Path, DiskUsage)> = disks
        .list()
        .iter()
        .map(|d| (d.mount_point(), DiskUsage { free: d.available_space(), total: d.total_space() }))
        .collect();
    let disk = disk_for_path(&mounts, data_path)
        .or_else(|| disk_for_path(&mounts, Path::new("/")))
        .unwrap_or_default();

    HeartbeatData {
        token: token.to_string(),
        cpu_usage,
        mem_usage,
        disk_free: disk.free,
        disk_total: disk.total,
        uptime_secs: System::uptime(),
    }
}

fn memory_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Filesystem with the longest mount point that contains `path`
fn disk_for_path(mounts: &[(&Path, DiskUsage)], path: &Path) -> Option<DiskUsage> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|(_, usage)| *usage)
}
