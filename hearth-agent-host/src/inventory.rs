//! Instance inventory for `sync` frames
//!
//! Lists every managed container, inspects it and, for running ones, adds
//! runtime stats and an A2S query on the host port published for 2457/udp.
//! Only the listing can fail the whole pass; per-instance probes degrade to
//! missing telemetry.

use crate::query::{query_info, DEFAULT_QUERY_TIMEOUT};
use crate::runtime::{ContainerRuntime, ContainerSummary, RuntimeError, QUERY_PORT_KEY};
use chrono::Utc;
use hearth_protocol::{InstanceReport, InstanceStatus};
use tracing::debug;

/// Container runtime state to instance status
pub fn map_status(state: &str) -> InstanceStatus {
    match state {
        "running" => InstanceStatus::Running,
        "restarting" => InstanceStatus::Starting,
        "removing" => InstanceStatus::Stopping,
        _ => InstanceStatus::Stopped,
    }
}

pub async fn collect_reports<R: ContainerRuntime>(runtime: &R) -> Result<Vec<InstanceReport>, RuntimeError> {
    let containers = runtime.list_managed().await?;
    let mut reports = Vec::with_capacity(containers.len());
    for container in &containers {
        reports.push(report_for(runtime, container).await);
    }
    Ok(reports)
}

async fn report_for<R: ContainerRuntime>(runtime: &R, container: &ContainerSummary) -> InstanceReport {
    let mut report = InstanceReport::new(&container.instance_id, map_status(&container.state));
    report.runtime_status = container.state.clone();

    let details = match runtime.inspect(&container.name).await {
        Ok(details) => details,
        Err(e) => {
            debug!("Inspect of {} failed: {}", container.name, e);
            return report;
        }
    };
    report.status = map_status(&details.status);
    report.runtime_status = details.status.clone();
    if !details.running {
        return report;
    }

    report.uptime_secs = details.uptime_secs(Utc::now());
    match runtime.stats(&container.name).await {
        Ok(stats) => {
            report.cpu_percent = stats.cpu_percent;
            report.mem_bytes = stats.mem_bytes;
        }
        Err(e) => debug!("Stats for {} unavailable: {}", container.name, e),
    }

    if let Some(port) = details.host_port(QUERY_PORT_KEY) {
        match query_info(&format!("127.0.0.1:{port}"), DEFAULT_QUERY_TIMEOUT).await {
            Ok(info) => {
                report.player_count = info.players as u32;
                report.max_players = info.max_players as u32;
                report.game_version = info.version;
            }
            Err(e) => debug!("Query of {} failed: {}", container.instance_id, e),
        }
    }
    report
}
