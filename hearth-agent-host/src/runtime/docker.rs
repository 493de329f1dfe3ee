//! `ContainerRuntime` on top of the docker CLI
//!
//! Every call spawns `docker <args>` with `kill_on_drop`, so a dropped
//! future never leaves a stray process behind.

use super::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerStats, ContainerSummary, RuntimeError, INSTANCE_LABEL,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, op: &'static str, args: &[String]) -> Result<String, RuntimeError> {
        debug!("docker {}", args.join(" "));
        let output = AsyncCommand::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(op, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl ContainerRuntime for DockerCli {
    async fn version(&self) -> Result<String, RuntimeError> {
        let out = self.run("version", &args(["version", "--format", "{{.Server.Version}}"])).await?;
        Ok(out.trim().to_string())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.run("create", &create_args(spec)).await.map(|_| ())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.run("pull", &args(["pull", image])).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.run("start", &args(["start", name])).await.map(|_| ())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().to_string();
        self.run("stop", &args(["stop", "-t", &secs, name])).await.map(|_| ())
    }

    async fn restart(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let secs = grace.as_secs().to_string();
        self.run("restart", &args(["restart", "-t", &secs, name])).await.map(|_| ())
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.run("kill", &args(["kill", "--signal", "KILL", name])).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self.run("rm", &args(["rm", "-f", name])).await {
            Err(RuntimeError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let filter = format!("label={INSTANCE_LABEL}");
        let format = format!("{{{{.Label \"{INSTANCE_LABEL}\"}}}}\t{{{{.Names}}}}\t{{{{.State}}}}");
        let out = self.run("ps", &args(["ps", "-a", "--filter", &filter, "--format", &format])).await?;
        Ok(out.lines().filter_map(parse_ps_line).collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let out = self.run("inspect", &args(["inspect", "--type", "container", name])).await?;
        parse_inspect(&out)
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats, RuntimeError> {
        let out = self.run("stats", &args(["stats", "--no-stream", "--format", "{{json .}}", name])).await?;
        parse_stats(&out)
    }

    async fn stream_logs(
        &self,
        name: &str,
        tail: usize,
        cancel: CancellationToken,
        lines: mpsc::Sender<String>,
    ) -> Result<(), RuntimeError> {
        let tail = tail.to_string();
        let mut child = AsyncCommand::new(&self.bin)
            .args(["logs", "--tail", tail.as_str(), "--follow", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Parse("log stdout not captured".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| RuntimeError::Parse("log stderr not captured".into()))?;
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_open, mut err_open) = (true, true);
        let mut interrupted = false;

        // docker writes the container's stderr to its own stderr
        while out_open || err_open {
            let line = tokio::select! {
                _ = cancel.cancelled() => { interrupted = true; break }
                _ = lines.closed() => { interrupted = true; break }
                next = out.next_line(), if out_open => match next {
                    Ok(Some(line)) => line,
                    _ => { out_open = false; continue }
                },
                next = err.next_line(), if err_open => match next {
                    Ok(Some(line)) => line,
                    _ => { err_open = false; continue }
                },
            };
            if lines.send(line).await.is_err() {
                interrupted = true;
                break;
            }
        }

        if interrupted {
            if let Err(e) = child.start_kill() {
                warn!("Failed to stop log follower for {}: {}", name, e);
            }
            let _ = child.wait().await;
            return Ok(());
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Command { op: "logs", stderr: format!("log follower exited with {status}") })
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn classify_failure(op: &'static str, stderr: &str) -> RuntimeError {
    let stderr = stderr.trim();
    if let Some(rest) = stderr.split("No such image:").nth(1) {
        return RuntimeError::NoSuchImage(rest.trim().to_string());
    }
    if let Some(rest) = stderr.split("No such container:").nth(1) {
        return RuntimeError::NotFound(rest.trim().to_string());
    }
    RuntimeError::Command { op, stderr: stderr.to_string() }
}

/// Arguments for `docker create` (never pulls, so a missing image surfaces)
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(["create", "--pull", "never", "--name", &spec.name, "--restart", "unless-stopped"]);
    for (key, value) in &spec.labels {
        out.push("--label".into());
        out.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        out.push("-p".into());
        out.push(format!("{}:{}/{}", port.host, port.container, port.protocol.as_str()));
    }
    for (key, value) in &spec.env {
        out.push("-e".into());
        out.push(format!("{key}={value}"));
    }
    for (host, container) in &spec.volumes {
        out.push("-v".into());
        out.push(format!("{}:{}", host.display(), container));
    }
    out.push(spec.image.clone());
    out
}

/// `<instance id>\t<name>\t<state>` from `docker ps`
fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut fields = line.trim_end().splitn(3, '\t');
    let instance_id = fields.next()?.trim();
    let name = fields.next()?.trim();
    let state = fields.next().unwrap_or_default().trim();
    if instance_id.is_empty() || name.is_empty() {
        return None;
    }
    Some(ContainerSummary {
        instance_id: instance_id.to_string(),
        name: name.to_string(),
        state: state.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    #[serde(default)]
    started_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Deserialize)]
struct InspectBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

fn parse_inspect(out: &str) -> Result<ContainerDetails, RuntimeError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(out).map_err(|e| RuntimeError::Parse(format!("inspect output: {e}")))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| RuntimeError::Parse("inspect returned no container".into()))?;

    let host_ports = entry
        .network_settings
        .and_then(|n| n.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, bindings)| {
            let port = bindings?.iter().find_map(|b| b.host_port.parse::<u16>().ok())?;
            Some((key, port))
        })
        .collect();

    // "0001-01-01T00:00:00Z" for containers that never started
    let started_at = DateTime::parse_from_rfc3339(&entry.state.started_at)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0);

    Ok(ContainerDetails {
        status: entry.state.status,
        running: entry.state.running,
        started_at,
        host_ports,
    })
}

#[derive(Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

fn parse_stats(out: &str) -> Result<ContainerStats, RuntimeError> {
    let line = out.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let stats: StatsLine =
        serde_json::from_str(line).map_err(|e| RuntimeError::Parse(format!("stats output: {e}")))?;
    Ok(ContainerStats {
        cpu_percent: parse_percent(&stats.cpu_perc).unwrap_or(0.0),
        mem_bytes: parse_mem_usage(&stats.mem_usage).unwrap_or(0),
    })
}

/// "1.23%" -> 1.23
pub fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').trim().parse().ok()
}

/// Used part of "512MiB / 8GiB", in bytes
pub fn parse_mem_usage(value: &str) -> Option<u64> {
    let used = value.split('/').next()?.trim();
    parse_size(used)
}

/// Docker size strings: "512MiB", "1.5GiB", "800kB", "0B"
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}
