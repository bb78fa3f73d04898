pub mod containers;
pub mod devices;
pub mod processes;

use crate::config::QueryConfig;
use crate::exec::{CommandRunner, ExecutionError};
use crate::state::{DeviceRecord, ProcessRecord, Snapshot};
use chrono::Local;
use containers::{apply_resolutions, detect_runtimes, resolve_containers};
use devices::{device_query_command, parse_devices, MalformedRecordError};
use processes::{
    compute_query_command, enrich_identity, identified_pids, os_listing_command,
    parse_compute_processes, parse_os_processes,
};
use std::collections::HashMap;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tracing::{debug, warn};

/// Substring nvidia-smi prints in place of a value the board cannot report.
pub const NOT_SUPPORTED_MARKER: &str = "Not Supported";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("device query failed: {0}")]
    Devices(#[source] ExecutionError),
    #[error("compute process query failed: {0}")]
    Processes(#[source] ExecutionError),
    #[error("malformed device record: {0}")]
    Malformed(#[from] MalformedRecordError),
}

/// Runs one query cycle against nvidia-smi, ps and the container runtimes.
pub struct Collector<R> {
    runner: R,
    nvidia_smi: String,
    container_lookup: bool,
}

impl<R: CommandRunner> Collector<R> {
    pub fn new(runner: R, cfg: &QueryConfig) -> Self {
        Self {
            runner,
            nvidia_smi: cfg.nvidia_smi.clone(),
            container_lookup: cfg.container_lookup,
        }
    }

    pub async fn build_snapshot(&self) -> Result<Snapshot, QueryError> {
        let devices = self.query_devices().await?;
        let processes = self.running_processes().await?;
        debug!(
            devices = devices.len(),
            processes = processes.len(),
            "query cycle finished"
        );
        Ok(Snapshot::assemble(
            devices,
            processes,
            host_name(),
            Local::now(),
        ))
    }

    pub async fn query_devices(&self) -> Result<Vec<DeviceRecord>, QueryError> {
        let text = self
            .runner
            .run(&device_query_command(&self.nvidia_smi))
            .await
            .map_err(QueryError::Devices)?;
        Ok(parse_devices(&text)?)
    }

    /// Compute processes with OS and container identity applied. Restricted
    /// entries are kept so they still count against their device.
    pub async fn running_processes(&self) -> Result<Vec<ProcessRecord>, QueryError> {
        let text = self
            .runner
            .run(&compute_query_command(&self.nvidia_smi))
            .await
            .map_err(QueryError::Processes)?;
        let entries = parse_compute_processes(&text);

        let pids = identified_pids(&entries);
        if pids.is_empty() {
            return Ok(entries);
        }

        // ps exits non-zero when none of the pids exist anymore.
        let identities = match self.runner.run(&os_listing_command(&pids)).await {
            Ok(listing) => parse_os_processes(&listing),
            Err(err) => {
                warn!(error = %err, "process listing unavailable, treating every pid as exited");
                HashMap::new()
            }
        };
        let entries = enrich_identity(entries, &identities);

        if !self.container_lookup {
            return Ok(entries);
        }
        let pids = identified_pids(&entries);
        if pids.is_empty() {
            return Ok(entries);
        }
        let runtimes = detect_runtimes(&self.runner).await;
        if !runtimes.any() {
            return Ok(entries);
        }
        let resolutions = resolve_containers(&self.runner, &pids, &runtimes).await;
        Ok(apply_resolutions(entries, &resolutions))
    }
}

fn host_name() -> String {
    System::new()
        .host_name()
        .unwrap_or_else(|| "localhost".to_string())
}

/// Splits one `--format=csv,noheader` row, trimming every field.
pub(crate) fn split_csv_row(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// `None` when the raw field carries the not-supported marker.
pub(crate) fn supported(raw: &str) -> Option<&str> {
    if raw.contains(NOT_SUPPORTED_MARKER) {
        None
    } else {
        Some(raw)
    }
}

pub(crate) fn parse_u64_loose(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<u64>() {
        return Some(v);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v as u64),
        _ => None,
    }
}
