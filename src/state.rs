use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Owner shown for a process whose user could not be resolved.
pub const UNKNOWN_USER: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    pub temperature_c: Option<u32>,
    pub utilization_percent: Option<u32>,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub processes: Vec<ProcessRecord>,
    /// Compute contexts whose pid the driver refused to report.
    pub restricted_processes: usize,
}

impl DeviceRecord {
    /// Restricted entries only bump the counter; identified ones are appended.
    pub fn attach(&mut self, process: ProcessRecord) {
        if process.is_restricted() {
            self.restricted_processes += 1;
        } else {
            self.processes.push(process);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub device_uuid: String,
    pub pid: Option<u32>,
    pub used_memory_mb: Option<u64>,
    pub user: Option<String>,
    pub command: Option<String>,
}

impl ProcessRecord {
    /// A freshly queried process, not yet matched against the OS listing.
    pub fn unresolved(device_uuid: String, pid: u32, used_memory_mb: Option<u64>) -> Self {
        Self {
            device_uuid,
            pid: Some(pid),
            used_memory_mb,
            user: Some(UNKNOWN_USER.to_string()),
            command: Some(String::new()),
        }
    }

    pub fn restricted(device_uuid: String) -> Self {
        Self {
            device_uuid,
            pid: None,
            used_memory_mb: None,
            user: None,
            command: None,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.pid.is_none()
    }
}

/// Result of one query cycle. Devices keep query order and are unique by uuid.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub hostname: String,
    pub query_time: DateTime<Local>,
    devices: Vec<DeviceRecord>,
}

impl Snapshot {
    pub fn assemble(
        devices: Vec<DeviceRecord>,
        processes: Vec<ProcessRecord>,
        hostname: String,
        query_time: DateTime<Local>,
    ) -> Self {
        let mut ordered: Vec<DeviceRecord> = Vec::with_capacity(devices.len());
        let mut by_uuid: HashMap<String, usize> = HashMap::with_capacity(devices.len());
        for device in devices {
            match by_uuid.get(&device.uuid) {
                Some(&slot) => {
                    warn!(uuid = %device.uuid, "duplicate device uuid, keeping the latest record");
                    ordered[slot] = device;
                }
                None => {
                    by_uuid.insert(device.uuid.clone(), ordered.len());
                    ordered.push(device);
                }
            }
        }

        for process in processes {
            match by_uuid.get(&process.device_uuid) {
                Some(&slot) => ordered[slot].attach(process),
                None => {
                    debug!(
                        uuid = %process.device_uuid,
                        pid = ?process.pid,
                        "process references an unknown device, dropping"
                    );
                }
            }
        }

        Self {
            hostname,
            query_time,
            devices: ordered,
        }
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    #[cfg(test)]
    pub fn device(&self, uuid: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.uuid == uuid)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
