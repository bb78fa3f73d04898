use crate::collectors::{parse_u64_loose, split_csv_row, supported};
use crate::exec::CommandLine;
use crate::state::ProcessRecord;
use std::collections::HashMap;
use tracing::debug;

pub const COMPUTE_QUERY_COLUMNS: [&str; 3] = ["gpu_uuid", "pid", "used_memory"];

/// Owner and short program name reported by `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsIdentity {
    pub user: String,
    pub command: String,
}

pub fn compute_query_command(nvidia_smi: &str) -> CommandLine {
    CommandLine::new(nvidia_smi)
        .arg(format!(
            "--query-compute-apps={}",
            COMPUTE_QUERY_COLUMNS.join(",")
        ))
        .arg("--format=csv,noheader,nounits")
}

pub fn os_listing_command(pids: &[u32]) -> CommandLine {
    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
    CommandLine::new("ps")
        .arg("-o")
        .arg("pid,user:16,comm")
        .arg("-p")
        .arg(pids.join(","))
}

/// One entry per row. A row whose pid is not reported becomes a restricted
/// entry rather than being dropped.
pub fn parse_compute_processes(text: &str) -> Vec<ProcessRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_csv_row(line);
            if fields.len() != COMPUTE_QUERY_COLUMNS.len() {
                debug!(line, "skipping compute process row with unexpected shape");
                return None;
            }

            let device_uuid = fields[0].to_string();
            let pid = supported(fields[1]).and_then(|raw| raw.parse::<u32>().ok());
            let Some(pid) = pid else {
                return Some(ProcessRecord::restricted(device_uuid));
            };
            let used_memory_mb = supported(fields[2]).and_then(parse_u64_loose);

            Some(ProcessRecord::unresolved(device_uuid, pid, used_memory_mb))
        })
        .collect()
}

/// Parses `ps -o pid,user,comm` output. The header and any line not led by
/// a numeric pid are ignored.
pub fn parse_os_processes(text: &str) -> HashMap<u32, OsIdentity> {
    let mut identities = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(pid) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        let Some(user) = parts.next() else {
            continue;
        };
        let command = parts.collect::<Vec<_>>().join(" ");
        identities.insert(
            pid,
            OsIdentity {
                user: user.to_string(),
                command,
            },
        );
    }
    identities
}

/// Distinct pids of the identified entries, in first-seen order.
pub fn identified_pids(entries: &[ProcessRecord]) -> Vec<u32> {
    let mut pids: Vec<u32> = Vec::new();
    for pid in entries.iter().filter_map(|e| e.pid) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

/// Fills user and command from the OS listing. Entries whose pid vanished
/// between the two queries are dropped; restricted entries pass through.
pub fn enrich_identity(
    entries: Vec<ProcessRecord>,
    identities: &HashMap<u32, OsIdentity>,
) -> Vec<ProcessRecord> {
    entries
        .into_iter()
        .filter_map(|mut entry| {
            let Some(pid) = entry.pid else {
                return Some(entry);
            };
            match identities.get(&pid) {
                Some(identity) => {
                    entry.user = Some(identity.user.clone());
                    entry.command = Some(identity.command.clone());
                    Some(entry)
                }
                None => {
                    debug!(pid, "process no longer listed by ps, dropping");
                    None
                }
            }
        })
        .collect()
}
