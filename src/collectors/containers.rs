//! Best-effort container ownership for GPU processes.
//!
//! A pid's cgroup path is matched against two runtimes: lxc containers are
//! named directly in the path, docker containers are named by id and looked
//! up in the `docker ps` listing. Any failure leaves the process untouched.

use crate::exec::{CommandLine, CommandRunner};
use crate::state::{ProcessRecord, UNKNOWN_USER};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

pub const CONTAINER_FIELD_DELIMITER: &str = "<>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerContainer {
    pub name: String,
    pub command: String,
}

/// Runtimes found on this host. `docker` carries the running containers by id.
#[derive(Debug, Clone, Default)]
pub struct ContainerRuntimes {
    pub lxc: bool,
    pub docker: Option<HashMap<String, DockerContainer>>,
}

impl ContainerRuntimes {
    pub fn any(&self) -> bool {
        self.lxc || self.docker.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupEntry {
    pub pid: u32,
    pub user: String,
    pub cgroup: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOwner {
    Host,
    Lxc { container: String },
    Docker { name: String },
    UnknownDocker { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnresolvedReason {
    #[error("cgroup lookup command failed")]
    LookupFailed,
    #[error("unexpected cgroup line `{0}`")]
    UnexpectedShape(String),
    #[error("cgroup line describes pid {found}")]
    PidMismatch { found: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ContainerOwner),
    Unresolved(UnresolvedReason),
}

fn version_probe(program: &str) -> CommandLine {
    CommandLine::new(program).arg("--version")
}

pub fn docker_listing_command() -> CommandLine {
    CommandLine::new("docker")
        .arg("ps")
        .arg("--format")
        .arg(
            ["{{.ID}}", "{{.Names}}", "{{.Command}}"].join(CONTAINER_FIELD_DELIMITER),
        )
        .arg("--no-trunc")
}

pub fn cgroup_lookup_command(pid: u32) -> CommandLine {
    CommandLine::new("ps")
        .arg("-o")
        .arg("pid=,user=,cgroup=")
        .arg("-p")
        .arg(pid.to_string())
}

pub async fn detect_runtimes<R: CommandRunner>(runner: &R) -> ContainerRuntimes {
    let lxc = installed(runner, "lxc-info").await;
    let docker = if installed(runner, "docker").await {
        let listing = runner
            .run_best_effort(&docker_listing_command())
            .await
            .unwrap_or_default();
        Some(parse_docker_listing(&listing))
    } else {
        None
    };

    debug!(lxc, docker = docker.is_some(), "container runtimes detected");
    ContainerRuntimes { lxc, docker }
}

async fn installed<R: CommandRunner>(runner: &R, program: &str) -> bool {
    runner
        .run_best_effort(&version_probe(program))
        .await
        .is_some_and(|out| !out.trim().is_empty())
}

pub fn parse_docker_listing(text: &str) -> HashMap<String, DockerContainer> {
    let mut containers = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.splitn(3, CONTAINER_FIELD_DELIMITER).collect();
        let [id, name, command] = parts[..] else {
            debug!(line, "skipping malformed docker ps row");
            continue;
        };
        containers.insert(
            id.trim().to_string(),
            DockerContainer {
                name: name.trim().to_string(),
                command: command.trim().to_string(),
            },
        );
    }
    containers
}

/// Expects `pid user cgroup` on a single line, any whitespace between fields.
pub fn parse_cgroup_line(text: &str) -> Result<CgroupEntry, UnresolvedReason> {
    let line = text.trim();
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [pid, user, cgroup] = parts[..] else {
        return Err(UnresolvedReason::UnexpectedShape(line.to_string()));
    };
    let pid = pid
        .parse::<u32>()
        .map_err(|_| UnresolvedReason::UnexpectedShape(line.to_string()))?;
    Ok(CgroupEntry {
        pid,
        user: user.to_string(),
        cgroup: cgroup.to_string(),
    })
}

/// Last path segment of the first controller listed in a `ps` cgroup field.
fn cgroup_leaf(cgroup: &str) -> &str {
    let first = cgroup.split(',').next().unwrap_or(cgroup);
    first.rsplit('/').next().unwrap_or(first)
}

pub fn classify_cgroup(cgroup: &str, runtimes: &ContainerRuntimes) -> ContainerOwner {
    if runtimes.lxc && cgroup.contains("lxc") {
        return ContainerOwner::Lxc {
            container: cgroup_leaf(cgroup).to_string(),
        };
    }

    if let Some(containers) = &runtimes.docker {
        if cgroup.contains("docker") {
            let id = cgroup_leaf(cgroup);
            return match containers.get(id) {
                Some(container) => {
                    debug!(id, name = %container.name, command = %container.command, "docker container matched");
                    ContainerOwner::Docker {
                        name: container.name.clone(),
                    }
                }
                None => ContainerOwner::UnknownDocker { id: id.to_string() },
            };
        }
    }

    ContainerOwner::Host
}

/// Looks up each pid independently; one pid failing never affects another.
pub async fn resolve_containers<R: CommandRunner>(
    runner: &R,
    pids: &[u32],
    runtimes: &ContainerRuntimes,
) -> BTreeMap<u32, Resolution> {
    let mut resolutions = BTreeMap::new();
    for &pid in pids {
        let resolution = match runner.run_best_effort(&cgroup_lookup_command(pid)).await {
            None => Resolution::Unresolved(UnresolvedReason::LookupFailed),
            Some(line) => match parse_cgroup_line(&line) {
                Ok(entry) if entry.pid != pid => {
                    Resolution::Unresolved(UnresolvedReason::PidMismatch { found: entry.pid })
                }
                Ok(entry) => {
                    debug!(pid, user = %entry.user, cgroup = %entry.cgroup, "cgroup resolved");
                    Resolution::Resolved(classify_cgroup(&entry.cgroup, runtimes))
                }
                Err(reason) => Resolution::Unresolved(reason),
            },
        };
        if let Resolution::Unresolved(reason) = &resolution {
            debug!(pid, reason = %reason, "container identity unresolved");
        }
        resolutions.insert(pid, resolution);
    }
    resolutions
}

pub fn apply_resolutions(
    entries: Vec<ProcessRecord>,
    resolutions: &BTreeMap<u32, Resolution>,
) -> Vec<ProcessRecord> {
    entries
        .into_iter()
        .map(|mut entry| {
            let Some(pid) = entry.pid else {
                return entry;
            };
            let owner = resolutions
                .get(&pid)
                .and_then(|resolution| match resolution {
                    Resolution::Resolved(owner) => Some(owner),
                    Resolution::Unresolved(_) => None,
                });
            match owner {
                Some(ContainerOwner::Lxc { container }) => {
                    let user = entry.user.as_deref().unwrap_or(UNKNOWN_USER);
                    entry.user = Some(format!("{user}/{container}"));
                }
                Some(ContainerOwner::Docker { name }) => entry.user = Some(name.clone()),
                Some(ContainerOwner::UnknownDocker { id }) => {
                    debug!(pid, id = %id, "container not in docker ps listing");
                    entry.user = Some(UNKNOWN_USER.to_string());
                }
                Some(ContainerOwner::Host) | None => {}
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;

    const DOCKER_ID: &str = "3f4e8a9c1b2d";

    fn docker_runtimes() -> ContainerRuntimes {
        let mut containers = HashMap::new();
        containers.insert(
            DOCKER_ID.to_string(),
            DockerContainer {
                name: "trainer".to_string(),
                command: "\"python train.py\"".to_string(),
            },
        );
        ContainerRuntimes {
            lxc: false,
            docker: Some(containers),
        }
    }

    fn process(pid: u32, user: &str) -> ProcessRecord {
        ProcessRecord {
            device_uuid: "GPU-aaa".to_string(),
            pid: Some(pid),
            used_memory_mb: Some(10),
            user: Some(user.to_string()),
            command: Some("python".to_string()),
        }
    }

    #[test]
    fn docker_listing_keeps_spaces_in_commands() {
        let listing = format!(
            "{DOCKER_ID}<>trainer<>\"python train.py --epochs 3\"\nabc<>web<>nginx -g daemon off;\n"
        );
        let map = parse_docker_listing(&listing);
        assert_eq!(map.len(), 2);
        assert_eq!(map[DOCKER_ID].name, "trainer");
        assert_eq!(map[DOCKER_ID].command, "\"python train.py --epochs 3\"");
        assert_eq!(map["abc"].command, "nginx -g daemon off;");
    }

    #[test]
    fn docker_listing_skips_malformed_rows() {
        let map = parse_docker_listing("only-an-id\n\nid2<>name2<>cmd\n");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("id2"));
    }

    #[test]
    fn cgroup_line_normalizes_whitespace() {
        let entry = parse_cgroup_line("  10278 ail\t\u{2003}11:hugetlb:/lxc/pablo_juk,1:name=systemd:/lxc/pablo_juk ")
            .expect("well formed line");
        assert_eq!(entry.pid, 10278);
        assert_eq!(entry.user, "ail");
        assert_eq!(entry.cgroup, "11:hugetlb:/lxc/pablo_juk,1:name=systemd:/lxc/pablo_juk");
    }

    #[test]
    fn cgroup_line_with_wrong_shape_is_rejected() {
        assert!(matches!(
            parse_cgroup_line("10278 ail"),
            Err(UnresolvedReason::UnexpectedShape(_))
        ));
        assert!(matches!(
            parse_cgroup_line("abc ail /docker/x"),
            Err(UnresolvedReason::UnexpectedShape(_))
        ));
    }

    #[test]
    fn classifies_lxc_container() {
        let runtimes = ContainerRuntimes {
            lxc: true,
            docker: None,
        };
        assert_eq!(
            classify_cgroup("11:hugetlb:/lxc/pablo_juk,1:name=systemd:/lxc/pablo_juk", &runtimes),
            ContainerOwner::Lxc {
                container: "pablo_juk".to_string()
            }
        );
    }

    #[test]
    fn lxc_path_ignored_when_lxc_not_installed() {
        assert_eq!(
            classify_cgroup("11:hugetlb:/lxc/pablo_juk", &docker_runtimes()),
            ContainerOwner::Host
        );
    }

    #[test]
    fn classifies_docker_container_by_id() {
        let runtimes = docker_runtimes();
        assert_eq!(
            classify_cgroup(&format!("12:devices:/docker/{DOCKER_ID},11:cpu:/docker/{DOCKER_ID}"), &runtimes),
            ContainerOwner::Docker {
                name: "trainer".to_string()
            }
        );
        assert_eq!(
            classify_cgroup("12:devices:/docker/ffff", &runtimes),
            ContainerOwner::UnknownDocker {
                id: "ffff".to_string()
            }
        );
        assert_eq!(classify_cgroup("0::/user.slice", &runtimes), ContainerOwner::Host);
    }

    #[test]
    fn resolutions_rewrite_user() {
        let mut resolutions = BTreeMap::new();
        resolutions.insert(
            1,
            Resolution::Resolved(ContainerOwner::Lxc {
                container: "box".to_string(),
            }),
        );
        resolutions.insert(
            2,
            Resolution::Resolved(ContainerOwner::Docker {
                name: "trainer".to_string(),
            }),
        );
        resolutions.insert(
            3,
            Resolution::Resolved(ContainerOwner::UnknownDocker {
                id: "ffff".to_string(),
            }),
        );
        resolutions.insert(4, Resolution::Unresolved(UnresolvedReason::LookupFailed));
        resolutions.insert(5, Resolution::Resolved(ContainerOwner::Host));

        let entries = (1..=5).map(|pid| process(pid, "alice")).collect();
        let users: Vec<_> = apply_resolutions(entries, &resolutions)
            .into_iter()
            .map(|p| p.user.unwrap_or_default())
            .collect();
        assert_eq!(users, vec!["alice/box", "trainer", "UNKNOWN", "alice", "alice"]);
    }

    #[test]
    fn restricted_entries_are_left_alone() {
        let entries = vec![ProcessRecord::restricted("GPU-aaa".to_string())];
        let out = apply_resolutions(entries.clone(), &BTreeMap::new());
        assert_eq!(out, entries);
    }

    #[tokio::test]
    async fn failing_pid_does_not_affect_others() {
        let runner = ScriptedRunner::new()
            .ok(
                "ps -o pid=,user=,cgroup= -p 10",
                &format!("10 alice 12:devices:/docker/{DOCKER_ID}"),
            )
            .fail("ps -o pid=,user=,cgroup= -p 20")
            .ok("ps -o pid=,user=,cgroup= -p 30", "garbage")
            .ok("ps -o pid=,user=,cgroup= -p 40", "41 bob 0::/user.slice");

        let resolutions = resolve_containers(&runner, &[10, 20, 30, 40], &docker_runtimes()).await;

        assert_eq!(
            resolutions[&10],
            Resolution::Resolved(ContainerOwner::Docker {
                name: "trainer".to_string()
            })
        );
        assert_eq!(
            resolutions[&20],
            Resolution::Unresolved(UnresolvedReason::LookupFailed)
        );
        assert_eq!(
            resolutions[&30],
            Resolution::Unresolved(UnresolvedReason::UnexpectedShape("garbage".to_string()))
        );
        assert_eq!(
            resolutions[&40],
            Resolution::Unresolved(UnresolvedReason::PidMismatch { found: 41 })
        );

        let entries = vec![process(10, "alice"), process(20, "carol")];
        let out = apply_resolutions(entries, &resolutions);
        assert_eq!(out[0].user.as_deref(), Some("trainer"));
        assert_eq!(out[1].user.as_deref(), Some("carol"));
        assert_eq!(out[1].command.as_deref(), Some("python"));
    }

    #[tokio::test]
    async fn detects_runtimes_from_version_probes() {
        let runner = ScriptedRunner::new()
            .ok("docker --version", "Docker version 24.0.7, build afdd53b")
            .ok(
                "docker ps --format {{.ID}}<>{{.Names}}<>{{.Command}} --no-trunc",
                &format!("{DOCKER_ID}<>trainer<>python"),
            )
            .ok("lxc-info --version", "");

        let runtimes = detect_runtimes(&runner).await;
        assert!(!runtimes.lxc);
        let docker = runtimes.docker.expect("docker detected");
        assert_eq!(docker[DOCKER_ID].name, "trainer");
    }

    #[tokio::test]
    async fn docker_listing_failure_yields_empty_table() {
        let runner = ScriptedRunner::new().ok("docker --version", "Docker version 24.0.7");
        let runtimes = detect_runtimes(&runner).await;
        assert!(runtimes.any());
        assert_eq!(runtimes.docker.map(|d| d.len()), Some(0));
    }
}
