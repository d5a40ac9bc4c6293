use crate::service::identity;
use crate::service::types::{format_uptime, ArtifactKind, ServiceDetail, ServiceRecord};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

/// Process registry backed by an OS-wide process table scan.
///
/// Each `discover` call rebuilds the live view from scratch; callers
/// re-invoke periodically instead of holding on to records, since pids are
/// not stable across restarts. The scan is a pure read with no side
/// effects on the processes themselves.
pub struct ServiceRegistry {
    system: System,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    /// Scan the process table and return a record for every process that
    /// was launched from a recognized artifact kind. Per-process read
    /// failures (process exited mid-scan, permission denied, empty command
    /// line) skip that record only; the pass itself always completes.
    pub fn discover(&mut self) -> Vec<ServiceRecord> {
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut records = Vec::new();
        for (pid, process) in self.system.processes() {
            if process.status() == ProcessStatus::Zombie {
                continue;
            }
            let Some((kind, artifact_path)) = classify(process) else {
                continue;
            };
            records.push(build_record(pid.as_u32(), process, kind, artifact_path));
        }
        records
    }

    /// Detailed view of a single supervised process, or `None` when the
    /// pid is gone or was not launched from a recognized artifact.
    pub fn service_detail(&mut self, pid: u32) -> Option<ServiceDetail> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        self.system.refresh_memory();

        let process = self.system.process(sys_pid)?;
        let (kind, artifact_path) = classify(process)?;
        let record = build_record(pid, process, kind, artifact_path);

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory > 0 {
            record.memory_bytes as f32 / total_memory as f32 * 100.0
        } else {
            0.0
        };

        Some(ServiceDetail {
            started_at: record.started_at(),
            uptime_formatted: format_uptime(record.uptime_secs),
            memory_percent,
            status: process.status().to_string(),
            open_files: open_file_count(pid),
            connections: open_socket_count(pid),
            record,
        })
    }

    /// True when the pid still maps to a running (non-zombie) process.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        self.system
            .process(sys_pid)
            .map(|p| p.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_record(
    pid: u32,
    process: &sysinfo::Process,
    kind: ArtifactKind,
    artifact_path: PathBuf,
) -> ServiceRecord {
    let cmdline = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");

    ServiceRecord {
        pid,
        logical_name: identity::logical_name(&artifact_path),
        artifact_path,
        kind,
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
        start_time: process.start_time(),
        uptime_secs: process.run_time(),
        thread_count: thread_count(process),
        cmdline,
        cwd: process.cwd().map(Path::to_path_buf),
    }
}

/// Map a process to the artifact it was launched from, if any.
///
/// JAR services run under an interpreter (`java -jar app.jar`), so they
/// are recognized by command line rather than executable path; the same
/// applies to shell scripts run as `sh app.sh`. Everything else is matched
/// on the executable extension. Only kinds recognized on the current
/// platform family produce a record.
fn classify(process: &sysinfo::Process) -> Option<(ArtifactKind, PathBuf)> {
    let recognized = ArtifactKind::recognized_on_host();
    let cmd: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    if let Some(first) = cmd.first() {
        let interpreter = Path::new(first)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if interpreter == "java" || interpreter == "javaw" {
            let jar = cmd
                .iter()
                .skip(1)
                .find(|arg| arg.to_lowercase().ends_with(".jar"))?;
            return Some((ArtifactKind::JarLike, PathBuf::from(jar)));
        }

        if matches!(interpreter.as_str(), "sh" | "bash" | "dash" | "zsh")
            && recognized.contains(&ArtifactKind::ShellScript)
        {
            if let Some(script) = cmd
                .iter()
                .skip(1)
                .find(|arg| arg.to_lowercase().ends_with(".sh"))
            {
                return Some((ArtifactKind::ShellScript, PathBuf::from(script)));
            }
            return None;
        }
    }

    // Directly executed artifacts: match on the executable path extension.
    let exe = process
        .exe()
        .map(Path::to_path_buf)
        .or_else(|| cmd.first().map(PathBuf::from))?;
    let kind = ArtifactKind::from_path(&exe)?;
    if recognized.contains(&kind) {
        Some((kind, exe))
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
fn thread_count(process: &sysinfo::Process) -> Option<usize> {
    process.tasks().map(|tasks| tasks.len())
}

#[cfg(not(target_os = "linux"))]
fn thread_count(_process: &sysinfo::Process) -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn open_file_count(pid: u32) -> Option<usize> {
    std::fs::read_dir(format!("/proc/{}/fd", pid))
        .ok()
        .map(|entries| entries.count())
}

#[cfg(not(target_os = "linux"))]
fn open_file_count(_pid: u32) -> Option<usize> {
    None
}

/// Open sockets, counted as the fd entries whose link target is a socket.
#[cfg(target_os = "linux")]
fn open_socket_count(pid: u32) -> Option<usize> {
    let entries = std::fs::read_dir(format!("/proc/{}/fd", pid)).ok()?;
    let sockets = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            std::fs::read_link(entry.path())
                .map(|target| target.to_string_lossy().starts_with("socket:"))
                .unwrap_or(false)
        })
        .count();
    Some(sockets)
}

#[cfg(not(target_os = "linux"))]
fn open_socket_count(_pid: u32) -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_is_resilient_and_bounded() {
        let mut registry = ServiceRegistry::new();
        // Whatever the host is running, a pass must complete and produce
        // only recognized artifact kinds.
        let records = registry.discover();
        for record in &records {
            assert!(ArtifactKind::recognized_on_host().contains(&record.kind));
            assert!(!record.logical_name.is_empty());
        }
    }

    #[tokio::test]
    async fn test_discover_finds_shell_script_service() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let script = temp_dir.path().join("regtest-svc.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 10\n").unwrap();

        let mut child = tokio::process::Command::new("sh")
            .arg(&script)
            .spawn()
            .expect("failed to spawn script");
        let pid = child.id().expect("no pid");

        // Give the process table a moment to settle.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let mut registry = ServiceRegistry::new();
        let records = registry.discover();
        let found = records.iter().find(|r| r.pid == pid);

        let record = found.expect("spawned script not discovered");
        assert_eq!(record.kind, ArtifactKind::ShellScript);
        assert_eq!(record.logical_name, "regtest-svc");
        assert_eq!(record.artifact_path, script);

        let detail = registry.service_detail(pid).expect("no detail");
        assert_eq!(detail.record.logical_name, "regtest-svc");
        #[cfg(target_os = "linux")]
        {
            // A shell sitting in sleep holds open fds; the socket count
            // is readable even when it is zero.
            assert!(detail.open_files.is_some());
            assert!(detail.connections.is_some());
            assert!(detail.connections.unwrap() <= detail.open_files.unwrap());
        }

        child.kill().await.ok();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_is_alive_tracks_exit() {
        let mut registry = ServiceRegistry::new();

        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("failed to spawn");
        let pid = child.id().expect("no pid");
        assert!(registry.is_alive(pid));

        child.kill().await.ok();
        let _ = child.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!registry.is_alive(pid));
    }

    #[tokio::test]
    async fn test_service_detail_unknown_pid() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.service_detail(2_000_000_000).is_none());
    }
}
