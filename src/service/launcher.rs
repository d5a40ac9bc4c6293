use crate::error::{LaunchError, Result, WardenError};
use crate::service::types::ArtifactKind;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tracing::{debug, info, warn};

/// How long to wait after spawn before confirming the process survived
/// startup. Catches artifacts that exit immediately (bad JVM flags, missing
/// runtime) without blocking the caller for long.
const STARTUP_CONFIRM: Duration = Duration::from_millis(800);

/// Grace period after SIGKILL escalation before declaring a stop failed.
const KILL_GRACE: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Start an artifact as a detached process and return its pid.
///
/// The child is placed in its own session so it is not signaled or reaped
/// when the supervisor exits: supervised services must outlive supervisor
/// restarts. Stdio is routed to the null device. The working directory
/// defaults to the artifact's own folder so it can resolve its relative
/// resources.
pub async fn launch(
    artifact: &Path,
    cwd: Option<&Path>,
    java_args: &[String],
) -> std::result::Result<u32, LaunchError> {
    if !artifact.exists() {
        return Err(LaunchError::ArtifactNotFound(artifact.to_path_buf()));
    }

    let kind = ArtifactKind::from_path(artifact).ok_or_else(|| {
        LaunchError::SpawnFailed(format!("unrecognized artifact: {}", artifact.display()))
    })?;

    let mut command = build_command(kind, artifact, java_args);

    let workdir = cwd
        .map(Path::to_path_buf)
        .or_else(|| artifact.parent().map(Path::to_path_buf));
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    detach(&mut command);

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LaunchError::ArtifactNotFound(artifact.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => {
            LaunchError::PermissionDenied(artifact.to_path_buf())
        }
        _ => LaunchError::SpawnFailed(format!("{}: {}", artifact.display(), e)),
    })?;
    let pid = child.id();

    // Confirm the service survived startup before reporting success.
    tokio::time::sleep(STARTUP_CONFIRM).await;
    match child.try_wait() {
        Ok(Some(status)) => {
            return Err(LaunchError::SpawnFailed(format!(
                "{} exited immediately with {}",
                artifact.display(),
                status
            )))
        }
        Ok(None) => {}
        Err(e) => {
            return Err(LaunchError::SpawnFailed(format!(
                "failed to poll spawned process: {}",
                e
            )))
        }
    }

    info!(pid, artifact = %artifact.display(), "started detached service");
    Ok(pid)
}

/// Build the launch command line for an artifact. The only place artifact
/// kinds are dispatched on; the match is exhaustive by construction.
fn build_command(kind: ArtifactKind, artifact: &Path, java_args: &[String]) -> Command {
    match kind {
        ArtifactKind::JarLike => {
            let mut command = Command::new("java");
            command.args(java_args);
            command.arg("-jar").arg(artifact);
            command
        }
        ArtifactKind::NativeExecutable => Command::new(artifact),
        ArtifactKind::BatchScript => {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(artifact);
            command
        }
        ArtifactKind::ShellScript => {
            let mut command = Command::new("sh");
            command.arg(artifact);
            command
        }
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // New session: the child no longer belongs to the supervisor's process
    // group and survives its termination.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {
    // On Windows the detached-process creation flags would go here.
}

/// Stop a process with a bounded wait: SIGTERM, poll for exit until
/// `timeout`, escalate once to SIGKILL, and fail with `StopTimeout` if the
/// process is somehow still alive after the kill grace period. A pid that
/// is already gone counts as success.
#[cfg(unix)]
pub async fn stop(pid: u32, timeout: Duration) -> Result<()> {
    use nix::sys::signal::Signal;

    if !process_alive(pid) {
        debug!(pid, "process already gone, nothing to stop");
        return Ok(());
    }

    info!(pid, "stopping process with SIGTERM");
    send_signal(pid, Signal::SIGTERM)?;
    if wait_for_exit(pid, timeout).await {
        info!(pid, "process exited gracefully");
        return Ok(());
    }

    warn!(pid, ?timeout, "process did not exit in time, escalating to SIGKILL");
    send_signal(pid, Signal::SIGKILL)?;
    if wait_for_exit(pid, KILL_GRACE).await {
        Ok(())
    } else {
        Err(WardenError::StopTimeout { pid })
    }
}

#[cfg(not(unix))]
pub async fn stop(pid: u32, _timeout: Duration) -> Result<()> {
    Err(WardenError::StopError(
        pid,
        "stop is not supported on this platform".to_string(),
    ))
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::unistd::Pid as NixPid;

    match nix::sys::signal::kill(NixPid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        // Exited between the liveness check and the signal.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(WardenError::StopError(pid, e.to_string())),
    }
}

/// True when the pid maps to a live, non-zombie process. Zombies count as
/// exited: a child we never reap stays in the table until the supervisor
/// itself exits.
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::everything(),
    );
    system
        .process(sys_pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
