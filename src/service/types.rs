use crate::config::AutoRestartPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Kind of launchable artifact a service was started from.
///
/// This is a closed set: the single place a launch command line is built
/// matches exhaustively over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    JarLike,
    NativeExecutable,
    BatchScript,
    ShellScript,
}

impl ArtifactKind {
    /// Classify a path by its extension. Returns `None` for anything that
    /// is not a launchable artifact.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "jar" => Some(ArtifactKind::JarLike),
            "exe" => Some(ArtifactKind::NativeExecutable),
            "bat" => Some(ArtifactKind::BatchScript),
            "sh" => Some(ArtifactKind::ShellScript),
            _ => None,
        }
    }

    /// Artifact kinds recognized on the current platform family.
    #[cfg(windows)]
    pub fn recognized_on_host() -> &'static [ArtifactKind] {
        &[
            ArtifactKind::JarLike,
            ArtifactKind::NativeExecutable,
            ArtifactKind::BatchScript,
        ]
    }

    /// Artifact kinds recognized on the current platform family.
    #[cfg(not(windows))]
    pub fn recognized_on_host() -> &'static [ArtifactKind] {
        &[ArtifactKind::JarLike, ArtifactKind::ShellScript]
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::JarLike => "JAR",
            ArtifactKind::NativeExecutable => "EXE",
            ArtifactKind::BatchScript => "BAT",
            ArtifactKind::ShellScript => "SH",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Snapshot of one live supervised process, rebuilt wholesale on every
/// discovery pass. Never mutated in place: a fresh pass replaces the
/// previous records entirely, so a record can never carry a stale pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub pid: u32,
    pub logical_name: String,
    pub artifact_path: PathBuf,
    pub kind: ArtifactKind,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    /// Seconds since the Unix epoch at which the process started.
    pub start_time: u64,
    pub uptime_secs: u64,
    pub thread_count: Option<usize>,
    pub cmdline: String,
    pub cwd: Option<PathBuf>,
}

impl ServiceRecord {
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Start time formatted as `YYYY-MM-DD HH:MM:SS` local time.
    pub fn started_at(&self) -> String {
        chrono::DateTime::from_timestamp(self.start_time as i64, 0)
            .map(|dt| {
                dt.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn uptime_formatted(&self) -> String {
        format_uptime(self.uptime_secs)
    }
}

/// Richer view of a single service, returned by detail lookups.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    pub record: ServiceRecord,
    pub memory_percent: f32,
    pub status: String,
    pub open_files: Option<usize>,
    pub connections: Option<usize>,
    pub started_at: String,
    pub uptime_formatted: String,
}

/// Phase of the restart state machine for one logical service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartPhase {
    Idle,
    Stopping,
    Delaying,
    Relaunching,
}

impl std::fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPhase::Idle => write!(f, "idle"),
            RestartPhase::Stopping => write!(f, "stopping"),
            RestartPhase::Delaying => write!(f, "delaying"),
            RestartPhase::Relaunching => write!(f, "relaunching"),
        }
    }
}

/// In-memory runtime state for a supervised process, keyed by its current
/// pid in the supervisor map. Derived from the name-keyed durable policy;
/// re-keyed to the new pid when a restart cycle completes.
#[derive(Debug, Clone)]
pub struct RestartRuntimeState {
    pub logical_name: String,
    pub policy: AutoRestartPolicy,
    pub restarting: bool,
    pub phase: RestartPhase,
    pub restart_deadline: Option<Instant>,
}

impl RestartRuntimeState {
    pub fn new(logical_name: String, policy: AutoRestartPolicy) -> Self {
        Self {
            logical_name,
            policy,
            restarting: false,
            phase: RestartPhase::Idle,
            restart_deadline: None,
        }
    }
}

/// Why a restart cycle was triggered.
#[derive(Debug, Clone, PartialEq)]
pub enum BreachReason {
    Cpu { observed: f32, threshold: f64 },
    Memory { observed_bytes: u64, threshold_bytes: u64 },
    Queue { depth: u64, threshold: u64 },
    Manual,
}

impl std::fmt::Display for BreachReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreachReason::Cpu { observed, threshold } => {
                write!(f, "CPU {:.1}% > {:.1}%", observed, threshold)
            }
            BreachReason::Memory {
                observed_bytes,
                threshold_bytes,
            } => write!(
                f,
                "Memory {:.1} MB > {:.1} MB",
                *observed_bytes as f64 / (1024.0 * 1024.0),
                *threshold_bytes as f64 / (1024.0 * 1024.0)
            ),
            BreachReason::Queue { depth, threshold } => {
                write!(f, "Queue depth {} > {}", depth, threshold)
            }
            BreachReason::Manual => write!(f, "Manual restart request"),
        }
    }
}

/// A detected threshold breach (or manual request) for one live service.
/// Emission is read-only; the restart state machine is the only mutator.
#[derive(Debug, Clone)]
pub struct RestartTrigger {
    pub pid: u32,
    pub logical_name: String,
    pub artifact_path: PathBuf,
    pub kind: ArtifactKind,
    pub reason: BreachReason,
}

pub(crate) fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}
