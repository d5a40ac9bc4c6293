use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while launching a service artifact.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    #[error("Permission denied executing: {0}")]
    PermissionDenied(PathBuf),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
}

/// Errors raised by the durable configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file is corrupt: {0}")]
    Corrupt(String),

    #[error("Failed to write configuration: {0}")]
    WriteFailed(String),
}

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to stop process {0}: {1}")]
    StopError(u32, String),

    #[error("Process {pid} is still alive after SIGKILL escalation")]
    StopTimeout { pid: u32 },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Restart already in progress for service: {0}")]
    RestartInProgress(String),

    #[error("Invalid auto-restart policy: {0}")]
    InvalidPolicy(String),

    #[error("No artifact folder configured")]
    NoFolderConfigured,

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
