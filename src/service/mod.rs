pub mod artifacts;
pub mod identity;
pub mod launcher;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use artifacts::{list_artifacts, ArtifactEntry};
pub use registry::ServiceRegistry;
pub use supervisor::{ServiceStatus, Supervisor, SupervisorOptions};
pub use types::{
    ArtifactKind, BreachReason, RestartPhase, RestartRuntimeState, RestartTrigger, ServiceDetail,
    ServiceRecord,
};
