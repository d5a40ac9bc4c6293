//! Process supervision for artifact-launched services.
//!
//! `warden` watches processes started from launchable artifacts (JARs,
//! scripts, native executables), evaluates them against per-service
//! resource thresholds, and restarts the ones that breach. Restart
//! policies are durable and keyed by logical service name, so they
//! survive both process restarts and supervisor restarts.

pub mod config;
pub mod error;
pub mod service;

pub use error::{Result, WardenError};
pub use service::supervisor::{Supervisor, SupervisorOptions};
