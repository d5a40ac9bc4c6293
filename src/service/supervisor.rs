use crate::config::{reconcile, AutoRestartPolicy, ConfigSnapshot, ConfigStore};
use crate::error::{Result, WardenError};
use crate::service::artifacts::{self, ArtifactEntry};
use crate::service::identity;
use crate::service::launcher;
use crate::service::monitor;
use crate::service::queue::{self, QueueProbe};
use crate::service::registry::ServiceRegistry;
use crate::service::types::{
    BreachReason, RestartPhase, RestartRuntimeState, RestartTrigger, ServiceDetail, ServiceRecord,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Timing knobs for the supervision loop. The defaults match production
/// cadence; tests shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How often the monitoring pass runs.
    pub check_interval: Duration,
    /// Graceful-stop budget before SIGKILL escalation.
    pub stop_timeout: Duration,
    /// Cool-down between stop and relaunch for CPU, memory and manual
    /// restarts.
    pub cpu_mem_delay: Duration,
    /// Shorter cool-down for queue backlogs, which drain fastest when the
    /// consumer comes back quickly.
    pub queue_delay: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            cpu_mem_delay: Duration::from_secs(120),
            queue_delay: Duration::from_secs(60),
        }
    }
}

impl SupervisorOptions {
    pub fn delay_for(&self, reason: &BreachReason) -> Duration {
        match reason {
            BreachReason::Queue { .. } => self.queue_delay,
            _ => self.cpu_mem_delay,
        }
    }
}

/// One row of the live service listing: the observed process joined with
/// its runtime restart state, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub record: ServiceRecord,
    pub policy: Option<AutoRestartPolicy>,
    pub restarting: bool,
    pub phase: RestartPhase,
}

/// The supervision engine: owns the durable configuration, the runtime
/// restart states and the registry, and drives the monitoring loop.
///
/// The in-memory snapshot is the authority; the store is its durable
/// mirror. Runtime states are keyed by pid and stay keyed by the old pid
/// for the whole restart cycle, so a cycle in flight can always be found
/// (and cancelled) through the pid the caller knows. Locks are never held
/// across await points.
pub struct Supervisor {
    options: SupervisorOptions,
    store: ConfigStore,
    registry: Mutex<ServiceRegistry>,
    snapshot: Mutex<ConfigSnapshot>,
    runtime: Mutex<HashMap<u32, RestartRuntimeState>>,
    /// Cancellation handles for cycles currently in their delay window,
    /// keyed by logical name.
    pending: Mutex<HashMap<String, watch::Sender<bool>>>,
    last_errors: Mutex<HashMap<String, String>>,
    probe: Box<dyn QueueProbe>,
}

impl Supervisor {
    pub fn new(store: ConfigStore, options: SupervisorOptions) -> Self {
        let snapshot = match store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %store.path().display(), error = %e,
                    "config file unreadable, starting with empty configuration");
                ConfigSnapshot::default()
            }
        };

        Self {
            options,
            store,
            registry: Mutex::new(ServiceRegistry::new()),
            snapshot: Mutex::new(snapshot),
            runtime: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
            probe: queue::platform_probe(),
        }
    }

    /// Run the periodic monitoring loop until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.options.check_interval, "supervision loop started");
        let mut ticker = tokio::time::interval(self.options.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = self.check_once().await;
                    if started > 0 {
                        info!(cycles = started, "monitoring pass triggered restarts");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("supervision loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One monitoring pass: rebuild the live view, reconcile runtime
    /// states with the durable policies, evaluate thresholds and start a
    /// restart cycle for every breach. Returns the number of cycles
    /// started.
    pub async fn check_once(self: &Arc<Self>) -> usize {
        let records = self.registry.lock().await.discover();

        let triggers = {
            let snapshot = self.snapshot.lock().await;
            let mut runtime = self.runtime.lock().await;
            reconcile(&records, &snapshot, &mut runtime);
            monitor::evaluate_once(&records, &runtime, self.probe.as_ref())
        };

        let mut started = 0;
        for trigger in triggers {
            warn!(
                pid = trigger.pid,
                service = %trigger.logical_name,
                reason = %trigger.reason,
                "threshold breach detected"
            );
            if self.spawn_restart_cycle(&trigger).await {
                started += 1;
            }
        }
        started
    }

    /// Live services joined with their restart state.
    pub async fn list_services(&self) -> Vec<ServiceStatus> {
        let records = self.registry.lock().await.discover();

        let snapshot = self.snapshot.lock().await;
        let mut runtime = self.runtime.lock().await;
        reconcile(&records, &snapshot, &mut runtime);

        records
            .into_iter()
            .map(|record| {
                let state = runtime.get(&record.pid);
                ServiceStatus {
                    policy: snapshot.policy(&record.logical_name).cloned(),
                    restarting: state.map_or(false, |s| s.restarting),
                    phase: state.map_or(RestartPhase::Idle, |s| s.phase),
                    record,
                }
            })
            .collect()
    }

    pub async fn service_detail(&self, pid: u32) -> Option<ServiceDetail> {
        self.registry.lock().await.service_detail(pid)
    }

    /// Start an artifact as a new detached service, applying any extra
    /// JVM arguments configured for its logical name.
    pub async fn start_service(&self, artifact: &Path) -> Result<u32> {
        let java_args = self.policy_java_args(&identity::logical_name(artifact)).await;
        let pid = launcher::launch(artifact, None, &java_args).await?;
        Ok(pid)
    }

    /// Stop a supervised process.
    ///
    /// Only processes launched from a recognized artifact may be stopped;
    /// any other pid is refused with `ServiceNotFound` so a caller mistake
    /// can never signal an unrelated system process. A pid whose restart
    /// cycle is in its delay window is not signalled at all (the process
    /// is already gone); the pending relaunch is cancelled instead. A pid
    /// mid-stop or mid-relaunch cannot be acted on and reports
    /// `RestartInProgress`.
    pub async fn stop_service(&self, pid: u32) -> Result<()> {
        enum Plan {
            CancelPending(String),
            Busy(String),
            Stop,
        }

        let plan = {
            let runtime = self.runtime.lock().await;
            match runtime.get(&pid) {
                Some(state) if state.restarting && state.phase == RestartPhase::Delaying => {
                    Plan::CancelPending(state.logical_name.clone())
                }
                Some(state) if state.restarting => Plan::Busy(state.logical_name.clone()),
                _ => Plan::Stop,
            }
        };

        match plan {
            Plan::CancelPending(name) => {
                let pending = self.pending.lock().await;
                if let Some(cancel) = pending.get(&name) {
                    info!(pid, service = %name, "cancelling pending relaunch");
                    let _ = cancel.send(true);
                    return Ok(());
                }
                // Delay window closed between the two locks; too late to
                // cancel, the relaunch is underway.
                Err(WardenError::RestartInProgress(name))
            }
            Plan::Busy(name) => Err(WardenError::RestartInProgress(name)),
            Plan::Stop => {
                if self.registry.lock().await.service_detail(pid).is_none() {
                    return Err(WardenError::ServiceNotFound(pid.to_string()));
                }
                launcher::stop(pid, self.options.stop_timeout).await?;
                self.runtime.lock().await.remove(&pid);
                Ok(())
            }
        }
    }

    /// Manually restart a live supervised process through the same cycle
    /// automatic breaches use.
    pub async fn restart_service(self: &Arc<Self>, pid: u32) -> Result<()> {
        let record = self
            .registry
            .lock()
            .await
            .service_detail(pid)
            .map(|detail| detail.record)
            .ok_or_else(|| WardenError::ServiceNotFound(pid.to_string()))?;

        let trigger = RestartTrigger {
            pid,
            logical_name: record.logical_name,
            artifact_path: record.artifact_path,
            kind: record.kind,
            reason: BreachReason::Manual,
        };

        if self.spawn_restart_cycle(&trigger).await {
            Ok(())
        } else {
            Err(WardenError::RestartInProgress(trigger.logical_name))
        }
    }

    /// The durable policy for a logical name, if one is configured.
    pub async fn auto_restart_config(&self, logical_name: &str) -> Option<AutoRestartPolicy> {
        self.snapshot.lock().await.policy(logical_name).cloned()
    }

    /// Policy lookup through a pid: resolves the pid to its logical name
    /// first, so the answer is the same one `auto_restart_config` gives
    /// before and after a restart cycle re-keys the process.
    pub async fn auto_restart_config_for_pid(&self, pid: u32) -> Option<AutoRestartPolicy> {
        let name = {
            let runtime = self.runtime.lock().await;
            runtime.get(&pid).map(|state| state.logical_name.clone())
        };
        let name = match name {
            Some(name) => name,
            None => {
                self.registry
                    .lock()
                    .await
                    .service_detail(pid)?
                    .record
                    .logical_name
            }
        };
        self.auto_restart_config(&name).await
    }

    /// Replace the durable policy for a logical name.
    ///
    /// The in-memory snapshot is the authority and is updated first; a
    /// failed save is reported but does not roll the memory state back.
    pub async fn set_auto_restart_config(
        &self,
        logical_name: &str,
        policy: AutoRestartPolicy,
    ) -> Result<()> {
        policy.validate()?;

        // The save happens under the snapshot lock so concurrent policy
        // writes cannot interleave on the durable file.
        {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.set_policy(logical_name, policy.clone());
            self.store.save(&snapshot)?;
        }

        if !policy.enabled {
            // Idle runtime entries for the name go away now; a cycle in
            // flight keeps its entry and finishes on its own.
            let name = logical_name.to_lowercase();
            let mut runtime = self.runtime.lock().await;
            runtime.retain(|_, state| state.logical_name != name || state.restarting);
        }

        info!(service = %logical_name, enabled = policy.enabled, "auto-restart policy updated");
        Ok(())
    }

    pub async fn folder_path(&self) -> Option<PathBuf> {
        self.snapshot.lock().await.folder_path.clone()
    }

    pub async fn set_folder_path(&self, folder: &Path) -> Result<()> {
        if !folder.is_dir() {
            return Err(WardenError::NotADirectory(folder.to_path_buf()));
        }

        let mut snapshot = self.snapshot.lock().await;
        snapshot.folder_path = Some(folder.to_path_buf());
        self.store.save(&snapshot)?;
        Ok(())
    }

    /// Launchable artifacts in the configured folder.
    pub async fn list_artifacts(&self) -> Result<Vec<ArtifactEntry>> {
        let folder = self
            .folder_path()
            .await
            .ok_or(WardenError::NoFolderConfigured)?;
        artifacts::list_artifacts(&folder)
    }

    /// The most recent restart failure for a logical name, cleared by the
    /// next successful relaunch.
    pub async fn last_error(&self, logical_name: &str) -> Option<String> {
        self.last_errors
            .lock()
            .await
            .get(&logical_name.to_lowercase())
            .cloned()
    }

    pub async fn restart_state(&self, pid: u32) -> Option<RestartRuntimeState> {
        self.runtime.lock().await.get(&pid).cloned()
    }

    /// Runtime state looked up by logical name, with the pid it is
    /// currently keyed under.
    pub async fn restart_state_for(
        &self,
        logical_name: &str,
    ) -> Option<(u32, RestartRuntimeState)> {
        let name = logical_name.to_lowercase();
        self.runtime
            .lock()
            .await
            .iter()
            .find(|(_, state)| state.logical_name == name)
            .map(|(pid, state)| (*pid, state.clone()))
    }

    /// Atomically claim the restart cycle for a trigger and spawn the
    /// cycle task. Returns false when a cycle for the same logical name is
    /// already in flight.
    async fn spawn_restart_cycle(self: &Arc<Self>, trigger: &RestartTrigger) -> bool {
        if !self.begin_cycle(trigger).await {
            info!(service = %trigger.logical_name, "restart already in progress, skipping");
            return false;
        }

        let supervisor = Arc::clone(self);
        let trigger = trigger.clone();
        tokio::spawn(async move {
            supervisor.run_restart_cycle(trigger).await;
        });
        true
    }

    /// Check-and-set of the `restarting` flag under the runtime lock: the
    /// single point of mutual exclusion between concurrent triggers for
    /// the same service.
    async fn begin_cycle(&self, trigger: &RestartTrigger) -> bool {
        let mut runtime = self.runtime.lock().await;

        let busy = runtime
            .values()
            .any(|state| state.logical_name == trigger.logical_name && state.restarting);
        if busy {
            return false;
        }

        let entry = runtime.entry(trigger.pid).or_insert_with(|| {
            // Manual restart of a service without a configured policy: a
            // placeholder state tracks the cycle and is dropped at the end.
            let jar_name = trigger
                .artifact_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            RestartRuntimeState::new(
                trigger.logical_name.clone(),
                AutoRestartPolicy::disabled(jar_name),
            )
        });
        if entry.restarting {
            return false;
        }
        entry.restarting = true;
        entry.phase = RestartPhase::Stopping;
        true
    }

    /// The full restart cycle: stop, cancellable delay, relaunch, re-key.
    async fn run_restart_cycle(self: Arc<Self>, trigger: RestartTrigger) {
        let name = trigger.logical_name.clone();
        info!(pid = trigger.pid, service = %name, reason = %trigger.reason, "restart cycle started");

        if let Err(e) = launcher::stop(trigger.pid, self.options.stop_timeout).await {
            error!(pid = trigger.pid, service = %name, error = %e, "restart aborted: stop failed");
            self.record_error(&name, format!("RestartFailed: {}", e))
                .await;
            self.finish_cycle(trigger.pid).await;
            return;
        }

        let delay = self.options.delay_for(&trigger.reason);
        if !self.delay_window(trigger.pid, &name, delay).await {
            // Cancelled by a manual stop; the entry is already gone.
            info!(service = %name, "pending relaunch cancelled, cycle abandoned");
            return;
        }

        let artifact = self.resolve_artifact(&trigger).await;
        let java_args = self.policy_java_args(&name).await;
        match launcher::launch(&artifact, None, &java_args).await {
            Ok(new_pid) => {
                self.rekey_after_relaunch(trigger.pid, new_pid, &name).await;
                info!(
                    old_pid = trigger.pid,
                    new_pid,
                    service = %name,
                    "restart cycle completed"
                );
            }
            Err(e) => {
                error!(service = %name, artifact = %artifact.display(), error = %e,
                    "restart failed: relaunch did not start");
                self.record_error(&name, format!("RestartFailed: {}", e))
                    .await;
                self.finish_cycle(trigger.pid).await;
            }
        }
    }

    /// Sit out the cool-down, watching for cancellation. Returns false if
    /// the cycle was cancelled (in which case the runtime entry has been
    /// removed).
    async fn delay_window(&self, pid: u32, name: &str, delay: Duration) -> bool {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.pending
            .lock()
            .await
            .insert(name.to_string(), cancel_tx);

        let deadline = Instant::now() + delay;
        {
            let mut runtime = self.runtime.lock().await;
            if let Some(state) = runtime.get_mut(&pid) {
                state.phase = RestartPhase::Delaying;
                state.restart_deadline = Some(deadline);
            }
        }
        info!(service = %name, ?delay, "waiting before relaunch");

        let cancelled = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => false,
            changed = cancel_rx.changed() => changed.is_ok() && *cancel_rx.borrow(),
        };

        self.pending.lock().await.remove(name);

        if cancelled {
            self.runtime.lock().await.remove(&pid);
            return false;
        }

        let mut runtime = self.runtime.lock().await;
        if let Some(state) = runtime.get_mut(&pid) {
            state.phase = RestartPhase::Relaunching;
            state.restart_deadline = None;
        }
        true
    }

    /// The artifact to relaunch from: the policy's artifact name resolved
    /// against the configured folder (flat, then the per-service subfolder
    /// layout), otherwise the path the process was observed running from.
    async fn resolve_artifact(&self, trigger: &RestartTrigger) -> PathBuf {
        let snapshot = self.snapshot.lock().await;
        if let (Some(folder), Some(policy)) = (
            snapshot.folder_path.as_ref(),
            snapshot.policy(&trigger.logical_name),
        ) {
            let flat = folder.join(&policy.jar_name);
            if flat.is_file() {
                return flat;
            }
            let nested = folder
                .join(identity::logical_name(Path::new(&policy.jar_name)))
                .join(&policy.jar_name);
            if nested.is_file() && identity::matches_subfolder_layout(&nested) {
                return nested;
            }
        }
        trigger.artifact_path.clone()
    }

    async fn policy_java_args(&self, name: &str) -> Vec<String> {
        self.snapshot
            .lock()
            .await
            .policy(name)
            .map(|policy| policy.java_args.clone())
            .unwrap_or_default()
    }

    /// Move the runtime entry from the old pid to the new one. A policy
    /// disabled (or removed) during the cycle means no entry is carried
    /// over; the relaunch itself already happened.
    async fn rekey_after_relaunch(&self, old_pid: u32, new_pid: u32, name: &str) {
        let policy = {
            let snapshot = self.snapshot.lock().await;
            snapshot.policy(name).filter(|p| p.enabled).cloned()
        };

        let mut runtime = self.runtime.lock().await;
        runtime.remove(&old_pid);
        if let Some(policy) = policy {
            runtime.insert(new_pid, RestartRuntimeState::new(name.to_string(), policy));
        }
        drop(runtime);

        self.last_errors.lock().await.remove(name);
    }

    async fn finish_cycle(&self, pid: u32) {
        let mut runtime = self.runtime.lock().await;
        if let Some(state) = runtime.get_mut(&pid) {
            state.restarting = false;
            state.phase = RestartPhase::Idle;
            state.restart_deadline = None;
        }
    }

    async fn record_error(&self, name: &str, message: String) {
        self.last_errors
            .lock()
            .await
            .insert(name.to_string(), message);
    }
}
