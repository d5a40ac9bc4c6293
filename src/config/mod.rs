use crate::error::ConfigError;
use crate::service::types::{RestartRuntimeState, ServiceRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Validation limits for policy thresholds.
const CPU_THRESHOLD_MIN: f64 = 1.0;
const CPU_THRESHOLD_MAX: f64 = 100.0;
const MEMORY_THRESHOLD_MIN_MB: f64 = 1.0;
const MEMORY_THRESHOLD_MAX_MB: f64 = 10_240.0;
const QUEUE_THRESHOLD_MIN: u64 = 1;
const QUEUE_THRESHOLD_MAX: u64 = 1_000_000;

/// Auto-restart policy for one logical service. Durable, keyed by logical
/// name so it survives both process restarts (pid churn) and supervisor
/// restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRestartPolicy {
    pub enabled: bool,

    /// CPU threshold in percent.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    /// Memory threshold in megabytes, as stored in the durable file.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,

    /// Queue-depth threshold in messages. Optional: platforms without a
    /// host queue facility simply never breach it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_threshold: Option<u64>,

    /// Artifact filename the service is relaunched from.
    pub jar_name: String,

    /// Extra JVM arguments inserted before `-jar` when relaunching a JAR
    /// service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub java_args: Vec<String>,
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_memory_threshold_mb() -> f64 {
    1000.0
}

impl AutoRestartPolicy {
    pub fn new(jar_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cpu_threshold: default_cpu_threshold(),
            memory_threshold_mb: default_memory_threshold_mb(),
            queue_threshold: None,
            jar_name: jar_name.into(),
            java_args: Vec::new(),
        }
    }

    /// A placeholder policy used for tracking manual restart cycles of
    /// services without a configured policy.
    pub fn disabled(jar_name: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(jar_name)
        }
    }

    pub fn memory_threshold_bytes(&self) -> u64 {
        (self.memory_threshold_mb * 1024.0 * 1024.0) as u64
    }

    pub fn validate(&self) -> Result<(), crate::error::WardenError> {
        use crate::error::WardenError::InvalidPolicy;

        if !(CPU_THRESHOLD_MIN..=CPU_THRESHOLD_MAX).contains(&self.cpu_threshold) {
            return Err(InvalidPolicy(format!(
                "cpu_threshold must be between {} and {}",
                CPU_THRESHOLD_MIN, CPU_THRESHOLD_MAX
            )));
        }
        if !(MEMORY_THRESHOLD_MIN_MB..=MEMORY_THRESHOLD_MAX_MB).contains(&self.memory_threshold_mb)
        {
            return Err(InvalidPolicy(format!(
                "memory_threshold_mb must be between {} and {}",
                MEMORY_THRESHOLD_MIN_MB, MEMORY_THRESHOLD_MAX_MB
            )));
        }
        if let Some(queue) = self.queue_threshold {
            if !(QUEUE_THRESHOLD_MIN..=QUEUE_THRESHOLD_MAX).contains(&queue) {
                return Err(InvalidPolicy(format!(
                    "queue_threshold must be between {} and {}",
                    QUEUE_THRESHOLD_MIN, QUEUE_THRESHOLD_MAX
                )));
            }
        }
        Ok(())
    }
}

/// The durable configuration snapshot: an ordered mapping of logical name
/// to policy plus the single global artifact folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub auto_restart: BTreeMap<String, AutoRestartPolicy>,

    #[serde(default)]
    pub folder_path: Option<PathBuf>,
}

impl ConfigSnapshot {
    /// Look up a policy by logical name, case-insensitively.
    pub fn policy(&self, logical_name: &str) -> Option<&AutoRestartPolicy> {
        self.auto_restart.get(&logical_name.to_lowercase())
    }

    pub fn set_policy(&mut self, logical_name: &str, policy: AutoRestartPolicy) {
        self.auto_restart
            .insert(logical_name.to_lowercase(), policy);
    }

    pub fn remove_policy(&mut self, logical_name: &str) -> Option<AutoRestartPolicy> {
        self.auto_restart.remove(&logical_name.to_lowercase())
    }
}

/// Durable JSON store for the configuration snapshot.
///
/// Reads never observe a partially written file: saves go to a temp file
/// in the same directory followed by an atomic rename.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot from disk. A missing file yields an empty
    /// snapshot; a file that exists but cannot be parsed yields
    /// `ConfigError::Corrupt` so the caller can fall back explicitly.
    pub fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        if !self.path.exists() {
            return Ok(ConfigSnapshot::default());
        }

        let file = File::open(&self.path)
            .map_err(|e| ConfigError::Corrupt(format!("failed to open config file: {}", e)))?;
        let reader = BufReader::new(file);

        serde_json::from_reader(reader)
            .map_err(|e| ConfigError::Corrupt(format!("failed to parse config file: {}", e)))
    }

    pub fn save(&self, snapshot: &ConfigSnapshot) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ConfigError::WriteFailed(format!("failed to create config directory: {}", e))
                })?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path).map_err(|e| {
                ConfigError::WriteFailed(format!("failed to create temp config file: {}", e))
            })?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, snapshot).map_err(|e| {
                ConfigError::WriteFailed(format!("failed to serialize config: {}", e))
            })?;
            writer
                .flush()
                .map_err(|e| ConfigError::WriteFailed(format!("failed to flush config: {}", e)))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            ConfigError::WriteFailed(format!("failed to rename temp config file: {}", e))
        })
    }
}

/// Reconcile the live process view against the durable snapshot.
///
/// For every live record whose logical name has an enabled policy, produce
/// or retain a runtime-state entry keyed by the current pid (refreshing the
/// policy copy so threshold edits take effect on the next pass). Entries
/// whose pid is no longer live are dropped unless a restart cycle is in
/// flight for them; the cycle itself re-keys the entry on completion.
pub fn reconcile(
    live: &[ServiceRecord],
    snapshot: &ConfigSnapshot,
    states: &mut HashMap<u32, RestartRuntimeState>,
) {
    for record in live {
        let enabled_policy = snapshot
            .policy(&record.logical_name)
            .filter(|p| p.enabled)
            .cloned();

        match enabled_policy {
            Some(policy) => {
                states
                    .entry(record.pid)
                    .and_modify(|state| state.policy = policy.clone())
                    .or_insert_with(|| {
                        RestartRuntimeState::new(record.logical_name.clone(), policy)
                    });
            }
            None => {
                // Policy removed or disabled while the process is idle.
                let idle = states.get(&record.pid).map_or(false, |s| !s.restarting);
                if idle {
                    states.remove(&record.pid);
                }
            }
        }
    }

    let live_pids: HashSet<u32> = live.iter().map(|r| r.pid).collect();
    states.retain(|pid, state| live_pids.contains(pid) || state.restarting);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::types::{ArtifactKind, RestartPhase};
    use tempfile::TempDir;

    fn record(pid: u32, name: &str) -> ServiceRecord {
        ServiceRecord {
            pid,
            logical_name: name.to_string(),
            artifact_path: PathBuf::from(format!("/opt/apps/{}.jar", name)),
            kind: ArtifactKind::JarLike,
            cpu_percent: 0.0,
            memory_bytes: 0,
            start_time: 0,
            uptime_secs: 0,
            thread_count: None,
            cmdline: String::new(),
            cwd: None,
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy = AutoRestartPolicy::new("billing.jar");
        assert!(policy.enabled);
        assert_eq!(policy.cpu_threshold, 80.0);
        assert_eq!(policy.memory_threshold_mb, 1000.0);
        assert_eq!(policy.queue_threshold, None);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_validation_ranges() {
        let mut policy = AutoRestartPolicy::new("billing.jar");
        policy.cpu_threshold = 0.5;
        assert!(policy.validate().is_err());

        policy.cpu_threshold = 101.0;
        assert!(policy.validate().is_err());

        policy.cpu_threshold = 80.0;
        policy.memory_threshold_mb = 20_000.0;
        assert!(policy.validate().is_err());

        policy.memory_threshold_mb = 512.0;
        policy.queue_threshold = Some(0);
        assert!(policy.validate().is_err());

        policy.queue_threshold = Some(25_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_java_args_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("monitor_config.json"));

        let mut snapshot = ConfigSnapshot::default();
        let mut policy = AutoRestartPolicy::new("billing.jar");
        policy.java_args = vec!["-Xmx512m".to_string(), "-Dapp.env=prod".to_string()];
        snapshot.set_policy("billing", policy.clone());
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.policy("billing"), Some(&policy));

        // Files written before the field existed load with no extra args.
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("java_args"));
        let older = r#"{"auto_restart":{"billing":{"enabled":true,"jar_name":"billing.jar"}}}"#;
        fs::write(store.path(), older).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.policy("billing").unwrap().java_args.is_empty());
    }

    #[test]
    fn test_memory_threshold_bytes() {
        let mut policy = AutoRestartPolicy::new("billing.jar");
        policy.memory_threshold_mb = 1000.0;
        assert_eq!(policy.memory_threshold_bytes(), 1000 * 1024 * 1024);
    }

    #[test]
    fn test_snapshot_lookup_case_insensitive() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.set_policy("Billing", AutoRestartPolicy::new("Billing.jar"));

        assert!(snapshot.policy("billing").is_some());
        assert!(snapshot.policy("BILLING").is_some());
        assert!(snapshot.policy("other").is_none());
    }

    #[test]
    fn test_store_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("monitor_config.json"));

        let snapshot = store.load().unwrap();
        assert!(snapshot.auto_restart.is_empty());
        assert!(snapshot.folder_path.is_none());
    }

    #[test]
    fn test_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("monitor_config.json"));

        let mut snapshot = ConfigSnapshot::default();
        let mut policy = AutoRestartPolicy::new("billing.jar");
        policy.cpu_threshold = 85.0;
        policy.memory_threshold_mb = 1500.0;
        policy.queue_threshold = Some(25_000);
        snapshot.set_policy("billing", policy);
        snapshot.folder_path = Some(PathBuf::from("/opt/apps"));

        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_store_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("monitor_config.json");
        fs::write(&path, "{ not valid json").unwrap();

        let store = ConfigStore::new(&path);
        assert!(matches!(store.load(), Err(ConfigError::Corrupt(_))));
    }

    #[test]
    fn test_store_atomic_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("monitor_config.json"));

        let mut first = ConfigSnapshot::default();
        first.set_policy("billing", AutoRestartPolicy::new("billing.jar"));
        store.save(&first).unwrap();

        let mut second = ConfigSnapshot::default();
        second.set_policy("invoicing", AutoRestartPolicy::new("invoicing.jar"));
        store.save(&second).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.policy("billing").is_none());
        assert!(loaded.policy("invoicing").is_some());
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_store_json_field_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("monitor_config.json"));

        let mut snapshot = ConfigSnapshot::default();
        snapshot.set_policy("billing", AutoRestartPolicy::new("billing.jar"));
        store.save(&snapshot).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value["auto_restart"]["billing"];
        assert_eq!(entry["enabled"], serde_json::json!(true));
        assert_eq!(entry["cpu_threshold"], serde_json::json!(80.0));
        assert_eq!(entry["memory_threshold_mb"], serde_json::json!(1000.0));
        assert_eq!(entry["jar_name"], serde_json::json!("billing.jar"));
    }

    #[test]
    fn test_reconcile_creates_entries_for_enabled_policies() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.set_policy("billing", AutoRestartPolicy::new("billing.jar"));
        snapshot.set_policy("batch", AutoRestartPolicy::disabled("batch.jar"));

        let live = vec![record(100, "billing"), record(200, "batch"), record(300, "other")];
        let mut states = HashMap::new();

        reconcile(&live, &snapshot, &mut states);

        assert_eq!(states.len(), 1);
        assert_eq!(states[&100].logical_name, "billing");
        assert!(!states[&100].restarting);
    }

    #[test]
    fn test_reconcile_drops_dead_idle_entries() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.set_policy("billing", AutoRestartPolicy::new("billing.jar"));

        let mut states = HashMap::new();
        states.insert(
            100,
            RestartRuntimeState::new("billing".into(), AutoRestartPolicy::new("billing.jar")),
        );

        reconcile(&[], &snapshot, &mut states);
        assert!(states.is_empty());
    }

    #[test]
    fn test_reconcile_keeps_restarting_entries_with_dead_pid() {
        let snapshot = ConfigSnapshot::default();

        let mut state =
            RestartRuntimeState::new("billing".into(), AutoRestartPolicy::new("billing.jar"));
        state.restarting = true;
        state.phase = RestartPhase::Delaying;
        let mut states = HashMap::new();
        states.insert(100, state);

        reconcile(&[], &snapshot, &mut states);
        assert!(states.contains_key(&100));
        assert!(states[&100].restarting);
    }

    #[test]
    fn test_reconcile_refreshes_policy_copy() {
        let mut snapshot = ConfigSnapshot::default();
        let mut policy = AutoRestartPolicy::new("billing.jar");
        policy.cpu_threshold = 50.0;
        snapshot.set_policy("billing", policy);

        let live = vec![record(100, "billing")];
        let mut states = HashMap::new();
        reconcile(&live, &snapshot, &mut states);
        assert_eq!(states[&100].policy.cpu_threshold, 50.0);

        let mut updated = AutoRestartPolicy::new("billing.jar");
        updated.cpu_threshold = 90.0;
        snapshot.set_policy("billing", updated);
        reconcile(&live, &snapshot, &mut states);
        assert_eq!(states[&100].policy.cpu_threshold, 90.0);
    }

    #[test]
    fn test_policy_survives_pid_change() {
        // Process P1 restarts as P2; the name-keyed policy answers with the
        // same thresholds before and after.
        let mut snapshot = ConfigSnapshot::default();
        let mut policy = AutoRestartPolicy::new("svc.jar");
        policy.cpu_threshold = 85.0;
        policy.memory_threshold_mb = 1500.0;
        snapshot.set_policy("svc", policy.clone());

        let mut states = HashMap::new();
        reconcile(&[record(100, "svc")], &snapshot, &mut states);
        assert_eq!(states[&100].policy, policy);

        reconcile(&[record(250, "svc")], &snapshot, &mut states);
        assert!(!states.contains_key(&100));
        assert_eq!(states[&250].policy, policy);
        assert_eq!(snapshot.policy("svc"), Some(&policy));
    }
}
