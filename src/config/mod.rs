use crate::error::ConfigError;
use crate::instance::{validate_instance_id, InstanceEnv};
use crate::process::parse_command;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// Fleet configuration: supervision policy plus the instances to run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Where instance snapshots are persisted (in-memory when unset)
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Root for per-instance workspaces of instances without a `workspace`
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time a process gets to exit after SIGTERM
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Maximum wait for another operation on the same instance
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Directory receiving `<id>.log` output files (output discarded when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Health check cadence and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    /// Consecutive failures before DEGRADED
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// Consecutive failures before UNHEALTHY
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,

    /// Consecutive passes that count as stable again
    #[serde(default = "default_stable_after")]
    pub stable_after: u32,

    #[serde(default)]
    pub max_cpu_percent: Option<f32>,

    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

/// Automatic restart policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// One instance started by the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,

    /// Command template; `{instance_id}` and `{workspace}` are substituted
    pub command: String,

    /// Explicit workspace directory, otherwise resolved under `workspace_root`
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

// Default value functions for serde
fn default_stop_timeout() -> u64 {
    10_000
}

fn default_lock_timeout() -> u64 {
    60_000
}

fn default_check_interval() -> u64 {
    30_000
}

fn default_check_timeout() -> u64 {
    5_000
}

fn default_degraded_after() -> u32 {
    2
}

fn default_unhealthy_after() -> u32 {
    4
}

fn default_stable_after() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_check_interval(),
            check_timeout_ms: default_check_timeout(),
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
            stable_after: default_stable_after(),
            max_cpu_percent: None,
            max_memory_bytes: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "health.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.check_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "health.check_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.degraded_after == 0 || self.stable_after == 0 {
            return Err(ConfigError::Validation(
                "health.degraded_after and health.stable_after must be at least 1".to_string(),
            ));
        }
        if self.unhealthy_after < self.degraded_after {
            return Err(ConfigError::Validation(format!(
                "health.unhealthy_after ({}) must not be below health.degraded_after ({})",
                self.unhealthy_after, self.degraded_after
            )));
        }
        if let Some(cpu) = self.max_cpu_percent {
            if !(cpu > 0.0) {
                return Err(ConfigError::Validation(
                    "health.max_cpu_percent must be positive".to_string(),
                ));
            }
        }
        if self.max_memory_bytes == Some(0) {
            return Err(ConfigError::Validation(
                "health.max_memory_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "recovery.max_delay_ms ({}) must not be below recovery.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

impl InstanceConfig {
    /// Validate the instance entry and build its environment
    pub fn validate(&self) -> Result<InstanceEnv> {
        validate_instance_id(&self.id)?;

        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "instances[{}].command",
                self.id
            )));
        }
        if parse_command(&self.command).is_none() {
            return Err(ConfigError::Validation(format!(
                "instance {}: cannot parse command {:?}",
                self.id, self.command
            )));
        }

        InstanceEnv::try_from(self.env.clone())
    }

    fn expand_env_vars(&mut self) {
        self.command = expand_env_in_string(&self.command);
        self.workspace = self.workspace.as_deref().map(expand_env_in_path);
        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

impl FleetConfig {
    /// Load a fleet configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<FleetConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    pub fn parse_toml(contents: &str) -> Result<FleetConfig> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse TOML: {}", e)))
    }

    pub fn parse_json(contents: &str) -> Result<FleetConfig> {
        serde_json::from_str(contents)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse JSON: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_policy()?;

        let mut seen = HashSet::new();
        for instance in &self.instances {
            instance.validate()?;
            if !seen.insert(instance.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate instance id: {}",
                    instance.id
                )));
            }
            if instance.workspace.is_none() && self.workspace_root.is_none() {
                return Err(ConfigError::MissingField(format!(
                    "instances[{}].workspace (or workspace_root)",
                    instance.id
                )));
            }
        }

        Ok(())
    }

    /// Validate the supervision, health and recovery sections
    ///
    /// Instances are left out; they are checked when started.
    pub fn validate_policy(&self) -> Result<()> {
        if self.supervisor.lock_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "supervisor.lock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.health.validate()?;
        self.recovery.validate()
    }

    fn expand_env_vars(&mut self) {
        self.state_file = self.state_file.as_deref().map(expand_env_in_path);
        self.workspace_root = self.workspace_root.as_deref().map(expand_env_in_path);
        self.supervisor.log_dir = self.supervisor.log_dir.as_deref().map(expand_env_in_path);
        for instance in &mut self.instances {
            instance.expand_env_vars();
        }
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment
fn expand_env_in_string(s: &str) -> String {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    // Longest names first so $HOME_DIR is not eaten by $HOME
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut result = s.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn instance(id: &str, command: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            command: command.to_string(),
            workspace: Some(PathBuf::from("/tmp")),
            branch: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();

        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.lock_timeout(), Duration::from_secs(60));
        assert_eq!(config.health.interval(), Duration::from_secs(30));
        assert_eq!(config.health.check_timeout(), Duration::from_secs(5));
        assert_eq!(config.health.degraded_after, 2);
        assert_eq!(config.health.unhealthy_after, 4);
        assert_eq!(config.health.stable_after, 5);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.base_delay(), Duration::from_secs(1));
        assert_eq!(config.recovery.max_delay(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_content = r#"
            state_file = "/var/lib/flotilla/state.json"
            workspace_root = "/srv/work"

            [health]
            interval_ms = 1000
            unhealthy_after = 3

            [recovery]
            max_attempts = 5

            [[instances]]
            id = "agent-1"
            command = "worker --id {instance_id}"
            branch = "main"

            [[instances]]
            id = "agent-2"
            command = "worker --id {instance_id}"
            workspace = "/tmp/agent-2"
            env = { MODE = "batch" }
        "#;

        let config = FleetConfig::parse_toml(toml_content).unwrap();
        assert_eq!(config.health.interval_ms, 1000);
        assert_eq!(config.health.unhealthy_after, 3);
        assert_eq!(config.health.degraded_after, 2);
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances[0].branch.as_deref(), Some("main"));
        assert_eq!(config.instances[1].env.get("MODE").map(String::as_str), Some("batch"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json_content = r#"
            {
                "recovery": { "base_delay_ms": 50, "max_delay_ms": 400 },
                "instances": [
                    { "id": "a", "command": "sleep 30", "workspace": "/tmp" }
                ]
            }
        "#;

        let config = FleetConfig::parse_json(json_content).unwrap();
        assert_eq!(config.recovery.base_delay_ms, 50);
        assert_eq!(config.instances[0].id, "a");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_threshold_order() {
        let mut config = FleetConfig::default();
        config.health.degraded_after = 5;
        config.health.unhealthy_after = 3;

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_delay_order() {
        let mut config = FleetConfig::default();
        config.recovery.base_delay_ms = 10_000;
        config.recovery.max_delay_ms = 1_000;

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let mut config = FleetConfig::default();
        config.instances = vec![instance("a", "sleep 1"), instance("a", "sleep 2")];

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_instance_fields() {
        let mut config = FleetConfig::default();
        config.instances = vec![instance("bad/id", "sleep 1")];
        assert!(config.validate().is_err());

        config.instances = vec![instance("a", "   ")];
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));

        config.instances = vec![instance("a", "echo 'unterminated")];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut reserved = instance("a", "sleep 1");
        reserved.env.insert("FLOTILLA_INSTANCE_ID".to_string(), "x".to_string());
        config.instances = vec![reserved];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_workspace_source() {
        let mut config = FleetConfig::default();
        let mut entry = instance("a", "sleep 1");
        entry.workspace = None;
        config.instances = vec![entry];
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));

        config.workspace_root = Some(PathBuf::from("/tmp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("FLEET_TEST_ROOT", "/tmp/fleet");
        std::env::set_var("FLEET_TEST_MODE", "fast");

        let mut config = FleetConfig::default();
        config.state_file = Some(PathBuf::from("$FLEET_TEST_ROOT/state.json"));
        let mut entry = instance("a", "worker --mode ${FLEET_TEST_MODE}");
        entry.workspace = Some(PathBuf::from("${FLEET_TEST_ROOT}/a"));
        entry.env.insert("MODE".to_string(), "$FLEET_TEST_MODE".to_string());
        config.instances = vec![entry];

        config.expand_env_vars();

        assert_eq!(config.state_file, Some(PathBuf::from("/tmp/fleet/state.json")));
        assert_eq!(config.instances[0].command, "worker --mode fast");
        assert_eq!(config.instances[0].workspace, Some(PathBuf::from("/tmp/fleet/a")));
        assert_eq!(config.instances[0].env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn test_from_file_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("fleet.toml");

        fs::write(
            &config_path,
            r#"
                [[instances]]
                id = "test-app"
                command = "sleep 5"
                workspace = "/tmp"
            "#,
        )
        .unwrap();

        let config = FleetConfig::from_file(&config_path).unwrap();
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].id, "test-app");
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("fleet.yaml");
        fs::write(&config_path, "instances: []").unwrap();

        let result = FleetConfig::from_file(&config_path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file_missing() {
        let result = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }
}
