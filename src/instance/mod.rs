// Instance module - The supervised unit of work and its metadata

mod env;

pub use env::{InstanceEnv, RESERVED_ENV_PREFIX};

use crate::error::ConfigError;
use crate::health::{HealthCheckResult, HealthState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum length of an instance id
const MAX_ID_LEN: usize = 64;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Crashed,
    Failed,
}

impl InstanceStatus {
    /// Whether a process is expected to exist in this status
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping
        )
    }

    /// Whether the instance may be reaped from the registry
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped
                | InstanceStatus::Crashed
                | InstanceStatus::Error
                | InstanceStatus::Failed
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopping => write!(f, "stopping"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Error => write!(f, "error"),
            InstanceStatus::Crashed => write!(f, "crashed"),
            InstanceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reference to the OS process currently backing an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: u32,
    pub process_group_id: i32,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// One supervised worker process plus its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,
    pub workspace_path: PathBuf,
    pub session_ref: Option<String>,
    /// Command template the instance was created with
    pub command: String,
    pub extra_env: InstanceEnv,
    pub process_ref: Option<ProcessRef>,
    /// Incremented on every spawn attempt
    pub generation: u64,
    pub health_state: HealthState,
    pub health_check_count: u64,
    pub healthy_check_count: u64,
    pub recovery_attempt_count: u32,
    pub last_health: Option<HealthCheckResult>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: String,
        workspace_path: PathBuf,
        command: String,
        session_ref: Option<String>,
        extra_env: InstanceEnv,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: InstanceStatus::Starting,
            workspace_path,
            session_ref,
            command,
            extra_env,
            process_ref: None,
            generation: 0,
            health_state: HealthState::Healthy,
            health_check_count: 0,
            healthy_check_count: 0,
            recovery_attempt_count: 0,
            last_health: None,
            last_health_check_at: None,
            last_activity_at: now,
            last_exit_code: None,
            last_error: None,
            created_at: now,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process_ref.as_ref().map(|p| p.pid)
    }

    /// Render the command template for the current workspace
    ///
    /// Supported placeholders are `{instance_id}` and `{workspace}`. They are
    /// substituted word by word after splitting, and the words are quoted back
    /// together, so a workspace path with spaces stays a single argument.
    pub fn render_command(&self) -> Result<String, ConfigError> {
        let workspace = self.workspace_path.to_string_lossy();
        let argv = shlex::split(&self.command).ok_or_else(|| {
            ConfigError::Validation(format!("cannot parse command {:?}", self.command))
        })?;

        let rendered: Vec<String> = argv
            .iter()
            .map(|word| {
                word.replace("{instance_id}", &self.id)
                    .replace("{workspace}", &workspace)
            })
            .collect();

        shlex::try_join(rendered.iter().map(String::as_str))
            .map_err(|e| ConfigError::Validation(format!("cannot render command: {}", e)))
    }
}

/// Check that an instance id is usable as a file name component
pub fn validate_instance_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() {
        return Err(ConfigError::MissingField("id".to_string()));
    }

    if id.len() > MAX_ID_LEN {
        return Err(ConfigError::Validation(format!(
            "instance id '{}' exceeds {} characters",
            id, MAX_ID_LEN
        )));
    }

    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ConfigError::Validation(format!(
            "instance id '{}' contains invalid character '{}'",
            id, bad
        )));
    }

    if id == "." || id == ".." {
        return Err(ConfigError::Validation(format!(
            "instance id '{}' is reserved",
            id
        )));
    }

    Ok(())
}
