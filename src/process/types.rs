use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;

/// Lifecycle of a tracked OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Running,
    Stopping,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Running => write!(f, "running"),
            RecordStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// The supervisor's view of one live process group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub instance_id: String,
    pub pid: u32,
    pub process_group_id: i32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub generation: u64,
    pub status: RecordStatus,
    /// False for processes adopted from a previous control plane
    pub owned: bool,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Exit of a process we could only poll, so the status is unknown
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}
