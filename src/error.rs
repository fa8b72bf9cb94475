use std::time::Duration;
use thiserror::Error;

/// Failures raised by the process supervisor
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn process for {instance_id}: {reason}")]
    SpawnFailed { instance_id: String, reason: String },

    #[error("No live process for instance {0}")]
    NotFound(String),

    #[error("Failed to terminate {instance_id}: {reason}")]
    TerminateFailed { instance_id: String, reason: String },
}

impl ProcessError {
    pub(crate) fn spawn_failed(instance_id: &str, reason: impl Into<String>) -> Self {
        ProcessError::SpawnFailed {
            instance_id: instance_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn terminate_failed(instance_id: &str, reason: impl Into<String>) -> Self {
        ProcessError::TerminateFailed {
            instance_id: instance_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by the orchestrator to its callers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Timed out after {waited:?} waiting for the lock on instance {instance_id}")]
    LockTimeout {
        instance_id: String,
        waited: Duration,
    },

    #[error("Instance {instance_id} is {status}, cannot {operation}")]
    InvalidState {
        instance_id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors passed through from a workspace provider
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid workspace request for {0}: {1}")]
    Invalid(String, String),

    #[error("Workspace for {0} is unavailable: {1}")]
    Unavailable(String, String),

    #[error("Workspace IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors passed through from a session provider
#[derive(Debug, Error)]
#[error("Session provider failed for {instance_id}: {reason}")]
pub struct SessionError {
    pub instance_id: String,
    pub reason: String,
}

/// State store errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to load state: {0}")]
    Load(String),

    #[error("Failed to save state: {0}")]
    Save(String),

    #[error("State corruption detected: {0}")]
    Corruption(String),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Invalid configuration file: {0}")]
    Invalid(String),

    #[error("Missing required configuration field: {0}")]
    MissingField(String),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
