use crate::config::InstanceConfig;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything needed to create an instance
#[derive(Debug, Clone, Default)]
pub struct InstanceSpec {
    pub id: String,
    /// Command template; `{instance_id}` and `{workspace}` are substituted
    pub command: String,
    /// Resolved through the workspace provider when absent
    pub workspace_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub session_ref: Option<String>,
    pub env: HashMap<String, String>,
}

impl InstanceSpec {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn session_ref(mut self, session_ref: impl Into<String>) -> Self {
        self.session_ref = Some(session_ref.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl From<&InstanceConfig> for InstanceSpec {
    fn from(config: &InstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone(),
            workspace_path: config.workspace.clone(),
            branch: config.branch.clone(),
            session_ref: None,
            env: config.env.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_methods() {
        let spec = InstanceSpec::new("a", "sleep 1")
            .workspace("/tmp/a")
            .branch("main")
            .session_ref("tmux:a")
            .env("MODE", "fast");

        assert_eq!(spec.id, "a");
        assert_eq!(spec.workspace_path, Some(PathBuf::from("/tmp/a")));
        assert_eq!(spec.branch.as_deref(), Some("main"));
        assert_eq!(spec.session_ref.as_deref(), Some("tmux:a"));
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn test_from_instance_config() {
        let config = InstanceConfig {
            id: "b".to_string(),
            command: "worker".to_string(),
            workspace: None,
            branch: Some("dev".to_string()),
            env: HashMap::new(),
        };

        let spec = InstanceSpec::from(&config);
        assert_eq!(spec.id, "b");
        assert!(spec.workspace_path.is_none());
        assert_eq!(spec.branch.as_deref(), Some("dev"));
    }
}
