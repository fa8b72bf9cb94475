// Providers - Workspace and session collaborators consumed by the orchestrator

use crate::error::{SessionError, WorkspaceError};
use std::fs;
use std::path::{Path, PathBuf};

/// Provisions the isolated filesystem location an instance works in
pub trait WorkspaceProvider: Send + Sync {
    fn resolve(&self, instance_id: &str, branch: Option<&str>) -> Result<PathBuf, WorkspaceError>;
}

/// Command rewritten by a session provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedCommand {
    pub command: String,
    pub session_ref: String,
}

/// Wraps an instance command in a persistent terminal session
pub trait SessionProvider: Send + Sync {
    fn wrap(
        &self,
        command: &str,
        workdir: &Path,
        instance_id: &str,
    ) -> Result<WrappedCommand, SessionError>;
}

/// Workspace provider handing out one directory per instance under a root
///
/// The directory is `<root>/<id>`, or `<root>/<id>-<branch>` when a branch is
/// requested. Branch names are flattened so they cannot escape the root.
#[derive(Debug, Clone)]
pub struct DirectoryWorkspaceProvider {
    root: PathBuf,
}

impl DirectoryWorkspaceProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sanitize_branch(branch: &str) -> String {
        branch
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>()
            .trim_matches('.')
            .to_string()
    }
}

impl WorkspaceProvider for DirectoryWorkspaceProvider {
    fn resolve(&self, instance_id: &str, branch: Option<&str>) -> Result<PathBuf, WorkspaceError> {
        crate::instance::validate_instance_id(instance_id)
            .map_err(|e| WorkspaceError::Invalid(instance_id.to_string(), e.to_string()))?;

        let dir_name = match branch {
            Some(branch) => {
                let branch = Self::sanitize_branch(branch);
                if branch.is_empty() {
                    return Err(WorkspaceError::Invalid(
                        instance_id.to_string(),
                        "branch name is empty after sanitizing".to_string(),
                    ));
                }
                format!("{}-{}", instance_id, branch)
            }
            None => instance_id.to_string(),
        };

        let path = self.root.join(dir_name);
        fs::create_dir_all(&path).map_err(|e| {
            WorkspaceError::Unavailable(
                instance_id.to_string(),
                format!("cannot create {}: {}", path.display(), e),
            )
        })?;

        Ok(path)
    }
}
