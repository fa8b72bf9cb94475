use crate::error::ProcessError;
use crate::instance::{InstanceEnv, RESERVED_ENV_PREFIX};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Everything needed to start one process generation of an instance
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub instance_id: String,
    /// Fully rendered command line, split with shell-word rules
    pub command: String,
    pub workdir: PathBuf,
    pub env: InstanceEnv,
    pub generation: u64,
}

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    /// Process group the child leads
    pub process_group_id: i32,
}

/// Split a command line into program and arguments
pub fn parse_command(command: &str) -> Option<Vec<String>> {
    let argv = shlex::split(command)?;
    if argv.is_empty() || argv[0].is_empty() {
        return None;
    }
    Some(argv)
}

/// Spawn a process in its own process group
///
/// The child gets the instance environment plus `FLOTILLA_INSTANCE_ID` and
/// `FLOTILLA_WORKSPACE`. Output goes to `log_file` (appended) when given,
/// otherwise it is discarded.
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Successfully spawned process with metadata
/// * `Err(ProcessError::SpawnFailed)` - Nothing was started
pub fn spawn_process(
    request: &SpawnRequest,
    log_file: Option<&Path>,
) -> Result<SpawnedProcess, ProcessError> {
    let id = request.instance_id.as_str();

    if !request.workdir.is_dir() {
        return Err(ProcessError::spawn_failed(
            id,
            format!(
                "working directory does not exist: {}",
                request.workdir.display()
            ),
        ));
    }

    let argv = parse_command(&request.command).ok_or_else(|| {
        ProcessError::spawn_failed(id, format!("cannot parse command: {:?}", request.command))
    })?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .current_dir(&request.workdir)
        .stdin(Stdio::null())
        .kill_on_drop(false);

    for (key, value) in request.env.iter() {
        command.env(key, value);
    }
    command.env(format!("{}INSTANCE_ID", RESERVED_ENV_PREFIX), id);
    command.env(format!("{}WORKSPACE", RESERVED_ENV_PREFIX), &request.workdir);

    match log_file {
        Some(path) => {
            let (stdout, stderr) = open_log(path)
                .map_err(|e| ProcessError::spawn_failed(id, format!("cannot open log: {}", e)))?;
            command.stdout(stdout).stderr(stderr);
        }
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    // Leading a fresh group keeps group signals away from the supervisor
    #[cfg(unix)]
    command.process_group(0);

    let child = command
        .spawn()
        .map_err(|e| ProcessError::spawn_failed(id, format!("{}: {}", argv[0], e)))?;

    let pid = child
        .id()
        .ok_or_else(|| ProcessError::spawn_failed(id, "failed to get process ID"))?;

    Ok(SpawnedProcess {
        child,
        pid,
        process_group_id: pid as i32,
    })
}

fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(command: &str, workdir: &Path) -> SpawnRequest {
        SpawnRequest {
            instance_id: "spawn-test".to_string(),
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
            env: InstanceEnv::empty(),
            generation: 1,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("sh -c 'echo hi'").unwrap(),
            vec!["sh", "-c", "echo hi"]
        );
        assert!(parse_command("").is_none());
        assert!(parse_command("   ").is_none());
        assert!(parse_command("echo 'unterminated").is_none());
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let temp_dir = TempDir::new().unwrap();
        let mut spawned = spawn_process(&request("echo hello", temp_dir.path()), None).unwrap();

        assert!(spawned.pid > 0);
        assert_eq!(spawned.process_group_id, spawned.pid as i32);
        assert!(spawned.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_runs_in_workdir_with_env() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("logs").join("out.log");

        let mut req = request(
            "sh -c 'echo \"$MODE $FLOTILLA_INSTANCE_ID $(pwd)\"'",
            temp_dir.path(),
        );
        req.env = InstanceEnv::new([("MODE", "fast")]).unwrap();

        let mut spawned = spawn_process(&req, Some(&log)).unwrap();
        assert!(spawned.child.wait().await.unwrap().success());

        let output = fs::read_to_string(&log).unwrap();
        assert!(output.contains("fast spawn-test"));
        let canonical = temp_dir.path().canonicalize().unwrap();
        assert!(output.trim_end().ends_with(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let temp_dir = TempDir::new().unwrap();
        let result = spawn_process(&request("/nonexistent/worker --flag", temp_dir.path()), None);

        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let result = spawn_process(
            &request("echo hi", Path::new("/nonexistent/directory")),
            None,
        );

        match result {
            Err(ProcessError::SpawnFailed { reason, .. }) => {
                assert!(reason.contains("does not exist"));
            }
            other => panic!("Expected SpawnFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_unparseable_command() {
        let temp_dir = TempDir::new().unwrap();
        let result = spawn_process(&request("'", temp_dir.path()), None);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }
}
