use crate::error::ProcessError;
use crate::instance::{Instance, InstanceStatus, ProcessRef};
use crate::process::monitor::{ProcessMonitor, ResourceSample};
use crate::process::signals::{self, Delivery, StopSignal};
use crate::process::spawner::{spawn_process, SpawnRequest};
use crate::process::types::{ExitOutcome, ProcessRecord, RecordStatus};
use crate::registry::InstanceRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to wait for the kernel to reap a group after SIGKILL
const FORCE_GRACE: Duration = Duration::from_secs(1);

/// Poll period for processes we adopted but cannot `wait()` on
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

type ExitReceiver = watch::Receiver<Option<ExitOutcome>>;

struct TrackedProcess {
    record: ProcessRecord,
    stop_requested: Arc<AtomicBool>,
    exited: ExitReceiver,
}

type ProcessTable = Arc<Mutex<HashMap<String, TrackedProcess>>>;

/// Owns every OS process the fleet runs
///
/// Each instance runs as the leader of its own process group so stop
/// signals reach the whole tree. A background task per process waits for
/// the exit, writes STOPPED or CRASHED into the registry and then wakes any
/// caller blocked in [`terminate`].
///
/// [`terminate`]: ProcessSupervisor::terminate
pub struct ProcessSupervisor {
    registry: Arc<InstanceRegistry>,
    table: ProcessTable,
    monitor: Mutex<ProcessMonitor>,
    log_dir: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<InstanceRegistry>, log_dir: Option<PathBuf>) -> Self {
        Self {
            registry,
            table: Arc::new(Mutex::new(HashMap::new())),
            monitor: Mutex::new(ProcessMonitor::new()),
            log_dir,
        }
    }

    /// Start a new process generation for an instance
    ///
    /// The instance moves to STARTING, then to RUNNING once the OS accepted
    /// the process. On failure nothing is tracked and the status is left for
    /// the caller to settle.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ProcessRecord, ProcessError> {
        let id = request.instance_id.clone();
        let generation = request.generation;

        if self.table.lock().contains_key(&id) {
            return Err(ProcessError::spawn_failed(
                &id,
                "a live process is still tracked for this instance",
            ));
        }

        self.registry
            .transition(&id, Some(generation), InstanceStatus::Starting, |instance| {
                instance.process_ref = None;
            });

        let log_file = self
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", id)));
        let spawned = spawn_process(&request, log_file.as_deref())?;

        let record = ProcessRecord {
            instance_id: id.clone(),
            pid: spawned.pid,
            process_group_id: spawned.process_group_id,
            command: request.command.clone(),
            started_at: Utc::now(),
            generation,
            status: RecordStatus::Running,
            owned: true,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop_requested = Arc::new(AtomicBool::new(false));
        self.table.lock().insert(
            id.clone(),
            TrackedProcess {
                record: record.clone(),
                stop_requested: Arc::clone(&stop_requested),
                exited: exit_rx,
            },
        );

        let process_ref = ProcessRef {
            pid: record.pid,
            process_group_id: record.process_group_id,
            generation,
            started_at: record.started_at,
        };
        self.registry
            .transition(&id, Some(generation), InstanceStatus::Running, |instance| {
                instance.process_ref = Some(process_ref);
                instance.last_exit_code = None;
                instance.last_error = None;
            });

        info!(
            instance_id = %id,
            pid = record.pid,
            generation,
            "Spawned process: {}",
            record.command
        );

        let reaper = Reaper {
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            instance_id: id,
            generation,
            process_group_id: record.process_group_id,
            stop_requested,
            exit_tx,
        };
        tokio::spawn(reaper.wait_child(spawned.child));

        Ok(record)
    }

    /// Current CPU and memory usage of an instance's process
    pub fn sample(&self, instance_id: &str) -> Result<ResourceSample, ProcessError> {
        let pid = self
            .table
            .lock()
            .get(instance_id)
            .map(|tracked| tracked.record.pid)
            .ok_or_else(|| ProcessError::NotFound(instance_id.to_string()))?;

        self.monitor
            .lock()
            .sample(pid)
            .ok_or_else(|| ProcessError::NotFound(instance_id.to_string()))
    }

    /// Ask the process group to exit
    ///
    /// Marks the exit as intentional so it is classified STOPPED. Returns
    /// false when nothing was running.
    pub fn request_graceful_stop(&self, instance_id: &str) -> Result<bool, ProcessError> {
        self.send_stop(instance_id, StopSignal::Graceful)
    }

    /// Kill the whole process group
    pub fn force_stop(&self, instance_id: &str) -> Result<bool, ProcessError> {
        self.send_stop(instance_id, StopSignal::Forced)
    }

    fn send_stop(&self, instance_id: &str, kind: StopSignal) -> Result<bool, ProcessError> {
        let (process_group_id, generation) = {
            let mut table = self.table.lock();
            let Some(tracked) = table.get_mut(instance_id) else {
                return Ok(false);
            };
            tracked.stop_requested.store(true, Ordering::SeqCst);
            tracked.record.status = RecordStatus::Stopping;
            (tracked.record.process_group_id, tracked.record.generation)
        };

        self.registry.transition_if(
            instance_id,
            |instance| {
                instance.generation == generation
                    && matches!(
                        instance.status,
                        InstanceStatus::Starting | InstanceStatus::Running
                    )
            },
            InstanceStatus::Stopping,
            |_| {},
        );

        debug!(instance_id = %instance_id, ?kind, process_group_id, "Signalling process group");

        match signals::signal_group(process_group_id, kind) {
            Ok(Delivery::Delivered) => Ok(true),
            Ok(Delivery::Gone) => Ok(false),
            Err(reason) => Err(ProcessError::terminate_failed(instance_id, reason)),
        }
    }

    /// Stop an instance's process, escalating to a forced kill
    ///
    /// Returns true once the process is confirmed dead. An instance with no
    /// tracked process is already dead.
    pub async fn terminate(&self, instance_id: &str, timeout: Duration) -> Result<bool, ProcessError> {
        let Some(exited) = self.exit_receiver(instance_id) else {
            return Ok(true);
        };

        info!(instance_id = %instance_id, "Terminating process (timeout {:?})", timeout);

        if !timeout.is_zero() {
            match self.request_graceful_stop(instance_id) {
                Ok(_) => {
                    if wait_for_exit(exited.clone(), timeout).await {
                        return Ok(true);
                    }
                    warn!(
                        instance_id = %instance_id,
                        "Process did not exit within {:?}, sending SIGKILL",
                        timeout
                    );
                }
                Err(e) => warn!(instance_id = %instance_id, "Graceful stop failed: {}", e),
            }
        }

        self.force_stop(instance_id)?;
        Ok(wait_for_exit(exited, FORCE_GRACE).await)
    }

    /// Terminate every tracked process, used at fleet shutdown
    ///
    /// All groups are signalled up front and share one deadline.
    pub async fn cleanup_all(&self, timeout: Duration) {
        let tracked: Vec<(String, ExitReceiver)> = self
            .table
            .lock()
            .iter()
            .map(|(id, tracked)| (id.clone(), tracked.exited.clone()))
            .collect();

        if tracked.is_empty() {
            return;
        }

        info!("Stopping {} process(es)", tracked.len());

        for (id, _) in &tracked {
            if let Err(e) = self.request_graceful_stop(id) {
                warn!(instance_id = %id, "Graceful stop failed: {}", e);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut survivors = Vec::new();
        for (id, exited) in tracked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !wait_for_exit(exited.clone(), remaining).await {
                survivors.push((id, exited));
            }
        }

        if survivors.is_empty() {
            return;
        }

        warn!("Force killing {} process(es) after {:?}", survivors.len(), timeout);

        for (id, _) in &survivors {
            if let Err(e) = self.force_stop(id) {
                warn!(instance_id = %id, "Forced stop failed: {}", e);
            }
        }

        let deadline = Instant::now() + FORCE_GRACE;
        for (id, exited) in survivors {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !wait_for_exit(exited, remaining).await {
                warn!(instance_id = %id, "Process still alive after SIGKILL");
            }
        }
    }

    /// Record an intentional stop for an instance without a live process
    pub fn mark_stopped(&self, instance_id: &str) -> bool {
        if self.is_tracked(instance_id) {
            return false;
        }

        self.registry.transition_if(
            instance_id,
            |instance| {
                !matches!(
                    instance.status,
                    InstanceStatus::Stopped | InstanceStatus::Failed
                )
            },
            InstanceStatus::Stopped,
            |instance| instance.process_ref = None,
        )
    }

    /// Adopt a process group started by a previous control plane
    ///
    /// The recorded pid must be alive and still lead the recorded group,
    /// otherwise the instance is marked CRASHED.
    pub fn reattach(&self, instance: &Instance) -> Result<ProcessRecord, ProcessError> {
        let id = instance.id.as_str();

        let alive = instance.process_ref.as_ref().filter(|process_ref| {
            signals::is_alive(process_ref.pid)
                && signals::leads_group(process_ref.pid, process_ref.process_group_id)
        });

        let Some(process_ref) = alive.cloned() else {
            self.registry
                .transition(id, None, InstanceStatus::Crashed, |instance| {
                    instance.process_ref = None;
                    instance.last_error = Some("process gone after control plane restart".to_string());
                });
            return Err(ProcessError::NotFound(id.to_string()));
        };

        let record = ProcessRecord {
            instance_id: id.to_string(),
            pid: process_ref.pid,
            process_group_id: process_ref.process_group_id,
            command: instance.command.clone(),
            started_at: process_ref.started_at,
            generation: instance.generation,
            status: RecordStatus::Running,
            owned: false,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop_requested = Arc::new(AtomicBool::new(false));
        {
            let mut table = self.table.lock();
            if table.contains_key(id) {
                return Err(ProcessError::spawn_failed(id, "instance is already tracked"));
            }
            table.insert(
                id.to_string(),
                TrackedProcess {
                    record: record.clone(),
                    stop_requested: Arc::clone(&stop_requested),
                    exited: exit_rx,
                },
            );
        }

        self.registry.transition(
            id,
            Some(instance.generation),
            InstanceStatus::Running,
            |instance| instance.process_ref = Some(process_ref),
        );

        info!(instance_id = %id, pid = record.pid, "Re-attached to running process");

        let reaper = Reaper {
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            instance_id: id.to_string(),
            generation: instance.generation,
            process_group_id: record.process_group_id,
            stop_requested,
            exit_tx,
        };
        tokio::spawn(reaper.poll_adopted(record.pid));

        Ok(record)
    }

    pub fn record(&self, instance_id: &str) -> Option<ProcessRecord> {
        self.table
            .lock()
            .get(instance_id)
            .map(|tracked| tracked.record.clone())
    }

    pub fn is_tracked(&self, instance_id: &str) -> bool {
        self.table.lock().contains_key(instance_id)
    }

    /// Number of processes currently alive
    pub fn live_count(&self) -> usize {
        self.table.lock().len()
    }

    fn exit_receiver(&self, instance_id: &str) -> Option<ExitReceiver> {
        self.table
            .lock()
            .get(instance_id)
            .map(|tracked| tracked.exited.clone())
    }
}

async fn wait_for_exit(mut exited: ExitReceiver, wait: Duration) -> bool {
    let outcome = tokio::time::timeout(wait, exited.wait_for(|outcome| outcome.is_some())).await;
    matches!(outcome, Ok(Ok(_)))
}

/// Settles the registry once a process generation ends
struct Reaper {
    registry: Arc<InstanceRegistry>,
    table: ProcessTable,
    instance_id: String,
    generation: u64,
    process_group_id: i32,
    stop_requested: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
}

impl Reaper {
    async fn wait_child(self, mut child: Child) {
        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                warn!(instance_id = %self.instance_id, "Failed to wait for process: {}", e);
                ExitOutcome::unknown()
            }
        };
        self.finish(outcome);
    }

    async fn poll_adopted(self, pid: u32) {
        let mut ticker = tokio::time::interval(ADOPTED_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if !signals::is_alive(pid) {
                break;
            }
        }
        self.finish(ExitOutcome::unknown());
    }

    fn finish(self, outcome: ExitOutcome) {
        // Leader is gone; take the rest of its group with it
        if let Ok(Delivery::Delivered) =
            signals::signal_group(self.process_group_id, StopSignal::Forced)
        {
            debug!(instance_id = %self.instance_id, "Killed leftover group members");
        }

        {
            let mut table = self.table.lock();
            let current = table
                .get(&self.instance_id)
                .map_or(false, |tracked| tracked.record.generation == self.generation);
            if current {
                table.remove(&self.instance_id);
            }
        }

        let intentional = self.stop_requested.load(Ordering::SeqCst);
        let status = if intentional || outcome.success() {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Crashed
        };

        self.registry
            .transition(&self.instance_id, Some(self.generation), status, |instance| {
                instance.process_ref = None;
                instance.last_exit_code = outcome.code;
                if status == InstanceStatus::Crashed {
                    instance.last_error = Some(outcome.describe());
                }
            });

        if status == InstanceStatus::Crashed {
            warn!(instance_id = %self.instance_id, generation = self.generation, "Process crashed: {}", outcome.describe());
        } else {
            info!(instance_id = %self.instance_id, generation = self.generation, "Process {}", outcome.describe());
        }

        let _ = self.exit_tx.send(Some(outcome));
    }
}
