use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Resource usage of one process at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Process monitor for collecting resource usage statistics
///
/// CPU usage is only computed by full refreshes, so every sample refreshes
/// the whole process table unless another sample already did so within
/// [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`].
pub struct ProcessMonitor {
    /// System information collector
    system: System,
    last_refresh: Option<Instant>,
}

impl ProcessMonitor {
    /// Create a new process monitor
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last_refresh: None,
        }
    }

    /// Sample CPU and memory usage of a process
    ///
    /// CPU usage is measured between two full refreshes, so the first sample
    /// of a process reports 0%.
    ///
    /// # Returns
    /// * `Some(sample)` - The process is alive
    /// * `None` - The process has exited (zombies count as exited)
    pub fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let sys_pid = Pid::from_u32(pid);

        let stale = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        if stale {
            self.refresh_all();
        }

        if self.system.process(sys_pid).is_none() {
            // Spawned after the last full refresh
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::everything(),
            );
        }

        let process = self.system.process(sys_pid)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }

        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }

    fn refresh_all(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        self.last_refresh = Some(Instant::now());
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
