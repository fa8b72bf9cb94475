// Thin wrappers over the OS signal primitives used by the supervisor

/// Kind of stop request sent to a process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM on Unix
    Graceful,
    /// SIGKILL on Unix
    Forced,
}

/// What happened when a signal was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nothing was left in the group
    Gone,
}

#[cfg(unix)]
mod imp {
    use super::{Delivery, StopSignal};
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{getpgid, Pid};

    pub fn signal_group(process_group_id: i32, kind: StopSignal) -> Result<Delivery, String> {
        let signal = match kind {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forced => Signal::SIGKILL,
        };

        match signal::killpg(Pid::from_raw(process_group_id), signal) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::Gone),
            Err(e) => Err(format!("failed to send {} to group {}: {}", signal, process_group_id, e)),
        }
    }

    pub fn is_alive(pid: u32) -> bool {
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn leads_group(pid: u32, process_group_id: i32) -> bool {
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map(|group| group.as_raw() == process_group_id)
            .unwrap_or(false)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{Delivery, StopSignal};

    pub fn signal_group(_process_group_id: i32, _kind: StopSignal) -> Result<Delivery, String> {
        Err("process groups are not supported on this platform".to_string())
    }

    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn leads_group(_pid: u32, _process_group_id: i32) -> bool {
        false
    }
}

pub use imp::{is_alive, leads_group, signal_group};
