// Process module - OS process lifecycle for fleet instances

pub mod monitor;
pub mod signals;
pub mod spawner;
mod supervisor;
mod types;

pub use monitor::{ProcessMonitor, ResourceSample};
pub use signals::{Delivery, StopSignal};
pub use spawner::{parse_command, spawn_process, SpawnRequest, SpawnedProcess};
pub use supervisor::ProcessSupervisor;
pub use types::{ExitOutcome, ProcessRecord, RecordStatus};
