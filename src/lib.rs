// Library exports for the Flotilla fleet supervisor

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod providers;
pub mod recovery;
pub mod registry;
pub mod state;

pub use config::FleetConfig;
pub use error::{OrchestratorError, ProcessError, Result};
pub use instance::{Instance, InstanceStatus};
pub use orchestrator::{InstanceSpec, Orchestrator};
