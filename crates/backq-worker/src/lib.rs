pub mod config;
mod error;
pub mod forwarder;
pub mod process;
pub mod runtime;
pub mod signals;
pub mod supervisor;

pub use config::{ProcessConfig, PublisherConfig, RuntimeConfig, WorkerConfig};
pub use error::{Result, WorkerError};
pub use forwarder::DispatchForwarder;
pub use process::{LaunchSpec, ManagedProcess, ProcessArena, ZOMBIE_BUDGET};
pub use runtime::{IdleLease, JobLease, Lease, RuntimeStats, WorkerRuntime};
pub use supervisor::ProcessSupervisor;
