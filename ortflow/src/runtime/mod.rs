/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Runtime supervisor hosting the orchestrator's receiver and housekeeping.
pub mod supervisor;

pub use builder::OrchestratorRuntimeBuilder;
pub use supervisor::{OrchestratorRuntime, ShutdownToken};
