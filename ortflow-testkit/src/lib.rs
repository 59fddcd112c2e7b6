//! Test support for ortflow: an in-memory [`RunStore`](ortflow::RunStore),
//! message and configuration fixtures, a recording stage worker and a
//! harness wiring an orchestrator to the in-memory transport, and a sender
//! backend that can be made to fail.

pub mod fixtures;
pub mod harness;
pub mod mock;
pub mod store;
pub mod transport;

pub use fixtures::*;
pub use harness::TestHarness;
pub use mock::RecordingStageWorker;
pub use store::InMemoryRunStore;
pub use transport::{FAILING_BACKEND, FailingSenderFactory};
