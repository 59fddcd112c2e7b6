//! Ortflow - Job orchestration for multi-stage software composition analysis.
//!
//! An ORT run takes a repository revision through up to five stages. The
//! orchestrator persists the run, decides which stage jobs are eligible,
//! dispatches them to workers over a pluggable transport and folds the
//! workers' reports back into run and job state.
//!
//! # Core Concepts
//!
//! - **Stage**: One of [`Stage::Analyzer`], [`Stage::Advisor`],
//!   [`Stage::Scanner`], [`Stage::Evaluator`] and [`Stage::Reporter`],
//!   with fixed prerequisites between them.
//!
//! - **Run and Job**: An [`OrtRun`] owns at most one [`Job`] per stage.
//!   Both follow forward-only status machines enforced by the [`RunStore`].
//!
//! - **Pipeline**: [`pipeline::evaluate`] is a pure decision over a run's
//!   configuration and its jobs: schedule more stages, wait, or finish.
//!
//! - **Transport**: Typed endpoints carry [`Message`]s over the `testing`,
//!   `kubernetes` or `nats` backend selected per endpoint by configuration.
//!
//! - **Orchestrator**: The [`Orchestrator`] handles `CreateOrtRun` and
//!   worker reports; the [`OrchestratorRuntime`] hosts it with a recovery
//!   housekeeper.
//!
//! - **Monitor**: The [`monitor::JobMonitor`] turns Kubernetes Job outcomes
//!   into worker reports for workers that died without reporting.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL run store via sqlx
//! - `kubernetes` - Kubernetes Job transport and the job monitor (default)
//! - `nats` - NATS JetStream transport
//! - `metrics` - Prometheus metrics support

/// Configuration for transports, the orchestrator, the monitor and
/// persistence.
///
/// Transport settings are read from `<ENDPOINT>_<ROLE>_TRANSPORT_*`
/// variables into a [`TransportConfig`].
pub mod config;

/// Error types shared across the crate.
pub mod error;

/// Job records, identifiers and the job status machine.
pub mod job;

/// Message envelopes and the orchestrator's message vocabulary.
///
/// Defines [`MessageHeader`], [`Message`], the per-stage requests and
/// [`OrchestratorMessage`].
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics for scheduling, transitions and monitor reports.
pub mod metrics;

#[cfg(feature = "kubernetes")]
/// Kubernetes Job monitor.
///
/// Watches worker Jobs created by the Kubernetes transport and reports
/// their terminal state to the orchestrator.
pub mod monitor;

/// Run and job state handling in response to messages.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides a PostgreSQL-backed implementation
/// of the run store when the `postgres` feature is enabled.
pub mod persistence;

/// Scheduling decisions over a run's jobs.
pub mod pipeline;

/// ORT runs and the run status machine.
pub mod run;

/// Runtime hosting of the orchestrator.
///
/// The `runtime` module provides the [`OrchestratorRuntime`], its builder
/// and [`ShutdownToken`] for graceful shutdown signaling.
pub mod runtime;

/// Pipeline stages and their job configurations.
pub mod stage;

/// The [`RunStore`] trait and its query types.
pub mod store;

/// Tracing spans and structured log events.
pub mod telemetry;

/// Message transport abstraction and backends.
///
/// Includes the [`TransportRegistry`], typed [`MessageSender`]s and
/// the in-memory `testing` backend.
pub mod transport;

/// Worker-side adapter for stage endpoints.
pub mod worker;

pub use config::*;
pub use error::*;
pub use job::*;
pub use message::*;
pub use orchestrator::{Orchestrator, RecoveryReport, StageSenders};
pub use run::*;
pub use runtime::{OrchestratorRuntime, OrchestratorRuntimeBuilder, ShutdownToken};
pub use stage::*;
pub use store::*;
pub use transport::{
    EndpointHandler, InMemoryBroker, MessageSender, ReceiverHandle, TransportRegistry,
    WireMessage,
};
pub use worker::{StageWorker, StageWorkerHandler, run_stage_worker};
