/// PostgreSQL implementation of the run store.
///
/// This module provides `PostgresRunStore`, a PostgreSQL-backed
/// implementation of the [`RunStore`](crate::store::RunStore) trait used by
/// the orchestrator binary.
pub mod postgres;

pub use postgres::PostgresRunStore;
