//! Core engine for pgbackup, a logical backup tool for PostgreSQL.
//!
//! This crate provides everything but the command line:
//!
//! - **error**: Error taxonomy with PostgreSQL-specific details
//! - **models**: Configuration, catalog entities, progress events and run summaries
//! - **services**: Snapshots, catalog introspection, rendering, streaming and orchestration
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod verification_tests;

pub use error::{BackupError, ErrorKind, Result};
pub use models::{
    BackupConfig, BackupConfigBuilder, BackupEvent, ConnectionConfig, DatabaseCatalog,
    DatabaseOutcome, DatabasePhase, ExclusionPolicy, IsolationLevel, OutputOptions, Password,
    RunPhase, RunSummary, SnapshotOptions, TableReport,
};
pub use services::{BackupSource, Orchestrator, PgSource, SnapshotSession};
