//! Progress events emitted while a run is in flight.
//!
//! Events are delivered over a `tokio::sync::mpsc` channel. Per database they arrive
//! in order: `DatabaseStarted`, then `TableStarted`/`TableCompleted` pairs, then
//! exactly one of `DatabaseCompleted` or `DatabaseFailed`.

use crate::error::{BackupError, ErrorKind};
use crate::models::report::{DatabasePhase, TableReport};

use std::path::PathBuf;
use uuid::Uuid;

/// A progress event.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    /// Discovery finished.
    RunStarted {
        /// Run identifier.
        run_id: Uuid,
        /// Databases that will be attempted.
        databases: Vec<String>,
    },
    /// Work on a database began.
    DatabaseStarted {
        /// Database name.
        database: String,
    },
    /// A table's data block is about to be streamed.
    TableStarted {
        /// Database name.
        database: String,
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
    },
    /// A table's data block was written.
    TableCompleted {
        /// Database name.
        database: String,
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
        /// Rows written.
        rows: u64,
    },
    /// The database artifact was finalized.
    DatabaseCompleted {
        /// Database name.
        database: String,
        /// Path of the finalized artifact.
        artifact: PathBuf,
        /// Per-table row counts.
        tables: Vec<TableReport>,
    },
    /// The database backup was aborted.
    DatabaseFailed {
        /// Database name.
        database: String,
        /// Error classification.
        kind: ErrorKind,
        /// Phase in which the error surfaced.
        phase: DatabasePhase,
        /// Error message.
        message: String,
    },
    /// Every database was attempted.
    RunFinished {
        /// Run identifier.
        run_id: Uuid,
        /// Databases that finalized an artifact.
        succeeded: usize,
        /// Databases that failed or were skipped.
        failed: usize,
    },
}

impl BackupEvent {
    /// Create a database-started event.
    pub fn database_started(database: &str) -> Self {
        Self::DatabaseStarted { database: database.to_string() }
    }

    /// Create a table-started event.
    pub fn table_started(database: &str, schema: &str, table: &str) -> Self {
        Self::TableStarted {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// Create a table-completed event.
    pub fn table_completed(database: &str, schema: &str, table: &str, rows: u64) -> Self {
        Self::TableCompleted {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            rows,
        }
    }

    /// Create a database-failed event.
    pub fn database_failed(database: &str, phase: DatabasePhase, err: &BackupError) -> Self {
        Self::DatabaseFailed {
            database: database.to_string(),
            kind: err.kind(),
            phase,
            message: err.to_string(),
        }
    }

    /// Database this event concerns, if any.
    pub fn database(&self) -> Option<&str> {
        match self {
            Self::DatabaseStarted { database }
            | Self::TableStarted { database, .. }
            | Self::TableCompleted { database, .. }
            | Self::DatabaseCompleted { database, .. }
            | Self::DatabaseFailed { database, .. } => Some(database),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }

    /// Check if this is a terminal event for a database.
    pub fn is_database_terminal(&self) -> bool {
        matches!(self, Self::DatabaseCompleted { .. } | Self::DatabaseFailed { .. })
    }
}
