//! Run state and summary models.

use crate::error::{BackupError, ErrorKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Run-level state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Constructed, not started.
    #[default]
    Idle,
    /// Discovering databases on the instance.
    ListingDatabases,
    /// Backing up discovered databases.
    Running,
    /// Every discovered database has been attempted or skipped.
    Done,
}

/// Per-database state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabasePhase {
    /// Opening a session to the database.
    Connecting,
    /// Opening the read-only transaction.
    Snapshotting,
    /// Reading the catalog.
    Introspecting,
    /// Writing definition statements.
    Rendering,
    /// Writing table data.
    Streaming,
    /// Closing the snapshot and the artifact.
    Finalizing,
    /// Artifact finalized.
    Completed,
}

impl DatabasePhase {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Snapshotting => "snapshotting",
            Self::Introspecting => "introspecting",
            Self::Rendering => "rendering",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row count of one exported table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Rows written to the data block.
    pub rows: u64,
}

/// Outcome of one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatabaseOutcome {
    /// Artifact finalized.
    Succeeded {
        /// Database name.
        database: String,
        /// Path of the finalized artifact.
        artifact: PathBuf,
        /// Per-table row counts.
        tables: Vec<TableReport>,
        /// Wall time in seconds.
        duration_seconds: f64,
    },
    /// Backup aborted; no complete artifact exists.
    Failed {
        /// Database name.
        database: String,
        /// Error classification.
        kind: ErrorKind,
        /// Phase in which the error surfaced.
        phase: DatabasePhase,
        /// Error message.
        message: String,
    },
    /// Never started because the run was cancelled.
    Skipped {
        /// Database name.
        database: String,
    },
}

impl DatabaseOutcome {
    /// Build a failed outcome from an error.
    pub fn failed(database: impl Into<String>, phase: DatabasePhase, err: &BackupError) -> Self {
        Self::Failed {
            database: database.into(),
            kind: err.kind(),
            phase,
            message: err.to_string(),
        }
    }

    /// Database this outcome belongs to.
    pub fn database(&self) -> &str {
        match self {
            Self::Succeeded { database, .. }
            | Self::Failed { database, .. }
            | Self::Skipped { database } => database,
        }
    }

    /// Whether the artifact was finalized.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Total rows exported, zero unless succeeded.
    pub fn total_rows(&self) -> u64 {
        match self {
            Self::Succeeded { tables, .. } => tables.iter().map(|t| t.rows).sum(),
            _ => 0,
        }
    }
}

/// Summary of a complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
    /// One entry per discovered database, in discovery order.
    pub databases: Vec<DatabaseOutcome>,
}

impl RunSummary {
    /// Outcomes that finalized an artifact.
    pub fn succeeded(&self) -> impl Iterator<Item = &DatabaseOutcome> {
        self.databases.iter().filter(|d| d.is_success())
    }

    /// Outcomes that failed.
    pub fn failed(&self) -> impl Iterator<Item = &DatabaseOutcome> {
        self.databases.iter().filter(|d| matches!(d, DatabaseOutcome::Failed { .. }))
    }

    /// Outcomes skipped by cancellation.
    pub fn skipped(&self) -> impl Iterator<Item = &DatabaseOutcome> {
        self.databases.iter().filter(|d| matches!(d, DatabaseOutcome::Skipped { .. }))
    }

    /// Whether every database produced an artifact.
    pub fn is_success(&self) -> bool {
        self.databases.iter().all(DatabaseOutcome::is_success)
    }

    /// Total rows exported across databases.
    pub fn total_rows(&self) -> u64 {
        self.databases.iter().map(DatabaseOutcome::total_rows).sum()
    }

    /// Wall time in seconds.
    pub fn duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Process exit code: 0 when everything succeeded, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(databases: Vec<DatabaseOutcome>) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            completed_at: now,
            cancelled: false,
            databases,
        }
    }

    fn succeeded(name: &str, rows: u64) -> DatabaseOutcome {
        DatabaseOutcome::Succeeded {
            database: name.into(),
            artifact: PathBuf::from(format!("{name}.sql")),
            tables: vec![TableReport { schema: "public".into(), table: "t".into(), rows }],
            duration_seconds: 0.1,
        }
    }

    #[test]
    fn test_exit_code_reflects_failures() {
        let ok = summary(vec![succeeded("a", 2), succeeded("b", 3)]);
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(ok.total_rows(), 5);

        let err = BackupError::catalog("permission denied for table pg_class");
        let bad = summary(vec![
            succeeded("a", 2),
            DatabaseOutcome::failed("b", DatabasePhase::Introspecting, &err),
        ]);
        assert_eq!(bad.exit_code(), 1);
        assert_eq!(bad.succeeded().count(), 1);
        assert_eq!(bad.failed().count(), 1);
        assert_eq!(bad.total_rows(), 2);
    }

    #[test]
    fn test_summary_json_shape() {
        let s = summary(vec![
            succeeded("inventory", 2),
            DatabaseOutcome::Skipped { database: "later".into() },
        ]);
        let json: serde_json::Value = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(json["databases"][0]["status"], "succeeded");
        assert_eq!(json["databases"][0]["tables"][0]["rows"], 2);
        assert_eq!(json["databases"][1]["status"], "skipped");
        assert_eq!(s.exit_code(), 1);
    }
}
