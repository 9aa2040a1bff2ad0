//! Data models for pgbackup.
//!
//! - `config` - BackupConfig, ConnectionConfig, SnapshotOptions, ExclusionPolicy
//! - `catalog` - Typed catalog entities and row fields
//! - `event` - Progress events
//! - `report` - Run phases and the run summary

pub mod catalog;
pub mod config;
pub mod event;
pub mod report;

pub use catalog::{
    quote_ident, Column, Constraint, ConstraintKind, DatabaseCatalog, Field, GeneratedKind,
    IdentityKind, Index, PartitionBound, QualifiedName, Row, Schema, Sequence, Table, View,
};
pub use config::{
    BackupConfig, BackupConfigBuilder, ConnectionConfig, ConnectionOptions, ExclusionPolicy,
    IsolationLevel, OutputOptions, Password, SnapshotOptions,
};
pub use event::BackupEvent;
pub use report::{DatabaseOutcome, DatabasePhase, RunPhase, RunSummary, TableReport};
