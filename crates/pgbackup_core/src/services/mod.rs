//! Backend services for pgbackup.
//!
//! This module contains the backup engine:
//! - `source` - Traits separating the engine from the server
//! - `connection` - Session pooling with deadpool-postgres and the server-backed source
//! - `snapshot` - Read-only snapshot transactions
//! - `catalog` - Catalog introspection
//! - `ddl` - Definition statement rendering
//! - `copy` - COPY text data blocks
//! - `artifact` - Artifact files with atomic finalization
//! - `orchestrator` - Per-database state machine and run summary

pub mod artifact;
pub mod catalog;
pub mod connection;
pub mod copy;
pub mod ddl;
pub mod orchestrator;
pub mod snapshot;
pub mod source;

pub use artifact::{ArtifactWriter, FileArtifact};
pub use catalog::CatalogReader;
pub use connection::{ConnectionPool, PgSource};
pub use orchestrator::Orchestrator;
pub use snapshot::PgSnapshot;
pub use source::{BackupSource, SnapshotSession};
