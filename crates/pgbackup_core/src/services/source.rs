//! Seams between the orchestrator and the server.
//!
//! [`PgSource`](crate::services::PgSource) is the production implementation. Tests plug
//! in an in-memory source so the engine can be exercised without a server.

use crate::error::Result;
use crate::models::{DatabaseCatalog, ExclusionPolicy, Row, Table};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Something that can enumerate databases and open a snapshot on each.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Databases to back up, in backup order, with the exclusion policy applied.
    async fn list_databases(&self, policy: &ExclusionPolicy) -> Result<Vec<String>>;

    /// Open a session on a database. No transaction is started yet.
    async fn connect(&self, database: &str) -> Result<Box<dyn SnapshotSession>>;
}

/// A single read-only transaction on one database.
///
/// Every read after [`SnapshotSession::begin`] goes through the same transaction.
/// Dropping the session without [`SnapshotSession::close`] must abort the transaction
/// server-side.
#[async_trait]
pub trait SnapshotSession: Send + Sync {
    /// Database this snapshot was opened on.
    fn database(&self) -> &str;

    /// Start the read-only transaction all later reads observe.
    async fn begin(&mut self) -> Result<()>;

    /// Read the object graph, skipping schemas the policy excludes.
    async fn load_catalog(&self, policy: &ExclusionPolicy) -> Result<DatabaseCatalog>;

    /// Get ready for data reads: lock the dumped tables if configured and lift the
    /// statement timeout that bounds catalog queries.
    async fn prepare_data(&self, catalog: &DatabaseCatalog) -> Result<()>;

    /// Rows of a table, aligned to [`Table::data_columns`].
    async fn rows<'a>(&'a self, table: &'a Table) -> Result<BoxStream<'a, Result<Row>>>;

    /// Roll back and release the session.
    async fn close(self: Box<Self>) -> Result<()>;
}
