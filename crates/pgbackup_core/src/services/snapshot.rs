//! Read-only snapshot transactions.
//!
//! A [`PgSnapshot`] owns one session and one `READ ONLY` transaction. Catalog reads,
//! table locks and row streams all run inside it, so everything written for a database
//! reflects a single instant.

use crate::error::{BackupError, Result};
use crate::models::{DatabaseCatalog, ExclusionPolicy, Field, Row, SnapshotOptions, Table};
use crate::models::{quote_ident, Column};
use crate::services::catalog::CatalogReader;
use crate::services::source::SnapshotSession;

use async_trait::async_trait;
use deadpool_postgres::Object;
use futures_util::stream::{BoxStream, StreamExt};

/// An open snapshot on one database.
pub struct PgSnapshot {
    client: Option<Object>,
    database: String,
    options: SnapshotOptions,
}

impl PgSnapshot {
    /// Wrap a session; the transaction starts with [`SnapshotSession::begin`].
    pub fn new(client: Object, database: &str, options: &SnapshotOptions) -> Self {
        Self { client: Some(client), database: database.to_string(), options: options.clone() }
    }

    /// Statements opening the transaction and applying session limits.
    pub fn setup_statements(options: &SnapshotOptions) -> String {
        let mut setup = options.begin_statement();
        setup.push(';');
        if let Some(secs) = options.statement_timeout_secs {
            setup.push_str(&format!(" SET LOCAL statement_timeout = '{secs}s';"));
        }
        if let Some(secs) = options.lock_timeout_secs {
            setup.push_str(&format!(" SET LOCAL lock_timeout = '{secs}s';"));
        }
        // Catalog functions qualify every name that is not visible on the search path.
        setup.push_str(" SET LOCAL search_path = '';");
        // Text output must not depend on database or role defaults.
        setup.push_str(
            " SET LOCAL datestyle = 'ISO'; SET LOCAL intervalstyle = 'postgres'; \
             SET LOCAL extra_float_digits = 3;",
        );
        setup
    }

    fn client(&self) -> Result<&Object> {
        self.client.as_ref().ok_or_else(|| BackupError::connection("Snapshot already closed"))
    }
}

#[async_trait]
impl SnapshotSession for PgSnapshot {
    fn database(&self) -> &str {
        &self.database
    }

    async fn begin(&mut self) -> Result<()> {
        let setup = Self::setup_statements(&self.options);
        self.client()?.batch_execute(&setup).await?;

        tracing::debug!(
            database = %self.database,
            isolation = self.options.isolation.as_sql(),
            deferrable = self.options.deferrable,
            "Snapshot opened"
        );
        Ok(())
    }

    async fn load_catalog(&self, policy: &ExclusionPolicy) -> Result<DatabaseCatalog> {
        CatalogReader::load(self.client()?, &self.database, policy).await
    }

    async fn prepare_data(&self, catalog: &DatabaseCatalog) -> Result<()> {
        let client = self.client()?;

        if self.options.lock_tables && catalog.table_count() > 0 {
            let tables: Vec<String> =
                catalog.tables().map(|t| t.qualified_name().to_string()).collect();
            let sql = format!("LOCK TABLE {} IN ACCESS SHARE MODE", tables.join(", "));
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| BackupError::catalog_query("Failed to lock tables", e))?;
            tracing::debug!(database = %self.database, tables = tables.len(), "Tables locked");
        }

        // Row fetches are bounded per row instead.
        client
            .batch_execute("SET LOCAL statement_timeout = 0")
            .await
            .map_err(|e| BackupError::catalog_query("Failed to reset statement timeout", e))?;
        Ok(())
    }

    async fn rows<'a>(&'a self, table: &'a Table) -> Result<BoxStream<'a, Result<Row>>> {
        let client = self.client()?;
        let columns: Vec<&Column> = table.data_columns().collect();
        let sql = select_statement(table, &columns);
        let label = table.label();

        let stream = client
            .query_raw(sql.as_str(), Vec::<String>::new())
            .await
            .map_err(|e| BackupError::data_stream_with_source(&label, e))?;

        let binary: Vec<bool> = columns.iter().map(|c| c.is_binary()).collect();
        let rows = stream.map(move |row| {
            let row = row.map_err(|e| BackupError::data_stream_with_source(&label, e))?;
            decode_pg_row(&row, &binary).map_err(|e| BackupError::data_stream_with_source(&label, e))
        });
        Ok(rows.boxed())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut snapshot = self;
        if let Some(client) = snapshot.client.take() {
            client.batch_execute("ROLLBACK").await?;
            tracing::debug!(database = %snapshot.database, "Snapshot closed");
        }
        Ok(())
    }
}

impl Drop for PgSnapshot {
    fn drop(&mut self) {
        // Detach the session from its pool so the connection is closed and the server
        // aborts the open transaction.
        if let Some(client) = self.client.take() {
            tracing::debug!(database = %self.database, "Discarding snapshot session");
            drop(Object::take(client));
        }
    }
}

/// `SELECT` reading a table's data columns in canonical text form.
///
/// Binary columns are fetched raw; everything else is cast to `text` so values keep the
/// server's own output format.
pub fn select_statement(table: &Table, columns: &[&Column]) -> String {
    let list: Vec<String> = columns
        .iter()
        .map(|c| {
            let name = quote_ident(&c.name);
            if c.is_binary() {
                name.into_owned()
            } else {
                format!("{name}::text")
            }
        })
        .collect();
    format!("SELECT {} FROM ONLY {}", list.join(", "), table.qualified_name())
}

fn decode_pg_row(
    row: &tokio_postgres::Row,
    binary: &[bool],
) -> std::result::Result<Row, tokio_postgres::Error> {
    let mut fields = Vec::with_capacity(binary.len());
    for (idx, is_binary) in binary.iter().enumerate() {
        let field = if *is_binary {
            row.try_get::<_, Option<Vec<u8>>>(idx)?.map_or(Field::Null, Field::Binary)
        } else {
            row.try_get::<_, Option<String>>(idx)?.map_or(Field::Null, Field::Text)
        };
        fields.push(field);
    }
    Ok(fields)
}
