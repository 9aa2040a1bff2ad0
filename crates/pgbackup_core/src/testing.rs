//! In-memory backup source for engine tests.

use crate::error::{BackupError, Result};
use crate::models::{
    Column, Constraint, ConstraintKind, DatabaseCatalog, ExclusionPolicy, Field, Row, Schema,
    Sequence, Table,
};
use crate::services::source::{BackupSource, SnapshotSession};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog plus row data of one fake database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    pub catalog: DatabaseCatalog,
    pub rows: HashMap<String, Vec<Row>>,
}

/// Injected failure for one database.
#[derive(Clone)]
pub enum Failure {
    Connect(fn() -> BackupError),
    Catalog(fn() -> BackupError),
    /// Fail after the first row of the named table.
    Stream(String),
    /// Never yield a row for the named table.
    Hang(String),
}

/// A [`BackupSource`] serving fixed catalogs and rows.
#[derive(Clone, Default)]
pub struct MemorySource {
    databases: Vec<(String, MemoryDatabase)>,
    failures: HashMap<String, Failure>,
    discovery_fails: bool,
    /// `close:<db>` or `drop:<db>` per finished session.
    pub sessions: Arc<Mutex<Vec<String>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, name: &str, database: MemoryDatabase) -> Self {
        self.databases.push((name.to_string(), database));
        self
    }

    pub fn with_failure(mut self, name: &str, failure: Failure) -> Self {
        self.failures.insert(name.to_string(), failure);
        self
    }

    pub fn with_connect_error(self, name: &str, error: fn() -> BackupError) -> Self {
        let this = if self.databases.iter().any(|(n, _)| n == name) {
            self
        } else {
            self.with_database(name, inventory_database(name))
        };
        this.with_failure(name, Failure::Connect(error))
    }

    pub fn with_discovery_error(mut self) -> Self {
        self.discovery_fails = true;
        self
    }
}

#[async_trait]
impl BackupSource for MemorySource {
    async fn list_databases(&self, policy: &ExclusionPolicy) -> Result<Vec<String>> {
        if self.discovery_fails {
            return Err(BackupError::connection("could not connect to maintenance database"));
        }
        Ok(self
            .databases
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !policy.excludes_database(name, false))
            .collect())
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn SnapshotSession>> {
        let failure = self.failures.get(database).cloned();
        if let Some(Failure::Connect(error)) = failure {
            return Err(error());
        }
        let data = self
            .databases
            .iter()
            .find(|(name, _)| name == database)
            .map(|(_, db)| db.clone())
            .ok_or_else(|| BackupError::connection(format!("database \"{database}\" does not exist")))?;

        Ok(Box::new(MemorySession {
            database: database.to_string(),
            data,
            failure,
            begun: false,
            closed: false,
            sessions: Arc::clone(&self.sessions),
        }))
    }
}

struct MemorySession {
    database: String,
    data: MemoryDatabase,
    failure: Option<Failure>,
    begun: bool,
    closed: bool,
    sessions: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SnapshotSession for MemorySession {
    fn database(&self) -> &str {
        &self.database
    }

    async fn begin(&mut self) -> Result<()> {
        self.begun = true;
        Ok(())
    }

    async fn load_catalog(&self, policy: &ExclusionPolicy) -> Result<DatabaseCatalog> {
        assert!(self.begun, "catalog read outside the snapshot");
        if let Some(Failure::Catalog(error)) = &self.failure {
            return Err(error());
        }
        let mut catalog = self.data.catalog.clone();
        catalog.schemas.retain(|s| !policy.excludes_schema(&s.name));
        Ok(catalog)
    }

    async fn prepare_data(&self, _catalog: &DatabaseCatalog) -> Result<()> {
        Ok(())
    }

    async fn rows<'a>(&'a self, table: &'a Table) -> Result<BoxStream<'a, Result<Row>>> {
        let label = table.label();
        let rows = self.data.rows.get(&label).cloned().unwrap_or_default();

        match &self.failure {
            Some(Failure::Hang(name)) if *name == label => {
                Ok(stream::pending::<Result<Row>>().boxed())
            }
            Some(Failure::Stream(name)) if *name == label => {
                let first = rows.into_iter().take(1).map(Ok);
                let err = BackupError::data_stream(&label, "connection reset by peer");
                Ok(stream::iter(first.chain(std::iter::once(Err(err)))).boxed())
            }
            _ => Ok(stream::iter(rows.into_iter().map(Ok::<Row, BackupError>)).boxed()),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut session = self;
        session.closed = true;
        session.sessions.lock().push(format!("close:{}", session.database));
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.sessions.lock().push(format!("drop:{}", self.database));
        }
    }
}

/// Text field helper.
pub fn text(value: &str) -> Field {
    Field::Text(value.to_string())
}

/// `public.products(product_id serial PK, name varchar(100), price numeric(10,2) DEFAULT 0.00)`
/// with two rows.
pub fn inventory_database(name: &str) -> MemoryDatabase {
    let mut products = Table::new("public", "products");
    products.columns.push(
        Column::new("product_id", "integer")
            .not_null()
            .with_default("nextval('public.products_product_id_seq'::regclass)"),
    );
    products.columns.push(Column::new("name", "character varying(100)"));
    products.columns.push(Column::new("price", "numeric(10,2)").with_default("0.00"));
    products.constraints.push(Constraint {
        name: "products_pkey".into(),
        kind: ConstraintKind::PrimaryKey,
        definition: "PRIMARY KEY (product_id)".into(),
        columns: vec!["product_id".into()],
        references: None,
    });
    for (i, column) in products.columns.iter_mut().enumerate() {
        column.ordinal_position = i as i32 + 1;
    }

    let mut public = Schema::new("public");
    public.sequences.push(Sequence {
        schema: "public".into(),
        name: "products_product_id_seq".into(),
        data_type: "integer".into(),
        start_value: 1,
        min_value: 1,
        max_value: 2147483647,
        increment_by: 1,
        cycle: false,
        last_value: Some(2),
    });
    public.tables.push(products);

    let mut rows = HashMap::new();
    rows.insert(
        "public.products".to_string(),
        vec![
            vec![text("1"), text("Widget A"), text("19.99")],
            vec![text("2"), text("Gadget B"), text("29.50")],
        ],
    );

    MemoryDatabase {
        catalog: DatabaseCatalog {
            database: name.to_string(),
            server_version: "PostgreSQL 16.2".into(),
            current_user: "backup".into(),
            schemas: vec![public],
        },
        rows,
    }
}
