//! Session management with deadpool-postgres.
//!
//! Provides:
//! - One pool per database, sized for the sessions that database needs
//! - Connect timeouts surfaced as `NetworkTimeout`
//! - [`PgSource`], the server-backed [`BackupSource`]

use crate::error::{BackupError, Result};
use crate::models::{BackupConfig, ConnectionConfig, ExclusionPolicy, Password};
use crate::services::snapshot::PgSnapshot;
use crate::services::source::{BackupSource, SnapshotSession};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;

/// A pool of sessions to one database.
pub struct ConnectionPool {
    database: String,
    pool: Pool,
    connect_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool and validate it by opening one session.
    pub async fn connect(
        config: &ConnectionConfig,
        password: &Password,
        database: &str,
        max_size: usize,
    ) -> Result<Self> {
        let connect_timeout = config.connect_timeout();

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(database);
        pg_config.user(&config.username);
        if !password.is_empty() {
            pg_config.password(password.expose());
        }
        pg_config.application_name(&config.options.application_name);
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(config.options.keepalives_idle_secs as u64));

        // Snapshot sessions are never reused, so skip recycling checks.
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .wait_timeout(Some(connect_timeout))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BackupError::connection(format!("Failed to create pool: {e}")))?;

        let pool = Self { database: database.to_string(), pool, connect_timeout };

        let client = pool.get().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| BackupError::connection_with_source("Connection validation failed", e))?;
        drop(client);

        tracing::debug!(
            host = %config.host,
            database,
            url = %config.display_url(database),
            "Connection pool created"
        );

        Ok(pool)
    }

    /// Database this pool connects to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Acquire a session.
    pub async fn get(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| map_pool_error(e, &self.database, self.connect_timeout))
    }

    /// Close the pool, dropping idle sessions.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Classify a failure to obtain a session.
fn map_pool_error(err: PoolError, database: &str, timeout: Duration) -> BackupError {
    match err {
        PoolError::Timeout(_) => {
            BackupError::network_timeout(format!("connecting to database {database}"), timeout)
        }
        PoolError::Backend(e) if is_timeout(&e) => {
            BackupError::network_timeout(format!("connecting to database {database}"), timeout)
        }
        PoolError::Backend(e) => BackupError::from(e),
        other => BackupError::connection(format!("Failed to connect to {database}: {other}")),
    }
}

fn is_timeout(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::TimedOut;
        }
        source = inner.source();
    }
    false
}

/// [`BackupSource`] backed by a PostgreSQL server.
pub struct PgSource {
    config: Arc<BackupConfig>,
}

impl PgSource {
    /// Create a source for the configured server.
    pub fn new(config: Arc<BackupConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackupSource for PgSource {
    async fn list_databases(&self, policy: &ExclusionPolicy) -> Result<Vec<String>> {
        let connection = &self.config.connection;
        let pool = ConnectionPool::connect(
            connection,
            &self.config.password,
            &connection.maintenance_database,
            1,
        )
        .await?;
        let client = pool.get().await?;

        let rows = client
            .query(
                r#"
                SELECT d.datname AS name, d.datistemplate AS is_template
                FROM pg_catalog.pg_database d
                WHERE d.datallowconn
                ORDER BY d.datname
                "#,
                &[],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to list databases", e))?;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("name")
                .map_err(|e| BackupError::catalog_query("Failed to list databases", e))?;
            let is_template: bool = row
                .try_get("is_template")
                .map_err(|e| BackupError::catalog_query("Failed to list databases", e))?;

            if policy.excludes_database(&name, is_template) {
                tracing::debug!(database = %name, "Excluded by policy");
                continue;
            }
            databases.push(name);
        }

        drop(client);
        pool.close();
        Ok(databases)
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn SnapshotSession>> {
        let pool =
            ConnectionPool::connect(&self.config.connection, &self.config.password, database, 1)
                .await?;
        let client = pool.get().await?;
        Ok(Box::new(PgSnapshot::new(client, database, &self.config.snapshot)))
    }
}
