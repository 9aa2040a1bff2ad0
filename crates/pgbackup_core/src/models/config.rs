//! Backup configuration models.
//!
//! A [`BackupConfig`] is built once by the caller and handed to the orchestrator;
//! nothing in the engine mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Database password, supplied by the caller and never persisted or logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wrap a password value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the password for the driver.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if no password was supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Additional connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u32,
    /// Application name sent to PostgreSQL
    pub application_name: String,
    /// TCP keepalive idle time in seconds
    pub keepalives_idle_secs: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            application_name: "pgbackup".to_string(),
            keepalives_idle_secs: 60,
        }
    }
}

/// Server connection target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 5432)
    pub port: u16,
    /// Login username
    pub username: String,
    /// Database used to discover the others (default "postgres")
    pub maintenance_database: String,
    /// Additional options
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    /// Create a connection target with default port and maintenance database.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 5432,
            username: username.into(),
            maintenance_database: "postgres".to_string(),
            options: ConnectionOptions::default(),
        }
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.options.connect_timeout_secs as u64)
    }

    /// Get the display connection string for a database (without password).
    pub fn display_url(&self, database: &str) -> String {
        format!("postgresql://{}@{}:{}/{}", self.username, self.host, self.port, database)
    }
}

/// Isolation level used for each database snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// SERIALIZABLE READ ONLY
    #[default]
    Serializable,
    /// REPEATABLE READ READ ONLY
    RepeatableRead,
}

impl IsolationLevel {
    /// SQL spelling of the level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Serializable => "SERIALIZABLE",
            Self::RepeatableRead => "REPEATABLE READ",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "serializable" => Some(Self::Serializable),
            "repeatable-read" | "repeatable_read" | "repeatable read" => Some(Self::RepeatableRead),
            _ => None,
        }
    }
}

/// How each database snapshot is opened and bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// Transaction isolation level
    pub isolation: IsolationLevel,
    /// Wait for a snapshot that cannot conflict (SERIALIZABLE only)
    pub deferrable: bool,
    /// Per-statement timeout inside the snapshot (None = server default)
    pub statement_timeout_secs: Option<u32>,
    /// Lock wait timeout inside the snapshot (None = server default)
    pub lock_timeout_secs: Option<u32>,
    /// Upper bound on waiting for a single row while streaming
    pub fetch_timeout_secs: u32,
    /// Take ACCESS SHARE locks on dumped tables
    pub lock_tables: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            deferrable: false,
            statement_timeout_secs: Some(300),
            lock_timeout_secs: Some(30),
            fetch_timeout_secs: 300,
            lock_tables: true,
        }
    }
}

impl SnapshotOptions {
    /// Statement used to open the snapshot.
    pub fn begin_statement(&self) -> String {
        let mut sql = format!("BEGIN ISOLATION LEVEL {} READ ONLY", self.isolation.as_sql());
        if self.deferrable && self.isolation == IsolationLevel::Serializable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }

    /// Fetch timeout as a duration.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs as u64)
    }
}

/// Where artifacts are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Directory receiving one artifact per database
    pub directory: PathBuf,
    /// Create the directory when it does not exist
    pub create_dir: bool,
    /// Keep `.partial` files of failed databases instead of deleting them
    pub keep_partial: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self { directory: PathBuf::from("postgres_backups"), create_dir: true, keep_partial: false }
    }
}

/// Name-based policy selecting which databases and schemas are skipped.
///
/// Entries are exact names or glob patterns where `*` matches any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionPolicy {
    /// Databases never backed up
    pub databases: Vec<String>,
    /// Schemas never backed up
    pub schemas: Vec<String>,
    /// Back up databases flagged as templates
    pub include_templates: bool,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self {
            databases: vec!["template0".into(), "template1".into(), "postgres".into()],
            schemas: vec!["pg_*".into(), "information_schema".into()],
            include_templates: false,
        }
    }
}

impl ExclusionPolicy {
    /// A policy that excludes nothing.
    pub fn none() -> Self {
        Self { databases: Vec::new(), schemas: Vec::new(), include_templates: true }
    }

    /// Check whether a database is skipped.
    pub fn excludes_database(&self, name: &str, is_template: bool) -> bool {
        (is_template && !self.include_templates)
            || self.databases.iter().any(|p| glob_match(p, name))
    }

    /// Check whether a schema is skipped.
    pub fn excludes_schema(&self, name: &str) -> bool {
        self.schemas.iter().any(|p| glob_match(p, name))
    }
}

/// Match `name` against a pattern where `*` matches any (possibly empty) run of characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all: exact match.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Complete configuration for one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Server connection target
    pub connection: ConnectionConfig,
    /// Password, supplied by the caller at runtime
    #[serde(skip)]
    pub password: Password,
    /// Snapshot behavior
    #[serde(default)]
    pub snapshot: SnapshotOptions,
    /// Artifact destination
    #[serde(default)]
    pub output: OutputOptions,
    /// Databases and schemas to skip
    #[serde(default)]
    pub exclusions: ExclusionPolicy,
    /// Number of databases backed up concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl BackupConfig {
    /// Create a configuration with defaults for everything but the connection target.
    pub fn new(connection: ConnectionConfig, password: Password) -> Self {
        Self {
            connection,
            password,
            snapshot: SnapshotOptions::default(),
            output: OutputOptions::default(),
            exclusions: ExclusionPolicy::default(),
            workers: default_workers(),
        }
    }

    /// Create a builder for complex configurations.
    pub fn builder() -> BackupConfigBuilder {
        BackupConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.connection.host.is_empty() {
            return Err("Host is required".to_string());
        }
        if self.connection.port == 0 {
            return Err("Port must be between 1 and 65535".to_string());
        }
        if self.connection.username.is_empty() {
            return Err("Username is required".to_string());
        }
        let maintenance = &self.connection.maintenance_database;
        if maintenance.is_empty() || maintenance.len() > 63 {
            return Err("Maintenance database name must be 1-63 characters".to_string());
        }
        if self.workers == 0 || self.workers > 64 {
            return Err("Workers must be between 1 and 64".to_string());
        }
        if self.snapshot.fetch_timeout_secs == 0 {
            return Err("Fetch timeout must be at least one second".to_string());
        }
        if self.output.directory.as_os_str().is_empty() {
            return Err("Output directory is required".to_string());
        }
        Ok(())
    }
}

/// Builder for BackupConfig.
#[derive(Debug, Default)]
pub struct BackupConfigBuilder {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Password,
    maintenance_database: Option<String>,
    options: ConnectionOptions,
    snapshot: SnapshotOptions,
    output: OutputOptions,
    exclusions: Option<ExclusionPolicy>,
    extra_database_exclusions: Vec<String>,
    extra_schema_exclusions: Vec<String>,
    workers: Option<usize>,
}

impl BackupConfigBuilder {
    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Password::new(password);
        self
    }

    /// Set the database used for discovery.
    pub fn maintenance_database(mut self, database: impl Into<String>) -> Self {
        self.maintenance_database = Some(database.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout_secs(mut self, secs: u32) -> Self {
        self.options.connect_timeout_secs = secs;
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.options.application_name = name.into();
        self
    }

    /// Set the snapshot options.
    pub fn snapshot(mut self, snapshot: SnapshotOptions) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Set the output directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output.directory = dir.into();
        self
    }

    /// Set whether a missing output directory is created.
    pub fn create_output_dir(mut self, create: bool) -> Self {
        self.output.create_dir = create;
        self
    }

    /// Keep partial artifacts of failed databases.
    pub fn keep_partial(mut self, keep: bool) -> Self {
        self.output.keep_partial = keep;
        self
    }

    /// Replace the exclusion policy.
    pub fn exclusions(mut self, policy: ExclusionPolicy) -> Self {
        self.exclusions = Some(policy);
        self
    }

    /// Add a database name or pattern to the exclusion policy.
    pub fn exclude_database(mut self, pattern: impl Into<String>) -> Self {
        self.extra_database_exclusions.push(pattern.into());
        self
    }

    /// Add a schema name or pattern to the exclusion policy.
    pub fn exclude_schema(mut self, pattern: impl Into<String>) -> Self {
        self.extra_schema_exclusions.push(pattern.into());
        self
    }

    /// Set the number of concurrent databases.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<BackupConfig, String> {
        let mut exclusions = self.exclusions.unwrap_or_default();
        exclusions.databases.extend(self.extra_database_exclusions);
        exclusions.schemas.extend(self.extra_schema_exclusions);

        let config = BackupConfig {
            connection: ConnectionConfig {
                host: self.host.ok_or("Host is required")?,
                port: if self.port == 0 { 5432 } else { self.port },
                username: self.username.ok_or("Username is required")?,
                maintenance_database: self
                    .maintenance_database
                    .unwrap_or_else(|| "postgres".to_string()),
                options: self.options,
            },
            password: self.password,
            snapshot: self.snapshot,
            output: self.output,
            exclusions,
            workers: self.workers.unwrap_or_else(default_workers),
        };
        config.validate()?;
        Ok(config)
    }
}
