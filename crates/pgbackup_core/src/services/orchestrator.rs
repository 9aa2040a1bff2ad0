//! Run orchestration.
//!
//! Discovers databases, then drives each one through
//! `Connecting → Snapshotting → Introspecting → Rendering/Streaming → Finalizing`.
//! A failure aborts only the database it happened in; the run always ends with a
//! [`RunSummary`] covering every discovered database.

use crate::error::{BackupError, Result};
use crate::models::{
    BackupConfig, BackupEvent, DatabaseOutcome, DatabasePhase, RunPhase, RunSummary, TableReport,
};
use crate::services::artifact::{prepare_output_dir, FileArtifact};
use crate::services::connection::PgSource;
use crate::services::copy::stream_table;
use crate::services::ddl::{plan_artifact, ArtifactMeta, Block};
use crate::services::source::{BackupSource, SnapshotSession};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Backs up every database of one server.
pub struct Orchestrator {
    config: Arc<BackupConfig>,
    source: Arc<dyn BackupSource>,
    phase: RwLock<RunPhase>,
}

impl Orchestrator {
    /// Create an orchestrator talking to the configured server.
    pub fn new(config: BackupConfig) -> Result<Self> {
        config.validate().map_err(BackupError::config)?;
        let config = Arc::new(config);
        let source = Arc::new(PgSource::new(Arc::clone(&config)));
        Ok(Self { config, source, phase: RwLock::new(RunPhase::Idle) })
    }

    /// Create an orchestrator over a custom source.
    pub fn with_source(config: BackupConfig, source: Arc<dyn BackupSource>) -> Result<Self> {
        config.validate().map_err(BackupError::config)?;
        Ok(Self { config: Arc::new(config), source, phase: RwLock::new(RunPhase::Idle) })
    }

    /// Configuration of this run.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Current run-level phase.
    pub fn phase(&self) -> RunPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.phase.write() = phase;
    }

    /// Run the backup.
    ///
    /// Returns `Err` only for run-fatal problems: an unusable output directory or a failed
    /// database discovery. Per-database failures are reported in the summary.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<BackupEvent>>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, host = %self.config.connection.host, "Starting backup run");

        self.set_phase(RunPhase::ListingDatabases);
        let discovered = self.discover().await;
        let (output_dir, databases) = match discovered {
            Ok(found) => found,
            Err(e) => {
                error!(%run_id, error = %e, "Backup run aborted");
                self.set_phase(RunPhase::Done);
                return Err(e);
            }
        };

        info!(%run_id, count = databases.len(), "Found {} databases to back up", databases.len());
        emit(
            events.as_ref(),
            BackupEvent::RunStarted { run_id, databases: databases.clone() },
        )
        .await;

        self.set_phase(RunPhase::Running);
        let workers = self.config.workers.max(1);
        let cancel = &cancel;
        let events = events.as_ref();
        let output_dir = output_dir.as_path();

        let mut outcomes: Vec<(usize, DatabaseOutcome)> =
            stream::iter(databases.iter().enumerate())
                .map(|(i, database)| async move {
                    (i, self.backup_database(database, output_dir, cancel, events).await)
                })
                .buffer_unordered(workers)
                .collect()
                .await;
        outcomes.sort_by_key(|(i, _)| *i);

        let summary = RunSummary {
            run_id,
            started_at,
            completed_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
            databases: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        };
        self.set_phase(RunPhase::Done);

        let succeeded = summary.succeeded().count();
        let failed = summary.databases.len() - succeeded;
        emit(events, BackupEvent::RunFinished { run_id, succeeded, failed }).await;

        let status = if summary.cancelled {
            "cancelled"
        } else if summary.is_success() {
            "completed"
        } else {
            "completed with failures"
        };
        info!(
            "Backup {}: {} of {} databases, {} rows in {:.1}s",
            status,
            succeeded,
            summary.databases.len(),
            summary.total_rows(),
            summary.duration_seconds()
        );

        Ok(summary)
    }

    async fn discover(&self) -> Result<(PathBuf, Vec<String>)> {
        let output_dir = prepare_output_dir(&self.config.output).await?;
        let databases = self.source.list_databases(&self.config.exclusions).await?;
        Ok((output_dir, databases))
    }

    /// Back up one database and turn the result into an outcome.
    async fn backup_database(
        &self,
        database: &str,
        output_dir: &Path,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<BackupEvent>>,
    ) -> DatabaseOutcome {
        if cancel.is_cancelled() {
            info!(database, "Skipped, run cancelled");
            return DatabaseOutcome::Skipped { database: database.to_string() };
        }

        emit(events, BackupEvent::database_started(database)).await;
        let started = Instant::now();
        let mut phase = DatabasePhase::Connecting;

        let result = self.export_database(database, output_dir, &mut phase, cancel, events).await;
        match result {
            Ok((artifact, tables)) => {
                let duration_seconds = started.elapsed().as_secs_f64();
                info!(
                    database,
                    artifact = %artifact.display(),
                    tables = tables.len(),
                    rows = tables.iter().map(|t| t.rows).sum::<u64>(),
                    "Backup completed in {:.1}s",
                    duration_seconds
                );
                emit(
                    events,
                    BackupEvent::DatabaseCompleted {
                        database: database.to_string(),
                        artifact: artifact.clone(),
                        tables: tables.clone(),
                    },
                )
                .await;
                DatabaseOutcome::Succeeded {
                    database: database.to_string(),
                    artifact,
                    tables,
                    duration_seconds,
                }
            }
            Err(err) => {
                if err.is_cancelled() {
                    warn!(database, phase = %phase, "Backup cancelled");
                } else {
                    error!(
                        database,
                        phase = %phase,
                        kind = %err.kind(),
                        error = %err,
                        "Backup failed"
                    );
                }
                emit(events, BackupEvent::database_failed(database, phase, &err)).await;
                DatabaseOutcome::failed(database, phase, &err)
            }
        }
    }

    /// Snapshot, render and stream one database into a finalized artifact.
    async fn export_database(
        &self,
        database: &str,
        output_dir: &Path,
        phase: &mut DatabasePhase,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<BackupEvent>>,
    ) -> Result<(PathBuf, Vec<TableReport>)> {
        *phase = DatabasePhase::Connecting;
        let mut session = cancellable(cancel, self.source.connect(database)).await?;

        *phase = DatabasePhase::Snapshotting;
        cancellable(cancel, session.begin()).await?;
        let captured_at = Utc::now();

        *phase = DatabasePhase::Introspecting;
        let catalog = cancellable(cancel, session.load_catalog(&self.config.exclusions)).await?;
        cancellable(cancel, session.prepare_data(&catalog)).await?;

        *phase = DatabasePhase::Rendering;
        let mut artifact =
            FileArtifact::create(output_dir, database, captured_at, self.config.output.keep_partial)
                .await?;

        let meta = ArtifactMeta { host: self.config.connection.host.clone(), captured_at };
        let blocks = plan_artifact(&catalog, &meta);
        let written = self
            .write_blocks(database, session.as_ref(), blocks, &mut artifact, phase, cancel, events)
            .await;

        let tables = match written {
            Ok(tables) => tables,
            Err(e) => {
                artifact.abort().await;
                return Err(e);
            }
        };

        *phase = DatabasePhase::Finalizing;
        if let Err(e) = session.close().await {
            artifact.abort().await;
            return Err(e);
        }
        let path = artifact.finish().await?;

        *phase = DatabasePhase::Completed;
        Ok((path, tables))
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_blocks(
        &self,
        database: &str,
        session: &dyn SnapshotSession,
        blocks: Vec<Block<'_>>,
        artifact: &mut FileArtifact,
        phase: &mut DatabasePhase,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<BackupEvent>>,
    ) -> Result<Vec<TableReport>> {
        let fetch_timeout = self.config.snapshot.fetch_timeout();
        let mut tables = Vec::new();

        for block in blocks {
            match block {
                Block::Ddl(sql) => {
                    *phase = DatabasePhase::Rendering;
                    artifact.writer()?.write_str(&sql).await?;
                }
                Block::Data(table) => {
                    *phase = DatabasePhase::Streaming;
                    info!(
                        database,
                        schema = %table.schema,
                        table = %table.name,
                        "Backing up {}",
                        table.label()
                    );
                    emit(events, BackupEvent::table_started(database, &table.schema, &table.name))
                        .await;

                    let rows = cancellable(cancel, session.rows(table)).await?;
                    let count =
                        stream_table(table, rows, artifact.writer()?, fetch_timeout, cancel).await?;

                    emit(
                        events,
                        BackupEvent::table_completed(database, &table.schema, &table.name, count),
                    )
                    .await;
                    tables.push(TableReport {
                        schema: table.schema.clone(),
                        table: table.name.clone(),
                        rows: count,
                    });
                }
            }
        }

        Ok(tables)
    }
}

/// Race a step against run cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        result = step => result,
    }
}

/// Deliver a progress event. A closed receiver is not an error.
async fn emit(events: Option<&mpsc::Sender<BackupEvent>>, event: BackupEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}
