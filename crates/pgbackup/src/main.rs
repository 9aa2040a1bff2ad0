//! pgbackup CLI - consistent logical backups of every database on a PostgreSQL server.

use clap::Parser;
use pgbackup_core::logging::{init_logging, log_dir, LogConfig};
use pgbackup_core::{
    BackupConfig, BackupError, BackupEvent, DatabaseOutcome, IsolationLevel, Orchestrator,
    RunSummary, SnapshotOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for errors that stop the run before any database is attempted.
const FATAL_EXIT_CODE: u8 = 2;

#[derive(Parser)]
#[command(name = "pgbackup")]
#[command(about = "Consistent logical backups of every database on a PostgreSQL server")]
#[command(version)]
struct Cli {
    /// Server hostname or IP
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, env = "PGPORT", default_value = "5432")]
    port: u16,

    /// Login username
    #[arg(short = 'U', long, env = "PGUSER", default_value = "postgres")]
    username: String,

    /// Login password
    #[arg(long, env = "PGPASSWORD", hide_env_values = true, default_value = "")]
    password: String,

    /// Database used to discover the others
    #[arg(long, default_value = "postgres")]
    maintenance_db: String,

    /// Directory receiving one artifact per database
    #[arg(short, long, default_value = "postgres_backups")]
    output_dir: PathBuf,

    /// Fail instead of creating a missing output directory
    #[arg(long)]
    no_create_dir: bool,

    /// Keep `.partial` artifacts of failed databases
    #[arg(long)]
    keep_partial: bool,

    /// Number of databases backed up concurrently
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Skip a database (exact name or `*` pattern, repeatable)
    #[arg(long = "exclude-database", value_name = "PATTERN")]
    exclude_databases: Vec<String>,

    /// Skip a schema (exact name or `*` pattern, repeatable)
    #[arg(long = "exclude-schema", value_name = "PATTERN")]
    exclude_schemas: Vec<String>,

    /// Also back up databases flagged as templates
    #[arg(long)]
    include_templates: bool,

    /// Snapshot isolation level: serializable or repeatable-read
    #[arg(long, default_value = "serializable", value_parser = parse_isolation)]
    isolation: IsolationLevel,

    /// Wait for a snapshot that cannot conflict (serializable only)
    #[arg(long)]
    deferrable: bool,

    /// Do not take ACCESS SHARE locks on dumped tables
    #[arg(long)]
    no_lock_tables: bool,

    /// Statement timeout in seconds for catalog reads (0 = server default)
    #[arg(long, default_value = "300", value_name = "SECS")]
    statement_timeout: u32,

    /// Lock wait timeout in seconds (0 = server default)
    #[arg(long, default_value = "30", value_name = "SECS")]
    lock_timeout: u32,

    /// Upper bound in seconds on waiting for a single row
    #[arg(long, default_value = "300", value_name = "SECS")]
    fetch_timeout: u32,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10", value_name = "SECS")]
    connect_timeout: u32,

    /// Output JSON summary to stdout
    #[arg(long)]
    output_json: bool,

    /// Print progress lines to stderr
    #[arg(long)]
    progress: bool,

    /// Log filter (overrides PGBACKUP_LOG and RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,

    /// Directory for log files when not attached to a terminal
    #[arg(long, env = "PGBACKUP_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn parse_isolation(s: &str) -> Result<IsolationLevel, String> {
    IsolationLevel::parse(s).ok_or_else(|| {
        format!("unknown isolation level '{s}' (expected serializable or repeatable-read)")
    })
}

/// Zero disables a timeout and leaves the server default in place.
fn optional_secs(secs: u32) -> Option<u32> {
    (secs > 0).then_some(secs)
}

impl Cli {
    fn into_config(self) -> Result<BackupConfig, BackupError> {
        let snapshot = SnapshotOptions {
            isolation: self.isolation,
            deferrable: self.deferrable,
            statement_timeout_secs: optional_secs(self.statement_timeout),
            lock_timeout_secs: optional_secs(self.lock_timeout),
            fetch_timeout_secs: self.fetch_timeout,
            lock_tables: !self.no_lock_tables,
        };

        let mut builder = BackupConfig::builder()
            .host(self.host)
            .port(self.port)
            .username(self.username)
            .password(self.password)
            .maintenance_database(self.maintenance_db)
            .connect_timeout_secs(self.connect_timeout)
            .snapshot(snapshot)
            .output_dir(self.output_dir)
            .create_output_dir(!self.no_create_dir)
            .keep_partial(self.keep_partial)
            .workers(self.workers);
        for pattern in self.exclude_databases {
            builder = builder.exclude_database(pattern);
        }
        for pattern in self.exclude_schemas {
            builder = builder.exclude_schema(pattern);
        }

        let mut config = builder.build().map_err(BackupError::config)?;
        config.exclusions.include_templates = self.include_templates;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new(cli.log_dir.clone().unwrap_or_else(log_dir));
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter.clone());
    }
    let _logging_guard = init_logging(log_config);

    let output_json = cli.output_json;
    match run(cli).await {
        Ok(summary) => {
            if output_json {
                match summary.to_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Error: failed to serialize summary: {e}");
                        return ExitCode::from(FATAL_EXIT_CODE);
                    }
                }
            } else {
                print_summary(&summary);
            }
            ExitCode::from(summary.exit_code())
        }
        Err(e) => {
            print_error(&e);
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary, BackupError> {
    let progress = cli.progress;
    let config = cli.into_config()?;
    info!(
        url = %config.connection.display_url(&config.connection.maintenance_database),
        output = %config.output.directory.display(),
        workers = config.workers,
        "Loaded configuration"
    );

    let orchestrator = Orchestrator::new(config)?;
    let cancel = setup_signal_handler();

    let (events, printer) = if progress {
        let (tx, rx) = mpsc::channel(256);
        (Some(tx), Some(tokio::spawn(print_progress(rx))))
    } else {
        (None, None)
    };

    let result = orchestrator.run(cancel, events).await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    result
}

/// Print progress events to stderr until the sender side closes.
async fn print_progress(mut rx: mpsc::Receiver<BackupEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            BackupEvent::RunStarted { databases, .. } => {
                eprintln!("Backing up {} databases: {}", databases.len(), databases.join(", "));
            }
            BackupEvent::DatabaseStarted { database } => eprintln!("[{database}] started"),
            BackupEvent::TableStarted { .. } => {}
            BackupEvent::TableCompleted { database, schema, table, rows } => {
                eprintln!("[{database}] {schema}.{table}: {rows} rows");
            }
            BackupEvent::DatabaseCompleted { database, artifact, .. } => {
                eprintln!("[{database}] completed -> {}", artifact.display());
            }
            BackupEvent::DatabaseFailed { database, kind, phase, message } => {
                eprintln!("[{database}] FAILED during {phase} ({kind}): {message}");
            }
            BackupEvent::RunFinished { succeeded, failed, .. } => {
                eprintln!("Finished: {succeeded} succeeded, {failed} failed or skipped");
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.cancelled {
        "Backup cancelled"
    } else if summary.is_success() {
        "Backup completed!"
    } else {
        "Backup completed with errors"
    };
    println!("\n{status}");
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.duration_seconds());
    println!(
        "  Databases: {}/{} succeeded",
        summary.succeeded().count(),
        summary.databases.len()
    );
    println!("  Rows: {}", summary.total_rows());

    if summary.databases.is_empty() {
        println!("\n  No databases matched the exclusion policy.");
        return;
    }

    println!();
    for outcome in &summary.databases {
        match outcome {
            DatabaseOutcome::Succeeded { database, artifact, tables, duration_seconds } => {
                println!(
                    "  ok       {database}: {} ({} tables, {} rows, {duration_seconds:.2}s)",
                    artifact.display(),
                    tables.len(),
                    outcome.total_rows()
                );
            }
            DatabaseOutcome::Failed { database, kind, phase, message } => {
                println!("  FAILED   {database}: {kind} during {phase}: {message}");
            }
            DatabaseOutcome::Skipped { database } => {
                println!("  skipped  {database}");
            }
        }
    }
}

fn print_error(err: &BackupError) {
    let info = err.to_error_info();
    eprintln!("Error: {}", info.message);
    if let Some(detail) = &info.technical_detail {
        eprintln!("  {detail}");
    }
    if let Some(hint) = &info.hint {
        eprintln!("  Hint: {hint}");
    }
}

/// Cancel the run on SIGINT (Ctrl-C) or SIGTERM.
///
/// In-flight databases are rolled back and their partial artifacts removed; databases that
/// have not started are reported as skipped.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        eprintln!("\nReceived {name}. Cancelling backup...");
                        token.cancel();
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install {name} handler"),
        }
    }

    cancel_token
}

/// Cancel the run on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling backup...");
            token.cancel();
        }
    });

    cancel_token
}
