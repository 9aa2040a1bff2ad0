//! Error types for pgbackup.
//!
//! Every failure maps onto one [`ErrorKind`] so the run summary can report
//! per-database outcomes without carrying driver-specific errors around.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stable classification of a failure, reported in progress events and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not reach the server or the session was lost.
    ConnectionFailed,
    /// The server rejected the credentials.
    AuthenticationFailed,
    /// A metadata query failed (permissions, timeout, broken catalog).
    CatalogUnavailable,
    /// Reading table rows failed mid-stream.
    DataStreamError,
    /// The output artifact could not be created or written.
    SinkUnavailable,
    /// Establishing a session took longer than the connect timeout.
    NetworkTimeout,
    /// The run was cancelled before the database finished.
    Cancelled,
    /// The configuration is invalid.
    Config,
}

impl ErrorKind {
    /// Name used in summaries and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "ConnectionFailed",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::CatalogUnavailable => "CatalogUnavailable",
            Self::DataStreamError => "DataStreamError",
            Self::SinkUnavailable => "SinkUnavailable",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::Cancelled => "Cancelled",
            Self::Config => "Config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Database connection failed or was lost.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Catalog introspection failed.
    #[error("Catalog unavailable: {message}")]
    CatalogUnavailable {
        /// Human-readable error message.
        message: String,
        /// PostgreSQL error code, when the server reported one.
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Reading rows from a table failed.
    #[error("Data stream error on {table}: {message}")]
    DataStream {
        /// Qualified table name.
        table: String,
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Output artifact could not be written.
    #[error("Sink unavailable ({}): {message}", .path.display())]
    SinkUnavailable {
        /// Path of the artifact or output directory.
        path: PathBuf,
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation on the network exceeded its deadline.
    #[error("Network timeout: {operation} did not complete within {timeout:?}")]
    NetworkTimeout {
        /// What was being attempted.
        operation: String,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// Run-level cancellation reached this database.
    #[error("Backup cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },
}

impl BackupError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a catalog error without a driver source.
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::CatalogUnavailable { message: message.into(), code: None, source: None }
    }

    /// Wrap a driver error raised by a metadata query.
    pub fn catalog_query(context: &str, err: tokio_postgres::Error) -> Self {
        let code = err.as_db_error().map(|db| db.code().code().to_string());
        let message = match err.as_db_error() {
            Some(db) => format!("{context}: {}", db.message()),
            None => format!("{context}: {err}"),
        };
        Self::CatalogUnavailable { message, code, source: Some(Box::new(err)) }
    }

    /// Create a data stream error for a table.
    pub fn data_stream(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataStream { table: table.into(), message: message.into(), source: None }
    }

    /// Wrap a driver error raised while streaming rows.
    pub fn data_stream_with_source(
        table: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DataStream {
            table: table.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a sink error for a path.
    pub fn sink(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::SinkUnavailable { path: path.into(), message: message.into(), source: None }
    }

    /// Wrap an I/O error raised while writing a path.
    pub fn sink_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::SinkUnavailable {
            path: path.into(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    /// Create a timeout error.
    pub fn network_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::NetworkTimeout { operation: operation.into(), timeout }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    // ========== Methods ==========

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::ConnectionFailed,
            Self::Authentication { .. } => ErrorKind::AuthenticationFailed,
            Self::CatalogUnavailable { .. } => ErrorKind::CatalogUnavailable,
            Self::DataStream { .. } => ErrorKind::DataStreamError,
            Self::SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            Self::NetworkTimeout { .. } => ErrorKind::NetworkTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Check if this error represents cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::CatalogUnavailable { .. } => "Catalog",
            Self::DataStream { .. } => "Data",
            Self::SinkUnavailable { .. } => "Output",
            Self::NetworkTimeout { .. } => "Network",
            Self::Cancelled => "Cancelled",
            Self::Config { .. } => "Config",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::CatalogUnavailable { code, .. } => match code.as_deref() {
                Some("42501") => Some("The backup role needs read access to the system catalogs"),
                Some("57014") => Some("Raise the statement timeout"),
                _ => None,
            },
            Self::DataStream { .. } => Some("Re-run the backup; a fresh snapshot is required"),
            Self::SinkUnavailable { .. } => Some("Check file permissions and disk space"),
            Self::NetworkTimeout { .. } => Some("Check network reachability or raise the timeout"),
            Self::Cancelled => None,
            Self::Config { .. } => None,
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::CatalogUnavailable { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let technical_detail = match self {
            Self::CatalogUnavailable { code: Some(code), .. } => Some(format!("Code: {code}")),
            Self::DataStream { table, .. } => Some(format!("Table: {table}")),
            Self::SinkUnavailable { path, .. } => Some(format!("Path: {}", path.display())),
            _ => None,
        };

        ErrorInfo {
            error_type: format!("{} Error", self.category()),
            kind: self.kind(),
            message: self.to_string(),
            hint: self.hint().map(String::from),
            technical_detail,
        }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Category name (e.g., "Catalog Error").
    pub error_type: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail, if any.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error raised while establishing a session.
impl From<tokio_postgres::Error> for BackupError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();
            match code_str {
                "28P01" => {
                    return BackupError::Authentication {
                        message,
                        hint: Some("Invalid password - check your credentials".to_string()),
                    }
                }
                "28000" => {
                    return BackupError::Authentication {
                        message,
                        hint: Some(
                            "Authentication failed - check username and pg_hba.conf".to_string(),
                        ),
                    }
                }
                _ => return BackupError::Connection { message, source: Some(Box::new(err)) },
            }
        }

        if err.is_closed() {
            return BackupError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        BackupError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from std::io::Error raised by the output sink.
impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::SinkUnavailable {
            path: PathBuf::new(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(BackupError::connection("x").kind(), ErrorKind::ConnectionFailed);
        assert_eq!(BackupError::authentication("x").kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(BackupError::catalog("x").kind(), ErrorKind::CatalogUnavailable);
        assert_eq!(BackupError::data_stream("public.t", "x").kind(), ErrorKind::DataStreamError);
        assert_eq!(BackupError::sink("/tmp/x", "x").kind(), ErrorKind::SinkUnavailable);
        assert_eq!(
            BackupError::network_timeout("connect", Duration::from_secs(1)).kind(),
            ErrorKind::NetworkTimeout
        );
        assert_eq!(BackupError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_io_error_is_sink_error() {
        let err: BackupError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.kind(), ErrorKind::SinkUnavailable);
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_error_info_carries_table() {
        let info = BackupError::data_stream("public.products", "reset by peer").to_error_info();
        assert_eq!(info.error_type, "Data Error");
        assert_eq!(info.kind, ErrorKind::DataStreamError);
        assert_eq!(info.technical_detail.as_deref(), Some("Table: public.products"));
        assert!(info.message.contains("public.products"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CatalogUnavailable).unwrap();
        assert_eq!(json, "\"catalog_unavailable\"");
        assert_eq!(ErrorKind::DataStreamError.to_string(), "DataStreamError");
    }
}
