//! Error types for pg-service

use pg_sql::SqlValue;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_postgres::error::DbError;

/// Result type alias for service operations
pub type PgResult<T> = Result<T, PgError>;

/// Server-side details attached to a failed statement.
///
/// Every field is optional: errors raised by the client (I/O, encoding) carry
/// none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDiagnostics {
    /// SQLSTATE code, e.g. `23505`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

impl DbDiagnostics {
    fn from_db_error(err: &DbError) -> Self {
        Self {
            code: Some(err.code().code().to_owned()),
            severity: Some(err.severity().to_owned()),
            detail: err.detail().map(str::to_owned),
            hint: err.hint().map(str::to_owned),
            schema: err.schema().map(str::to_owned),
            table: err.table().map(str::to_owned),
            column: err.column().map(str::to_owned),
            data_type: err.datatype().map(str::to_owned),
            constraint: err.constraint().map(str::to_owned),
            file: err.file().map(str::to_owned),
            line: err.line(),
            routine: err.routine().map(str::to_owned),
        }
    }
}

/// A failure reported by the driver (or a test double) for one statement.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    diagnostics: DbDiagnostics,
    #[source]
    source: Option<Arc<tokio_postgres::Error>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics: DbDiagnostics::default(),
            source: None,
        }
    }

    /// Set the SQLSTATE code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.diagnostics.code = Some(code.into());
        self
    }

    /// Replace all diagnostics at once.
    pub fn with_diagnostics(mut self, diagnostics: DbDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn diagnostics(&self) -> &DbDiagnostics {
        &self.diagnostics
    }

    pub fn code(&self) -> Option<&str> {
        self.diagnostics.code.as_deref()
    }

    /// `{index, message, code, severity, ...}` as reported to callers.
    fn report(&self, index: Option<usize>) -> Value {
        let mut report = Map::new();
        report.insert("index".into(), json!(index));
        report.insert("message".into(), json!(self.message));
        if let Ok(Value::Object(fields)) = serde_json::to_value(&self.diagnostics) {
            report.extend(fields);
        }
        Value::Object(report)
    }
}

impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        let (message, diagnostics) = match err.as_db_error() {
            Some(db) => (db.message().to_owned(), DbDiagnostics::from_db_error(db)),
            None => (err.to_string(), DbDiagnostics::default()),
        };
        Self {
            message,
            diagnostics,
            source: Some(Arc::new(err)),
        }
    }
}

/// A batch (or transaction) in which a statement, or the transaction control
/// around them, failed.
#[derive(Debug, Clone, Error)]
pub struct BatchFailure {
    pub texts: Vec<String>,
    pub values: Vec<Vec<SqlValue>>,
    /// Failing statement; `None` when `BEGIN` or `COMMIT` failed.
    pub index: Option<usize>,
    #[source]
    pub error: DriverError,
    /// Set when rolling back after `error` failed as well.
    pub rollback_error: Option<DriverError>,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(
                f,
                "query #{index} of {} failed: {}",
                self.texts.len(),
                self.error
            )?,
            None => write!(f, "transaction control failed: {}", self.error)?,
        }
        if let Some(rollback) = &self.rollback_error {
            write!(f, " (rollback failed: {rollback})")?;
        }
        Ok(())
    }
}

/// Error types for service operations
#[derive(Debug, Error)]
pub enum PgError {
    /// A statement run through `query` or `queries` failed.
    #[error("queries failed: {0}")]
    Queries(Box<BatchFailure>),

    /// A `transaction` failed and was rolled back.
    #[error("transaction failed: {0}")]
    Transaction(Box<BatchFailure>),

    /// A pooled connection died outside of any call.
    #[error("connection error: {0}")]
    Connection(DriverError),

    /// No connection could be obtained from the pool.
    #[error("pool error: {0}")]
    Pool(String),

    /// The service was disposed.
    #[error("pool is closed")]
    Closed,

    /// Invalid configuration or connection URL.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queries(_) => "E_PG_QUERIES",
            Self::Transaction(_) => "E_PG_TRANSACTION",
            Self::Connection(_) => "E_PG_CONNECTION",
            Self::Pool(_) | Self::Closed => "E_PG_POOL",
            Self::Config(_) => "E_PG_CONFIG",
        }
    }

    /// Consumer-facing parameters of the error.
    ///
    /// - `E_PG_QUERIES` / `E_PG_TRANSACTION`: `[texts, valuesList, {index, code, ...}]`,
    ///   plus a `rollbackError` entry when the rollback failed too; a single
    ///   `query` reports a batch of one
    /// - anything else: `[message]`, or `[{message, code, ...}]` for connection errors
    pub fn params(&self) -> Value {
        match self {
            Self::Queries(failure) | Self::Transaction(failure) => {
                let mut report = failure.error.report(failure.index);
                if let (Some(rollback), Value::Object(fields)) =
                    (&failure.rollback_error, &mut report)
                {
                    fields.insert("rollbackError".into(), rollback.report(None));
                }
                json!([failure.texts, failure.values, report])
            }
            Self::Connection(error) => json!([error.report(None)]),
            Self::Pool(message) | Self::Config(message) => json!([message]),
            Self::Closed => json!([self.to_string()]),
        }
    }

    /// The driver error behind a statement or connection failure.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Queries(failure) | Self::Transaction(failure) => Some(&failure.error),
            Self::Connection(error) => Some(error),
            _ => None,
        }
    }

    /// SQLSTATE code of the underlying failure, if the server reported one.
    pub fn code(&self) -> Option<&str> {
        self.driver_error().and_then(DriverError::code)
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        self.code() == Some("23505")
    }

    /// Check if this is a foreign key violation error
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code() == Some("23503")
    }

    /// Check if this is a check constraint violation error
    pub fn is_check_violation(&self) -> bool {
        self.code() == Some("23514")
    }

    /// Check if the transaction lost a serialization race and may be retried
    pub fn is_serialization_failure(&self) -> bool {
        matches!(self.code(), Some("40001" | "40P01"))
    }

    /// Check if the pool was closed by `dispose`
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub(crate) fn queries(failure: BatchFailure) -> Self {
        Self::Queries(Box::new(failure))
    }

    pub(crate) fn transaction(failure: BatchFailure) -> Self {
        Self::Transaction(Box::new(failure))
    }
}

impl<E: fmt::Display> From<deadpool::managed::PoolError<E>> for PgError {
    fn from(err: deadpool::managed::PoolError<E>) -> Self {
        match err {
            deadpool::managed::PoolError::Closed => Self::Closed,
            other => Self::Pool(other.to_string()),
        }
    }
}
