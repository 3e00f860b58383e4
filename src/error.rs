//! Error types for the database abstraction layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Query failures carry the rendered query, the raw parameters and a call stack so
//! that callers can log a complete post-mortem at their service boundary.

use std::backtrace::{Backtrace, BacktraceStatus};

use thiserror::Error;

use crate::models::{DataType, QueryParam};

/// MySQL `ER_LOCK_DEADLOCK`.
pub const MYSQL_DEADLOCK_CODE: &str = "1213";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Driver not found: {driver}")]
    DriverNotFound { driver: String },

    #[error("Query failed: {message} (query: {query})")]
    Query {
        message: String,
        /// MySQL error number or SQLSTATE, when the engine reported one
        code: Option<String>,
        /// Parameter-substituted query, for display only
        query: String,
        params: Vec<QueryParam>,
        call_stack: String,
    },

    #[error("Cannot add column {column} ({data_type}) to {table}")]
    AddColumn {
        table: String,
        column: String,
        data_type: DataType,
        #[source]
        source: Box<DbError>,
    },

    #[error("Cannot change column {old_column} to {new_column} ({data_type}) on {table}")]
    ChangeColumn {
        table: String,
        old_column: String,
        new_column: String,
        data_type: DataType,
        #[source]
        source: Box<DbError>,
    },

    #[error("Cannot remove column {column} from {table}")]
    RemoveColumn {
        table: String,
        column: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Cannot create table {table}")]
    CreateTable {
        table: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Commit failed: the transaction was rolled back by a nested rollback")]
    Commit,

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Dump/restore failed ({tool}): {message}")]
    Dump { tool: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a driver-not-found error.
    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    /// Create a query error without query context.
    ///
    /// The executing driver attaches the query via [`DbError::with_query`].
    pub fn query(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            code,
            query: String::new(),
            params: Vec::new(),
            call_stack: capture_call_stack(),
        }
    }

    /// Attach the failing query to a query error that has none yet.
    pub fn with_query(self, query: impl Into<String>, params: &[QueryParam]) -> Self {
        match self {
            Self::Query {
                message,
                code,
                query: existing,
                params: existing_params,
                call_stack,
            } if existing.is_empty() => Self::Query {
                message,
                code,
                query: query.into(),
                params: if existing_params.is_empty() {
                    params.to_vec()
                } else {
                    existing_params
                },
                call_stack,
            },
            other => other,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a table-not-found error.
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Create a dump/restore error.
    pub fn dump(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dump {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::DriverNotFound { .. } => Some(
                "Use one of: mysql, postgres, oracle, sqlserver, sqlite (oracle and sqlserver need their cargo features)",
            ),
            Self::Commit => Some("Retry the whole unit of work; nothing was persisted"),
            _ => None,
        }
    }

    /// Vendor error code of a query failure (MySQL error number or SQLSTATE).
    pub fn vendor_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            Self::AddColumn { source, .. }
            | Self::ChangeColumn { source, .. }
            | Self::RemoveColumn { source, .. }
            | Self::CreateTable { source, .. } => source.vendor_code(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only a MySQL deadlock qualifies; nothing else is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Query { .. }) && self.vendor_code() == Some(MYSQL_DEADLOCK_CODE)
    }
}

fn capture_call_stack() -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        _ => String::new(),
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number().to_string())
                    .or_else(|| db_err.code().map(|c| c.to_string()));
                DbError::query(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DbError::connection("Connection is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::query(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(err.suggestion(), Some("Check credentials"));
    }

    #[test]
    fn test_query_error_carries_context() {
        let params = vec![QueryParam::Int(1), QueryParam::from("x")];
        let err = DbError::query("no such table: agp_missing", None)
            .with_query("SELECT * FROM agp_missing WHERE id = 1", &params);

        match &err {
            DbError::Query {
                query, params: p, ..
            } => {
                assert_eq!(query, "SELECT * FROM agp_missing WHERE id = 1");
                assert_eq!(p.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("agp_missing"));
    }

    #[test]
    fn test_with_query_keeps_first_context() {
        let err = DbError::query("boom", None)
            .with_query("SELECT 1", &[])
            .with_query("SELECT 2", &[]);
        assert!(err.to_string().contains("SELECT 1"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::query("Deadlock found", Some("1213".to_string())).is_retryable());
        assert!(!DbError::query("syntax", Some("1064".to_string())).is_retryable());
        assert!(!DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::Commit.is_retryable());
    }

    #[test]
    fn test_column_error_wraps_source() {
        let err = DbError::AddColumn {
            table: "agp_user".to_string(),
            column: "age".to_string(),
            data_type: DataType::Int,
            source: Box::new(DbError::query("duplicate column", Some("1060".to_string()))),
        };
        assert!(err.to_string().contains("age"));
        assert_eq!(err.vendor_code(), Some("1060"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
